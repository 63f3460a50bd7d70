use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use basalt_core::{Error, Result};
use tracing::trace;

/// Initialize-exactly-once ceremony for structures in a zero-filled arena.
///
/// A magic word at a fixed offset moves through three states:
/// `0` (untouched arena) → `BUILDING` → the structure's ready magic. The
/// process that wins the CAS from `0` runs the init closure; everyone else
/// spin-waits (bounded) for the ready magic. Any other value means the
/// arena holds something that is not the expected structure.
pub struct InitGate;

const BUILDING: u64 = 1;

/// How long openers wait for a concurrent initializer before giving up.
const WAIT_ATTEMPTS: u32 = 5_000;
const WAIT_STEP: Duration = Duration::from_millis(1);

impl InitGate {
    /// Ensure the structure guarded by `word` is initialized.
    ///
    /// Returns `true` if this call ran `init` (i.e. it created the
    /// structure), `false` if the structure already existed.
    pub fn ensure<F>(word: &AtomicU64, ready: u64, init: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        match word.compare_exchange(0, BUILDING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                trace!("initializing shared structure");
                if let Err(e) = init() {
                    // Leave the arena reusable for the next opener.
                    word.store(0, Ordering::Release);
                    return Err(e);
                }
                word.store(ready, Ordering::Release);
                Ok(true)
            }
            Err(cur) if cur == ready => Ok(false),
            Err(_) => {
                for _ in 0..WAIT_ATTEMPTS {
                    match word.load(Ordering::Acquire) {
                        v if v == ready => return Ok(false),
                        BUILDING => std::thread::sleep(WAIT_STEP),
                        0 => {
                            // The initializer failed and reset the word;
                            // take over.
                            return InitGate::ensure(word, ready, init);
                        }
                        _ => return Err(Error::InvalidArg("arena holds an unexpected structure")),
                    }
                }
                // The initializer died mid-build. The arena cannot be
                // trusted; recovery is recreating the backing file.
                Err(Error::TimedOut)
            }
        }
    }
}
