use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::AtomicU64;

use basalt_arena::{Arena, ArenaFile, CreateOptions, FileOptions, OpenOptions, topic};
use basalt_core::align::align_up;
use basalt_core::time::TimeMono;
use basalt_core::{Error, Result, env};
use tracing::debug;

use crate::gate::InitGate;
use crate::mtx::{Cnd, Mtx, Ownership};

// "BASALTDM"
const DEADMAN_MAGIC: u64 = u64::from_be_bytes(*b"BASALTDM");

#[repr(C, align(16))]
struct Shm {
    magic: AtomicU64,
    // Protects `generation` and `locked`.
    guard: Mtx,
    cnd: Cnd,
    // The ownership token. Death of the holder releases it.
    owner: Mtx,
    generation: UnsafeCell<u64>,
    locked: UnsafeCell<bool>,
}

/// Result of [`Deadman::state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeadmanState {
    pub is_taken: bool,
    pub is_owner: bool,
    pub generation: u64,
}

/// Single-owner presence beacon for a named resource.
///
/// At most one process holds the deadman at a time; death of the holder
/// releases it automatically. Every successful take increments a
/// generation counter, so observers can track a *specific* ownership and
/// detect that it ended — whether by release or by death.
///
/// The blocking verbs park on the owner's robust mutex itself, so the
/// kernel wakes them on release or owner death; there is no polling.
///
/// `take` and `release` must be called from the same thread (the ownership
/// token is thread-bound).
pub struct Deadman {
    arena: Arena,
    owned: bool,
    // The owner mutex binds to the taking thread.
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl Deadman {
    /// Open (creating if needed) the deadman for `topic`, placed by the
    /// configured `{topic}.deadman` template under the root directory.
    pub fn open(topic_name: &str) -> Result<Deadman> {
        let rel = topic::resolve(env::topic_tmpl_deadman(), topic_name)?;
        let file = ArenaFile::open_with(
            &rel,
            FileOptions {
                create: CreateOptions {
                    size: align_up(size_of::<Shm>()) as u64,
                    mode: 0o666,
                    dir_mode: 0o777,
                },
                open: OpenOptions { readonly: false },
            },
        )?;
        Deadman::from_arena(file.into_arena())
    }

    /// Place the deadman in a caller-provided arena.
    pub fn from_arena(arena: Arena) -> Result<Deadman> {
        if arena.len() < size_of::<Shm>() {
            return Err(Error::InvalidArg("arena too small for a deadman"));
        }
        let shm = unsafe { &*(arena.ptr() as *const Shm) };
        InitGate::ensure(&shm.magic, DEADMAN_MAGIC, || unsafe {
            let shm = arena.ptr() as *mut Shm;
            Mtx::init_in_place(&raw mut (*shm).guard)?;
            Cnd::init_in_place(&raw mut (*shm).cnd)?;
            Mtx::init_in_place(&raw mut (*shm).owner)?;
            (*shm).generation.get().write(0);
            (*shm).locked.get().write(false);
            Ok(())
        })?;
        Ok(Deadman {
            arena,
            owned: false,
            _not_sync: PhantomData,
        })
    }

    fn shm(&self) -> &Shm {
        unsafe { &*(self.arena.ptr() as *const Shm) }
    }

    /// Take ownership, blocking until the current owner releases or dies.
    pub fn take(&mut self) -> Result<Ownership> {
        if self.owned {
            return Err(Error::InvalidArg("deadman already taken by this handle"));
        }
        let own = self.shm().owner.lock()?;
        self.finish_take(own)
    }

    /// Non-blocking take; busy if a live owner holds the deadman.
    pub fn try_take(&mut self) -> Result<Ownership> {
        if self.owned {
            return Err(Error::InvalidArg("deadman already taken by this handle"));
        }
        let own = self.shm().owner.try_lock()?;
        self.finish_take(own)
    }

    /// [`Deadman::take`] with an absolute monotonic deadline.
    pub fn timed_take(&mut self, deadline: TimeMono) -> Result<Ownership> {
        if self.owned {
            return Err(Error::InvalidArg("deadman already taken by this handle"));
        }
        let own = self.shm().owner.timed_lock(deadline)?;
        self.finish_take(own)
    }

    fn finish_take(&mut self, own: Ownership) -> Result<Ownership> {
        let shm = self.shm();
        shm.guard.lock()?;
        unsafe {
            *shm.generation.get() += 1;
            *shm.locked.get() = true;
        }
        if own.recovered() {
            debug!("deadman owner died; ownership recovered");
        }
        shm.cnd.broadcast()?;
        shm.guard.unlock()?;
        self.owned = true;
        Ok(own)
    }

    /// Release ownership. Must be called by the taking thread.
    pub fn release(&mut self) -> Result<()> {
        if !self.owned {
            return Err(Error::InvalidArg("deadman not taken by this handle"));
        }
        let shm = self.shm();
        shm.guard.lock()?;
        unsafe {
            *shm.locked.get() = false;
        }
        shm.cnd.broadcast()?;
        // Release the token while still holding the guard so no taker can
        // slip in between the bit clearing and the unlock.
        shm.owner.unlock()?;
        shm.guard.unlock()?;
        self.owned = false;
        Ok(())
    }

    /// With the guard held: is the deadman taken by a live owner?
    /// Clears a stale `locked` bit left behind by a dead owner.
    fn taken_locked(&self) -> Result<bool> {
        let shm = self.shm();
        if !unsafe { *shm.locked.get() } {
            return Ok(false);
        }
        if self.owned {
            return Ok(true);
        }
        match shm.owner.try_lock() {
            Ok(_) => {
                // The bit was set but nobody holds the token: the owner
                // died. Clean up on their behalf.
                unsafe { *shm.locked.get() = false };
                shm.owner.unlock()?;
                shm.cnd.broadcast()?;
                Ok(false)
            }
            Err(e) if e.is_busy() => Ok(true),
            // EDEADLK: this thread owns the token through another handle.
            Err(Error::InvalidArg(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Block until the deadman is taken; returns the owner's generation.
    pub fn wait_taken(&self) -> Result<u64> {
        self.wait_taken_impl(None)
    }

    pub fn timed_wait_taken(&self, deadline: TimeMono) -> Result<u64> {
        self.wait_taken_impl(Some(deadline))
    }

    fn wait_taken_impl(&self, deadline: Option<TimeMono>) -> Result<u64> {
        let shm = self.shm();
        shm.guard.lock()?;
        let res = (|| {
            loop {
                if self.taken_locked()? {
                    return Ok(unsafe { *shm.generation.get() });
                }
                match deadline {
                    None => shm.cnd.wait(&shm.guard)?,
                    Some(d) => shm.cnd.timed_wait(&shm.guard, d)?,
                };
            }
        })();
        shm.guard.unlock()?;
        res
    }

    /// Block until the ownership identified by `tkn` has ended, by release,
    /// by death, or by a newer generation having taken over.
    pub fn wait_released(&self, tkn: u64) -> Result<()> {
        self.wait_released_impl(tkn, None)
    }

    pub fn timed_wait_released(&self, tkn: u64, deadline: TimeMono) -> Result<()> {
        self.wait_released_impl(tkn, Some(deadline))
    }

    fn wait_released_impl(&self, tkn: u64, deadline: Option<TimeMono>) -> Result<()> {
        // Re-check cadence while parked on the token. Release and death
        // wake the park immediately; the slice only bounds the corner
        // where the token was already re-taken by a newer generation.
        const PARK_SLICE: std::time::Duration = std::time::Duration::from_millis(50);

        let shm = self.shm();
        loop {
            shm.guard.lock()?;
            let ended = (|| -> Result<bool> {
                if unsafe { *shm.generation.get() } != tkn || !unsafe { *shm.locked.get() } {
                    return Ok(true);
                }
                Ok(!self.taken_locked()?)
            })();
            shm.guard.unlock()?;
            if ended? {
                return Ok(());
            }

            // Park on the ownership token itself; the kernel wakes us when
            // the owner unlocks or dies.
            let slice = TimeMono::now()?.add(PARK_SLICE);
            let park_deadline = match deadline {
                Some(d) if d.as_ns() < slice.as_ns() => d,
                _ => slice,
            };
            match self.shm().owner.timed_lock(park_deadline) {
                Ok(_) => {
                    shm.guard.lock()?;
                    if unsafe { *shm.generation.get() } == tkn && unsafe { *shm.locked.get() } {
                        unsafe { *shm.locked.get() = false };
                        shm.cnd.broadcast()?;
                    }
                    shm.owner.unlock()?;
                    shm.guard.unlock()?;
                    return Ok(());
                }
                Err(Error::TimedOut) => {
                    if let Some(d) = deadline {
                        if TimeMono::now()?.as_ns() >= d.as_ns() {
                            return Err(Error::TimedOut);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Atomically report `(is_taken, is_owner, generation)`.
    pub fn state(&self) -> Result<DeadmanState> {
        let shm = self.shm();
        shm.guard.lock()?;
        let res = (|| {
            Ok(DeadmanState {
                is_taken: self.taken_locked()?,
                is_owner: self.owned,
                generation: unsafe { *shm.generation.get() },
            })
        })();
        shm.guard.unlock()?;
        res
    }
}

impl Drop for Deadman {
    fn drop(&mut self) {
        if self.owned {
            let _ = self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn new_arena(buf: &mut Vec<u8>) -> Arena {
        buf.resize(4096, 0);
        unsafe { Arena::from_raw(buf.as_mut_ptr(), 4096, basalt_arena::Mode::Shared) }.unwrap()
    }

    #[test]
    fn take_release_cycle() {
        let mut buf = Vec::new();
        let arena = new_arena(&mut buf);
        let mut d = Deadman::from_arena(arena).unwrap();

        let st = d.state().unwrap();
        assert_eq!(st, DeadmanState { is_taken: false, is_owner: false, generation: 0 });

        assert_eq!(d.take().unwrap(), Ownership::Clean);
        let st = d.state().unwrap();
        assert_eq!(st, DeadmanState { is_taken: true, is_owner: true, generation: 1 });

        d.release().unwrap();
        let st = d.state().unwrap();
        assert_eq!(st, DeadmanState { is_taken: false, is_owner: false, generation: 1 });

        // Generation moves forward on every take.
        d.take().unwrap();
        assert_eq!(d.state().unwrap().generation, 2);
        d.release().unwrap();
    }

    #[test]
    fn second_take_is_busy() {
        let mut buf = Vec::new();
        let arena = new_arena(&mut buf);
        let mut d1 = Deadman::from_arena(arena.clone()).unwrap();
        d1.take().unwrap();

        let handle = std::thread::spawn(move || {
            let mut d2 = Deadman::from_arena(arena).unwrap();
            let err = d2.try_take().unwrap_err();
            assert!(err.is_busy());
        });
        handle.join().unwrap();
        d1.release().unwrap();
    }

    #[test]
    fn wait_taken_returns_generation() {
        let mut buf = Vec::new();
        let arena = new_arena(&mut buf);
        let observer_arena = arena.clone();

        let observer = std::thread::spawn(move || {
            let d = Deadman::from_arena(observer_arena).unwrap();
            d.wait_taken().unwrap()
        });

        std::thread::sleep(Duration::from_millis(20));
        let mut d = Deadman::from_arena(arena).unwrap();
        d.take().unwrap();
        assert_eq!(observer.join().unwrap(), 1);
        d.release().unwrap();
    }

    #[test]
    fn wait_released_sees_release() {
        let mut buf = Vec::new();
        let arena = new_arena(&mut buf);
        let mut d = Deadman::from_arena(arena.clone()).unwrap();
        d.take().unwrap();
        let tkn = d.state().unwrap().generation;

        let waiter = std::thread::spawn(move || {
            let d2 = Deadman::from_arena(arena).unwrap();
            d2.wait_released(tkn).unwrap();
        });

        std::thread::sleep(Duration::from_millis(20));
        d.release().unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn wait_released_sees_owner_death() {
        let mut buf = Vec::new();
        let arena = new_arena(&mut buf);

        // Take from a thread that exits without releasing.
        let taker_arena = arena.clone();
        let tkn = std::thread::spawn(move || {
            let mut d = Deadman::from_arena(taker_arena).unwrap();
            d.take().unwrap();
            let tkn = d.state().unwrap().generation;
            std::mem::forget(d);
            tkn
        })
        .join()
        .unwrap();

        let mut d = Deadman::from_arena(arena).unwrap();
        d.wait_released(tkn).unwrap();
        assert!(!d.state().unwrap().is_taken);

        // The stale token was already recovered by the wait; the next take
        // proceeds and advances the generation.
        d.take().unwrap();
        assert_eq!(d.state().unwrap().generation, tkn + 1);
        d.release().unwrap();
    }

    #[test]
    fn timed_take_times_out_under_live_owner() {
        let mut buf = Vec::new();
        let arena = new_arena(&mut buf);
        let mut d1 = Deadman::from_arena(arena.clone()).unwrap();
        d1.take().unwrap();

        std::thread::spawn(move || {
            let mut d2 = Deadman::from_arena(arena).unwrap();
            let deadline = TimeMono::now().unwrap().add(Duration::from_millis(20));
            let err = d2.timed_take(deadline).unwrap_err();
            assert!(err.is_timeout());
        })
        .join()
        .unwrap();
        d1.release().unwrap();
    }
}
