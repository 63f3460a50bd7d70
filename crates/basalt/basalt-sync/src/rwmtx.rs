use std::cell::UnsafeCell;

use basalt_core::time::TimeMono;
use basalt_core::{Error, Result};

use crate::mtx::{Cnd, Mtx};

/// A reader-writer mutex designed to be robust in shared memory.
///
/// Robustness rules out an unbounded reader count in O(1) space: there is
/// no mechanism to decrement a counter when a process dies. Instead each
/// reader occupies an explicit slot mutex, and the kernel's robustness
/// machinery releases the slot when its holder dies.
///
/// The reader-slot array is supplied by the caller, must be zero-initialized
/// together with the `RwMtx` (see [`RwMtx::init_in_place`]), must be the
/// same array for every operation over the lifetime of the lock, and may
/// not be shared across `RwMtx` instances.
///
/// Writers are preferred: a pending writer blocks new readers.
#[repr(C)]
pub struct RwMtx {
    // Protects the internal state transitions below.
    guard: Mtx,
    // Waited on for any slot or writer release.
    cnd: Cnd,
    // The exclusive write mutex.
    wmtx: Mtx,
    // Round-robin hint into the reader-slot array. Guarded by `guard`.
    next_slot: UnsafeCell<usize>,
}

unsafe impl Send for RwMtx {}
unsafe impl Sync for RwMtx {}

/// Token emitted by a locking operation; required to unlock.
#[derive(Debug)]
pub struct RwTkn<'a> {
    mtx: &'a Mtx,
}

enum Deadline {
    None,
    Try,
    At(TimeMono),
}

impl RwMtx {
    /// Initialize a reader-writer mutex and its reader-slot array in place.
    ///
    /// # Safety
    /// Same placement and sequencing rules as [`Mtx::init_in_place`]; the
    /// slot array must satisfy them too.
    pub unsafe fn init_in_place(this: *mut RwMtx, slots: *mut Mtx, num_slots: usize) -> Result<()> {
        unsafe {
            Mtx::init_in_place(&raw mut (*this).guard)?;
            Cnd::init_in_place(&raw mut (*this).cnd)?;
            Mtx::init_in_place(&raw mut (*this).wmtx)?;
            (*this).next_slot.get().write(0);
            for i in 0..num_slots {
                Mtx::init_in_place(slots.add(i))?;
            }
        }
        Ok(())
    }

    fn wait_step(&self, deadline: &Deadline) -> Result<()> {
        match deadline {
            Deadline::None => self.cnd.wait(&self.guard).map(|_| ()),
            Deadline::Try => Err(Error::sys(libc::EBUSY)),
            Deadline::At(d) => self.cnd.timed_wait(&self.guard, *d).map(|_| ()),
        }
    }

    /// True when the write mutex is currently free. Briefly acquires it.
    fn writer_idle(&self) -> Result<bool> {
        match self.wmtx.try_lock() {
            Ok(_) => {
                self.wmtx.unlock()?;
                Ok(true)
            }
            Err(e) if e.is_busy() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn rlock_impl<'a>(&self, slots: &'a [Mtx], deadline: Deadline) -> Result<RwTkn<'a>> {
        if slots.is_empty() {
            return Err(Error::InvalidArg("reader-slot array is empty"));
        }
        self.guard.lock()?;
        let res = (|| {
            loop {
                // Writer preference: do not grant new read slots while a
                // writer holds or is about to hold the lock.
                if !self.writer_idle()? {
                    self.wait_step(&deadline)?;
                    continue;
                }
                let start = unsafe { *self.next_slot.get() };
                for i in 0..slots.len() {
                    let idx = (start + i) % slots.len();
                    match slots[idx].try_lock() {
                        // A recovered slot needs no repair: occupancy is
                        // the only state it carries.
                        Ok(_) => {
                            unsafe { *self.next_slot.get() = (idx + 1) % slots.len() };
                            return Ok(RwTkn { mtx: &slots[idx] });
                        }
                        Err(e) if e.is_busy() => continue,
                        Err(e) => return Err(e),
                    }
                }
                // All slots taken; wait for one to free up.
                self.wait_step(&deadline)?;
            }
        })();
        self.guard.unlock()?;
        res
    }

    /// Acquire `mtx` honoring the deadline mode. Blocking directly on the
    /// mutex (not the condvar) is what makes writers robust: the kernel
    /// wakes the sleeper when the holder unlocks *or dies*.
    fn acquire(mtx: &Mtx, deadline: &Deadline) -> Result<()> {
        match deadline {
            Deadline::None => mtx.lock().map(|_| ()),
            Deadline::Try => mtx.try_lock().map(|_| ()),
            Deadline::At(d) => mtx.timed_lock(*d).map(|_| ()),
        }
    }

    fn wlock_impl<'a>(&'a self, slots: &[Mtx], deadline: Deadline) -> Result<RwTkn<'a>> {
        self.guard.lock()?;
        let res = (|| {
            // Claim the write mutex, then drain the readers. The guard is
            // held throughout, so no new slot can be granted; each held
            // slot is released by its reader's unlock or by its death.
            Self::acquire(&self.wmtx, &deadline)?;
            for slot in slots {
                match Self::acquire(slot, &deadline) {
                    Ok(()) => slot.unlock()?,
                    Err(e) => {
                        self.wmtx.unlock()?;
                        return Err(e);
                    }
                }
            }
            Ok(RwTkn { mtx: &self.wmtx })
        })();
        self.guard.unlock()?;
        res
    }

    pub fn rlock<'a>(&self, slots: &'a [Mtx]) -> Result<RwTkn<'a>> {
        self.rlock_impl(slots, Deadline::None)
    }

    pub fn try_rlock<'a>(&self, slots: &'a [Mtx]) -> Result<RwTkn<'a>> {
        self.rlock_impl(slots, Deadline::Try)
    }

    pub fn timed_rlock<'a>(&self, slots: &'a [Mtx], deadline: TimeMono) -> Result<RwTkn<'a>> {
        self.rlock_impl(slots, Deadline::At(deadline))
    }

    pub fn wlock<'a>(&'a self, slots: &[Mtx]) -> Result<RwTkn<'a>> {
        self.wlock_impl(slots, Deadline::None)
    }

    pub fn try_wlock<'a>(&'a self, slots: &[Mtx]) -> Result<RwTkn<'a>> {
        self.wlock_impl(slots, Deadline::Try)
    }

    pub fn timed_wlock<'a>(&'a self, slots: &[Mtx], deadline: TimeMono) -> Result<RwTkn<'a>> {
        self.wlock_impl(slots, Deadline::At(deadline))
    }

    /// Release a read or write token and wake every waiter.
    pub fn unlock(&self, tkn: RwTkn<'_>) -> Result<()> {
        tkn.mtx.unlock()?;
        self.cnd.broadcast()
    }
}
