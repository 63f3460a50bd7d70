use std::cell::UnsafeCell;

use basalt_core::time::TimeMono;
use basalt_core::{Error, Result};

// Robust-mutex symbols not exposed by the libc crate on all targets.
unsafe extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutexattr_setprotocol(
        attr: *mut libc::pthread_mutexattr_t,
        protocol: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
    fn pthread_mutex_clocklock(
        mutex: *mut libc::pthread_mutex_t,
        clock: libc::clockid_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
}

const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;
const PTHREAD_PRIO_INHERIT: libc::c_int = 1;

/// Outcome of a successful lock acquisition.
///
/// `Recovered` means the previous owner died while holding the lock. The
/// caller owns the lock in both cases, but on `Recovered` the protected
/// state may be inconsistent and must be repaired before release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    Clean,
    Recovered,
}

impl Ownership {
    pub fn recovered(self) -> bool {
        self == Ownership::Recovered
    }
}

fn chk(eno: libc::c_int) -> Result<()> {
    if eno == 0 { Ok(()) } else { Err(Error::sys(eno)) }
}

/// Mutex designed for IPC.
///
/// A `pthread_mutex_t` with the following attributes fixed:
/// - process shared (may live in a shared-memory arena),
/// - robust (the OS releases ownership and reports to the next acquirer
///   when the owner dies without unlocking),
/// - error checking (relocking from the same thread returns an error
///   instead of deadlocking),
/// - priority inheriting.
///
/// Unlike `std::sync::Mutex` there is no guard: the mutex protects state
/// that lives next to it in the arena, not a Rust value. A mutex must be
/// initialized in place exactly once per arena lifetime, and must be
/// unlocked before its mapping goes away.
#[repr(C)]
#[derive(Debug)]
pub struct Mtx {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for Mtx {}
unsafe impl Sync for Mtx {}

impl Mtx {
    /// Initialize a mutex placed in shared memory.
    ///
    /// # Safety
    /// `this` must point to a zeroed, max-aligned, mapped region. No other
    /// process may touch the mutex until initialization returns; callers
    /// sequence this through [`crate::InitGate`].
    pub unsafe fn init_in_place(this: *mut Mtx) -> Result<()> {
        let mut attr: libc::pthread_mutexattr_t = unsafe { std::mem::zeroed() };
        chk(unsafe { libc::pthread_mutexattr_init(&mut attr) })?;
        let res = (|| {
            chk(unsafe {
                libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED)
            })?;
            chk(unsafe {
                libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_ERRORCHECK)
            })?;
            chk(unsafe { pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST) })?;
            chk(unsafe { pthread_mutexattr_setprotocol(&mut attr, PTHREAD_PRIO_INHERIT) })?;
            chk(unsafe { libc::pthread_mutex_init((*this).inner.get(), &attr) })
        })();
        unsafe { libc::pthread_mutexattr_destroy(&mut attr) };
        res
    }

    fn acquired(&self, eno: libc::c_int) -> Result<Ownership> {
        match eno {
            0 => Ok(Ownership::Clean),
            libc::EOWNERDEAD => {
                // Mark consistent immediately: the protected resource is
                // kept consistent by the caller, not by pthread.
                unsafe { pthread_mutex_consistent(self.inner.get()) };
                Ok(Ownership::Recovered)
            }
            libc::EDEADLK => Err(Error::InvalidArg("mutex already held by this thread")),
            libc::ETIMEDOUT => Err(Error::TimedOut),
            other => Err(Error::sys(other)),
        }
    }

    pub fn lock(&self) -> Result<Ownership> {
        self.acquired(unsafe { libc::pthread_mutex_lock(self.inner.get()) })
    }

    /// Non-blocking lock. Busy is reported as `SYS(EBUSY)`; see
    /// [`Error::is_busy`].
    pub fn try_lock(&self) -> Result<Ownership> {
        self.acquired(unsafe { libc::pthread_mutex_trylock(self.inner.get()) })
    }

    /// Lock with an absolute monotonic deadline.
    pub fn timed_lock(&self, deadline: TimeMono) -> Result<Ownership> {
        let ts = deadline.as_timespec();
        self.acquired(unsafe {
            pthread_mutex_clocklock(self.inner.get(), libc::CLOCK_MONOTONIC, &ts)
        })
    }

    pub fn unlock(&self) -> Result<()> {
        chk(unsafe { libc::pthread_mutex_unlock(self.inner.get()) })
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }
}

/// Condition variable paired with [`Mtx`].
///
/// Process shared; timed waits measure against `CLOCK_MONOTONIC`. Spurious
/// wakeups are permitted, so callers re-check their predicate. Signaling
/// without holding the mutex is allowed.
#[repr(C)]
pub struct Cnd {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for Cnd {}
unsafe impl Sync for Cnd {}

impl Cnd {
    /// Initialize a condition variable placed in shared memory.
    ///
    /// # Safety
    /// Same placement and sequencing rules as [`Mtx::init_in_place`].
    pub unsafe fn init_in_place(this: *mut Cnd) -> Result<()> {
        let mut attr: libc::pthread_condattr_t = unsafe { std::mem::zeroed() };
        chk(unsafe { libc::pthread_condattr_init(&mut attr) })?;
        let res = (|| {
            chk(unsafe {
                libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED)
            })?;
            chk(unsafe { libc::pthread_condattr_setclock(&mut attr, libc::CLOCK_MONOTONIC) })?;
            chk(unsafe { libc::pthread_cond_init((*this).inner.get(), &attr) })
        })();
        unsafe { libc::pthread_condattr_destroy(&mut attr) };
        res
    }

    /// Atomically release `mtx` and suspend; `mtx` is reacquired before
    /// returning. The returned [`Ownership`] reports whether the mutex was
    /// recovered from a dead owner during reacquisition.
    pub fn wait(&self, mtx: &Mtx) -> Result<Ownership> {
        let eno = unsafe { libc::pthread_cond_wait(self.inner.get(), mtx.raw()) };
        mtx.acquired(eno)
    }

    /// [`Cnd::wait`] with an absolute monotonic deadline. On `TimedOut`
    /// the mutex is still reacquired and held.
    pub fn timed_wait(&self, mtx: &Mtx, deadline: TimeMono) -> Result<Ownership> {
        let ts = deadline.as_timespec();
        let eno = unsafe { libc::pthread_cond_timedwait(self.inner.get(), mtx.raw(), &ts) };
        mtx.acquired(eno)
    }

    /// Wake at least one waiter.
    pub fn signal(&self) -> Result<()> {
        chk(unsafe { libc::pthread_cond_signal(self.inner.get()) })
    }

    /// Wake all waiters.
    pub fn broadcast(&self) -> Result<()> {
        chk(unsafe { libc::pthread_cond_broadcast(self.inner.get()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Slab {
        mtx: Mtx,
        cnd: Cnd,
        flag: AtomicBool,
    }

    fn new_slab() -> Arc<Slab> {
        let slab: Arc<Slab> = Arc::new(unsafe { std::mem::zeroed() });
        unsafe {
            Mtx::init_in_place(&slab.mtx as *const Mtx as *mut Mtx).unwrap();
            Cnd::init_in_place(&slab.cnd as *const Cnd as *mut Cnd).unwrap();
        }
        slab
    }

    #[test]
    fn lock_unlock_roundtrip() {
        let slab = new_slab();
        assert_eq!(slab.mtx.lock().unwrap(), Ownership::Clean);
        slab.mtx.unlock().unwrap();
    }

    #[test]
    fn relock_is_detected() {
        let slab = new_slab();
        slab.mtx.lock().unwrap();
        assert!(matches!(slab.mtx.lock(), Err(Error::InvalidArg(_))));
        slab.mtx.unlock().unwrap();
    }

    #[test]
    fn try_lock_reports_busy() {
        let slab = new_slab();
        slab.mtx.lock().unwrap();
        let contender = Arc::clone(&slab);
        std::thread::spawn(move || {
            let err = contender.mtx.try_lock().unwrap_err();
            assert!(err.is_busy());
        })
        .join()
        .unwrap();
        slab.mtx.unlock().unwrap();
    }

    #[test]
    fn timed_lock_times_out() {
        let slab = new_slab();
        slab.mtx.lock().unwrap();
        let contender = Arc::clone(&slab);
        std::thread::spawn(move || {
            let deadline = TimeMono::now().unwrap().add(Duration::from_millis(10));
            let err = contender.mtx.timed_lock(deadline).unwrap_err();
            assert!(err.is_timeout());
        })
        .join()
        .unwrap();
        slab.mtx.unlock().unwrap();
    }

    #[test]
    fn owner_death_is_reported_once() {
        let slab = new_slab();
        let dier = Arc::clone(&slab);
        // A thread that exits while holding the mutex counts as a dead
        // owner for the robustness machinery.
        std::thread::spawn(move || {
            dier.mtx.lock().unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(slab.mtx.lock().unwrap(), Ownership::Recovered);
        slab.mtx.unlock().unwrap();
        assert_eq!(slab.mtx.lock().unwrap(), Ownership::Clean);
        slab.mtx.unlock().unwrap();
    }

    #[test]
    fn cnd_wakes_waiter() {
        let slab = new_slab();
        let waiter = Arc::clone(&slab);
        let handle = std::thread::spawn(move || {
            waiter.mtx.lock().unwrap();
            while !waiter.flag.load(Ordering::Relaxed) {
                waiter.cnd.wait(&waiter.mtx).unwrap();
            }
            waiter.mtx.unlock().unwrap();
        });

        std::thread::sleep(Duration::from_millis(10));
        slab.mtx.lock().unwrap();
        slab.flag.store(true, Ordering::Relaxed);
        slab.cnd.broadcast().unwrap();
        slab.mtx.unlock().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn timed_wait_times_out_with_lock_held() {
        let slab = new_slab();
        slab.mtx.lock().unwrap();
        let deadline = TimeMono::now().unwrap().add(Duration::from_millis(10));
        let err = slab.cnd.timed_wait(&slab.mtx, deadline).unwrap_err();
        assert!(err.is_timeout());
        // The mutex is reacquired after a timeout.
        slab.mtx.unlock().unwrap();
    }
}
