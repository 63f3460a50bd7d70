//! Monotonic and wall-clock time.
//!
//! Timed lock and wait operations throughout basalt take an **absolute
//! monotonic deadline** ([`TimeMono`]); relative timeouts are computed by
//! the caller. [`TimeWall`] exists only for human-readable packet headers.

use std::time::Duration;

use crate::{Error, Result};

const NS_PER_SEC: i64 = 1_000_000_000;

fn clock_now(clock: libc::clockid_t) -> Result<libc::timespec> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc == -1 {
        return Err(Error::Sys(std::io::Error::last_os_error()));
    }
    Ok(ts)
}

/// A point on `CLOCK_MONOTONIC`.
#[derive(Clone, Copy)]
pub struct TimeMono {
    ts: libc::timespec,
}

impl TimeMono {
    pub fn now() -> Result<TimeMono> {
        Ok(TimeMono {
            ts: clock_now(libc::CLOCK_MONOTONIC)?,
        })
    }

    /// The deadline `dur` after this instant.
    pub fn add(self, dur: Duration) -> TimeMono {
        let mut sec = self.ts.tv_sec + dur.as_secs() as libc::time_t;
        let mut nsec = self.ts.tv_nsec + dur.subsec_nanos() as libc::c_long;
        if nsec >= NS_PER_SEC {
            sec += 1;
            nsec -= NS_PER_SEC;
        }
        TimeMono {
            ts: libc::timespec {
                tv_sec: sec,
                tv_nsec: nsec,
            },
        }
    }

    /// Nanoseconds since the (arbitrary) monotonic epoch.
    pub fn as_ns(&self) -> u64 {
        self.ts.tv_sec as u64 * NS_PER_SEC as u64 + self.ts.tv_nsec as u64
    }

    /// The raw timespec, for handing to clock-aware pthread calls.
    pub fn as_timespec(&self) -> libc::timespec {
        self.ts
    }
}

impl std::fmt::Debug for TimeMono {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimeMono({}ns)", self.as_ns())
    }
}

/// A point on `CLOCK_REALTIME`, rendered as RFC-3339 with nanoseconds.
#[derive(Clone, Copy)]
pub struct TimeWall {
    ts: libc::timespec,
}

impl TimeWall {
    pub fn now() -> Result<TimeWall> {
        Ok(TimeWall {
            ts: clock_now(libc::CLOCK_REALTIME)?,
        })
    }

    /// `2006-01-02T15:04:05.999999999Z` — UTC, nanosecond precision.
    pub fn to_rfc3339(&self) -> String {
        let mut tm: libc::tm = unsafe { std::mem::zeroed() };
        unsafe { libc::gmtime_r(&self.ts.tv_sec, &mut tm) };
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}Z",
            tm.tm_year + 1900,
            tm.tm_mon + 1,
            tm.tm_mday,
            tm.tm_hour,
            tm.tm_min,
            tm.tm_sec,
            self.ts.tv_nsec
        )
    }
}

impl std::fmt::Debug for TimeWall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimeWall({})", self.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_is_monotonic() {
        let a = TimeMono::now().unwrap();
        let b = TimeMono::now().unwrap();
        assert!(b.as_ns() >= a.as_ns());
    }

    #[test]
    fn add_carries_nanos() {
        let t = TimeMono::now().unwrap();
        let later = t.add(Duration::from_nanos(1_999_999_999));
        assert_eq!(later.as_ns() - t.as_ns(), 1_999_999_999);
    }

    #[test]
    fn wall_formats_rfc3339() {
        let s = TimeWall::now().unwrap().to_rfc3339();
        // e.g. 2026-08-01T12:34:56.123456789Z
        assert_eq!(s.len(), 30);
        assert_eq!(&s[4..5], "-");
        assert_eq!(&s[10..11], "T");
        assert!(s.ends_with('Z'));
    }
}
