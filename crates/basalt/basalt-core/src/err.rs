use std::io;

/// Error taxonomy shared by every basalt crate.
///
/// OS-level failures keep their errno inside the wrapped [`io::Error`] and
/// propagate unchanged. Validation failures are converted at the API
/// boundary. A lock acquisition that succeeds after the previous owner died
/// is *not* an error; see `basalt_sync::Ownership`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// OS-level failure: file, mapping, lock, clock.
    #[error(transparent)]
    Sys(#[from] io::Error),

    /// A timed operation reached its deadline.
    #[error("timed out")]
    TimedOut,

    /// Caller-visible precondition violation.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// Iterator advanced past either end of the log.
    #[error("iterator out of range")]
    Range,

    /// Non-blocking read found no data.
    #[error("no data available")]
    Again,

    /// Requested frame exceeds the arena capacity minus the header.
    #[error("frame does not fit in the arena")]
    FrameTooLarge,

    /// Header iterator exhausted.
    #[error("iterator done")]
    IterDone,

    /// Lookup by key or index missed.
    #[error("not found")]
    NotFound,

    /// Topic name rejected by validation.
    #[error("bad topic: {0:?}")]
    BadTopic(String),

    /// Error with a caller-meaningful message.
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// An [`Error::Sys`] from a raw errno value.
    pub fn sys(errno: i32) -> Error {
        Error::Sys(io::Error::from_raw_os_error(errno))
    }

    /// Raw errno, if this is an OS-level error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Sys(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// True for the `EBUSY`-shaped results of `try_lock` / `try_take`.
    pub fn is_busy(&self) -> bool {
        self.raw_os_error() == Some(libc::EBUSY)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_timeout_helpers() {
        assert!(Error::sys(libc::EBUSY).is_busy());
        assert!(!Error::sys(libc::ENOENT).is_busy());
        assert!(Error::TimedOut.is_timeout());
        assert!(!Error::Again.is_timeout());
    }

    #[test]
    fn sys_preserves_errno() {
        assert_eq!(Error::sys(libc::EINVAL).raw_os_error(), Some(libc::EINVAL));
    }
}
