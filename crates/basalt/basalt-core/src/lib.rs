//! `basalt-core`: shared plumbing for the basalt crates.
//!
//! Everything here is cross-cutting: the error taxonomy used by every
//! basalt API, alignment arithmetic for the shared-memory layouts, the
//! monotonic/wall clock types, and the cached environment snapshot that
//! maps topics to file paths.

pub mod align;
pub mod env;
mod err;
pub mod time;

pub use err::{Error, Result};
