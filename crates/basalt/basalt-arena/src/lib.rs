//! `basalt-arena`: contiguous shared byte regions.
//!
//! An [`Arena`] is a fixed-size byte region with shared or copy-on-write
//! access, backed by a memory-mapped file or a caller-provided mapping.
//! [`ArenaFile`] creates and maps files under the configured root directory;
//! [`topic`] maps logical topic names to file paths.
//!
//! Arenas are zero-filled on first creation. The transport relies on this
//! to detect uninitialized state.

mod arena;
mod file;
pub mod topic;

pub use arena::{Arena, Mode};
pub use file::{ArenaFile, CreateOptions, FileOptions, OpenOptions};
