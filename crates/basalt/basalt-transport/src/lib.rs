//! `basalt-transport`: the shared-memory circular log.
//!
//! The transport lays a doubly linked list of **frames** out in an arena,
//! one after the other, max-aligned. Once the arena is exhausted, the
//! oldest frames are evicted to make room. Sequence numbers increase by
//! one per committed frame and are never reused.
//!
//! A transport has a single exclusive robust lock that must be acquired
//! before reading or writing; all access goes through the
//! [`TransportLocked`] guard so the borrow checker scopes every frame view
//! to the lock. The state is double buffered — a working copy is mutated
//! and published into the committed copy atomically at commit — so death
//! of a lock holder at any point leaves the log exactly at its last
//! commit.
//!
//! ```no_run
//! use basalt_arena::ArenaFile;
//! use basalt_transport::Transport;
//!
//! # fn demo() -> basalt_core::Result<()> {
//! let arena = ArenaFile::open("demo.pubsub.a0")?.into_arena();
//! let mut t = Transport::open(arena)?;
//! let mut lk = t.lock()?;
//! let buf = lk.alloc(5)?;
//! buf.copy_from_slice(b"hello");
//! lk.commit()?;
//! # Ok(())
//! # }
//! ```

mod layout;
mod transport;

pub use layout::{FrameHdr, State};
pub use transport::{FrameView, Transport, TransportLocked};
