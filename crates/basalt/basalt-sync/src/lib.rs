//! `basalt-sync`: process-shared synchronization primitives.
//!
//! Everything in this crate is designed to live inside a shared-memory
//! arena and to survive the death of any participating process:
//!
//! - [`Mtx`] / [`Cnd`]: a robust, priority-inheriting, re-entry-detecting
//!   mutex and its condition variable. The foundation for every other
//!   primitive.
//! - [`InitGate`]: the initialize-exactly-once ceremony for structures
//!   placed in a zero-filled arena.
//! - [`RwMtx`]: a bounded-readership reader-writer lock built from
//!   reader-slot mutexes, robust against the death of any holder.
//! - [`Deadman`]: a single-owner presence beacon with generation tokens.
//!
//! A successful lock reports whether the previous owner died via
//! [`Ownership`]; callers own the lock either way and must restore any
//! protected state before relying on it.

mod deadman;
mod gate;
mod mtx;
mod rwmtx;

pub use deadman::{Deadman, DeadmanState};
pub use gate::InitGate;
pub use mtx::{Cnd, Mtx, Ownership};
pub use rwmtx::{RwMtx, RwTkn};
