//! Binary layout of the transport within an arena.
//!
//! The header sits at offset 0, max-aligned; frames follow at max-aligned
//! offsets. The layout is stable across processes on the same architecture
//! and libc; arenas are not portable across architectures.

use std::cell::UnsafeCell;
use std::mem::size_of;
use std::sync::atomic::AtomicU64;

use basalt_core::align::align_up;
use basalt_sync::{Cnd, Mtx};

/// Magic word marking a fully initialized transport header: "BASALTLG".
pub(crate) const MAGIC: u64 = u64::from_be_bytes(*b"BASALTLG");

/// One of the two double-buffered views of the log.
///
/// Sequence numbers are 1-based; offsets are arena-relative byte offsets
/// of frame headers, with 0 meaning "no frame".
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct State {
    /// Sequence number of the oldest live frame.
    pub seq_low: u64,
    /// Sequence number of the newest live frame.
    pub seq_high: u64,
    /// Offset of the oldest frame's header.
    pub off_head: u64,
    /// Offset of the newest frame's header.
    pub off_tail: u64,
    /// One past the last byte ever used by a frame.
    pub high_water_mark: u64,
}

impl State {
    pub fn is_empty(&self) -> bool {
        self.off_head == 0
    }
}

/// The transport header, at arena offset 0.
///
/// `committed` is the authoritative view readers trust. `working` is
/// transiently mutated under the lock and copied into `committed` only at
/// commit; owner-death recovery restores `working` from `committed`.
#[repr(C, align(16))]
pub(crate) struct Hdr {
    /// Init-gate word; `MAGIC` once the header below is live.
    pub magic: AtomicU64,
    pub committed: UnsafeCell<State>,
    pub working: UnsafeCell<State>,
    pub mtx: Mtx,
    pub cnd: Cnd,
    /// Arena size at init time, for cross-process sanity checks.
    pub arena_size: UnsafeCell<u64>,
}

// All interior state is either atomic or guarded by `mtx`.
unsafe impl Sync for Hdr {}

/// Header preceding every frame body, max-aligned within the arena.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHdr {
    /// Sequence number; strictly monotonic over the transport lifetime.
    pub seq: u64,
    /// Offset of this header within the arena (self-reference).
    pub off: u64,
    /// Offset of the next-newer frame, or 0.
    pub next_off: u64,
    /// Offset of the next-older frame, or 0.
    pub prev_off: u64,
    /// Byte length of the body.
    pub data_size: u64,
}

pub(crate) const FRAME_HDR_SIZE: u64 = size_of::<FrameHdr>() as u64;

/// Offset of the first byte past the (aligned) transport header.
pub(crate) fn header_end() -> u64 {
    align_up(size_of::<Hdr>()) as u64
}
