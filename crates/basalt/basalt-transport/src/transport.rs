use basalt_arena::Arena;
use basalt_core::align::{MAX_ALIGN, align_up_u64};
use basalt_core::time::TimeMono;
use basalt_core::{Error, Result};
use basalt_sync::{Cnd, InitGate, Mtx};
use tracing::{debug, trace, warn};

use crate::layout::{FRAME_HDR_SIZE, FrameHdr, Hdr, MAGIC, State, header_end};

/// A handle onto the circular log within an arena.
///
/// Cheap to open; all real work happens through [`Transport::lock`]. The
/// handle carries the per-handle iterator cursor, which survives
/// unlock/relock (with eviction repositioning, see
/// [`TransportLocked::step_next`]).
pub struct Transport {
    arena: Arena,
    iter_seq: u64,
    iter_off: u64,
}

impl Transport {
    /// Open the transport in `arena`. State is initialized lazily on the
    /// first successful lock.
    pub fn open(arena: Arena) -> Result<Transport> {
        if (arena.len() as u64) < header_end() + MAX_ALIGN as u64 {
            return Err(Error::InvalidArg("arena too small for a transport"));
        }
        Ok(Transport {
            arena,
            iter_seq: 0,
            iter_off: 0,
        })
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    fn hdr(&self) -> &Hdr {
        unsafe { &*(self.arena.ptr() as *const Hdr) }
    }

    /// Acquire the transport's exclusive lock.
    ///
    /// The first lock of a zero-filled arena initializes the header; later
    /// locks validate the recorded arena size against this mapping. If the
    /// previous lock holder died, the working state is rolled back to the
    /// last commit before this call returns (and
    /// [`TransportLocked::prev_owner_died`] reports it).
    pub fn lock(&mut self) -> Result<TransportLocked<'_>> {
        let arena_len = self.arena.len() as u64;
        let hdr_ptr = self.arena.ptr() as *mut Hdr;
        let created = InitGate::ensure(&self.hdr().magic, MAGIC, || unsafe {
            Mtx::init_in_place(&raw mut (*hdr_ptr).mtx)?;
            Cnd::init_in_place(&raw mut (*hdr_ptr).cnd)?;
            let init = State {
                seq_low: 0,
                seq_high: 0,
                off_head: 0,
                off_tail: 0,
                high_water_mark: header_end(),
            };
            (*hdr_ptr).committed.get().write(init);
            (*hdr_ptr).working.get().write(init);
            (*hdr_ptr).arena_size.get().write(arena_len);
            Ok(())
        })?;
        if created {
            debug!(size = arena_len, "transport initialized");
        }

        let stored = unsafe { *self.hdr().arena_size.get() };
        if stored != arena_len {
            return Err(Error::InvalidArg(
                "arena size does not match the transport header",
            ));
        }

        let own = self.hdr().mtx.lock()?;
        let mut lk = TransportLocked {
            t: self,
            recovered: own.recovered(),
            pending: None,
        };
        if lk.recovered {
            lk.recover()?;
        }
        Ok(lk)
    }
}

/// A frame, viewed in place.
///
/// `data` aliases arena bytes and is only valid while the lock that
/// produced it is held and the cursor has not moved across an eviction;
/// the borrow on the guard enforces this.
pub struct FrameView<'v> {
    pub hdr: FrameHdr,
    pub data: &'v [u8],
}

/// Exclusive access to the transport.
///
/// Produced by [`Transport::lock`]; unlocks on drop. Many operations can
/// be streamed under one acquisition.
pub struct TransportLocked<'a> {
    t: &'a mut Transport,
    recovered: bool,
    // Offset of the one outstanding allocation, if any.
    pending: Option<u64>,
}

impl<'a> TransportLocked<'a> {
    fn hdr(&self) -> &Hdr {
        unsafe { &*(self.t.arena.ptr() as *const Hdr) }
    }

    fn committed(&self) -> State {
        unsafe { *self.hdr().committed.get() }
    }

    fn set_committed(&self, s: State) {
        unsafe { *self.hdr().committed.get() = s }
    }

    fn working(&self) -> State {
        unsafe { *self.hdr().working.get() }
    }

    fn set_working(&self, s: State) {
        unsafe { *self.hdr().working.get() = s }
    }

    fn arena_size(&self) -> u64 {
        self.t.arena.len() as u64
    }

    fn frame_hdr(&self, off: u64) -> FrameHdr {
        unsafe { (self.t.arena.ptr().add(off as usize) as *const FrameHdr).read() }
    }

    fn write_frame_hdr(&mut self, off: u64, f: FrameHdr) {
        unsafe { (self.t.arena.ptr().add(off as usize) as *mut FrameHdr).write(f) }
    }

    fn set_frame_next(&mut self, off: u64, next_off: u64) {
        let mut f = self.frame_hdr(off);
        f.next_off = next_off;
        self.write_frame_hdr(off, f);
    }

    fn recover(&mut self) -> Result<()> {
        warn!("transport lock recovered from a dead owner; rolling back working state");
        self.set_working(self.committed());
        self.hdr().cnd.broadcast()
    }

    /// True if this acquisition (or a wait within it) recovered the lock
    /// from a dead owner. The transport state has already been repaired.
    pub fn prev_owner_died(&self) -> bool {
        self.recovered
    }

    // ---- committed-state queries ------------------------------------

    pub fn empty(&self) -> bool {
        self.committed().is_empty()
    }

    pub fn seq_low(&self) -> u64 {
        self.committed().seq_low
    }

    pub fn seq_high(&self) -> u64 {
        self.committed().seq_high
    }

    /// Sequence number the next committed frame will carry.
    pub fn next_seq(&self) -> u64 {
        self.working().seq_high + 1
    }

    pub fn committed_state(&self) -> State {
        self.committed()
    }

    // ---- iterator -----------------------------------------------------

    /// Whether the cursor points at a live committed frame.
    pub fn iter_valid(&self) -> bool {
        let c = self.committed();
        self.t.iter_off != 0
            && !c.is_empty()
            && self.t.iter_seq >= c.seq_low
            && self.t.iter_seq <= c.seq_high
    }

    /// Move the cursor to the oldest frame.
    pub fn jump_head(&mut self) -> Result<()> {
        let c = self.committed();
        if c.is_empty() {
            return Err(Error::Again);
        }
        self.t.iter_seq = c.seq_low;
        self.t.iter_off = c.off_head;
        Ok(())
    }

    /// Move the cursor to the newest frame.
    pub fn jump_tail(&mut self) -> Result<()> {
        let c = self.committed();
        if c.is_empty() {
            return Err(Error::Again);
        }
        self.t.iter_seq = c.seq_high;
        self.t.iter_off = c.off_tail;
        Ok(())
    }

    /// Move the cursor to the frame whose header sits at `off`.
    pub fn jump(&mut self, off: u64) -> Result<()> {
        if off % MAX_ALIGN as u64 != 0
            || off < header_end()
            || off + FRAME_HDR_SIZE > self.arena_size()
        {
            return Err(Error::InvalidArg("frame offset out of bounds"));
        }
        let c = self.committed();
        let f = self.frame_hdr(off);
        if f.off != off || c.is_empty() || f.seq < c.seq_low || f.seq > c.seq_high {
            return Err(Error::NotFound);
        }
        self.t.iter_seq = f.seq;
        self.t.iter_off = off;
        Ok(())
    }

    /// Whether a frame newer than the cursor exists.
    ///
    /// Once true, stays true across unlock/relock until [`step_next`]
    /// consumes it — eviction of the cursor's frame repositions rather
    /// than loses data.
    ///
    /// [`step_next`]: TransportLocked::step_next
    pub fn has_next(&self) -> bool {
        if self.iter_valid() {
            self.t.iter_seq < self.committed().seq_high
        } else {
            !self.empty()
        }
    }

    /// Step the cursor to the oldest frame newer than the current one.
    ///
    /// If the current frame was evicted while unlocked, this repositions
    /// to the oldest surviving frame.
    pub fn step_next(&mut self) -> Result<()> {
        if !self.iter_valid() {
            return self.jump_head().map_err(|e| match e {
                Error::Again => Error::Range,
                e => e,
            });
        }
        if self.t.iter_seq >= self.committed().seq_high {
            return Err(Error::Range);
        }
        let f = self.frame_hdr(self.t.iter_off);
        self.t.iter_off = f.next_off;
        self.t.iter_seq += 1;
        Ok(())
    }

    /// Whether an older frame than the cursor survives.
    ///
    /// Unlike [`has_next`], this is *not* preserved across unlock/relock:
    /// the previous frame may have been evicted.
    ///
    /// [`has_next`]: TransportLocked::has_next
    pub fn has_prev(&self) -> bool {
        self.iter_valid() && self.t.iter_seq > self.committed().seq_low
    }

    /// Step the cursor to the next-older frame.
    pub fn step_prev(&mut self) -> Result<()> {
        if !self.has_prev() {
            return Err(Error::Range);
        }
        let f = self.frame_hdr(self.t.iter_off);
        self.t.iter_off = f.prev_off;
        self.t.iter_seq -= 1;
        Ok(())
    }

    /// View the frame under the cursor. `NotFound` if the cursor is
    /// invalid (never positioned, or its frame was evicted).
    pub fn frame(&self) -> Result<FrameView<'_>> {
        if !self.iter_valid() {
            return Err(Error::NotFound);
        }
        let f = self.frame_hdr(self.t.iter_off);
        let data = unsafe {
            std::slice::from_raw_parts(
                self.t
                    .arena
                    .ptr()
                    .add((self.t.iter_off + FRAME_HDR_SIZE) as usize),
                f.data_size as usize,
            )
        };
        Ok(FrameView { hdr: f, data })
    }

    // ---- write path ---------------------------------------------------

    /// Evict head frames overlapping `[lo, hi)`, publishing the eviction.
    ///
    /// Evicted frames are lost even if no commit follows: their bytes are
    /// about to be overwritten, so the committed view must stop
    /// referencing them before the caller writes the body.
    fn evict_overlapping(&mut self, lo: u64, hi: u64) {
        let mut w = self.working();
        let mut evicted = 0u64;
        // A wrapped placement (lo at the header end, at or below the tail)
        // always lands on the oldest frame of the low run, whose sequence
        // is higher than everything in the high run. FIFO order therefore
        // evicts the entire high run before the overlap scan below.
        if lo <= w.off_tail {
            while !w.is_empty() && w.off_head > w.off_tail {
                evicted += 1;
                self.drop_head(&mut w);
            }
        }
        while !w.is_empty() {
            let head = self.frame_hdr(w.off_head);
            let head_end = align_up_u64(w.off_head + FRAME_HDR_SIZE + head.data_size);
            if w.off_head >= hi || head_end <= lo {
                break;
            }
            evicted += 1;
            self.drop_head(&mut w);
        }
        if evicted == 0 {
            return;
        }
        trace!(evicted, seq_low = w.seq_low, "evicting frames for a new allocation");
        self.set_working(w);

        let mut c = self.committed();
        if w.is_empty() || w.seq_low > c.seq_high {
            c.seq_low = c.seq_high + 1;
            c.off_head = 0;
            c.off_tail = 0;
        } else {
            c.off_head = w.off_head;
            c.seq_low = w.seq_low;
        }
        self.set_committed(c);
        // Await predicates are re-checked after commits and evictions.
        let _ = self.hdr().cnd.broadcast();
    }

    /// Destination offset and end for an allocation of `total` bytes.
    fn alloc_target(&self, total: u64) -> Result<(u64, u64)> {
        let arena_size = self.arena_size();
        let hend = header_end();
        if total > arena_size - hend {
            return Err(Error::FrameTooLarge);
        }
        let w = self.working();
        let mut off = if w.is_empty() {
            hend
        } else {
            let tail = self.frame_hdr(w.off_tail);
            align_up_u64(w.off_tail + FRAME_HDR_SIZE + tail.data_size)
        };
        if off + total > arena_size {
            off = hend;
        }
        Ok((off, off + total))
    }

    /// Whether an [`alloc`] of `size` bytes would evict at least one frame.
    ///
    /// [`alloc`]: TransportLocked::alloc
    pub fn alloc_evicts(&self, size: usize) -> Result<bool> {
        let (lo, hi) = self.alloc_target(align_up_u64(FRAME_HDR_SIZE + size as u64))?;
        let w = self.working();
        if w.is_empty() {
            return Ok(false);
        }
        if lo <= w.off_tail && w.off_head > w.off_tail {
            return Ok(true);
        }
        let head = self.frame_hdr(w.off_head);
        let head_end = align_up_u64(w.off_head + FRAME_HDR_SIZE + head.data_size);
        Ok(w.off_head < hi && lo < head_end)
    }

    /// Remove the head frame from `w`.
    fn drop_head(&self, w: &mut State) {
        if w.seq_low == w.seq_high {
            w.seq_low = w.seq_high + 1;
            w.off_head = 0;
            w.off_tail = 0;
        } else {
            w.off_head = self.frame_hdr(w.off_head).next_off;
            w.seq_low += 1;
        }
    }

    /// Allocate space for a frame body of `size` bytes.
    ///
    /// Evicts the oldest frames as needed (FIFO, possibly several in one
    /// call). The returned slice aliases the arena; fill it, then call
    /// [`commit`]. Only one allocation may be outstanding per lock
    /// acquisition — a second `alloc` replaces the first.
    ///
    /// [`commit`]: TransportLocked::commit
    pub fn alloc(&mut self, size: usize) -> Result<&mut [u8]> {
        let total = align_up_u64(FRAME_HDR_SIZE + size as u64);
        let (off, end) = self.alloc_target(total)?;
        self.evict_overlapping(off, end);

        let mut w = self.working();
        let seq = w.seq_high + 1;
        self.write_frame_hdr(
            off,
            FrameHdr {
                seq,
                off,
                next_off: 0,
                prev_off: w.off_tail,
                data_size: size as u64,
            },
        );
        if off + total > w.high_water_mark {
            w.high_water_mark = off + total;
            self.set_working(w);
        }
        self.pending = Some(off);
        trace!(seq, off, size, "allocated frame");

        let ptr = unsafe { self.t.arena.ptr().add((off + FRAME_HDR_SIZE) as usize) };
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, size) })
    }

    /// Link the outstanding allocation into the log and atomically publish
    /// the working state to readers, then wake every waiter.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(off) = self.pending.take() {
            let mut w = self.working();
            let f = self.frame_hdr(off);
            if w.is_empty() {
                w.off_head = off;
                w.seq_low = f.seq;
            } else {
                self.set_frame_next(w.off_tail, off);
            }
            w.seq_high = f.seq;
            w.off_tail = off;
            self.set_working(w);
            trace!(seq = f.seq, off, "committing frame");
        }
        self.set_committed(self.working());
        self.hdr().cnd.broadcast()
    }

    // ---- waiting ------------------------------------------------------

    /// Atomically unlock and sleep until `pred` holds; relock on wake.
    ///
    /// The predicate is re-evaluated on every wake (spurious wakeups are
    /// allowed) and once before the first sleep.
    pub fn wait<F>(&mut self, pred: F) -> Result<()>
    where
        F: FnMut(&mut Self) -> Result<bool>,
    {
        self.wait_impl(pred, None)
    }

    /// [`wait`] with an absolute monotonic deadline; distinguishable
    /// `TimedOut` on expiry. A predicate already satisfied at the deadline
    /// is still a success.
    ///
    /// [`wait`]: TransportLocked::wait
    pub fn wait_until<F>(&mut self, pred: F, deadline: TimeMono) -> Result<()>
    where
        F: FnMut(&mut Self) -> Result<bool>,
    {
        self.wait_impl(pred, Some(deadline))
    }

    fn wait_impl<F>(&mut self, mut pred: F, deadline: Option<TimeMono>) -> Result<()>
    where
        F: FnMut(&mut Self) -> Result<bool>,
    {
        loop {
            if pred(self)? {
                return Ok(());
            }
            let res = match deadline {
                None => self.hdr().cnd.wait(&self.hdr().mtx),
                Some(d) => self.hdr().cnd.timed_wait(&self.hdr().mtx, d),
            };
            match res {
                Ok(own) => {
                    if own.recovered() {
                        self.recovered = true;
                        self.recover()?;
                    }
                }
                Err(Error::TimedOut) => {
                    return if pred(self)? {
                        Ok(())
                    } else {
                        Err(Error::TimedOut)
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wake every waiter on this transport.
    pub fn broadcast(&self) -> Result<()> {
        self.hdr().cnd.broadcast()
    }

    // ---- diagnostics --------------------------------------------------

    /// Multi-line dump of the header and committed frames.
    pub fn debug_string(&self) -> String {
        use std::fmt::Write as _;
        let c = self.committed();
        let w = self.working();
        let mut s = String::new();
        let _ = writeln!(s, "arena_size = {}", self.arena_size());
        let _ = writeln!(
            s,
            "committed: seq=[{}, {}] head @ {} tail @ {} hwm = {}",
            c.seq_low, c.seq_high, c.off_head, c.off_tail, c.high_water_mark
        );
        let _ = writeln!(
            s,
            "working:   seq=[{}, {}] head @ {} tail @ {} hwm = {}",
            w.seq_low, w.seq_high, w.off_head, w.off_tail, w.high_water_mark
        );
        if !c.is_empty() {
            let mut off = c.off_head;
            for _ in c.seq_low..=c.seq_high {
                let f = self.frame_hdr(off);
                let _ = writeln!(
                    s,
                    "frame seq={} @ {} prev @ {} next @ {} size={}",
                    f.seq, f.off, f.prev_off, f.next_off, f.data_size
                );
                off = f.next_off;
            }
        }
        s
    }
}

impl Drop for TransportLocked<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.hdr().mtx.unlock() {
            warn!(error = %e, "transport unlock failed");
        }
    }
}
