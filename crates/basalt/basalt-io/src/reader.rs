use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, ThreadId};

use basalt_arena::Arena;
use basalt_core::time::TimeMono;
use basalt_core::{Error, Result};
use basalt_packet::{FlatPacket, Packet};
use basalt_transport::{Transport, TransportLocked};
use tracing::{debug, error};

/// Where a reader starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Init {
    /// Start at the oldest live frame.
    Oldest,
    /// Start at the newest live frame.
    MostRecent,
    /// Start strictly after the newest frame at construction time.
    AwaitNew,
}

/// How a reader advances after its first frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Iter {
    /// Emit every subsequent frame in order.
    Next,
    /// On wake, emit whichever frame is newest, possibly skipping.
    Newest,
}

/// Shared cursor logic for every reader variant.
struct Cursor {
    init: Init,
    iter: Iter,
    init_seq_high: u64,
    first_done: bool,
}

impl Cursor {
    fn new(lk: &TransportLocked<'_>, init: Init, iter: Iter) -> Cursor {
        Cursor {
            init,
            iter,
            init_seq_high: lk.seq_high(),
            first_done: false,
        }
    }

    fn has_next(&self, lk: &TransportLocked<'_>) -> bool {
        if !self.first_done {
            match self.init {
                Init::Oldest | Init::MostRecent => !lk.empty(),
                Init::AwaitNew => lk.seq_high() > self.init_seq_high,
            }
        } else {
            lk.has_next()
        }
    }

    /// Position the cursor on the next frame to emit. Callers check
    /// [`Cursor::has_next`] first.
    fn advance(&mut self, lk: &mut TransportLocked<'_>) -> Result<()> {
        if !self.first_done {
            match self.init {
                Init::Oldest => lk.jump_head()?,
                Init::MostRecent => lk.jump_tail()?,
                Init::AwaitNew => {
                    lk.jump_head()?;
                    while lk.frame()?.hdr.seq <= self.init_seq_high {
                        lk.step_next()?;
                    }
                }
            }
            self.first_done = true;
        } else {
            match self.iter {
                Iter::Next => lk.step_next()?,
                Iter::Newest => lk.jump_tail()?,
            }
        }
        Ok(())
    }
}

/// Synchronous zero-copy reader.
///
/// `next` hands the callback the held lock and a packet view aliased into
/// the arena; neither may be retained beyond the callback's return (the
/// borrows enforce this).
pub struct ReaderSyncZc {
    transport: Transport,
    cursor: Cursor,
}

impl ReaderSyncZc {
    pub fn new(arena: Arena, init: Init, iter: Iter) -> Result<ReaderSyncZc> {
        let mut transport = Transport::open(arena)?;
        let cursor = {
            let lk = transport.lock()?;
            Cursor::new(&lk, init, iter)
        };
        Ok(ReaderSyncZc { transport, cursor })
    }

    /// Whether a frame is available right now. Non-blocking.
    pub fn has_next(&mut self) -> Result<bool> {
        let lk = self.transport.lock()?;
        Ok(self.cursor.has_next(&lk))
    }

    /// Emit the next frame through `f`, or `Again` if none is available.
    pub fn next<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&TransportLocked<'_>, FlatPacket<'_>) -> R,
    {
        let mut lk = self.transport.lock()?;
        if !self.cursor.has_next(&lk) {
            return Err(Error::Again);
        }
        self.cursor.advance(&mut lk)?;
        let view = lk.frame()?;
        let flat = FlatPacket::new(view.data)?;
        Ok(f(&lk, flat))
    }

    /// Like [`ReaderSyncZc::next`], but waits for a frame; `deadline`
    /// bounds the wait.
    pub fn next_blocking<F, R>(&mut self, deadline: Option<TimeMono>, f: F) -> Result<R>
    where
        F: FnOnce(&TransportLocked<'_>, FlatPacket<'_>) -> R,
    {
        let mut lk = self.transport.lock()?;
        let cursor = &self.cursor;
        match deadline {
            None => lk.wait(|lk| Ok(cursor.has_next(lk)))?,
            Some(d) => lk.wait_until(|lk| Ok(cursor.has_next(lk)), d)?,
        }
        self.cursor.advance(&mut lk)?;
        let view = lk.frame()?;
        let flat = FlatPacket::new(view.data)?;
        Ok(f(&lk, flat))
    }
}

/// Synchronous copying reader: yields owned [`Packet`]s, no lock held
/// across the return.
pub struct ReaderSync {
    inner: ReaderSyncZc,
}

impl ReaderSync {
    pub fn new(arena: Arena, init: Init, iter: Iter) -> Result<ReaderSync> {
        Ok(ReaderSync {
            inner: ReaderSyncZc::new(arena, init, iter)?,
        })
    }

    pub fn has_next(&mut self) -> Result<bool> {
        self.inner.has_next()
    }

    pub fn next(&mut self) -> Result<Packet> {
        self.inner.next(|_lk, flat| flat.to_packet())
    }

    pub fn next_blocking(&mut self, deadline: Option<TimeMono>) -> Result<Packet> {
        self.inner.next_blocking(deadline, |_lk, flat| flat.to_packet())
    }
}

type ZcCallback = Box<dyn FnMut(&TransportLocked<'_>, FlatPacket<'_>) + Send>;
type PacketCallback = Box<dyn FnMut(Packet) + Send>;

enum Sink {
    Zc(ZcCallback),
    Owned(PacketCallback),
}

struct Shared {
    stop: AtomicBool,
}

/// Run `f`; a panicking user callback is fatal — continuing would risk
/// silently skipping frames under a held lock.
fn guard_callback<R>(f: impl FnOnce() -> R) -> R {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(_) => {
            error!("reader callback panicked; aborting");
            std::process::abort();
        }
    }
}

fn reader_loop(mut transport: Transport, mut cursor: Cursor, shared: Arc<Shared>, mut sink: Sink) {
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let mut owned: Option<Packet> = None;
        {
            let mut lk = match transport.lock() {
                Ok(lk) => lk,
                Err(e) => {
                    error!(error = %e, "reader thread failed to lock transport");
                    break;
                }
            };
            let stop = &shared.stop;
            let cur = &cursor;
            if let Err(e) = lk.wait(|lk| Ok(stop.load(Ordering::Acquire) || cur.has_next(lk))) {
                error!(error = %e, "reader thread wait failed");
                break;
            }
            if shared.stop.load(Ordering::Acquire) {
                break;
            }
            let flat_res = cursor
                .advance(&mut lk)
                .and_then(|()| lk.frame())
                .and_then(|view| FlatPacket::new(view.data));
            match flat_res {
                Ok(flat) => match &mut sink {
                    Sink::Zc(cb) => guard_callback(|| cb(&lk, flat)),
                    Sink::Owned(_) => owned = Some(flat.to_packet()),
                },
                Err(e) => {
                    error!(error = %e, "reader thread failed to read frame");
                    break;
                }
            }
        }
        // The copying variant runs the user callback without the lock.
        if let Some(pkt) = owned {
            if let Sink::Owned(cb) = &mut sink {
                guard_callback(|| cb(pkt));
            }
        }
    }
    debug!("reader thread exiting");
}

/// Requests a background reader to shut down. Cloneable and safe to use
/// from inside the reader's own callback.
#[derive(Clone)]
pub struct CloseHandle {
    arena: Arena,
    shared: Arc<Shared>,
    thread_id: ThreadId,
}

impl CloseHandle {
    /// Schedule the reader to stop after the current loop turn. Does not
    /// join; idempotent.
    pub fn async_close(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if std::thread::current().id() != self.thread_id {
            // Wake the thread if it is parked. From the reader thread
            // itself the loop re-checks the flag after the callback, and
            // taking the lock here would self-deadlock.
            let _ = notify(&self.arena);
        }
    }
}

fn notify(arena: &Arena) -> Result<()> {
    let mut t = Transport::open(arena.clone())?;
    let lk = t.lock()?;
    lk.broadcast()
}

struct BgReader {
    arena: Arena,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl BgReader {
    fn spawn(arena: Arena, init: Init, iter: Iter, sink: Sink) -> Result<BgReader> {
        let mut transport = Transport::open(arena.clone())?;
        let cursor = {
            let lk = transport.lock()?;
            Cursor::new(&lk, init, iter)
        };
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("basalt-reader".into())
            .spawn(move || reader_loop(transport, cursor, thread_shared, sink))
            .map_err(Error::Sys)?;
        let thread_id = thread.thread().id();
        Ok(BgReader {
            arena,
            shared,
            thread: Some(thread),
            thread_id,
        })
    }

    fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            arena: self.arena.clone(),
            shared: Arc::clone(&self.shared),
            thread_id: self.thread_id,
        }
    }

    fn close(&mut self) -> Result<()> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };
        self.shared.stop.store(true, Ordering::Release);
        if std::thread::current().id() == self.thread_id {
            // Close from inside the callback: behave like async_close to
            // avoid self-join; the loop exits after the callback returns.
            drop(handle);
            return Ok(());
        }
        notify(&self.arena)?;
        handle
            .join()
            .map_err(|_| Error::Custom("reader thread panicked".into()))
    }

    fn async_close(&self) {
        self.close_handle().async_close();
    }
}

impl Drop for BgReader {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "reader close failed");
        }
    }
}

/// Background zero-copy reader: a dedicated thread invokes the callback
/// under the transport lock with a view aliased into the arena. The
/// callback must not retain the lock or the view beyond its return.
pub struct ReaderZc {
    bg: BgReader,
}

impl ReaderZc {
    pub fn new<F>(arena: Arena, init: Init, iter: Iter, on_packet: F) -> Result<ReaderZc>
    where
        F: FnMut(&TransportLocked<'_>, FlatPacket<'_>) + Send + 'static,
    {
        Ok(ReaderZc {
            bg: BgReader::spawn(arena, init, iter, Sink::Zc(Box::new(on_packet)))?,
        })
    }

    /// A handle for closing this reader from inside its own callback.
    pub fn close_handle(&self) -> CloseHandle {
        self.bg.close_handle()
    }

    /// Stop the reader thread and join it. Idempotent; also runs on drop.
    /// Must not be called from within the callback — use
    /// [`ReaderZc::async_close`] or a [`CloseHandle`] there.
    pub fn close(&mut self) -> Result<()> {
        self.bg.close()
    }

    /// Schedule the shutdown without joining.
    pub fn async_close(&self) {
        self.bg.async_close()
    }
}

/// Background copying reader: a dedicated thread copies each frame out
/// and invokes the callback with an owned [`Packet`], without the lock.
pub struct Reader {
    bg: BgReader,
}

impl Reader {
    pub fn new<F>(arena: Arena, init: Init, iter: Iter, on_packet: F) -> Result<Reader>
    where
        F: FnMut(Packet) + Send + 'static,
    {
        Ok(Reader {
            bg: BgReader::spawn(arena, init, iter, Sink::Owned(Box::new(on_packet)))?,
        })
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.bg.close_handle()
    }

    pub fn close(&mut self) -> Result<()> {
        self.bg.close()
    }

    pub fn async_close(&self) {
        self.bg.async_close()
    }
}

/// One-shot read.
///
/// Nonblocking: `Again` if no data is available — immediately for
/// [`Init::AwaitNew`], which by definition starts with nothing to read.
/// Blocking: waits for the first matching frame.
pub fn read_one(arena: Arena, init: Init, nonblocking: bool) -> Result<Packet> {
    if nonblocking && init == Init::AwaitNew {
        return Err(Error::Again);
    }
    let mut reader = ReaderSync::new(arena, init, Iter::Next)?;
    if nonblocking {
        if !reader.has_next()? {
            return Err(Error::Again);
        }
        reader.next()
    } else {
        reader.next_blocking(None)
    }
}
