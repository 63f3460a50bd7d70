use basalt_arena::Arena;
use basalt_core::Result;
use basalt_packet::Packet;
use basalt_transport::{Transport, TransportLocked};

use crate::middleware::{Flow, Middleware};

/// Serializes packets into a transport, through a middleware chain.
///
/// The chain is ordered outermost-first: [`Writer::wrap`] adds a stage
/// that runs before all existing stages. Each `write` runs every stage's
/// pre-lock phase, takes the transport lock once, runs every stage's
/// locked phase, then serializes the packet directly into a frame
/// allocation and commits.
pub struct Writer {
    transport: Transport,
    chain: Vec<Box<dyn Middleware>>,
    closed: bool,
}

impl Writer {
    pub fn new(arena: Arena) -> Result<Writer> {
        Ok(Writer {
            transport: Transport::open(arena)?,
            chain: Vec::new(),
            closed: false,
        })
    }

    /// Add an outer middleware stage.
    pub fn wrap(mut self, middleware: Box<dyn Middleware>) -> Writer {
        self.chain.insert(0, middleware);
        self
    }

    /// Process `pkt` through the chain and append it to the transport.
    ///
    /// A middleware may short-circuit, in which case nothing is written
    /// and `write` still succeeds.
    pub fn write(&mut self, mut pkt: Packet) -> Result<()> {
        for stage in &mut self.chain {
            if stage.process(&mut pkt)? == Flow::Stop {
                return Ok(());
            }
        }
        let mut lk = self.transport.lock()?;
        for stage in &mut self.chain {
            if stage.process_locked(&mut lk, &mut pkt)? == Flow::Stop {
                return Ok(());
            }
        }
        write_packet_locked(&mut lk, &pkt)
    }

    /// Close the middleware chain, innermost stage first. Idempotent;
    /// also runs on drop.
    pub fn close(&mut self) {
        if !self.closed {
            for stage in self.chain.iter_mut().rev() {
                stage.close();
            }
            self.closed = true;
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serialize `pkt` into a fresh frame under an already-held lock.
pub(crate) fn write_packet_locked(lk: &mut TransportLocked<'_>, pkt: &Packet) -> Result<()> {
    let size = pkt.serialized_size();
    let buf = lk.alloc(size)?;
    pkt.serialize_into(buf)?;
    lk.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{
        add_standard_headers, add_transport_seq_header, json_mergepatch, write_if_empty,
    };
    use crate::reader::{Init, Iter, ReaderSync};
    use basalt_arena::Mode;
    use basalt_packet::{
        TIME_MONO_KEY, TIME_WALL_KEY, TRANSPORT_SEQ_KEY, WRITER_ID_KEY, WRITER_SEQ_KEY,
    };
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn new_arena(buf: &mut Vec<u8>, size: usize) -> Arena {
        buf.resize(size, 0);
        unsafe { Arena::from_raw(buf.as_mut_ptr(), size, Mode::Shared) }.unwrap()
    }

    #[test]
    fn write_then_read_back() {
        let mut buf = Vec::new();
        let arena = new_arena(&mut buf, 4096);
        let mut w = Writer::new(arena.clone()).unwrap();
        w.write(Packet::new(&b"hello"[..])).unwrap();

        let mut r = ReaderSync::new(arena, Init::Oldest, Iter::Next).unwrap();
        let pkt = r.next().unwrap();
        assert_eq!(pkt.payload(), b"hello");
        assert!(pkt.headers().is_empty());
    }

    #[test]
    fn standard_headers_are_attached() {
        let mut buf = Vec::new();
        let arena = new_arena(&mut buf, 8192);
        let mut w = Writer::new(arena.clone()).unwrap().wrap(add_standard_headers());
        w.write(Packet::new(&b"p0"[..])).unwrap();
        w.write(Packet::new(&b"p1"[..])).unwrap();

        let mut r = ReaderSync::new(arena, Init::Oldest, Iter::Next).unwrap();
        let p0 = r.next().unwrap();
        let p1 = r.next().unwrap();

        for pkt in [&p0, &p1] {
            for key in [TIME_MONO_KEY, TIME_WALL_KEY, WRITER_ID_KEY, WRITER_SEQ_KEY] {
                assert!(pkt.find_header(key).is_some(), "missing {key}");
            }
        }
        assert_eq!(p0.find_header(WRITER_SEQ_KEY), Some("0"));
        assert_eq!(p1.find_header(WRITER_SEQ_KEY), Some("1"));
        assert_eq!(p0.find_header(TRANSPORT_SEQ_KEY), Some("1"));
        assert_eq!(p1.find_header(TRANSPORT_SEQ_KEY), Some("2"));
        // Same writer, same id.
        assert_eq!(
            p0.find_header(WRITER_ID_KEY),
            p1.find_header(WRITER_ID_KEY)
        );
        // Monotonic timestamps.
        let t0: u64 = p0.find_header(TIME_MONO_KEY).unwrap().parse().unwrap();
        let t1: u64 = p1.find_header(TIME_MONO_KEY).unwrap().parse().unwrap();
        assert!(t1 >= t0);
    }

    #[test]
    fn transport_seq_matches_frame_seq() {
        let mut buf = Vec::new();
        let arena = new_arena(&mut buf, 4096);
        let mut w = Writer::new(arena.clone())
            .unwrap()
            .wrap(add_transport_seq_header());
        w.write(Packet::new(&b"x"[..])).unwrap();

        let mut r = ReaderSync::new(arena.clone(), Init::Oldest, Iter::Next).unwrap();
        let pkt = r.next().unwrap();
        let mut t = Transport::open(arena).unwrap();
        let mut lk = t.lock().unwrap();
        lk.jump_tail().unwrap();
        assert_eq!(
            pkt.find_header(TRANSPORT_SEQ_KEY).unwrap(),
            lk.frame().unwrap().hdr.seq.to_string()
        );
    }

    #[test]
    fn write_if_empty_writes_once() {
        let mut buf = Vec::new();
        let arena = new_arena(&mut buf, 4096);
        let written = Arc::new(AtomicBool::new(false));
        let mut w = Writer::new(arena.clone())
            .unwrap()
            .wrap(write_if_empty(Arc::clone(&written)));

        w.write(Packet::new(&b"first"[..])).unwrap();
        assert!(written.load(Ordering::Acquire));

        w.write(Packet::new(&b"second"[..])).unwrap();
        assert!(!written.load(Ordering::Acquire));

        let mut r = ReaderSync::new(arena, Init::Oldest, Iter::Next).unwrap();
        assert_eq!(r.next().unwrap().payload(), b"first");
        assert!(!r.has_next().unwrap());
    }

    #[test]
    fn json_mergepatch_updates_newest_document() {
        let mut buf = Vec::new();
        let arena = new_arena(&mut buf, 8192);
        let mut w = Writer::new(arena.clone()).unwrap().wrap(json_mergepatch());

        w.write(Packet::new(json!({"a": 1, "b": 2}).to_string())).unwrap();
        w.write(Packet::new(json!({"b": null, "c": 3}).to_string()))
            .unwrap();

        let mut r = ReaderSync::new(arena, Init::MostRecent, Iter::Next).unwrap();
        let pkt = r.next().unwrap();
        let doc: serde_json::Value = serde_json::from_slice(pkt.payload()).unwrap();
        assert_eq!(doc, json!({"a": 1, "c": 3}));
    }

    #[test]
    fn short_circuit_skips_terminal_write() {
        struct Mute;
        impl crate::middleware::Middleware for Mute {
            fn process(&mut self, _pkt: &mut Packet) -> Result<Flow> {
                Ok(Flow::Stop)
            }
        }

        let mut buf = Vec::new();
        let arena = new_arena(&mut buf, 4096);
        let mut w = Writer::new(arena.clone()).unwrap().wrap(Box::new(Mute));
        w.write(Packet::new(&b"dropped"[..])).unwrap();

        let mut t = Transport::open(arena).unwrap();
        assert!(t.lock().unwrap().empty());
    }
}
