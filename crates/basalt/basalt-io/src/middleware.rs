//! Middleware: stages that intercept and modify packets before they are
//! serialized onto the arena.
//!
//! Processing happens in two phases. `process` runs for every stage, in
//! chain order, before the transport lock is taken. `process_locked` runs
//! for every stage, again in chain order, with the lock held and just
//! before serialization — this is where transport-dependent headers and
//! read-modify-write payload transforms belong.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use basalt_core::time::{TimeMono, TimeWall};
use basalt_core::{Error, Result};
use basalt_packet::{
    FlatPacket, Packet, PacketId, TIME_MONO_KEY, TIME_WALL_KEY, TRANSPORT_SEQ_KEY, WRITER_ID_KEY,
    WRITER_SEQ_KEY,
};
use basalt_transport::TransportLocked;

/// Whether the chain keeps running after a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Short-circuit: later stages and the terminal write are skipped.
    Stop,
}

/// A packet-processing stage owned by a writer.
///
/// Each instance belongs to exactly one writer; the writer calls `close`
/// (innermost stage first) when it closes.
pub trait Middleware: Send {
    /// Pre-lock phase. May mutate the packet or short-circuit.
    fn process(&mut self, pkt: &mut Packet) -> Result<Flow> {
        let _ = pkt;
        Ok(Flow::Continue)
    }

    /// Under-lock phase, just before serialization.
    fn process_locked(
        &mut self,
        lk: &mut TransportLocked<'_>,
        pkt: &mut Packet,
    ) -> Result<Flow> {
        let _ = (lk, pkt);
        Ok(Flow::Continue)
    }

    /// Release stage-owned resources. Called once by the owning writer.
    fn close(&mut self) {}
}

struct Composed {
    stages: Vec<Box<dyn Middleware>>,
}

impl Middleware for Composed {
    fn process(&mut self, pkt: &mut Packet) -> Result<Flow> {
        for stage in &mut self.stages {
            if stage.process(pkt)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn process_locked(&mut self, lk: &mut TransportLocked<'_>, pkt: &mut Packet) -> Result<Flow> {
        for stage in &mut self.stages {
            if stage.process_locked(lk, pkt)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn close(&mut self) {
        for stage in self.stages.iter_mut().rev() {
            stage.close();
        }
    }
}

/// Compose stages into one middleware. Processing runs in the given
/// order; `close` runs in reverse.
pub fn compose(stages: Vec<Box<dyn Middleware>>) -> Box<dyn Middleware> {
    Box::new(Composed { stages })
}

struct AddTimeMonoHeader;

impl Middleware for AddTimeMonoHeader {
    fn process(&mut self, pkt: &mut Packet) -> Result<Flow> {
        pkt.push_header(TIME_MONO_KEY, TimeMono::now()?.as_ns().to_string());
        Ok(Flow::Continue)
    }
}

/// Adds `a0_time_mono`: decimal nanoseconds on the monotonic clock.
pub fn add_time_mono_header() -> Box<dyn Middleware> {
    Box::new(AddTimeMonoHeader)
}

struct AddTimeWallHeader;

impl Middleware for AddTimeWallHeader {
    fn process(&mut self, pkt: &mut Packet) -> Result<Flow> {
        pkt.push_header(TIME_WALL_KEY, TimeWall::now()?.to_rfc3339());
        Ok(Flow::Continue)
    }
}

/// Adds `a0_time_wall`: RFC-3339 nanosecond UTC timestamp.
pub fn add_time_wall_header() -> Box<dyn Middleware> {
    Box::new(AddTimeWallHeader)
}

struct AddWriterIdHeader {
    id: PacketId,
}

impl Middleware for AddWriterIdHeader {
    fn process(&mut self, pkt: &mut Packet) -> Result<Flow> {
        pkt.push_header(WRITER_ID_KEY, self.id.as_str());
        Ok(Flow::Continue)
    }
}

/// Adds `a0_writer_id`: a uuid minted when the middleware is created.
pub fn add_writer_id_header() -> Box<dyn Middleware> {
    Box::new(AddWriterIdHeader {
        id: PacketId::random(),
    })
}

struct AddWriterSeqHeader {
    next: u64,
}

impl Middleware for AddWriterSeqHeader {
    fn process(&mut self, pkt: &mut Packet) -> Result<Flow> {
        pkt.push_header(WRITER_SEQ_KEY, self.next.to_string());
        self.next += 1;
        Ok(Flow::Continue)
    }
}

/// Adds `a0_writer_seq`: 0-based count of packets written by this writer.
pub fn add_writer_seq_header() -> Box<dyn Middleware> {
    Box::new(AddWriterSeqHeader { next: 0 })
}

struct AddTransportSeqHeader;

impl Middleware for AddTransportSeqHeader {
    fn process_locked(&mut self, lk: &mut TransportLocked<'_>, pkt: &mut Packet) -> Result<Flow> {
        pkt.push_header(TRANSPORT_SEQ_KEY, lk.next_seq().to_string());
        Ok(Flow::Continue)
    }
}

/// Adds `a0_transport_seq`: the sequence number the frame will carry.
/// Requires the lock, so it runs in the locked phase.
pub fn add_transport_seq_header() -> Box<dyn Middleware> {
    Box::new(AddTransportSeqHeader)
}

/// All of the standard header middleware.
pub fn add_standard_headers() -> Box<dyn Middleware> {
    compose(vec![
        add_time_mono_header(),
        add_time_wall_header(),
        add_writer_id_header(),
        add_writer_seq_header(),
        add_transport_seq_header(),
    ])
}

struct WriteIfEmpty {
    written: Arc<AtomicBool>,
}

impl Middleware for WriteIfEmpty {
    fn process_locked(&mut self, lk: &mut TransportLocked<'_>, _pkt: &mut Packet) -> Result<Flow> {
        if lk.empty() {
            self.written.store(true, Ordering::Release);
            Ok(Flow::Continue)
        } else {
            self.written.store(false, Ordering::Release);
            Ok(Flow::Stop)
        }
    }
}

/// Skip the write if the transport already has a frame. `written` records
/// whether the most recent write went through.
pub fn write_if_empty(written: Arc<AtomicBool>) -> Box<dyn Middleware> {
    Box::new(WriteIfEmpty { written })
}

struct JsonMergepatch;

fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    use serde_json::Value;
    if let Value::Object(patch_map) = patch {
        if !target.is_object() {
            *target = Value::Object(serde_json::Map::new());
        }
        let target_map = target.as_object_mut().unwrap();
        for (key, val) in patch_map {
            if val.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), val);
            }
        }
    } else {
        *target = patch.clone();
    }
}

fn json_err(what: &str, e: serde_json::Error) -> Error {
    Error::Custom(format!("json_mergepatch: {what}: {e}"))
}

impl Middleware for JsonMergepatch {
    fn process_locked(&mut self, lk: &mut TransportLocked<'_>, pkt: &mut Packet) -> Result<Flow> {
        if lk.empty() {
            // Nothing to merge against; the incoming document is the base.
            return Ok(Flow::Continue);
        }
        lk.jump_tail()?;
        let mut base: serde_json::Value = {
            let view = lk.frame()?;
            let flat = FlatPacket::new(view.data)?;
            serde_json::from_slice(flat.payload()).map_err(|e| json_err("newest frame", e))?
        };
        let patch: serde_json::Value =
            serde_json::from_slice(pkt.payload()).map_err(|e| json_err("incoming payload", e))?;
        merge_patch(&mut base, &patch);
        pkt.set_payload(serde_json::to_vec(&base).map_err(|e| json_err("merged document", e))?);
        Ok(Flow::Continue)
    }
}

/// Replace the payload with the RFC 7386 merge-patch of the newest frame's
/// JSON payload and the incoming JSON payload. Requires the lock.
pub fn json_mergepatch() -> Box<dyn Middleware> {
    Box::new(JsonMergepatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut doc = json!({"a": "b", "c": {"d": "e", "f": "g"}});
        merge_patch(&mut doc, &json!({"a": "z", "c": {"f": null}}));
        assert_eq!(doc, json!({"a": "z", "c": {"d": "e"}}));

        let mut doc = json!({"a": 1});
        merge_patch(&mut doc, &json!([1, 2, 3]));
        assert_eq!(doc, json!([1, 2, 3]));

        let mut doc = json!("scalar");
        merge_patch(&mut doc, &json!({"k": "v"}));
        assert_eq!(doc, json!({"k": "v"}));
    }

    #[test]
    fn writer_seq_counts_from_zero() {
        let mut mw = AddWriterSeqHeader { next: 0 };
        let mut p0 = Packet::new(&b""[..]);
        let mut p1 = Packet::new(&b""[..]);
        mw.process(&mut p0).unwrap();
        mw.process(&mut p1).unwrap();
        assert_eq!(p0.find_header(WRITER_SEQ_KEY), Some("0"));
        assert_eq!(p1.find_header(WRITER_SEQ_KEY), Some("1"));
    }

    #[test]
    fn composed_closes_in_reverse() {
        struct Tracker {
            tag: u8,
            order: Arc<std::sync::Mutex<Vec<u8>>>,
        }
        impl Middleware for Tracker {
            fn close(&mut self) {
                self.order.lock().unwrap().push(self.tag);
            }
        }

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut composed = compose(vec![
            Box::new(Tracker { tag: 1, order: Arc::clone(&order) }),
            Box::new(Tracker { tag: 2, order: Arc::clone(&order) }),
            Box::new(Tracker { tag: 3, order: Arc::clone(&order) }),
        ]);
        composed.close();
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    }
}
