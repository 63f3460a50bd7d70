//! `basalt-packet`: the framing format carried inside transport frames.
//!
//! A packet is a unit of information with three parts: a unique **id**, a
//! multimap of utf-8 **headers**, and an arbitrary binary **payload**.
//!
//! The serialized form has four sections — id, index, header contents,
//! payload — where the index gives O(1) lookup of every header and the
//! payload:
//!
//! ```text
//! +-------------------------------+
//! | id: 36 ascii chars + NUL      |
//! +-------------------------------+
//! | num headers (usize)           |
//! | offset of hdr 0 key (usize)   |
//! | offset of hdr 0 val (usize)   |
//! |   ...                         |
//! | offset of payload (usize)     |
//! +-------------------------------+
//! | hdr 0 key NUL hdr 0 val NUL...|
//! +-------------------------------+
//! | payload                       |
//! +-------------------------------+
//! ```
//!
//! Offsets are measured from the start of the packet. Header keys and
//! values carry a trailing NUL, but the index gives exact lengths — reads
//! use offset deltas, never string scanning. Offsets are native-endian
//! `usize`: the layout is stable on one architecture, not portable across
//! architectures.
//!
//! Header keys starting with `a0_` are reserved. See the key constants
//! below.

mod id;
mod packet;

pub use id::PacketId;
pub use packet::{FlatPacket, FlatPacketBuf, Header, HeaderIter, HeaderMatchIter, Packet, PacketStats};

/// Annotates a dependence on another packet; the value is a packet id.
/// May appear multiple times.
pub const DEP_KEY: &str = "a0_deps";
/// Monotonic clock value, decimal nanoseconds.
pub const TIME_MONO_KEY: &str = "a0_time_mono";
/// Wall clock value, RFC-3339 with nanoseconds.
pub const TIME_WALL_KEY: &str = "a0_time_wall";
/// Sequence number among all packets in the transport.
pub const TRANSPORT_SEQ_KEY: &str = "a0_transport_seq";
/// Sequence number from the writer.
pub const WRITER_SEQ_KEY: &str = "a0_writer_seq";
/// Unique id of the writer.
pub const WRITER_ID_KEY: &str = "a0_writer_id";
