use basalt_core::{Error, Result};

/// Length of the canonical uuid rendering, without the terminator.
pub(crate) const ID_STR_LEN: usize = 36;
/// Serialized id size: 36 ascii chars plus a NUL.
pub(crate) const ID_LEN: usize = 37;

/// Unique identifier of a packet: a canonical-form uuid, stored as 36
/// ascii characters plus a trailing NUL so it can be handed to C-string
/// consumers unmodified.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId {
    bytes: [u8; ID_LEN],
}

impl PacketId {
    /// Mint a fresh random (v4) id.
    pub fn random() -> PacketId {
        let mut bytes = [0u8; ID_LEN];
        let rendered = uuid::Uuid::new_v4();
        let mut buf = [0u8; ID_STR_LEN];
        rendered.hyphenated().encode_lower(&mut buf);
        bytes[..ID_STR_LEN].copy_from_slice(&buf);
        PacketId { bytes }
    }

    /// Adopt the 37 serialized bytes of an id.
    pub fn from_bytes(raw: &[u8]) -> Result<PacketId> {
        if raw.len() != ID_LEN || raw[ID_STR_LEN] != 0 {
            return Err(Error::InvalidArg("packet id must be 36 chars + NUL"));
        }
        if !raw[..ID_STR_LEN].iter().all(|b| b.is_ascii_graphic()) {
            return Err(Error::InvalidArg("packet id must be printable ascii"));
        }
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(raw);
        Ok(PacketId { bytes })
    }

    pub fn as_str(&self) -> &str {
        // Construction guarantees ascii.
        std::str::from_utf8(&self.bytes[..ID_STR_LEN]).unwrap()
    }

    /// The serialized form, including the trailing NUL.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketId({})", self.as_str())
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
