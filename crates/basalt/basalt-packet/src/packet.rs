use basalt_core::{Error, Result};

use crate::id::{ID_LEN, PacketId};

const WORD: usize = std::mem::size_of::<usize>();

fn read_word(buf: &[u8], at: usize) -> usize {
    usize::from_ne_bytes(buf[at..at + WORD].try_into().unwrap())
}

fn write_word(buf: &mut [u8], at: usize, v: usize) {
    buf[at..at + WORD].copy_from_slice(&v.to_ne_bytes());
}

/// One utf-8 key/value header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub val: String,
}

/// Computed sizes of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketStats {
    /// Number of headers.
    pub num_headers: usize,
    /// User-provided content: header keys and values plus the payload.
    pub content_size: usize,
    /// Size in serialized form: content plus id, index and terminators.
    pub serial_size: usize,
}

/// An owned, unserialized packet: id, ordered headers, payload.
#[derive(Clone, Debug)]
pub struct Packet {
    id: PacketId,
    headers: Vec<Header>,
    payload: Vec<u8>,
}

impl Packet {
    /// A packet with a fresh random id and no headers.
    pub fn new(payload: impl Into<Vec<u8>>) -> Packet {
        Packet::with_id(PacketId::random(), payload)
    }

    pub fn with_id(id: PacketId, payload: impl Into<Vec<u8>>) -> Packet {
        Packet {
            id,
            headers: Vec::new(),
            payload: payload.into(),
        }
    }

    pub fn id(&self) -> &PacketId {
        &self.id
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Append a header. Headers form a multimap; duplicate keys are fine.
    pub fn push_header(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.headers.push(Header {
            key: key.into(),
            val: val.into(),
        });
    }

    /// The first value for `key`, if any.
    pub fn find_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.val.as_str())
    }

    /// Every value for `key`, in insertion order.
    pub fn headers_matching<'s>(&'s self, key: &'s str) -> impl Iterator<Item = &'s str> {
        self.headers
            .iter()
            .filter(move |h| h.key == key)
            .map(|h| h.val.as_str())
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    pub fn stats(&self) -> PacketStats {
        let content: usize = self
            .headers
            .iter()
            .map(|h| h.key.len() + h.val.len())
            .sum::<usize>()
            + self.payload.len();
        PacketStats {
            num_headers: self.headers.len(),
            content_size: content,
            serial_size: self.serialized_size(),
        }
    }

    /// Exact size of the serialized form.
    pub fn serialized_size(&self) -> usize {
        let index = WORD * (2 * self.headers.len() + 2);
        let strings: usize = self
            .headers
            .iter()
            .map(|h| h.key.len() + 1 + h.val.len() + 1)
            .sum();
        ID_LEN + index + strings + self.payload.len()
    }

    /// Serialize into a caller-supplied buffer of exactly
    /// [`Packet::serialized_size`] bytes. This is the zero-copy write path:
    /// the buffer is typically a transport frame allocation.
    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.serialized_size() {
            return Err(Error::InvalidArg("serialize buffer has the wrong size"));
        }

        buf[..ID_LEN].copy_from_slice(self.id.as_bytes());

        let mut idx_off = ID_LEN;
        write_word(buf, idx_off, self.headers.len());
        idx_off += WORD;

        let mut off = ID_LEN + WORD * (2 * self.headers.len() + 2);
        for h in &self.headers {
            write_word(buf, idx_off, off);
            idx_off += WORD;
            buf[off..off + h.key.len()].copy_from_slice(h.key.as_bytes());
            off += h.key.len();
            buf[off] = 0;
            off += 1;

            write_word(buf, idx_off, off);
            idx_off += WORD;
            buf[off..off + h.val.len()].copy_from_slice(h.val.as_bytes());
            off += h.val.len();
            buf[off] = 0;
            off += 1;
        }

        write_word(buf, idx_off, off);
        buf[off..off + self.payload.len()].copy_from_slice(&self.payload);
        Ok(())
    }

    /// Serialize into an owned buffer.
    pub fn serialize(&self) -> FlatPacketBuf {
        let mut buf = vec![0u8; self.serialized_size()];
        self.serialize_into(&mut buf).unwrap();
        FlatPacketBuf { buf }
    }
}

/// A zero-copy view over a serialized packet.
///
/// Construction validates the whole layout, so every accessor afterwards
/// is O(1) and infallible except for lookups that can miss.
#[derive(Clone, Copy)]
pub struct FlatPacket<'a> {
    buf: &'a [u8],
    num_headers: usize,
}

impl<'a> FlatPacket<'a> {
    pub fn new(buf: &'a [u8]) -> Result<FlatPacket<'a>> {
        if buf.len() < ID_LEN + 2 * WORD {
            return Err(Error::InvalidArg("flat packet too short"));
        }
        PacketId::from_bytes(&buf[..ID_LEN])?;

        let num_headers = read_word(buf, ID_LEN);
        let index_end = (2usize.checked_mul(num_headers))
            .and_then(|n| n.checked_add(2))
            .and_then(|n| n.checked_mul(WORD))
            .and_then(|n| n.checked_add(ID_LEN))
            .ok_or(Error::InvalidArg("flat packet header count overflows"))?;
        if index_end > buf.len() {
            return Err(Error::InvalidArg("flat packet index exceeds buffer"));
        }

        // Offsets must walk monotonically from the end of the index to the
        // payload, and every header string must carry its NUL.
        let fp = FlatPacket { buf, num_headers };
        let mut prev = index_end;
        for i in 0..2 * num_headers {
            let off = read_word(buf, ID_LEN + WORD * (1 + i));
            let min = if i == 0 { prev } else { prev + 1 };
            if off < min || off > buf.len() {
                return Err(Error::InvalidArg("flat packet offset out of order"));
            }
            if i > 0 && buf[off - 1] != 0 {
                return Err(Error::InvalidArg("flat packet header missing terminator"));
            }
            prev = off;
        }
        let payload_off = fp.payload_off();
        if payload_off > buf.len()
            || payload_off < prev + usize::from(num_headers > 0)
            || (num_headers > 0 && buf[payload_off - 1] != 0)
        {
            return Err(Error::InvalidArg("flat packet payload offset invalid"));
        }
        for i in 0..num_headers {
            let (key, val) = fp.header_bytes(i);
            if std::str::from_utf8(key).is_err() || std::str::from_utf8(val).is_err() {
                return Err(Error::InvalidArg("flat packet header is not utf-8"));
            }
        }
        Ok(fp)
    }

    /// Wrap a buffer this crate serialized itself.
    pub(crate) fn trusted(buf: &'a [u8]) -> FlatPacket<'a> {
        FlatPacket {
            buf,
            num_headers: read_word(buf, ID_LEN),
        }
    }

    fn key_off(&self, i: usize) -> usize {
        read_word(self.buf, ID_LEN + WORD * (1 + 2 * i))
    }

    fn val_off(&self, i: usize) -> usize {
        read_word(self.buf, ID_LEN + WORD * (1 + 2 * i + 1))
    }

    fn payload_off(&self) -> usize {
        read_word(self.buf, ID_LEN + WORD * (1 + 2 * self.num_headers))
    }

    fn header_bytes(&self, i: usize) -> (&'a [u8], &'a [u8]) {
        let key_off = self.key_off(i);
        let val_off = self.val_off(i);
        let val_end = if i + 1 < self.num_headers {
            self.key_off(i + 1)
        } else {
            self.payload_off()
        };
        // Lengths come from the offset deltas, excluding the NUL.
        (
            &self.buf[key_off..val_off - 1],
            &self.buf[val_off..val_end - 1],
        )
    }

    pub fn id(&self) -> PacketId {
        PacketId::from_bytes(&self.buf[..ID_LEN]).unwrap()
    }

    pub fn id_str(&self) -> &'a str {
        std::str::from_utf8(&self.buf[..ID_LEN - 1]).unwrap()
    }

    pub fn num_headers(&self) -> usize {
        self.num_headers
    }

    /// The i-th header. `NotFound` past the end.
    pub fn header(&self, i: usize) -> Result<(&'a str, &'a str)> {
        if i >= self.num_headers {
            return Err(Error::NotFound);
        }
        let (key, val) = self.header_bytes(i);
        // Validated utf-8 at construction.
        Ok(unsafe {
            (
                std::str::from_utf8_unchecked(key),
                std::str::from_utf8_unchecked(val),
            )
        })
    }

    /// The first value for `key`. `NotFound` on miss.
    pub fn find_header(&self, key: &str) -> Result<&'a str> {
        self.headers()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
            .ok_or(Error::NotFound)
    }

    pub fn headers(&self) -> HeaderIter<'a> {
        HeaderIter { fp: *self, idx: 0 }
    }

    /// Iterate the values whose key equals `key`.
    pub fn headers_matching<'k>(&self, key: &'k str) -> HeaderMatchIter<'a, 'k> {
        HeaderMatchIter {
            inner: self.headers(),
            key,
        }
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buf[self.payload_off()..]
    }

    pub fn stats(&self) -> PacketStats {
        let index_end = ID_LEN + WORD * (2 * self.num_headers + 2);
        let strings = self.payload_off() - index_end;
        PacketStats {
            num_headers: self.num_headers,
            content_size: strings - 2 * self.num_headers + self.payload().len(),
            serial_size: self.buf.len(),
        }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }

    /// Deep-copy into an owned [`Packet`].
    pub fn to_packet(&self) -> Packet {
        let mut pkt = Packet::with_id(self.id(), self.payload().to_vec());
        for (k, v) in self.headers() {
            pkt.push_header(k, v);
        }
        pkt
    }

    /// Deep-copy the serialized bytes.
    pub fn to_owned_buf(&self) -> FlatPacketBuf {
        FlatPacketBuf {
            buf: self.buf.to_vec(),
        }
    }
}

impl std::fmt::Debug for FlatPacket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatPacket")
            .field("id", &self.id_str())
            .field("num_headers", &self.num_headers)
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

/// Walks every header of a [`FlatPacket`] by index.
pub struct HeaderIter<'a> {
    fp: FlatPacket<'a>,
    idx: usize,
}

impl<'a> Iterator for HeaderIter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let out = self.fp.header(self.idx).ok()?;
        self.idx += 1;
        Some(out)
    }
}

/// Walks the headers of a [`FlatPacket`] whose key matches exactly.
pub struct HeaderMatchIter<'a, 'k> {
    inner: HeaderIter<'a>,
    key: &'k str,
}

impl<'a> Iterator for HeaderMatchIter<'a, '_> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .by_ref()
            .find(|(k, _)| *k == self.key)
            .map(|(_, v)| v)
    }
}

/// An owned serialized packet.
#[derive(Clone, Debug)]
pub struct FlatPacketBuf {
    buf: Vec<u8>,
}

impl FlatPacketBuf {
    pub fn as_flat(&self) -> FlatPacket<'_> {
        FlatPacket::trusted(&self.buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}
