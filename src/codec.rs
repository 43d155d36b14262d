//! Framing of msgpack values on a byte stream.
//!
//! Msgpack is self-delimiting, so a frame is exactly one encoded value. The
//! decoder buffers bytes until a whole value is available.

use bytes::{Buf, BufMut, BytesMut};
use rmpv::{decode, Value};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// A [`Decoder`]/[`Encoder`] for whole [`rmpv::Value`]s.
#[derive(Debug, Clone)]
pub struct MsgpackCodec {
    max_message_size: usize,
    scan: Scan,
}

impl MsgpackCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            scan: Scan::default(),
        }
    }

    fn too_large(&mut self, size: usize) -> io::Error {
        self.scan = Scan::default();
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "message of at least {size} bytes exceeds the {} byte limit",
                self.max_message_size
            ),
        )
    }
}

impl Default for MsgpackCodec {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

/// Progress through the value at the front of the buffer.
///
/// Only headers are inspected, so the buffered prefix is walked once no matter
/// how many reads it takes to arrive. `pos` is the start of the first element
/// not yet known to be complete.
#[derive(Debug, Clone, Copy)]
struct Scan {
    pos: usize,
    remaining: u64,
}

impl Default for Scan {
    fn default() -> Self {
        Self {
            pos: 0,
            remaining: 1,
        }
    }
}

enum Extent {
    /// The first value occupies this many bytes.
    Complete(usize),
    /// At least this many bytes are needed.
    Partial(usize),
}

impl Scan {
    fn resume(&mut self, buf: &[u8]) -> Extent {
        while self.remaining > 0 {
            let (size, children) = match element(&buf[self.pos..]) {
                Ok(element) => element,
                Err(needed) => return Extent::Partial(self.pos.saturating_add(needed)),
            };
            let end = usize::try_from(size)
                .map_or(usize::MAX, |size| self.pos.saturating_add(size));
            if end > buf.len() {
                return Extent::Partial(end);
            }
            self.pos = end;
            self.remaining = (self.remaining - 1).saturating_add(children);
        }
        Extent::Complete(self.pos)
    }
}

/// Big-endian length field of `width` bytes at `at`.
fn length(buf: &[u8], at: usize, width: usize) -> Result<u64, usize> {
    let bytes = buf.get(at..at + width).ok_or(at + width)?;
    Ok(bytes.iter().fold(0, |n, byte| (n << 8) | u64::from(*byte)))
}

/// Size of one element's own bytes (marker, length fields, payload) and how
/// many child elements follow it. `Err` holds how many bytes are needed to
/// tell.
fn element(buf: &[u8]) -> Result<(u64, u64), usize> {
    let marker = *buf.first().ok_or(1usize)?;
    let fix = u64::from(marker & 0x0f);
    Ok(match marker {
        0x00..=0x7f | 0xc0..=0xc3 | 0xe0..=0xff => (1, 0),
        0x80..=0x8f => (1, 2 * fix),
        0x90..=0x9f => (1, fix),
        0xa0..=0xbf => (1 + u64::from(marker & 0x1f), 0),
        0xc4 | 0xd9 => (2 + length(buf, 1, 1)?, 0),
        0xc5 | 0xda => (3 + length(buf, 1, 2)?, 0),
        0xc6 | 0xdb => (5 + length(buf, 1, 4)?, 0),
        0xc7 => (3 + length(buf, 1, 1)?, 0),
        0xc8 => (4 + length(buf, 1, 2)?, 0),
        0xc9 => (6 + length(buf, 1, 4)?, 0),
        0xcc | 0xd0 => (2, 0),
        0xcd | 0xd1 => (3, 0),
        0xca | 0xce | 0xd2 => (5, 0),
        0xcb | 0xcf | 0xd3 => (9, 0),
        0xd4 => (3, 0),
        0xd5 => (4, 0),
        0xd6 => (6, 0),
        0xd7 => (10, 0),
        0xd8 => (18, 0),
        0xdc => (3, length(buf, 1, 2)?),
        0xdd => (5, length(buf, 1, 4)?),
        0xde => (3, 2 * length(buf, 1, 2)?),
        0xdf => (5, 2 * length(buf, 1, 4)?),
    })
}

impl Decoder for MsgpackCodec {
    type Item = Value;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Value>> {
        let len = match self.scan.resume(src) {
            Extent::Complete(len) => len,
            Extent::Partial(needed) if needed > self.max_message_size => {
                return Err(self.too_large(needed));
            }
            Extent::Partial(_) => return Ok(None),
        };
        self.scan = Scan::default();
        if len > self.max_message_size {
            return Err(self.too_large(len));
        }

        let mut frame = &src[..len];
        let value = decode::read_value(&mut frame)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        src.advance(len);
        Ok(Some(value))
    }
}

impl Encoder<Value> for MsgpackCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> io::Result<()> {
        let mut writer = dst.writer();
        rmpv::encode::write_value(&mut writer, &item)
            .map_err(|err| io::Error::other(err.to_string()))
    }
}
