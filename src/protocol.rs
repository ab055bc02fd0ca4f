//! MessagePack request codec.
//!
//! A request is one MessagePack map with at least two entries:
//!
//! ```text
//! { "type": 1 | 2, "content": { "x": i, "y": i, "z": i, "w": i, "h": i, ... } }
//! ```
//!
//! [`decode`] walks the value in place over the caller's slice, so nothing is
//! allocated and nothing borrowed outlives the call. Values the server does
//! not care about are skipped with a pending-value counter instead of
//! recursion, which keeps deeply nested input from growing the stack.
//!
//! Bytes arriving in pieces go through a [`Framer`] first. It remembers how
//! far it has scanned, so each new read costs only the bytes it added, and
//! [`decode`] runs once per complete message.
//!
//! Responses go the other way as `{ "type", "ok", "content" }` maps, see
//! [`encode_response`].

use std::fmt;

use rmp::{encode, Marker};
use thiserror::Error;

use crate::error::{Result, TileliteError};

/// Message tag carried in the `type` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Invalid,
    TileRequest,
    Prerender,
}

impl MessageType {
    pub fn from_wire(value: u64) -> Self {
        match value {
            1 => MessageType::TileRequest,
            2 => MessageType::Prerender,
            _ => MessageType::Invalid,
        }
    }

    pub fn as_wire(self) -> u64 {
        match self {
            MessageType::Invalid => 0,
            MessageType::TileRequest => 1,
            MessageType::Prerender => 2,
        }
    }
}

/// Tile coordinates and pixel size extracted from a request's `content`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Tile {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub w: i32,
    pub h: i32,
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{} ({}x{})", self.z, self.x, self.y, self.w, self.h)
    }
}

/// A structurally valid request, not yet tied to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub kind: MessageType,
    pub tile: Tile,
}

/// Why a complete candidate message was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Malformed {
    #[error("message is not a map")]
    NotAMap,
    #[error("message map has {0} entries, expected at least 2")]
    TooFewEntries(u32),
    #[error("reserved marker byte 0xc1")]
    ReservedMarker,
    #[error("`type` is missing or not a known message type")]
    BadType,
    #[error("`content` is missing, empty or not a map")]
    BadContent,
    #[error("content key `{0}` is not an integer")]
    BadCoordinate(&'static str),
}

/// Outcome of one [`decode`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decode {
    /// The buffer holds a prefix of a message; nothing was consumed.
    Incomplete,
    /// One request and the number of bytes it occupied at the buffer front.
    Decoded(Request, usize),
    /// The candidate message is invalid. The stream cannot be resynchronized.
    Malformed(Malformed),
}

/// Decodes the message at the front of `buf`.
pub fn decode(buf: &[u8]) -> Decode {
    let mut reader = Reader::new(buf);
    match reader.request() {
        Ok(request) => Decode::Decoded(request, reader.pos),
        Err(Stop::Incomplete) => Decode::Incomplete,
        Err(Stop::Malformed(reason)) => Decode::Malformed(reason),
    }
}

/// Outcome of one [`Framer::advance`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// More bytes are needed before the message ends.
    Pending,
    /// A whole message occupies this many bytes at the buffer front.
    Complete(usize),
    /// The bytes cannot start a request.
    Malformed(Malformed),
}

/// Resumable boundary scan for the message at the front of a growing buffer.
///
/// Each value is skipped only once it is fully buffered, so `scanned`
/// always sits on a value boundary and a later call resumes there. The
/// caller must not change bytes before `scanned` and must [`reset`] the
/// framer after consuming a message.
///
/// [`reset`]: Framer::reset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framer {
    scanned: usize,
    pending: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self {
            scanned: 0,
            pending: 1,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Bytes already known to belong to the current message.
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    /// Scans whatever `buf` holds past the last boundary reached.
    pub fn advance(&mut self, buf: &[u8]) -> Frame {
        while self.pending > 0 {
            let mut reader = Reader::at(buf, self.scanned);
            let children = match reader.whole_value_head(self.scanned == 0) {
                Ok(children) => children,
                Err(Stop::Incomplete) => return Frame::Pending,
                Err(Stop::Malformed(reason)) => return Frame::Malformed(reason),
            };
            self.pending = (self.pending - 1).saturating_add(children);
            self.scanned = reader.pos;
        }
        Frame::Complete(self.scanned)
    }
}

enum Stop {
    Incomplete,
    Malformed(Malformed),
}

type Parse<T> = std::result::Result<T, Stop>;

enum Integer {
    Unsigned(u64),
    Signed(i64),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self::at(buf, 0)
    }

    fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take(&mut self, n: usize) -> Parse<&'a [u8]> {
        if self.buf.len().saturating_sub(self.pos) < n {
            return Err(Stop::Incomplete);
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Parse<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn len8(&mut self) -> Parse<usize> {
        Ok(self.array::<1>()?[0] as usize)
    }

    fn len16(&mut self) -> Parse<usize> {
        Ok(u16::from_be_bytes(self.array()?) as usize)
    }

    fn len32(&mut self) -> Parse<usize> {
        Ok(u32::from_be_bytes(self.array()?) as usize)
    }

    fn marker(&mut self) -> Parse<Marker> {
        match Marker::from_u8(self.array::<1>()?[0]) {
            Marker::Reserved => Err(Stop::Malformed(Malformed::ReservedMarker)),
            marker => Ok(marker),
        }
    }

    fn map_len(&mut self, marker: Marker) -> Parse<Option<usize>> {
        Ok(match marker {
            Marker::FixMap(n) => Some(n as usize),
            Marker::Map16 => Some(self.len16()?),
            Marker::Map32 => Some(self.len32()?),
            _ => None,
        })
    }

    fn str(&mut self, marker: Marker) -> Parse<Option<&'a [u8]>> {
        let len = match marker {
            Marker::FixStr(n) => n as usize,
            Marker::Str8 => self.len8()?,
            Marker::Str16 => self.len16()?,
            Marker::Str32 => self.len32()?,
            _ => return Ok(None),
        };
        self.take(len).map(Some)
    }

    fn integer(&mut self, marker: Marker) -> Parse<Option<Integer>> {
        Ok(Some(match marker {
            Marker::FixPos(n) => Integer::Unsigned(n as u64),
            Marker::FixNeg(n) => Integer::Signed(n as i64),
            Marker::U8 => Integer::Unsigned(u8::from_be_bytes(self.array()?) as u64),
            Marker::U16 => Integer::Unsigned(u16::from_be_bytes(self.array()?) as u64),
            Marker::U32 => Integer::Unsigned(u32::from_be_bytes(self.array()?) as u64),
            Marker::U64 => Integer::Unsigned(u64::from_be_bytes(self.array()?)),
            Marker::I8 => Integer::Signed(i8::from_be_bytes(self.array()?) as i64),
            Marker::I16 => Integer::Signed(i16::from_be_bytes(self.array()?) as i64),
            Marker::I32 => Integer::Signed(i32::from_be_bytes(self.array()?) as i64),
            Marker::I64 => Integer::Signed(i64::from_be_bytes(self.array()?)),
            _ => return Ok(None),
        }))
    }

    /// Payload byte count and child value count of the value `marker` opens.
    fn extent(&mut self, marker: Marker) -> Parse<(usize, usize)> {
        Ok(match marker {
            Marker::FixPos(_)
            | Marker::FixNeg(_)
            | Marker::Null
            | Marker::True
            | Marker::False => (0, 0),
            Marker::U8 | Marker::I8 => (1, 0),
            Marker::U16 | Marker::I16 => (2, 0),
            Marker::U32 | Marker::I32 | Marker::F32 => (4, 0),
            Marker::U64 | Marker::I64 | Marker::F64 => (8, 0),
            Marker::FixStr(n) => (n as usize, 0),
            Marker::Str8 | Marker::Bin8 => (self.len8()?, 0),
            Marker::Str16 | Marker::Bin16 => (self.len16()?, 0),
            Marker::Str32 | Marker::Bin32 => (self.len32()?, 0),
            Marker::FixArray(n) => (0, n as usize),
            Marker::Array16 => (0, self.len16()?),
            Marker::Array32 => (0, self.len32()?),
            Marker::FixMap(n) => (0, 2 * n as usize),
            Marker::Map16 => (0, 2 * self.len16()?),
            Marker::Map32 => (0, self.len32()?.saturating_mul(2)),
            Marker::FixExt1 => (2, 0),
            Marker::FixExt2 => (3, 0),
            Marker::FixExt4 => (5, 0),
            Marker::FixExt8 => (9, 0),
            Marker::FixExt16 => (17, 0),
            Marker::Ext8 => (self.len8()? + 1, 0),
            Marker::Ext16 => (self.len16()? + 1, 0),
            Marker::Ext32 => (self.len32()?.saturating_add(1), 0),
            Marker::Reserved => return Err(Stop::Malformed(Malformed::ReservedMarker)),
        })
    }

    /// Reads one value's marker and payload, all or nothing, and returns
    /// how many child values follow it.
    fn whole_value_head(&mut self, top_level: bool) -> Parse<usize> {
        let marker = self.marker()?;
        if top_level && !matches!(marker, Marker::FixMap(_) | Marker::Map16 | Marker::Map32) {
            return Err(Stop::Malformed(Malformed::NotAMap));
        }
        let (bytes, children) = self.extent(marker)?;
        self.take(bytes)?;
        Ok(children)
    }

    /// Skips the rest of a value whose marker has already been read.
    fn skip(&mut self, mut marker: Marker) -> Parse<()> {
        let mut pending: usize = 0;
        loop {
            let (bytes, children) = self.extent(marker)?;
            self.take(bytes)?;
            pending = pending.saturating_add(children);
            if pending == 0 {
                return Ok(());
            }
            pending -= 1;
            marker = self.marker()?;
        }
    }

    /// Reads a map key, returning `None` (and skipping it) unless it is a string.
    fn key(&mut self) -> Parse<Option<&'a [u8]>> {
        let marker = self.marker()?;
        match self.str(marker)? {
            Some(key) => Ok(Some(key)),
            None => {
                self.skip(marker)?;
                Ok(None)
            }
        }
    }

    fn message_type(&mut self, marker: Marker) -> Parse<MessageType> {
        let wire = match self.integer(marker)? {
            Some(Integer::Unsigned(v)) => v,
            Some(Integer::Signed(v)) if v >= 0 => v as u64,
            _ => return Err(Stop::Malformed(Malformed::BadType)),
        };
        match MessageType::from_wire(wire) {
            MessageType::Invalid => Err(Stop::Malformed(Malformed::BadType)),
            kind => Ok(kind),
        }
    }

    fn coordinate(&mut self, name: &'static str, marker: Marker) -> Parse<i32> {
        // 64-bit wire value narrowed to 32 bits, unsigned values reinterpreted
        match self.integer(marker)? {
            Some(Integer::Unsigned(v)) => Ok(v as i64 as i32),
            Some(Integer::Signed(v)) => Ok(v as i32),
            None => Err(Stop::Malformed(Malformed::BadCoordinate(name))),
        }
    }

    /// Reads the `content` map, returning its entry count and the coordinates found.
    fn content(&mut self, marker: Marker) -> Parse<(usize, Tile)> {
        let Some(entries) = self.map_len(marker)? else {
            return Err(Stop::Malformed(Malformed::BadContent));
        };

        let mut tile = Tile::default();
        for _ in 0..entries {
            let key = self.key()?;
            let value = self.marker()?;
            let slot = match key {
                Some(b"x") => Some(("x", &mut tile.x)),
                Some(b"y") => Some(("y", &mut tile.y)),
                Some(b"z") => Some(("z", &mut tile.z)),
                Some(b"w") => Some(("w", &mut tile.w)),
                Some(b"h") => Some(("h", &mut tile.h)),
                _ => None,
            };
            match slot {
                Some((name, field)) => *field = self.coordinate(name, value)?,
                None => self.skip(value)?,
            }
        }
        Ok((entries, tile))
    }

    fn request(&mut self) -> Parse<Request> {
        let marker = self.marker()?;
        let Some(entries) = self.map_len(marker)? else {
            return Err(Stop::Malformed(Malformed::NotAMap));
        };
        if entries < 2 {
            return Err(Stop::Malformed(Malformed::TooFewEntries(entries as u32)));
        }

        let mut kind = MessageType::Invalid;
        let mut content = None;
        for _ in 0..entries {
            let key = self.key()?;
            let value = self.marker()?;
            match key {
                Some(b"type") => kind = self.message_type(value)?,
                Some(b"content") => content = Some(self.content(value)?),
                _ => self.skip(value)?,
            }
        }

        match (kind, content) {
            (MessageType::Invalid, _) => Err(Stop::Malformed(Malformed::BadType)),
            (_, None) | (_, Some((0, _))) => Err(Stop::Malformed(Malformed::BadContent)),
            (kind, Some((_, tile))) => Ok(Request { kind, tile }),
        }
    }
}

fn encode_error(err: impl fmt::Display) -> TileliteError {
    TileliteError::Encode(err.to_string())
}

/// Appends one response map to `out`.
///
/// `outcome` is the rendered tile on success or the failure text sent to
/// the client.
pub fn encode_response(
    kind: MessageType,
    outcome: std::result::Result<&[u8], &str>,
    out: &mut Vec<u8>,
) -> Result<()> {
    encode::write_map_len(out, 3).map_err(encode_error)?;
    encode::write_str(out, "type").map_err(encode_error)?;
    encode::write_uint(out, kind.as_wire()).map_err(encode_error)?;
    encode::write_str(out, "ok").map_err(encode_error)?;
    encode::write_bool(out, outcome.is_ok()).map_err(encode_error)?;
    encode::write_str(out, "content").map_err(encode_error)?;
    match outcome {
        Ok(bytes) => encode::write_bin(out, bytes).map_err(encode_error)?,
        Err(message) => encode::write_str(out, message).map_err(encode_error)?,
    }
    Ok(())
}

/// Appends one request map to `out`. This is the client half of the codec.
pub fn encode_request(request: &Request, out: &mut Vec<u8>) -> Result<()> {
    let tile = &request.tile;
    encode::write_map_len(out, 2).map_err(encode_error)?;
    encode::write_str(out, "type").map_err(encode_error)?;
    encode::write_uint(out, request.kind.as_wire()).map_err(encode_error)?;
    encode::write_str(out, "content").map_err(encode_error)?;
    encode::write_map_len(out, 5).map_err(encode_error)?;
    for (key, value) in [("x", tile.x), ("y", tile.y), ("z", tile.z), ("w", tile.w), ("h", tile.h)] {
        encode::write_str(out, key).map_err(encode_error)?;
        encode::write_sint(out, value as i64).map_err(encode_error)?;
    }
    Ok(())
}
