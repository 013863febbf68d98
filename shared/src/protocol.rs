//! Binary chunk protocol spoken between server and clients
//!
//! Every chunk starts with a one byte type tag followed by a fixed,
//! big-endian payload layout. Chunks are byte-stable: independently built
//! clients and servers must agree on every field, so nothing here goes
//! through serde.
//!
//! Chunks queued for one destination during a tick are flushed together as
//! a batch: a sequence of `len:u32 ‖ chunk` records, one batch per channel.
//! Decoding never tries to resynchronise; the first malformed byte fails the
//! whole batch and the connection that sent it is torn down.

use crate::rle::{self, RleError};
use crate::terrain::Region;
use crate::{LAND_HEIGHT, LAND_WIDTH};
use bytes::{BufMut, Bytes, BytesMut};

/// Chunk tag bytes, the first byte of every chunk
pub const LAND_CHUNK: u8 = 1;
pub const PACKED_LAND_CHUNK: u8 = 2;
pub const TANK_CHUNK: u8 = 3;
pub const BULLET_CHUNK: u8 = 4;
pub const CRATE_CHUNK: u8 = 5;
pub const SERVER_MSG_CHUNK: u8 = 6;
pub const CLIENT_MSG_CHUNK: u8 = 7;
pub const INPUT_CHUNK: u8 = 8;

/// Origin id used for notices that come from the server itself
pub const ORIGIN_SERVER: u8 = u8::MAX;

/// Coordinate sent for a tank that has been removed
pub const KILLED_COORD: u16 = u16::MAX;

/// Largest land region a chunk may describe
pub const MAX_LAND_AREA: usize = LAND_WIDTH * LAND_HEIGHT;

/// Errors raised while decoding chunks. Every variant is fatal for the
/// connection the bytes came from.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty chunk")]
    Empty,

    #[error("unknown chunk type {0}")]
    UnknownChunk(u8),

    #[error("chunk type {0:?} is not accepted here")]
    UnexpectedChunk(ChunkType),

    #[error("truncated payload: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} trailing bytes after chunk")]
    TrailingBytes(usize),

    #[error("invalid entity action {0}")]
    InvalidAction(u8),

    #[error("invalid message kind {0}")]
    InvalidMessageKind(u8),

    #[error("invalid input key code {0}")]
    InvalidInputKey(u8),

    #[error("entity id {0} out of range")]
    IdOutOfRange(u8),

    #[error("land region {0:?} is larger than the map")]
    RegionTooLarge(Region),

    #[error("land region {0:?} lies outside the map")]
    RegionOutOfBounds(Region),

    #[error("land payload holds {actual} cells, region needs {expected}")]
    LandLength { expected: usize, actual: usize },

    #[error("packed land payload: {0}")]
    Rle(#[from] RleError),
}

/// Chunk type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Land,
    PackedLand,
    Tank,
    Bullet,
    Crate,
    ServerMsg,
    ClientMsg,
    Input,
}

impl ChunkType {
    pub fn tag(self) -> u8 {
        match self {
            ChunkType::Land => LAND_CHUNK,
            ChunkType::PackedLand => PACKED_LAND_CHUNK,
            ChunkType::Tank => TANK_CHUNK,
            ChunkType::Bullet => BULLET_CHUNK,
            ChunkType::Crate => CRATE_CHUNK,
            ChunkType::ServerMsg => SERVER_MSG_CHUNK,
            ChunkType::ClientMsg => CLIENT_MSG_CHUNK,
            ChunkType::Input => INPUT_CHUNK,
        }
    }
}

impl TryFrom<u8> for ChunkType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            LAND_CHUNK => Ok(ChunkType::Land),
            PACKED_LAND_CHUNK => Ok(ChunkType::PackedLand),
            TANK_CHUNK => Ok(ChunkType::Tank),
            BULLET_CHUNK => Ok(ChunkType::Bullet),
            CRATE_CHUNK => Ok(ChunkType::Crate),
            SERVER_MSG_CHUNK => Ok(ChunkType::ServerMsg),
            CLIENT_MSG_CHUNK => Ok(ChunkType::ClientMsg),
            INPUT_CHUNK => Ok(ChunkType::Input),
            other => Err(ProtocolError::UnknownChunk(other)),
        }
    }
}

/// Lifecycle action carried by TANK and CRATE chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Spawn = 1,
    Move = 2,
    Kill = 3,
}

impl TryFrom<u8> for Action {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Action::Spawn),
            2 => Ok(Action::Move),
            3 => Ok(Action::Kill),
            other => Err(ProtocolError::InvalidAction(other)),
        }
    }
}

/// What a SERVER_MSG chunk carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Chat = 1,
    NameChange = 2,
    Notice = 3,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Chat),
            2 => Ok(MessageKind::NameChange),
            3 => Ok(MessageKind::Notice),
            other => Err(ProtocolError::InvalidMessageKind(other)),
        }
    }
}

/// Controls a client can hold down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Left,
    Right,
    Up,
    Down,
    Fire,
}

impl Key {
    pub const ALL: [Key; 5] = [Key::Left, Key::Right, Key::Up, Key::Down, Key::Fire];

    fn index(self) -> u8 {
        match self {
            Key::Left => 0,
            Key::Right => 1,
            Key::Up => 2,
            Key::Down => 3,
            Key::Fire => 4,
        }
    }
}

/// Whether an input code reports a key going down or coming back up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Press,
    Release,
}

/// One of the ten press/release codes carried by INPUT chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputKey {
    pub key: Key,
    pub edge: Edge,
}

impl InputKey {
    /// Pairs a key with an edge; always a valid code
    pub fn new(key: Key, edge: Edge) -> Self {
        Self { key, edge }
    }

    /// Wire code: presses are odd (1, 3, ...), the matching release follows
    pub fn code(self) -> u8 {
        let release = match self.edge {
            Edge::Press => 0,
            Edge::Release => 1,
        };
        1 + self.key.index() * 2 + release
    }

    /// Parses a wire code, rejecting anything outside 1..=10
    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        if !(1..=10).contains(&code) {
            return Err(ProtocolError::InvalidInputKey(code));
        }
        let key = Key::ALL[((code - 1) / 2) as usize];
        let edge = if (code - 1) % 2 == 0 {
            Edge::Press
        } else {
            Edge::Release
        };
        Ok(Self { key, edge })
    }
}

/// Transport channel a chunk travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Guaranteed, in-order delivery
    Reliable,
    /// Best effort. Loss costs one tick of staleness.
    Unreliable,
}

/// A decoded chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Land {
        region: Region,
        cells: Vec<u8>,
    },
    PackedLand {
        region: Region,
        cells: Vec<u8>,
    },
    Tank {
        id: u8,
        action: Action,
        x: u16,
        y: u16,
        /// Aim angle; negative when the tank faces left
        angle: i8,
    },
    Bullets {
        positions: Vec<(u16, u16)>,
    },
    Crate {
        action: Action,
        x: u16,
        y: u16,
    },
    ServerMsg {
        origin: u8,
        kind: MessageKind,
        text: Vec<u8>,
    },
    ClientMsg {
        text: Vec<u8>,
    },
    Input {
        key: InputKey,
        timestamp: u16,
    },
}

impl Chunk {
    /// Tag this chunk is written with
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Chunk::Land { .. } => ChunkType::Land,
            Chunk::PackedLand { .. } => ChunkType::PackedLand,
            Chunk::Tank { .. } => ChunkType::Tank,
            Chunk::Bullets { .. } => ChunkType::Bullet,
            Chunk::Crate { .. } => ChunkType::Crate,
            Chunk::ServerMsg { .. } => ChunkType::ServerMsg,
            Chunk::ClientMsg { .. } => ChunkType::ClientMsg,
            Chunk::Input { .. } => ChunkType::Input,
        }
    }

    /// Per-tick position updates go unreliable, everything else reliable
    pub fn channel(&self) -> Channel {
        match self {
            Chunk::Tank {
                action: Action::Move,
                ..
            }
            | Chunk::Crate {
                action: Action::Move,
                ..
            }
            | Chunk::Bullets { .. } => Channel::Unreliable,
            _ => Channel::Reliable,
        }
    }

    /// Encodes the chunk into a fresh buffer
    pub fn encode(&self) -> Bytes {
        let mut writer = ChunkWriter::new();
        self.write(&mut writer);
        writer.finish()
    }

    /// Appends the tag and payload to `w`
    ///
    /// Terrain in a PACKED_LAND chunk is run-length encoded here, so callers
    /// always hold raw cells.
    pub fn write(&self, w: &mut ChunkWriter) {
        w.put_u8(self.chunk_type().tag());
        match self {
            Chunk::Land { region, cells } => {
                w.put_region(region);
                w.put_bytes(cells);
            }
            Chunk::PackedLand { region, cells } => {
                w.put_region(region);
                w.put_bytes(&rle::encode(cells));
            }
            Chunk::Tank {
                id,
                action,
                x,
                y,
                angle,
            } => {
                w.put_u8(*id);
                w.put_u8(*action as u8);
                w.put_u16(*x);
                w.put_u16(*y);
                w.put_i8(*angle);
            }
            Chunk::Bullets { positions } => {
                let count = positions.len().min(u16::MAX as usize);
                w.put_u16(count as u16);
                for &(x, y) in &positions[..count] {
                    w.put_u16(x);
                    w.put_u16(y);
                }
            }
            Chunk::Crate { action, x, y } => {
                w.put_u8(*action as u8);
                w.put_u16(*x);
                w.put_u16(*y);
            }
            Chunk::ServerMsg { origin, kind, text } => {
                let len = text.len().min(u8::MAX as usize);
                w.put_u8(*origin);
                w.put_u8(*kind as u8);
                w.put_u8(len as u8);
                w.put_bytes(&text[..len]);
            }
            Chunk::ClientMsg { text } => {
                w.put_bytes(text);
            }
            Chunk::Input { key, timestamp } => {
                w.put_u8(key.code());
                w.put_u16(*timestamp);
            }
        }
    }

    /// Decodes exactly one chunk; leftover bytes are an error
    pub fn decode(buf: &[u8]) -> Result<Chunk, ProtocolError> {
        let mut r = ChunkReader::new(buf);
        if r.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let chunk = match ChunkType::try_from(r.read_u8()?)? {
            ChunkType::Land => {
                let region = r.read_region()?;
                let cells = r.read_bytes(region.area())?.to_vec();
                Chunk::Land { region, cells }
            }
            ChunkType::PackedLand => {
                let region = r.read_region()?;
                let packed = r.read_rest();
                let cells = rle::decode_with_limit(packed, region.area())?;
                if cells.len() != region.area() {
                    return Err(ProtocolError::LandLength {
                        expected: region.area(),
                        actual: cells.len(),
                    });
                }
                Chunk::PackedLand { region, cells }
            }
            ChunkType::Tank => Chunk::Tank {
                id: r.read_u8()?,
                action: Action::try_from(r.read_u8()?)?,
                x: r.read_u16()?,
                y: r.read_u16()?,
                angle: r.read_i8()?,
            },
            ChunkType::Bullet => {
                let count = r.read_u16()? as usize;
                let mut positions = Vec::with_capacity(count.min(r.remaining() / 4));
                for _ in 0..count {
                    positions.push((r.read_u16()?, r.read_u16()?));
                }
                Chunk::Bullets { positions }
            }
            ChunkType::Crate => Chunk::Crate {
                action: Action::try_from(r.read_u8()?)?,
                x: r.read_u16()?,
                y: r.read_u16()?,
            },
            ChunkType::ServerMsg => {
                let origin = r.read_u8()?;
                let kind = MessageKind::try_from(r.read_u8()?)?;
                let len = r.read_u8()? as usize;
                let text = r.read_bytes(len)?.to_vec();
                Chunk::ServerMsg { origin, kind, text }
            }
            ChunkType::ClientMsg => Chunk::ClientMsg {
                text: r.read_rest().to_vec(),
            },
            ChunkType::Input => Chunk::Input {
                key: InputKey::from_code(r.read_u8()?)?,
                timestamp: r.read_u16()?,
            },
        };

        r.finish()?;
        Ok(chunk)
    }
}

/// Builds the INPUT chunk for one key edge
pub fn encode_input(key: Key, edge: Edge, timestamp: u16) -> Bytes {
    Chunk::Input {
        key: InputKey::new(key, edge),
        timestamp,
    }
    .encode()
}

/// Append-only big-endian writer over an owned buffer
#[derive(Debug, Default)]
pub struct ChunkWriter {
    buf: BytesMut,
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    fn put_region(&mut self, region: &Region) {
        self.put_u16(region.x);
        self.put_u16(region.y);
        self.put_u16(region.width);
        self.put_u16(region.height);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freezes the written bytes into a cheaply cloneable buffer
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked big-endian cursor. Reading past the end reports
/// [`ProtocolError::Truncated`] instead of panicking.
#[derive(Debug)]
pub struct ChunkReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ChunkReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrows the next `len` bytes, or fails with `Truncated` if fewer remain
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Takes whatever is left. Used by chunks whose payload runs to the end.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, ProtocolError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_region(&mut self) -> Result<Region, ProtocolError> {
        let region = Region::new(
            self.read_u16()?,
            self.read_u16()?,
            self.read_u16()?,
            self.read_u16()?,
        );
        if region.area() > MAX_LAND_AREA {
            return Err(ProtocolError::RegionTooLarge(region));
        }
        Ok(region)
    }

    /// Fails if any bytes were left unread
    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}

/// Joins encoded chunks into one length-prefixed batch
pub fn encode_batch(chunks: &[Bytes]) -> Vec<u8> {
    let mut writer = ChunkWriter::new();
    for chunk in chunks {
        writer.put_u32(chunk.len() as u32);
        writer.put_bytes(chunk);
    }
    writer.finish().to_vec()
}

/// Splits a batch back into raw chunk slices without decoding them
pub fn split_batch(batch: &[u8]) -> Result<Vec<&[u8]>, ProtocolError> {
    let mut reader = ChunkReader::new(batch);
    let mut chunks = Vec::new();
    while !reader.is_empty() {
        let len = reader.read_u32()? as usize;
        chunks.push(reader.read_bytes(len)?);
    }
    Ok(chunks)
}

/// Splits and decodes a whole batch, stopping at the first bad chunk
pub fn decode_batch(batch: &[u8]) -> Result<Vec<Chunk>, ProtocolError> {
    split_batch(batch)?.into_iter().map(Chunk::decode).collect()
}

/// Per-destination queue of encoded chunks awaiting the next flush
#[derive(Debug, Default, Clone)]
pub struct SendQueue {
    reliable: Vec<Bytes>,
    unreliable: Vec<Bytes>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes `chunk` and queues it on the channel its kind travels on
    ///
    /// Tank and crate spawns and kills are reliable while moves are not, so
    /// two chunks of the same type may land in different batches.
    pub fn push(&mut self, chunk: &Chunk) {
        self.push_encoded(chunk.channel(), chunk.encode());
    }

    /// Queues bytes that were already encoded, so a broadcast encodes once
    pub fn push_encoded(&mut self, channel: Channel, bytes: Bytes) {
        match channel {
            Channel::Reliable => self.reliable.push(bytes),
            Channel::Unreliable => self.unreliable.push(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.reliable.len() + self.unreliable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reliable.is_empty() && self.unreliable.is_empty()
    }

    /// Drops everything queued without sending it
    pub fn clear(&mut self) {
        self.reliable.clear();
        self.unreliable.clear();
    }

    /// Drains the queue into at most one batch per channel, reliable first
    pub fn flush(&mut self) -> Vec<(Channel, Vec<u8>)> {
        let mut batches = Vec::with_capacity(2);
        if !self.reliable.is_empty() {
            batches.push((Channel::Reliable, encode_batch(&self.reliable)));
            self.reliable.clear();
        }
        if !self.unreliable.is_empty() {
            batches.push((Channel::Unreliable, encode_batch(&self.unreliable)));
            self.unreliable.clear();
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tank_chunk_layout() {
        let bytes = Chunk::Tank {
            id: 2,
            action: Action::Move,
            x: 0x0102,
            y: 300,
            angle: -35,
        }
        .encode();

        assert_eq!(&bytes[..], &[TANK_CHUNK, 2, 2, 0x01, 0x02, 0x01, 0x2C, 0xDD]);
    }

    #[test]
    fn test_server_msg_layout() {
        let bytes = Chunk::ServerMsg {
            origin: 3,
            kind: MessageKind::Chat,
            text: b"hi".to_vec(),
        }
        .encode();

        assert_eq!(&bytes[..], &[SERVER_MSG_CHUNK, 3, 1, 2, b'h', b'i']);
    }

    #[test]
    fn test_server_msg_text_is_capped() {
        let chunk = Chunk::ServerMsg {
            origin: ORIGIN_SERVER,
            kind: MessageKind::Notice,
            text: vec![b'x'; 400],
        };
        let decoded = Chunk::decode(&chunk.encode()).unwrap();
        match decoded {
            Chunk::ServerMsg { text, .. } => assert_eq!(text.len(), 255),
            _ => panic!("Wrong chunk type after decoding"),
        }
    }

    #[test]
    fn test_input_codes() {
        assert_eq!(InputKey::new(Key::Left, Edge::Press).code(), 1);
        assert_eq!(InputKey::new(Key::Left, Edge::Release).code(), 2);
        assert_eq!(InputKey::new(Key::Fire, Edge::Press).code(), 9);
        assert_eq!(InputKey::new(Key::Fire, Edge::Release).code(), 10);

        for code in 1..=10 {
            assert_eq!(InputKey::from_code(code).unwrap().code(), code);
        }
        assert_eq!(
            InputKey::from_code(0),
            Err(ProtocolError::InvalidInputKey(0))
        );
        assert_eq!(
            InputKey::from_code(11),
            Err(ProtocolError::InvalidInputKey(11))
        );
    }

    #[test]
    fn test_encode_input() {
        let bytes = encode_input(Key::Fire, Edge::Release, 700);
        assert_eq!(&bytes[..], &[INPUT_CHUNK, 10, 0x02, 0xBC]);
    }

    #[test]
    fn test_packed_land_decodes_cells() {
        let region = Region::new(10, 20, 4, 3);
        let cells = vec![0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 0, 1];
        let chunk = Chunk::PackedLand {
            region,
            cells: cells.clone(),
        };
        assert_eq!(Chunk::decode(&chunk.encode()).unwrap(), chunk);
    }

    #[test]
    fn test_packed_land_length_mismatch() {
        let mut w = ChunkWriter::new();
        w.put_u8(PACKED_LAND_CHUNK);
        for v in [0u16, 0, 2, 2] {
            w.put_u16(v);
        }
        w.put_bytes(&rle::encode(&[1, 1, 1]));
        assert_eq!(
            Chunk::decode(&w.finish()),
            Err(ProtocolError::LandLength {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_oversized_region_rejected() {
        let mut w = ChunkWriter::new();
        w.put_u8(LAND_CHUNK);
        for v in [0u16, 0, 1000, 1000] {
            w.put_u16(v);
        }
        assert!(matches!(
            Chunk::decode(&w.finish()),
            Err(ProtocolError::RegionTooLarge(_))
        ));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(Chunk::decode(&[]), Err(ProtocolError::Empty));
        assert_eq!(Chunk::decode(&[99]), Err(ProtocolError::UnknownChunk(99)));
        assert_eq!(
            Chunk::decode(&[TANK_CHUNK, 1, 1, 0]),
            Err(ProtocolError::Truncated {
                needed: 2,
                remaining: 1
            })
        );
        assert_eq!(
            Chunk::decode(&[TANK_CHUNK, 1, 9, 0, 0, 0, 0, 0]),
            Err(ProtocolError::InvalidAction(9))
        );
        assert_eq!(
            Chunk::decode(&[INPUT_CHUNK, 1, 0, 0, 7]),
            Err(ProtocolError::TrailingBytes(1))
        );
        assert_eq!(
            Chunk::decode(&[SERVER_MSG_CHUNK, 0, 4, 0]),
            Err(ProtocolError::InvalidMessageKind(4))
        );
    }

    #[test]
    fn test_bullet_count_must_match_payload() {
        assert_eq!(
            Chunk::decode(&[BULLET_CHUNK, 0, 2, 0, 1, 0, 2]),
            Err(ProtocolError::Truncated {
                needed: 2,
                remaining: 0
            })
        );
    }

    #[test]
    fn test_client_msg_takes_remaining_payload() {
        let chunk = Chunk::decode(&[CLIENT_MSG_CHUNK, b'/', b'n', b' ', b'x']).unwrap();
        assert_eq!(
            chunk,
            Chunk::ClientMsg {
                text: b"/n x".to_vec()
            }
        );
    }

    #[test]
    fn test_channels() {
        let moving = Chunk::Tank {
            id: 0,
            action: Action::Move,
            x: 0,
            y: 0,
            angle: 1,
        };
        let killed = Chunk::Tank {
            id: 0,
            action: Action::Kill,
            x: KILLED_COORD,
            y: KILLED_COORD,
            angle: 1,
        };
        assert_eq!(moving.channel(), Channel::Unreliable);
        assert_eq!(killed.channel(), Channel::Reliable);
        assert_eq!(
            Chunk::Bullets { positions: vec![] }.channel(),
            Channel::Unreliable
        );
        assert_eq!(
            Chunk::ClientMsg { text: vec![] }.channel(),
            Channel::Reliable
        );
    }

    #[test]
    fn test_send_queue_batches_per_channel() {
        let mut queue = SendQueue::new();
        queue.push(&Chunk::ClientMsg {
            text: b"one".to_vec(),
        });
        queue.push(&Chunk::Bullets {
            positions: vec![(1, 2)],
        });
        queue.push(&Chunk::ClientMsg {
            text: b"two".to_vec(),
        });
        assert_eq!(queue.len(), 3);

        let batches = queue.flush();
        assert!(queue.is_empty());
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, Channel::Reliable);
        assert_eq!(batches[1].0, Channel::Unreliable);

        let reliable = decode_batch(&batches[0].1).unwrap();
        assert_eq!(
            reliable,
            vec![
                Chunk::ClientMsg {
                    text: b"one".to_vec()
                },
                Chunk::ClientMsg {
                    text: b"two".to_vec()
                },
            ]
        );
        assert!(queue.flush().is_empty());
    }

    #[test]
    fn test_truncated_batch_is_rejected() {
        let mut batch = encode_batch(&[Chunk::ClientMsg {
            text: b"hello".to_vec(),
        }
        .encode()]);
        batch.pop();
        assert!(matches!(
            decode_batch(&batch),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_batch_with_unknown_chunk_fails() {
        let batch = encode_batch(&[
            encode_input(Key::Left, Edge::Press, 0),
            Bytes::from_static(&[0xEE, 1, 2]),
        ]);
        assert_eq!(
            decode_batch(&batch),
            Err(ProtocolError::UnknownChunk(0xEE))
        );
    }
}
