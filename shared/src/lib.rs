//! Types and codecs shared by the MOAG server and client
//!
//! - [`terrain`]: the destructible cell grid and its region helpers
//! - [`rle`]: run-length codec used for terrain payloads
//! - [`protocol`]: byte-stable chunk encoding and per-channel batching
//! - [`transport`]: reliable/unreliable datagram sessions over UDP

pub mod protocol;
pub mod rle;
pub mod terrain;
pub mod transport;

pub use protocol::{
    decode_batch, encode_batch, encode_input, Action, Channel, Chunk, ChunkReader, ChunkType,
    ChunkWriter, Edge, InputKey, Key, MessageKind, ProtocolError, SendQueue, KILLED_COORD,
    ORIGIN_SERVER,
};
pub use terrain::{Cell, Region, RegionError, TerrainMap};
pub use transport::{Packet, Peer, PeerEvent, TransportError};

/// Terrain size in cells
pub const LAND_WIDTH: usize = 800;
pub const LAND_HEIGHT: usize = 600;

/// Tank slots, and so the most sessions a server can hold
pub const MAX_PLAYERS: usize = 8;
/// Bullet slots. Shots fired while all are in flight are lost.
pub const MAX_BULLETS: usize = 256;

/// Longest nickname in bytes
pub const MAX_NAME_LEN: usize = 15;
/// Longest chat line in bytes
pub const MAX_CHAT_LEN: usize = 255;

/// UDP port used when none is given
pub const DEFAULT_PORT: u16 = 8080;
