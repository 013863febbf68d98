//! Client-side mirror of the server's world, rebuilt purely from chunks

use crate::chat::ChatLog;
use log::{debug, trace};
use shared::protocol::split_batch;
use shared::{
    Action, Chunk, MessageKind, ProtocolError, Region, RegionError, TerrainMap, LAND_HEIGHT,
    LAND_WIDTH, MAX_NAME_LEN, MAX_PLAYERS, ORIGIN_SERVER,
};
use std::time::Instant;

/// What the client knows about one tank slot
///
/// `angle` is the magnitude of the aim and `facing_left` its direction, as
/// split out of the signed wire angle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TankView {
    pub active: bool,
    pub x: u16,
    pub y: u16,
    pub angle: u8,
    pub facing_left: bool,
    pub name: String,
}

/// Position of the ammo crate while it is on the map
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrateView {
    pub active: bool,
    pub x: u16,
    pub y: u16,
}

/// Everything a presentation layer needs to draw one frame
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub terrain: TerrainMap,
    pub tanks: [TankView; MAX_PLAYERS],
    /// Positions from the latest bullet snapshot; replaced wholesale each tick
    pub bullets: Vec<(u16, u16)>,
    pub ammo_crate: CrateView,
    pub chat: ChatLog,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            terrain: TerrainMap::new(LAND_WIDTH, LAND_HEIGHT),
            tanks: Default::default(),
            bullets: Vec::new(),
            ammo_crate: CrateView::default(),
            chat: ChatLog::new(),
        }
    }
}

impl Snapshot {
    /// Tank `id` if it is in play
    pub fn tank(&self, id: u8) -> Option<&TankView> {
        self.tanks.get(id as usize).filter(|t| t.active)
    }

    /// Active tanks with their ids
    pub fn active_tanks(&self) -> impl Iterator<Item = (u8, &TankView)> {
        self.tanks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.active)
            .map(|(id, t)| (id as u8, t))
    }
}

/// Applies server chunks to a [`Snapshot`]
///
/// Per-tick deltas (tank and crate moves, bullet lists) are ignored until
/// the first full-map terrain chunk has arrived.
#[derive(Debug, Clone, Default)]
pub struct ClientReplica {
    snapshot: Snapshot,
    synced: bool,
}

impl ClientReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Whether the baseline terrain has been received
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Decodes and applies a single chunk, timestamping chat with the current time
    pub fn apply_chunk(&mut self, buf: &[u8]) -> Result<&Snapshot, ProtocolError> {
        self.apply_chunk_at(buf, Instant::now())
    }

    /// Like [`Self::apply_chunk`] with an explicit clock for chat expiry
    pub fn apply_chunk_at(&mut self, buf: &[u8], now: Instant) -> Result<&Snapshot, ProtocolError> {
        let chunk = Chunk::decode(buf)?;
        self.apply(chunk, now)?;
        Ok(&self.snapshot)
    }

    /// Applies every chunk of a batch in order, stopping at the first error
    pub fn apply_batch(&mut self, batch: &[u8], now: Instant) -> Result<&Snapshot, ProtocolError> {
        for raw in split_batch(batch)? {
            let chunk = Chunk::decode(raw)?;
            self.apply(chunk, now)?;
        }
        self.snapshot.chat.expire(now);
        Ok(&self.snapshot)
    }

    /// Drops chat lines that have been on screen long enough
    pub fn expire_chat(&mut self, now: Instant) {
        self.snapshot.chat.expire(now);
    }

    /// Applies one decoded chunk
    pub fn apply(&mut self, chunk: Chunk, now: Instant) -> Result<(), ProtocolError> {
        match chunk {
            Chunk::Land { region, cells } | Chunk::PackedLand { region, cells } => {
                self.apply_land(region, &cells)
            }
            Chunk::Tank {
                id,
                action,
                x,
                y,
                angle,
            } => self.apply_tank(id, action, x, y, angle),
            Chunk::Bullets { positions } => {
                if self.synced {
                    self.snapshot.bullets = positions;
                }
                Ok(())
            }
            Chunk::Crate { action, x, y } => {
                self.apply_crate(action, x, y);
                Ok(())
            }
            Chunk::ServerMsg { origin, kind, text } => self.apply_message(origin, kind, &text, now),
            other => Err(ProtocolError::UnexpectedChunk(other.chunk_type())),
        }
    }

    fn apply_land(&mut self, region: Region, cells: &[u8]) -> Result<(), ProtocolError> {
        self.snapshot
            .terrain
            .write_region(region, cells)
            .map_err(|e| match e {
                RegionError::OutOfBounds(region) => ProtocolError::RegionOutOfBounds(region),
                RegionError::LengthMismatch { expected, actual } => {
                    ProtocolError::LandLength { expected, actual }
                }
            })?;

        if !self.synced && region == self.snapshot.terrain.bounds() {
            debug!("Baseline terrain received");
            self.synced = true;
        }
        Ok(())
    }

    fn apply_tank(
        &mut self,
        id: u8,
        action: Action,
        x: u16,
        y: u16,
        angle: i8,
    ) -> Result<(), ProtocolError> {
        let tank = self
            .snapshot
            .tanks
            .get_mut(id as usize)
            .ok_or(ProtocolError::IdOutOfRange(id))?;

        match action {
            Action::Spawn => tank.active = true,
            // a move never resurrects a killed tank
            Action::Move if !self.synced || !tank.active => return Ok(()),
            Action::Move => {}
            Action::Kill => {
                *tank = TankView::default();
                return Ok(());
            }
        }

        tank.x = x;
        tank.y = y;
        tank.angle = angle.unsigned_abs();
        tank.facing_left = angle < 0;
        Ok(())
    }

    fn apply_crate(&mut self, action: Action, x: u16, y: u16) {
        let ammo_crate = &mut self.snapshot.ammo_crate;
        match action {
            Action::Spawn => *ammo_crate = CrateView { active: true, x, y },
            Action::Move if self.synced => {
                ammo_crate.x = x;
                ammo_crate.y = y;
            }
            Action::Move => {}
            Action::Kill => ammo_crate.active = false,
        }
    }

    fn apply_message(
        &mut self,
        origin: u8,
        kind: MessageKind,
        text: &[u8],
        now: Instant,
    ) -> Result<(), ProtocolError> {
        let is_player = (origin as usize) < MAX_PLAYERS;
        if !is_player && !(kind == MessageKind::Notice && origin == ORIGIN_SERVER) {
            return Err(ProtocolError::IdOutOfRange(origin));
        }
        let text = String::from_utf8_lossy(text);

        match kind {
            MessageKind::Chat => {
                let name = &self.snapshot.tanks[origin as usize].name;
                let line = format!("<{}> {}", name, text);
                self.snapshot.chat.push(line, now);
            }
            MessageKind::NameChange => {
                if text.is_empty() || text.len() > MAX_NAME_LEN {
                    trace!("Ignoring name change of {} bytes for {}", text.len(), origin);
                    return Ok(());
                }
                self.snapshot.tanks[origin as usize].name = text.into_owned();
            }
            MessageKind::Notice => self.snapshot.chat.push(text.into_owned(), now),
        }
        Ok(())
    }
}
