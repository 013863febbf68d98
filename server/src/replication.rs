//! Builds the chunks that keep client replicas in step with the simulation
//!
//! Terrain is only resent where a detonation touched it. Tank positions and
//! the bullet list are sent every tick regardless of change; they travel
//! unreliably and the next tick supersedes a lost one.

use crate::entity::{Crate, Tank};
use crate::game::{CrateChange, Simulator, TickReport};
use shared::{Action, Chunk, MessageKind, Region, KILLED_COORD};

/// Clamps a world coordinate into the range a u16 wire field can carry
/// without colliding with [`KILLED_COORD`].
pub fn wire_coord(value: i32) -> u16 {
    value.clamp(0, KILLED_COORD as i32 - 1) as u16
}

/// TANK chunk carrying a tank's current position and aim
///
/// Used with [`Action::Spawn`] in baselines and joins, and with
/// [`Action::Move`] every tick.
pub fn tank_chunk(id: u8, tank: &Tank, action: Action) -> Chunk {
    Chunk::Tank {
        id,
        action,
        x: wire_coord(tank.x),
        y: wire_coord(tank.y),
        angle: tank.wire_angle(),
    }
}

/// TANK chunk removing a tank from every replica
///
/// Both coordinates are [`KILLED_COORD`] so a client can tell a kill from
/// a move even without looking at the action byte.
pub fn tank_kill_chunk(id: u8) -> Chunk {
    Chunk::Tank {
        id,
        action: Action::Kill,
        x: KILLED_COORD,
        y: KILLED_COORD,
        angle: 0,
    }
}

/// SERVER_MSG announcing tank `id`'s display name
pub fn name_change_chunk(id: u8, name: &str) -> Chunk {
    Chunk::ServerMsg {
        origin: id,
        kind: MessageKind::NameChange,
        text: name.as_bytes().to_vec(),
    }
}

fn crate_chunk(action: Action, x: i32, y: i32) -> Chunk {
    Chunk::Crate {
        action,
        x: wire_coord(x),
        y: wire_coord(y),
    }
}

fn crate_spawn_chunk(ammo_crate: &Crate) -> Chunk {
    crate_chunk(Action::Spawn, ammo_crate.x, ammo_crate.y)
}

/// Terrain regions touched since the last flush
#[derive(Debug, Default, Clone)]
pub struct DirtyTracker {
    regions: Vec<Region>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a region to resend. Overlapping regions are kept as they are.
    pub fn mark(&mut self, region: Region) {
        self.regions.push(region);
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Hands back every region marked so far and clears the tracker
    pub fn take(&mut self) -> Vec<Region> {
        std::mem::take(&mut self.regions)
    }
}

/// Accumulates tick reports and turns them into per-tick delta chunks
#[derive(Debug, Default)]
pub struct ReplicationEncoder {
    dirty: DirtyTracker,
    crate_changes: Vec<CrateChange>,
}

impl ReplicationEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a tick's dirty regions and crate changes into the next delta
    pub fn record(&mut self, report: &TickReport) {
        for &region in &report.dirty {
            self.dirty.mark(region);
        }
        self.crate_changes.extend_from_slice(&report.crate_changes);
    }

    pub fn pending_regions(&self) -> usize {
        self.dirty.len()
    }

    /// Full state for a newly connected client: the whole terrain, every
    /// active tank, every known name and the crate if one is falling.
    pub fn baseline<'a>(
        sim: &Simulator,
        names: impl IntoIterator<Item = (u8, &'a str)>,
    ) -> Vec<Chunk> {
        let terrain = sim.terrain();
        let mut chunks = vec![Chunk::PackedLand {
            region: terrain.bounds(),
            cells: terrain.as_bytes().to_vec(),
        }];

        chunks.extend(
            sim.store()
                .tanks()
                .map(|(id, tank)| tank_chunk(id, tank, Action::Spawn)),
        );
        chunks.extend(
            names
                .into_iter()
                .map(|(id, name)| name_change_chunk(id, name)),
        );

        let ammo_crate = &sim.store().ammo_crate;
        if ammo_crate.active {
            chunks.push(crate_spawn_chunk(ammo_crate));
        }
        chunks
    }

    /// Delta chunks for the tick just simulated. Drains everything recorded.
    pub fn encode_tick(&mut self, sim: &Simulator) -> Vec<Chunk> {
        let terrain = sim.terrain();
        let mut chunks: Vec<Chunk> = self
            .dirty
            .take()
            .into_iter()
            .map(|region| Chunk::PackedLand {
                region,
                cells: terrain.serialize_region(region),
            })
            .collect();

        chunks.extend(
            self.crate_changes
                .drain(..)
                .map(|change| crate_chunk(change.action, change.x, change.y)),
        );

        chunks.extend(
            sim.store()
                .tanks()
                .map(|(id, tank)| tank_chunk(id, tank, Action::Move)),
        );

        chunks.push(Chunk::Bullets {
            positions: sim
                .store()
                .bullets()
                .map(|b| (wire_coord(b.x), wire_coord(b.y)))
                .collect(),
        });
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::BulletKind;
    use shared::{Channel, LAND_HEIGHT, LAND_WIDTH};

    #[test]
    fn test_wire_coord_clamps() {
        assert_eq!(wire_coord(-5), 0);
        assert_eq!(wire_coord(123), 123);
        assert_eq!(wire_coord(1_000_000), KILLED_COORD - 1);
    }

    #[test]
    fn test_baseline_order() {
        let mut sim = Simulator::new(0, 0);
        sim.add_tank().unwrap();
        sim.add_tank().unwrap();

        let chunks = ReplicationEncoder::baseline(&sim, vec![(0, "alice"), (1, "p1")]);
        assert_eq!(chunks.len(), 5);

        match &chunks[0] {
            Chunk::PackedLand { region, cells } => {
                assert_eq!(*region, Region::new(0, 0, LAND_WIDTH as u16, LAND_HEIGHT as u16));
                assert_eq!(cells.len(), LAND_WIDTH * LAND_HEIGHT);
            }
            other => panic!("Expected full land first, got {:?}", other),
        }
        assert!(matches!(
            chunks[1],
            Chunk::Tank {
                id: 0,
                action: Action::Spawn,
                x: 260,
                y: 60,
                angle: 35
            }
        ));
        assert!(matches!(
            chunks[2],
            Chunk::Tank {
                id: 1,
                action: Action::Spawn,
                ..
            }
        ));
        assert_eq!(chunks[3], name_change_chunk(0, "alice"));
        assert_eq!(chunks[4], name_change_chunk(1, "p1"));
        assert!(chunks.iter().all(|c| c.channel() == Channel::Reliable));
    }

    #[test]
    fn test_baseline_includes_active_crate() {
        let mut sim = Simulator::new(1, 1);
        sim.step();
        let chunks = ReplicationEncoder::baseline(&sim, std::iter::empty());
        assert!(matches!(
            chunks.last(),
            Some(Chunk::Crate {
                action: Action::Spawn,
                y: 30,
                ..
            })
        ));
    }

    #[test]
    fn test_tick_without_changes() {
        let mut sim = Simulator::new(0, 0);
        sim.add_tank().unwrap();
        let mut encoder = ReplicationEncoder::new();
        encoder.record(&sim.step());

        let chunks = encoder.encode_tick(&sim);
        assert_eq!(chunks.len(), 2);
        assert!(matches!(
            chunks[0],
            Chunk::Tank {
                action: Action::Move,
                ..
            }
        ));
        assert_eq!(chunks[1], Chunk::Bullets { positions: vec![] });
    }

    #[test]
    fn test_dirty_region_is_sent_once() {
        let mut sim = Simulator::new(0, 0);
        sim.store_mut()
            .spawn_bullet(BulletKind::Missile, 400, 299, 0.0, 1.0)
            .unwrap();

        let mut encoder = ReplicationEncoder::new();
        encoder.record(&sim.step());
        assert_eq!(encoder.pending_regions(), 1);

        let chunks = encoder.encode_tick(&sim);
        let region = Region::new(388, 288, 24, 24);
        assert_eq!(
            chunks[0],
            Chunk::PackedLand {
                region,
                cells: sim.terrain().serialize_region(region),
            }
        );

        encoder.record(&sim.step());
        let chunks = encoder.encode_tick(&sim);
        assert!(!chunks
            .iter()
            .any(|c| matches!(c, Chunk::PackedLand { .. })));
    }

    #[test]
    fn test_bullets_are_dense_in_slot_order() {
        let mut sim = Simulator::with_terrain(shared::TerrainMap::new(800, 600), 0, 0);
        for x in [100, 200, 300] {
            sim.store_mut()
                .spawn_bullet(BulletKind::Missile, x, 100, 0.0, 0.0)
                .unwrap();
        }
        let mut encoder = ReplicationEncoder::new();
        encoder.record(&sim.step());

        let chunks = encoder.encode_tick(&sim);
        assert_eq!(
            chunks.last(),
            Some(&Chunk::Bullets {
                positions: vec![(100, 100), (200, 100), (300, 100)]
            })
        );
    }

    #[test]
    fn test_crate_changes_precede_tank_moves() {
        let mut sim = Simulator::new(5, 1);
        sim.add_tank().unwrap();
        let mut encoder = ReplicationEncoder::new();
        encoder.record(&sim.step());

        let chunks = encoder.encode_tick(&sim);
        assert!(matches!(
            chunks[0],
            Chunk::Crate {
                action: Action::Spawn,
                ..
            }
        ));
        assert!(matches!(chunks[1], Chunk::Tank { .. }));
    }

    #[test]
    fn test_kill_chunk_uses_sentinel() {
        assert_eq!(
            tank_kill_chunk(4),
            Chunk::Tank {
                id: 4,
                action: Action::Kill,
                x: 0xFFFF,
                y: 0xFFFF,
                angle: 0
            }
        );
    }
}
