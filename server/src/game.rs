//! Authoritative per-tick simulation
//!
//! [`Simulator::step`] advances the world by exactly one tick in a fixed
//! order: crate, then every tank in slot order, then every bullet in slot
//! order. Given the same seed, terrain and input sequence it always produces
//! the same world. Nothing here touches the network; each step returns a
//! [`TickReport`] describing what changed so replication never has to diff.

use crate::entity::{BulletKind, EntityStore, Tank, MAX_ANGLE, MIN_ANGLE};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{Action, Cell, InputKey, Region, TerrainMap, MAX_BULLETS, MAX_PLAYERS};

/// Height tanks spawn at before falling onto the terrain
pub const SPAWN_Y: i32 = 60;
pub const SPAWN_SPACING: u64 = 240;

/// Distance tanks and crates keep from the left and right map edges
pub const EDGE_MARGIN: i32 = 10;
/// Highest ledge a tank can climb in one step
pub const STEP_HEIGHT: i32 = 8;

/// Power gained per tick of held fire, up to [`MAX_POWER`]
pub const POWER_STEP: u16 = 10;
pub const MAX_POWER: u16 = 1000;
/// Launch speed in pixels per tick for each unit of power
pub const POWER_TO_SPEED: f32 = 0.01;
pub const MUZZLE_HEIGHT: i32 = 7;
/// Added to a bullet's downward velocity every tick
pub const GRAVITY: f32 = 0.1;

/// Every Nth shot overall is a dirtbomb, and every [`NUKE_PERIOD`]th a nuke
pub const DIRTBOMB_PERIOD: u32 = 50;
pub const NUKE_PERIOD: u32 = 313;

/// Squared distance at which an armed bullet hits a tank
pub const PROXIMITY_SQ: i32 = 72;
/// Added to the blast radius when deciding which tanks respawn
pub const BLAST_MARGIN: i32 = 6;

pub const CRATE_SPAWN_Y: i32 = 30;
pub const CRATE_PICKUP_SQ: i32 = 14 * 14;
pub const DEFAULT_CRATE_CHANCE: u32 = 1000;

/// A crate lifecycle event to replicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrateChange {
    pub action: Action,
    pub x: i32,
    pub y: i32,
}

/// Everything a tick changed that is not sent unconditionally
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Clipped bounding boxes of every detonation this tick
    pub dirty: Vec<Region>,
    /// Crate spawns, moves and pickups, in the order they happened
    pub crate_changes: Vec<CrateChange>,
    /// Bullets launched this tick
    pub shots: usize,
    pub detonations: usize,
    /// Tanks sent back to their spawn point by a blast
    pub respawned: Vec<u8>,
}

struct Shot {
    kind: BulletKind,
    x: i32,
    y: i32,
    vx: f32,
    vy: f32,
}

/// The world: terrain, entities and the counters that drive spawning and ammo
#[derive(Debug, Clone)]
pub struct Simulator {
    store: EntityStore,
    terrain: TerrainMap,
    tick: u64,
    shots_fired: u32,
    spawns: u64,
    crate_chance: u32,
    rng: StdRng,
}

impl Simulator {
    /// Standard map with crates dropping on average once every
    /// `crate_chance` ticks; zero disables crates.
    pub fn new(seed: u64, crate_chance: u32) -> Self {
        Self::with_terrain(TerrainMap::default(), seed, crate_chance)
    }

    /// Same as [`Simulator::new`] but starting from a custom map
    pub fn with_terrain(terrain: TerrainMap, seed: u64, crate_chance: u32) -> Self {
        Self {
            store: EntityStore::new(),
            terrain,
            tick: 0,
            shots_fired: 0,
            spawns: 0,
            crate_chance,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Ticks stepped so far
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn terrain(&self) -> &TerrainMap {
        &self.terrain
    }

    pub fn terrain_mut(&mut self) -> &mut TerrainMap {
        &mut self.terrain
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }

    /// Shots fired by all tanks together since start
    pub fn shots_fired(&self) -> u32 {
        self.shots_fired
    }

    fn next_spawn_point(&mut self) -> (i32, i32) {
        self.spawns += 1;
        let span = (self.terrain.width() as u64).saturating_sub(2 * 20).max(1);
        let x = (self.spawns * SPAWN_SPACING) % span + 20;
        (x as i32, SPAWN_Y)
    }

    /// Activates a tank for a new player. `None` when every slot is taken.
    pub fn add_tank(&mut self) -> Option<u8> {
        if self.store.active_tank_count() >= MAX_PLAYERS {
            return None;
        }
        let spawn = self.next_spawn_point();
        let id = self.store.activate_tank(spawn)?;
        info!("Tank {} spawned at ({}, {})", id, spawn.0, spawn.1);
        Some(id)
    }

    /// Frees a tank slot. Returns false if the slot was already free.
    pub fn remove_tank(&mut self, id: u8) -> bool {
        self.store.deactivate_tank(id)
    }

    /// Updates a tank's held keys. Unknown or inactive ids are ignored.
    ///
    /// Inputs are level-triggered: the effect shows up over the following
    /// ticks for as long as the key stays down.
    pub fn apply_input(&mut self, id: u8, input: InputKey) {
        if let Some(tank) = self.store.tank_mut(id) {
            tank.input.apply(input);
        }
    }

    /// Advances the world by one tick
    pub fn step(&mut self) -> TickReport {
        let mut report = TickReport::default();

        self.update_crate(&mut report);

        for id in 0..MAX_PLAYERS {
            let tank = &mut self.store.tank_slots_mut()[id];
            if !tank.active {
                continue;
            }
            let shot = update_tank(tank, &self.terrain, &mut self.shots_fired);
            if let Some(shot) = shot {
                report.shots += 1;
                if self
                    .store
                    .spawn_bullet(shot.kind, shot.x, shot.y, shot.vx, shot.vy)
                    .is_none()
                {
                    debug!("Bullet table full, shot from tank {} lost", id);
                }
            }
        }

        for slot in 0..MAX_BULLETS {
            self.update_bullet(slot, &mut report);
        }

        self.tick += 1;
        report
    }

    fn update_bullet(&mut self, slot: usize, report: &mut TickReport) {
        let bullet = &mut self.store.bullet_slots_mut()[slot];
        if !bullet.active {
            return;
        }

        bullet.fx += bullet.vx;
        bullet.fy += bullet.vy;
        bullet.vy += GRAVITY;
        bullet.x = bullet.fx as i32;
        bullet.y = bullet.fy as i32;

        let (x, y) = (bullet.x, bullet.y);
        if self.terrain.get(x, y).is_blocking() {
            self.detonate(slot, report);
            return;
        }

        if bullet.armed > 1 {
            bullet.armed -= 1;
            return;
        }

        if self.store.tank_near(x, y, PROXIMITY_SQ).is_some() {
            self.detonate(slot, report);
        }
    }

    fn detonate(&mut self, slot: usize, report: &mut TickReport) {
        let bullet = &mut self.store.bullet_slots_mut()[slot];
        bullet.active = false;
        let (x, y, kind) = (bullet.x, bullet.y, bullet.kind);
        report.detonations += 1;

        let Some((radius, fill)) = kind.blast() else {
            return;
        };

        if let Some(region) = self.terrain.carve_circle(x, y, radius, fill) {
            report.dirty.push(region);
        }

        if fill == Cell::Empty {
            let reach = (radius + BLAST_MARGIN) * (radius + BLAST_MARGIN);
            for id in self.store.tanks_within(x, y, reach) {
                if let Some(tank) = self.store.tank_mut(id) {
                    tank.respawn();
                    report.respawned.push(id);
                }
            }
        }
    }

    fn update_crate(&mut self, report: &mut TickReport) {
        if !self.store.ammo_crate.active {
            if self.crate_chance == 0 || self.rng.gen_range(0..self.crate_chance) != 0 {
                return;
            }
            let right = self.terrain.width() as i32 - EDGE_MARGIN;
            let x = self.rng.gen_range(EDGE_MARGIN..=right.max(EDGE_MARGIN));
            let kind = if self.rng.gen_bool(0.5) {
                BulletKind::Nuke
            } else {
                BulletKind::DirtBomb
            };

            let ammo_crate = &mut self.store.ammo_crate;
            ammo_crate.active = true;
            ammo_crate.x = x;
            ammo_crate.y = CRATE_SPAWN_Y;
            ammo_crate.kind = kind;
            debug!("{:?} crate dropped at x={}", kind, x);
            report.crate_changes.push(CrateChange {
                action: Action::Spawn,
                x,
                y: CRATE_SPAWN_Y,
            });
            return;
        }

        let ammo_crate = &mut self.store.ammo_crate;
        if self.terrain.is_empty_at(ammo_crate.x, ammo_crate.y + 1) {
            ammo_crate.y += 1;
            report.crate_changes.push(CrateChange {
                action: Action::Move,
                x: ammo_crate.x,
                y: ammo_crate.y,
            });
        }

        let (x, y, kind) = (ammo_crate.x, ammo_crate.y, ammo_crate.kind);
        if let Some(id) = self.store.tank_near(x, y, CRATE_PICKUP_SQ) {
            self.store.ammo_crate.active = false;
            if let Some(tank) = self.store.tank_mut(id) {
                tank.ammo = kind;
            }
            debug!("Tank {} picked up a {:?} crate", id, kind);
            report.crate_changes.push(CrateChange {
                action: Action::Kill,
                x,
                y,
            });
        }
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(0, DEFAULT_CRATE_CHANCE)
    }
}

/// Ammo for the next shot given the global shot number
fn shot_kind(shot_number: u32, ammo: BulletKind) -> BulletKind {
    if shot_number % DIRTBOMB_PERIOD == 0 {
        BulletKind::DirtBomb
    } else if shot_number % NUKE_PERIOD == 0 {
        BulletKind::Nuke
    } else {
        ammo
    }
}

/// Movement, aim, charge/fire and soft gravity for one tank
fn update_tank(tank: &mut Tank, terrain: &TerrainMap, shots_fired: &mut u32) -> Option<Shot> {
    let right_edge = terrain.width() as i32 - EDGE_MARGIN;

    let dx = if tank.input.left {
        tank.facing_left = true;
        -1
    } else if tank.input.right {
        tank.facing_left = false;
        1
    } else {
        0
    };
    if dx != 0 {
        for climb in 0..STEP_HEIGHT {
            if terrain.is_empty_at(tank.x + dx, tank.y - climb) {
                tank.x = (tank.x + dx).clamp(EDGE_MARGIN, right_edge);
                tank.y -= climb;
                break;
            }
        }
    }

    if tank.input.up && tank.angle < MAX_ANGLE {
        tank.angle += 1;
    } else if tank.input.down && tank.angle > MIN_ANGLE {
        tank.angle -= 1;
    }

    let mut shot = None;
    if tank.input.fire {
        tank.power = (tank.power + POWER_STEP).min(MAX_POWER);
    } else if tank.power > 0 {
        *shots_fired = shots_fired.wrapping_add(1);
        let kind = shot_kind(*shots_fired, tank.ammo);

        let degrees = if tank.facing_left {
            180.0 - tank.angle as f32
        } else {
            tank.angle as f32
        };
        let radians = degrees.to_radians();
        let speed = tank.power as f32 * POWER_TO_SPEED;

        shot = Some(Shot {
            kind,
            x: tank.x,
            y: tank.y - MUZZLE_HEIGHT,
            vx: speed * radians.cos(),
            vy: -speed * radians.sin(),
        });
        tank.ammo = BulletKind::Missile;
        tank.power = 0;
    }

    for _ in 0..2 {
        if terrain.is_empty_at(tank.x, tank.y + 1) {
            tank.y += 1;
        }
    }

    shot
}
