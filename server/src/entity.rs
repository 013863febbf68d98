//! Fixed-capacity entity tables owned by the simulation
//!
//! Tanks and bullets live in flat slot arrays indexed by small integer ids.
//! A tank's id is also the id of the session controlling it, so connecting,
//! respawning and disconnecting are plain slot updates.

use shared::{Cell, Edge, InputKey, Key, MAX_BULLETS, MAX_PLAYERS};

/// Aim of a freshly spawned or respawned tank, in degrees above horizontal
pub const SPAWN_ANGLE: u8 = 35;
pub const MIN_ANGLE: u8 = 1;
pub const MAX_ANGLE: u8 = 90;

/// Vertical offset from a tank's position to the point used for distance tests
pub const TANK_CENTER_OFFSET: i32 = 3;

/// Level-triggered key state for one tank
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputFlags {
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
    pub fire: bool,
}

impl InputFlags {
    /// Applies one press/release code
    pub fn apply(&mut self, input: InputKey) {
        let held = input.edge == Edge::Press;
        match input.key {
            Key::Left => self.left = held,
            Key::Right => self.right = held,
            Key::Up => self.up = held,
            Key::Down => self.down = held,
            Key::Fire => self.fire = held,
        }
    }
}

/// Projectile types and their detonation effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulletKind {
    /// Despawns without touching terrain
    Standard,
    Missile,
    Nuke,
    DirtBomb,
}

impl BulletKind {
    /// Blast radius and the cell value written inside it
    pub fn blast(self) -> Option<(i32, Cell)> {
        match self {
            BulletKind::Standard => None,
            BulletKind::Missile => Some((12, Cell::Empty)),
            BulletKind::Nuke => Some((128, Cell::Empty)),
            BulletKind::DirtBomb => Some((64, Cell::Solid)),
        }
    }
}

/// One player's tank
///
/// Positions are whole pixels; `y` is the empty row just above the ground the tank stands on. `power`
/// grows while fire is held and is turned into launch speed on release.
#[derive(Debug, Clone)]
pub struct Tank {
    pub active: bool,
    pub x: i32,
    pub y: i32,
    /// Always within [MIN_ANGLE, MAX_ANGLE]
    pub angle: u8,
    pub facing_left: bool,
    pub power: u16,
    pub input: InputFlags,
    /// Where the tank returns to when caught in a blast
    pub spawn: (i32, i32),
    /// Kind used by the next shot
    pub ammo: BulletKind,
}

impl Tank {
    fn empty() -> Self {
        Self {
            active: false,
            x: 0,
            y: 0,
            angle: SPAWN_ANGLE,
            facing_left: false,
            power: 0,
            input: InputFlags::default(),
            spawn: (0, 0),
            ammo: BulletKind::Missile,
        }
    }

    /// Puts the tank back on its spawn point with everything else reset
    pub fn respawn(&mut self) {
        let (x, y) = self.spawn;
        self.x = x;
        self.y = y;
        self.angle = SPAWN_ANGLE;
        self.facing_left = false;
        self.power = 0;
        self.input = InputFlags::default();
        self.ammo = BulletKind::Missile;
    }

    /// Angle as sent on the wire: negative when facing left
    pub fn wire_angle(&self) -> i8 {
        let angle = self.angle.min(MAX_ANGLE) as i8;
        if self.facing_left {
            -angle
        } else {
            angle
        }
    }

    /// Squared distance from the tank's center to (`x`, `y`)
    pub fn distance_sq(&self, x: i32, y: i32) -> i32 {
        let dx = self.x - x;
        let dy = self.y - TANK_CENTER_OFFSET - y;
        dx * dx + dy * dy
    }
}

/// A projectile in flight
///
/// `fx`/`fy` carry the exact position between ticks and `x`/`y` the cell
/// it currently occupies.
#[derive(Debug, Clone)]
pub struct Bullet {
    pub active: bool,
    pub fx: f32,
    pub fy: f32,
    pub vx: f32,
    pub vy: f32,
    /// Truncated integer position used for collision and replication
    pub x: i32,
    pub y: i32,
    /// Ticks left before tank proximity can detonate it; checks start at 1
    pub armed: u8,
    pub kind: BulletKind,
}

/// Ticks a new bullet ignores nearby tanks, so it clears its own barrel
pub const ARMED_COUNTDOWN: u8 = 4;

impl Bullet {
    fn empty() -> Self {
        Self {
            active: false,
            fx: 0.0,
            fy: 0.0,
            vx: 0.0,
            vy: 0.0,
            x: 0,
            y: 0,
            armed: 0,
            kind: BulletKind::Standard,
        }
    }
}

/// The single ammo crate. `kind` becomes the ammo of whoever picks it up.
#[derive(Debug, Clone)]
pub struct Crate {
    pub active: bool,
    pub x: i32,
    pub y: i32,
    pub kind: BulletKind,
}

impl Default for Crate {
    fn default() -> Self {
        Self {
            active: false,
            x: 0,
            y: 0,
            kind: BulletKind::Nuke,
        }
    }
}

/// Slot tables for every entity in the world
#[derive(Debug, Clone)]
pub struct EntityStore {
    tanks: Vec<Tank>,
    bullets: Vec<Bullet>,
    /// At most one crate exists at a time
    pub ammo_crate: Crate,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            tanks: (0..MAX_PLAYERS).map(|_| Tank::empty()).collect(),
            bullets: (0..MAX_BULLETS).map(|_| Bullet::empty()).collect(),
            ammo_crate: Crate::default(),
        }
    }

    /// Claims the first free tank slot and places it at `spawn`
    pub fn activate_tank(&mut self, spawn: (i32, i32)) -> Option<u8> {
        let id = self.tanks.iter().position(|t| !t.active)?;
        let tank = &mut self.tanks[id];
        *tank = Tank::empty();
        tank.active = true;
        tank.spawn = spawn;
        tank.respawn();
        Some(id as u8)
    }

    /// Frees a tank slot. Returns false if it was not in use.
    pub fn deactivate_tank(&mut self, id: u8) -> bool {
        match self.tanks.get_mut(id as usize) {
            Some(tank) if tank.active => {
                tank.active = false;
                tank.input = InputFlags::default();
                true
            }
            _ => false,
        }
    }

    /// Tank in slot `id`, if that slot is in use
    ///
    /// Inactive slots read as `None` so callers never see stale state left
    /// behind by a disconnected player.
    pub fn tank(&self, id: u8) -> Option<&Tank> {
        self.tanks.get(id as usize).filter(|t| t.active)
    }

    /// Mutable access to an active tank; `None` for free or unknown slots
    pub fn tank_mut(&mut self, id: u8) -> Option<&mut Tank> {
        self.tanks.get_mut(id as usize).filter(|t| t.active)
    }

    /// Active tanks in slot order
    pub fn tanks(&self) -> impl Iterator<Item = (u8, &Tank)> {
        self.tanks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.active)
            .map(|(id, t)| (id as u8, t))
    }

    /// Number of occupied tank slots
    pub fn active_tank_count(&self) -> usize {
        self.tanks.iter().filter(|t| t.active).count()
    }

    pub(crate) fn tank_slots_mut(&mut self) -> &mut [Tank] {
        &mut self.tanks
    }

    /// First active tank whose center is strictly closer than `radius_sq`
    pub fn tank_near(&self, x: i32, y: i32, radius_sq: i32) -> Option<u8> {
        self.tanks()
            .find(|(_, t)| t.distance_sq(x, y) < radius_sq)
            .map(|(id, _)| id)
    }

    /// Every active tank whose center is strictly closer than `radius_sq`
    pub fn tanks_within(&self, x: i32, y: i32, radius_sq: i32) -> Vec<u8> {
        self.tanks()
            .filter(|(_, t)| t.distance_sq(x, y) < radius_sq)
            .map(|(id, _)| id)
            .collect()
    }

    /// Fires a bullet from (`x`, `y`). Returns `None` when every slot is
    /// taken; the shot is simply lost.
    pub fn spawn_bullet(
        &mut self,
        kind: BulletKind,
        x: i32,
        y: i32,
        vx: f32,
        vy: f32,
    ) -> Option<usize> {
        let slot = self.bullets.iter().position(|b| !b.active)?;
        self.bullets[slot] = Bullet {
            active: true,
            fx: x as f32,
            fy: y as f32,
            vx,
            vy,
            x,
            y,
            armed: ARMED_COUNTDOWN,
            kind,
        };
        Some(slot)
    }

    /// Bullet in `slot` while it is still flying
    pub fn bullet(&self, slot: usize) -> Option<&Bullet> {
        self.bullets.get(slot).filter(|b| b.active)
    }

    pub(crate) fn bullet_slots_mut(&mut self) -> &mut [Bullet] {
        &mut self.bullets
    }

    /// Active bullets in slot order
    pub fn bullets(&self) -> impl Iterator<Item = &Bullet> {
        self.bullets.iter().filter(|b| b.active)
    }

    pub fn active_bullet_count(&self) -> usize {
        self.bullets().count()
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}
