//! Turns held-key samples into the press/release edges the server expects

use bytes::Bytes;
use shared::{encode_input, Edge, Key};
use std::time::Instant;

/// Which keys are held at one sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeldKeys {
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
    pub fire: bool,
}

impl HeldKeys {
    /// Whether `key` is down in this sample
    pub fn get(&self, key: Key) -> bool {
        match key {
            Key::Left => self.left,
            Key::Right => self.right,
            Key::Up => self.up,
            Key::Down => self.down,
            Key::Fire => self.fire,
        }
    }

    pub fn set(&mut self, key: Key, down: bool) {
        match key {
            Key::Left => self.left = down,
            Key::Right => self.right = down,
            Key::Up => self.up = down,
            Key::Down => self.down = down,
            Key::Fire => self.fire = down,
        }
    }
}

/// Edge detector over successive [`HeldKeys`] samples
#[derive(Debug, Default)]
pub struct InputTracker {
    held: HeldKeys,
    fire_pressed_at: Option<Instant>,
}

impl InputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last sample seen
    pub fn held(&self) -> HeldKeys {
        self.held
    }

    /// Compares a new sample against the last one and returns an INPUT
    /// chunk per changed key. A fire release carries how long fire was held
    /// in milliseconds; every other edge carries 0.
    pub fn update(&mut self, sample: HeldKeys, now: Instant) -> Vec<Bytes> {
        Key::ALL
            .iter()
            .filter_map(|&key| self.set(key, sample.get(key), now))
            .collect()
    }

    /// Sets one key and returns its edge, if it changed
    pub fn set(&mut self, key: Key, down: bool, now: Instant) -> Option<Bytes> {
        if self.held.get(key) == down {
            return None;
        }
        self.held.set(key, down);

        let edge = if down { Edge::Press } else { Edge::Release };
        let mut timestamp = 0;
        if key == Key::Fire {
            if down {
                self.fire_pressed_at = Some(now);
            } else if let Some(pressed) = self.fire_pressed_at.take() {
                let held_ms = now.saturating_duration_since(pressed).as_millis();
                timestamp = u16::try_from(held_ms).unwrap_or(u16::MAX);
            }
        }
        Some(encode_input(key, edge, timestamp))
    }

    /// Flips one key
    pub fn toggle(&mut self, key: Key, now: Instant) -> Option<Bytes> {
        let down = !self.held.get(key);
        self.set(key, down, now)
    }
}

/// Parses a console key command such as `!left`
pub fn parse_key_command(line: &str) -> Option<Key> {
    match line.trim() {
        "!left" => Some(Key::Left),
        "!right" => Some(Key::Right),
        "!up" => Some(Key::Up),
        "!down" => Some(Key::Down),
        "!fire" => Some(Key::Fire),
        _ => None,
    }
}
