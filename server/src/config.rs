//! Command line configuration for the server binary

use crate::game::DEFAULT_CRATE_CHANCE;
use clap::Parser;
use shared::{DEFAULT_PORT, MAX_PLAYERS};
use std::time::Duration;

/// Command line values that parse but cannot be used
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tick rate must be between 1 and 1000 Hz, got {0}")]
    TickRate(u32),

    #[error("max players must be between 1 and {MAX_PLAYERS}, got {0}")]
    MaxPlayers(usize),
}

/// Server settings, parsed from the command line
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "MOAG authoritative game server", long_about = None)]
pub struct ServerConfig {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    pub host: String,

    /// UDP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Simulation ticks per second
    #[arg(short, long, default_value_t = 65)]
    pub tick_rate: u32,

    /// Concurrent players admitted before connections are refused
    #[arg(short, long, default_value_t = MAX_PLAYERS)]
    pub max_players: usize,

    /// Sleep between ticks while nobody is connected
    #[arg(long, default_value_t = 200)]
    pub idle_delay_ms: u64,

    /// One in N ticks drops an ammo crate while none is active; 0 disables crates
    #[arg(long, default_value_t = DEFAULT_CRATE_CHANCE)]
    pub crate_chance: u32,

    /// Seed for crate drops. Random when omitted.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Ignore the /shutdown chat command
    #[arg(long)]
    pub no_shutdown_command: bool,
}

impl ServerConfig {
    /// Checks the ranges clap cannot express
    ///
    /// The tick rate must be 1 to 1000 Hz and the player limit 1 to
    /// [`MAX_PLAYERS`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&self.tick_rate) {
            return Err(ConfigError::TickRate(self.tick_rate));
        }
        if !(1..=MAX_PLAYERS).contains(&self.max_players) {
            return Err(ConfigError::MaxPlayers(self.max_players));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Target period between tick starts
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    /// Whether the `/shutdown` chat command is honoured
    pub fn allow_shutdown(&self) -> bool {
        !self.no_shutdown_command
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            tick_rate: 65,
            max_players: MAX_PLAYERS,
            idle_delay_ms: 200,
            crate_chance: DEFAULT_CRATE_CHANCE,
            seed: None,
            no_shutdown_command: false,
        }
    }
}
