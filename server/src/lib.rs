//! # MOAG Game Server Library
//!
//! This library provides the authoritative server for MOAG, a multiplayer
//! 2D artillery game. Tanks sit on a shared destructible terrain, fire
//! ballistic shells that carve or deposit earth, and get thrown back to
//! their spawn point when caught in a blast. The server owns the one true
//! copy of the world and replicates it to every connected client.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! Every tick advances the world deterministically: the ammo crate falls,
//! tanks move, aim and fire from their held input flags, and bullets fly
//! until they hit terrain or come close enough to a tank. Clients only ever
//! send key edges and chat; they never report positions.
//!
//! ### Session Management
//! Handles the complete lifecycle of a player connection:
//! - Admission, tank slot assignment and the initial world baseline
//! - Decoding inbound input and chat chunks
//! - Chat commands (`/nick`, `/shutdown`)
//! - Isolation of misbehaving connections without disturbing anyone else
//!
//! ### Delta Replication
//! After each tick only what changed is sent: terrain regions touched by a
//! detonation (run-length encoded), crate changes, tank positions and the
//! full bullet list. Terrain and roster changes travel reliably; positions
//! travel unreliably and are superseded by the next tick.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! One task on a current-thread runtime owns the simulation, the sessions
//! and the socket. There are no locks. Each iteration simulates, sends,
//! drains the socket without blocking, runs transport timers and removes
//! dead sessions, in that order.
//!
//! ### Drift-Compensated Tick Rate
//! The loop sleeps for the target period minus whatever the previous
//! period overran, so the average tick rate holds even when the OS sleeps
//! long. With nobody connected it idles at a much lower rate.
//!
//! ## Module Organization
//!
//! ### Entity Module (`entity`)
//! Fixed-capacity pools of tanks and bullets plus the single ammo crate.
//!
//! ### Game Module (`game`)
//! The `Simulator`: terrain, entities and the per-tick update rules.
//!
//! ### Replication Module (`replication`)
//! Dirty-region tracking, the per-tick delta and the new-client baseline.
//!
//! ### Client Manager Module (`client_manager`)
//! The `SessionManager` with per-session outboxes and chat handling.
//!
//! ### Network Module (`network`)
//! The UDP server loop and its `TickClock`.
//!
//! ### Config Module (`config`)
//! Command line options.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         port: 8080,
//!         ..ServerConfig::default()
//!     };
//!     config.validate()?;
//!
//!     // Runs until Ctrl-C or a player types /shutdown
//!     let mut server = Server::bind(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod entity;
pub mod game;
pub mod network;
pub mod replication;
