//! # MOAG Client Library
//!
//! The client side of MOAG. It never simulates anything: the server is
//! authoritative, and the client only mirrors what it is told and reports
//! which keys are held.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! The `ClientReplica`, which decodes server chunks into a `Snapshot` of
//! terrain, tanks, bullets, the ammo crate and recent chat. Position updates
//! are ignored until the full terrain baseline has arrived.
//!
//! ### Chat Module (`chat`)
//! A seven-line chat history where each line expires after 18 seconds.
//!
//! ### Input Module (`input`)
//! Edge detection over held keys. Only changes are sent, and a fire release
//! carries how long fire was held.
//!
//! ### Network Module (`network`)
//! The handshake, reliable and unreliable channels over UDP, and batching
//! of outgoing chunks.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::input::InputTracker;
//! use client::network::NetworkClient;
//! use shared::Key;
//! use std::time::{Duration, Instant};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut network = NetworkClient::connect("127.0.0.1:8080".parse()?).await?;
//! let mut input = InputTracker::new();
//!
//! if let Some(edge) = input.toggle(Key::Fire, Instant::now()) {
//!     network.queue_input(edge);
//! }
//! network.flush().await?;
//!
//! for event in network.poll(Duration::from_millis(16)).await? {
//!     println!("{:?}", event);
//! }
//! let tanks = network.replica().snapshot().active_tanks().count();
//! println!("{} tanks in play", tanks);
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod game;
pub mod input;
pub mod network;
