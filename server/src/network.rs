//! Server network layer: the UDP socket, per-connection transport state and
//! the fixed-rate loop that drives the simulation

use crate::client_manager::{ConnectionId, SessionManager};
use crate::config::ServerConfig;
use crate::game::Simulator;
use crate::replication::ReplicationEncoder;
use log::{debug, info, trace, warn};
use shared::transport::{decode_packet, send_packet, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use shared::{Packet, Peer, PeerEvent, TransportError};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// Shortest sleep between two ticks
pub const MIN_TICK_DELAY: Duration = Duration::from_millis(1);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Works out how long to sleep after each tick so that the period between
/// tick starts stays at the target even when sleeps overshoot or ticks run
/// long. Whatever the last period ran over the requested sleep is taken off
/// the next sleep.
#[derive(Debug, Clone)]
pub struct TickClock {
    target: Duration,
    requested: Duration,
    overrun: Duration,
    last_start: Option<Instant>,
}

impl TickClock {
    pub fn new(target: Duration) -> Self {
        Self {
            target,
            requested: target,
            overrun: Duration::ZERO,
            last_start: None,
        }
    }

    pub fn target(&self) -> Duration {
        self.target
    }

    /// Records the start of a tick
    pub fn begin(&mut self, now: Instant) {
        if let Some(previous) = self.last_start {
            let measured = now.saturating_duration_since(previous);
            self.overrun = measured.saturating_sub(self.requested);
        }
        self.last_start = Some(now);
    }

    /// Sleep to request after the current tick, never less than `floor`
    pub fn delay(&mut self, floor: Duration) -> Duration {
        let delay = self
            .target
            .saturating_sub(self.overrun)
            .max(MIN_TICK_DELAY)
            .max(floor);
        self.requested = delay;
        delay
    }
}

struct Connection {
    conn: ConnectionId,
    peer: Peer,
}

#[derive(Debug, Default)]
struct LoopStats {
    datagrams_in: u64,
    datagrams_out: u64,
    bad_datagrams: u64,
}

/// Authoritative game server
pub struct Server {
    socket: UdpSocket,
    config: ServerConfig,
    sim: Simulator,
    sessions: SessionManager,
    encoder: ReplicationEncoder,

    connections: HashMap<SocketAddr, Connection>,
    addrs: HashMap<ConnectionId, SocketAddr>,
    next_conn: u32,
    /// Packets for addresses without a connection (handshake replies)
    direct: Vec<(SocketAddr, Packet)>,

    clock: TickClock,
    shutdown: bool,
    stats: LoopStats,
    last_stats: Instant,
}

impl Server {
    /// Binds the UDP socket and builds a fresh world
    ///
    /// The crate RNG is seeded from `config.seed`, or randomly when unset.
    pub async fn bind(config: ServerConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(config.bind_addr()).await?;
        info!("Server listening on {}", socket.local_addr()?);

        let seed = config.seed.unwrap_or_else(rand::random);
        debug!("Crate seed {}", seed);

        Ok(Self {
            socket,
            sim: Simulator::new(seed, config.crate_chance),
            sessions: SessionManager::new(config.max_players, config.allow_shutdown()),
            encoder: ReplicationEncoder::new(),
            connections: HashMap::new(),
            addrs: HashMap::new(),
            next_conn: 0,
            direct: Vec::new(),
            clock: TickClock::new(config.tick_duration()),
            shutdown: false,
            stats: LoopStats::default(),
            last_stats: Instant::now(),
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sessions currently known, including ones waiting for the sweep
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn simulator(&self) -> &Simulator {
        &self.sim
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown
    }

    /// Runs until Ctrl-C or the /shutdown command
    pub async fn run(&mut self) -> Result<(), TransportError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Unable to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Runs ticks until `shutdown` resolves or a session asks for shutdown.
    /// A tick in progress always completes.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            "Server running at {} Hz with up to {} players",
            self.config.tick_rate, self.config.max_players
        );

        while !self.shutdown {
            self.clock.begin(Instant::now());
            self.tick().await?;
            if self.shutdown {
                break;
            }

            let floor = if self.sessions.is_empty() {
                self.config.idle_delay()
            } else {
                Duration::ZERO
            };
            let delay = self.clock.delay(floor);

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    self.shutdown = true;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.close_all().await?;
        info!("Server stopped after {} ticks", self.sim.tick());
        Ok(())
    }

    /// One full iteration: simulate, replicate, receive and sweep
    pub async fn tick(&mut self) -> Result<(), TransportError> {
        let report = self.sim.step();
        if report.detonations > 0 {
            debug!(
                "Tick {}: {} detonations, {} tanks respawned",
                self.sim.tick(),
                report.detonations,
                report.respawned.len()
            );
        }
        self.encoder.record(&report);
        let chunks = self.encoder.encode_tick(&self.sim);
        self.sessions.broadcast_all(&chunks);

        let now = Instant::now();
        self.flush_sessions(now);
        self.transmit().await?;

        let now = Instant::now();
        self.receive_all(now);
        self.run_timers(now);
        self.sweep();
        self.transmit().await?;

        if self.sessions.shutdown_requested() && !self.shutdown {
            info!("Shutdown requested over chat");
            self.shutdown = true;
        }
        self.log_stats(now);
        Ok(())
    }

    fn flush_sessions(&mut self, now: Instant) {
        for (conn, batches) in self.sessions.flush_all() {
            let Some(connection) = self
                .addrs
                .get(&conn)
                .and_then(|addr| self.connections.get_mut(addr))
            else {
                continue;
            };
            for (channel, batch) in batches {
                connection.peer.send(channel, &batch, now);
            }
        }
    }

    fn receive_all(&mut self, now: Instant) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.socket.try_recv_from(&mut buffer) {
                Ok((len, addr)) => {
                    self.stats.datagrams_in += 1;
                    match decode_packet(&buffer[..len]) {
                        Ok(packet) => self.dispatch(packet, addr, now),
                        Err(e) => {
                            self.stats.bad_datagrams += 1;
                            debug!("Dropping undecodable datagram from {}: {}", addr, e);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Error receiving datagram: {}", e);
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, packet: Packet, addr: SocketAddr, now: Instant) {
        if let Packet::Connect { protocol_version } = packet {
            self.handle_connect(protocol_version, addr, now);
            return;
        }

        let Some(connection) = self.connections.get_mut(&addr) else {
            trace!("Ignoring {:?} from unknown address {}", packet, addr);
            return;
        };
        let conn = connection.conn;

        match connection.peer.receive(packet, now) {
            Ok(events) => {
                for event in events {
                    let result = match event {
                        PeerEvent::Message { data, .. } => {
                            self.sessions.handle_payload(conn, &data, &mut self.sim)
                        }
                        PeerEvent::Disconnected => {
                            self.sessions.disconnect(conn, "client disconnected")
                        }
                    };
                    if let Err(e) = result {
                        warn!("Dropping event for {}: {}", conn, e);
                    }
                }
            }
            Err(e) => {
                warn!("Transport error from {} ({}): {}", conn, addr, e);
                self.drop_session(conn, &e.to_string());
            }
        }
    }

    fn handle_connect(&mut self, protocol_version: u32, addr: SocketAddr, now: Instant) {
        if self.connections.contains_key(&addr) {
            // the first Accepted was lost
            self.direct.push((addr, Packet::Accepted));
            return;
        }
        if protocol_version != PROTOCOL_VERSION {
            info!(
                "Refusing {}: protocol version {} (expected {})",
                addr, protocol_version, PROTOCOL_VERSION
            );
            self.direct.push((
                addr,
                Packet::Refused {
                    reason: format!("protocol version {} is not supported", protocol_version),
                },
            ));
            return;
        }

        let conn = ConnectionId(self.next_conn);
        match self.sessions.connect(conn, &mut self.sim) {
            Ok(tank_id) => {
                self.next_conn = self.next_conn.wrapping_add(1);
                info!("Accepted {} from {} as tank {}", conn, addr, tank_id);

                let mut peer = Peer::new(now);
                for (channel, batch) in self.sessions.flush(conn) {
                    peer.send(channel, &batch, now);
                }
                self.direct.push((addr, Packet::Accepted));
                self.connections.insert(addr, Connection { conn, peer });
                self.addrs.insert(conn, addr);
            }
            Err(e) => {
                info!("Refusing {}: {}", addr, e);
                self.direct.push((
                    addr,
                    Packet::Refused {
                        reason: e.to_string(),
                    },
                ));
            }
        }
    }

    fn run_timers(&mut self, now: Instant) {
        for connection in self.connections.values_mut() {
            if let Err(e) = connection.peer.update(now) {
                info!("Connection {} lost: {}", connection.conn, e);
                if let Err(e) = self.sessions.disconnect(connection.conn, &e.to_string()) {
                    warn!("Dropping timeout for {}: {}", connection.conn, e);
                }
            }
        }
    }

    fn sweep(&mut self) {
        for conn in self.sessions.sweep(&mut self.sim) {
            let Some(addr) = self.addrs.remove(&conn) else {
                continue;
            };
            if self.connections.remove(&addr).is_some() {
                self.direct.push((addr, Packet::Disconnect));
            }
        }
    }

    /// Marks a session for removal at the next sweep
    fn drop_session(&mut self, conn: ConnectionId, reason: &str) {
        if let Err(e) = self.sessions.disconnect(conn, reason) {
            warn!("Dropping disconnect for {}: {}", conn, e);
        }
    }

    /// Sends every queued packet. A failed send marks that destination's
    /// session disconnect-pending; other destinations are still served.
    async fn transmit(&mut self) -> Result<(), TransportError> {
        let mut outgoing = std::mem::take(&mut self.direct);
        for (addr, connection) in self.connections.iter_mut() {
            outgoing.extend(
                connection
                    .peer
                    .drain_outgoing()
                    .into_iter()
                    .map(|packet| (*addr, packet)),
            );
        }

        for (addr, packet) in outgoing {
            match send_packet(&self.socket, &packet, addr).await {
                Ok(()) => self.stats.datagrams_out += 1,
                Err(TransportError::Io(e)) => {
                    warn!("Failed to send to {}: {}", addr, e);
                    if let Some(conn) = self.connections.get(&addr).map(|c| c.conn) {
                        self.drop_session(conn, &e.to_string());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn close_all(&mut self) -> Result<(), TransportError> {
        info!("Disconnecting {} sessions", self.connections.len());
        for connection in self.connections.values_mut() {
            connection.peer.disconnect();
        }
        self.transmit().await
    }

    fn log_stats(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_stats) < STATS_INTERVAL {
            return;
        }
        self.last_stats = now;
        debug!(
            "Tick {}: {} sessions, {} bullets, {} datagrams in, {} out, {} dropped",
            self.sim.tick(),
            self.sessions.len(),
            self.sim.store().active_bullet_count(),
            self.stats.datagrams_in,
            self.stats.datagrams_out,
            self.stats.bad_datagrams
        );
    }
}
