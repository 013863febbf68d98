use crate::game::ClientReplica;
use bytes::Bytes;
use log::{debug, info, warn};
use shared::protocol::split_batch;
use shared::transport::{decode_packet, send_packet, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use shared::{
    Channel, Chunk, MessageKind, Packet, Peer, PeerEvent, ProtocolError, SendQueue,
    TransportError, MAX_CHAT_LEN,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_RETRY: Duration = Duration::from_millis(500);

/// Errors that end the client's session
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("bad data from server: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Something the console should know about after a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A chat line or notice, formatted for display
    ChatLine(String),
    Disconnected,
}

/// Connection to one server plus the replica it keeps up to date
pub struct NetworkClient {
    socket: UdpSocket,
    server: SocketAddr,
    peer: Peer,
    replica: ClientReplica,
    outbox: SendQueue,
    /// Messages that arrived while the handshake was still running
    early: Vec<PeerEvent>,
}

impl NetworkClient {
    /// Performs the handshake, retrying the connect request until the
    /// server answers or [`CONNECT_TIMEOUT`] passes.
    pub async fn connect(server: SocketAddr) -> Result<Self, ClientError> {
        let bind_addr = if server.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(TransportError::from)?;
        info!("Connecting to {}...", server);

        let mut peer = Peer::new(Instant::now());
        let mut early = Vec::new();
        let connect = Packet::Connect {
            protocol_version: PROTOCOL_VERSION,
        };
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        'handshake: loop {
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout.into());
            }
            send_packet(&socket, &connect, server).await?;

            let retry_at = tokio::time::Instant::now() + CONNECT_RETRY;
            loop {
                let received =
                    tokio::time::timeout_at(retry_at, socket.recv_from(&mut buffer)).await;
                let Ok(result) = received else {
                    continue 'handshake;
                };
                let (len, from) = result.map_err(TransportError::from)?;
                if from != server {
                    continue;
                }
                let Ok(packet) = decode_packet(&buffer[..len]) else {
                    debug!("Ignoring undecodable datagram during handshake");
                    continue;
                };
                match packet {
                    Packet::Accepted => break 'handshake,
                    Packet::Refused { reason } => {
                        return Err(TransportError::Refused(reason).into());
                    }
                    other => early.extend(peer.receive(other, Instant::now())?),
                }
            }
        }

        info!("Connected to {}", server);
        Ok(Self {
            socket,
            server,
            peer,
            replica: ClientReplica::new(),
            outbox: SendQueue::new(),
            early,
        })
    }

    /// World state rebuilt from everything received so far
    pub fn replica(&self) -> &ClientReplica {
        &self.replica
    }

    /// Smoothed round trip time, once the first ping has been answered
    pub fn rtt(&self) -> Option<Duration> {
        self.peer.rtt()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Queues an encoded INPUT chunk for the next flush
    pub fn queue_input(&mut self, chunk: Bytes) {
        self.outbox.push_encoded(Channel::Reliable, chunk);
    }

    /// Queues a chat line; anything past [`MAX_CHAT_LEN`] bytes is cut off
    pub fn queue_chat(&mut self, line: &str) {
        let mut end = line.len().min(MAX_CHAT_LEN);
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        self.outbox.push(&Chunk::ClientMsg {
            text: line[..end].as_bytes().to_vec(),
        });
    }

    /// Sends queued chunks and runs the transport timers
    pub async fn flush(&mut self) -> Result<(), ClientError> {
        let now = Instant::now();
        for (channel, batch) in self.outbox.flush() {
            self.peer.send(channel, &batch, now);
        }
        self.peer.update(now)?;
        self.transmit().await
    }

    /// Waits up to `timeout` for traffic, then applies everything that has
    /// arrived. Any malformed chunk from the server is fatal. A server
    /// disconnect is reported as [`ClientEvent::Disconnected`].
    pub async fn poll(&mut self, timeout: Duration) -> Result<Vec<ClientEvent>, ClientError> {
        let mut events = Vec::new();
        for early in std::mem::take(&mut self.early) {
            self.handle_event(early, &mut events)?;
        }

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let first = tokio::time::timeout(timeout, self.socket.recv_from(&mut buffer)).await;
        let Ok(result) = first else {
            self.replica.expire_chat(Instant::now());
            return Ok(events);
        };
        let (len, from) = result.map_err(TransportError::from)?;
        self.handle_datagram(&buffer[..len], from, &mut events)?;

        loop {
            match self.socket.try_recv_from(&mut buffer) {
                Ok((len, from)) => self.handle_datagram(&buffer[..len], from, &mut events)?,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TransportError::from(e).into()),
            }
        }
        self.replica.expire_chat(Instant::now());
        Ok(events)
    }

    fn handle_datagram(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        events: &mut Vec<ClientEvent>,
    ) -> Result<(), ClientError> {
        if from != self.server {
            return Ok(());
        }
        let packet = match decode_packet(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping undecodable datagram: {}", e);
                return Ok(());
            }
        };
        for event in self.peer.receive(packet, Instant::now())? {
            self.handle_event(event, events)?;
        }
        Ok(())
    }

    fn handle_event(
        &mut self,
        event: PeerEvent,
        events: &mut Vec<ClientEvent>,
    ) -> Result<(), ClientError> {
        let data = match event {
            PeerEvent::Message { data, .. } => data,
            PeerEvent::Disconnected => {
                events.push(ClientEvent::Disconnected);
                return Ok(());
            }
        };

        let now = Instant::now();
        for raw in split_batch(&data)? {
            let chunk = Chunk::decode(raw)?;
            let is_line = matches!(
                chunk,
                Chunk::ServerMsg {
                    kind: MessageKind::Chat | MessageKind::Notice,
                    ..
                }
            );
            self.replica.apply(chunk, now)?;
            if is_line {
                if let Some(line) = self.replica.snapshot().chat.lines().last() {
                    events.push(ClientEvent::ChatLine(line.to_string()));
                }
            }
        }
        Ok(())
    }

    async fn transmit(&mut self) -> Result<(), ClientError> {
        for packet in self.peer.drain_outgoing() {
            send_packet(&self.socket, &packet, self.server).await?;
        }
        Ok(())
    }

    /// Tells the server we are leaving
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        self.peer.disconnect();
        self.transmit().await
    }
}
