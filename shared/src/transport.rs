//! Datagram sessions with one reliable-ordered and one unreliable channel
//!
//! Each datagram carries a single bincode-encoded [`Packet`]. [`Peer`] is a
//! sans-IO state machine: callers feed it received packets and the current
//! time, and drain the packets it wants sent. Socket handling stays in the
//! server and client loops.
//!
//! Reliable messages are split into fragments of at most
//! [`MAX_FRAGMENT_SIZE`] bytes, each with its own sequence number. The
//! receiver acks every fragment, buffers out-of-order ones and reassembles
//! in sequence order. Unacked fragments are resent after twice the smoothed
//! round trip time.

use crate::protocol::Channel;
use bincode::Options;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// Sent in [`Packet::Connect`]; the server refuses any other value
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest reliable fragment a peer sends or accepts
pub const MAX_FRAGMENT_SIZE: usize = 1024;
/// Receive buffer size and bincode decode limit
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Largest reassembled reliable message a peer accepts
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

pub const PING_INTERVAL: Duration = Duration::from_secs(1);
pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_RESEND_DELAY: Duration = Duration::from_millis(50);
const MAX_RESEND_DELAY: Duration = Duration::from_secs(1);
const INITIAL_RTT: Duration = Duration::from_millis(100);

/// How far ahead of the next expected sequence a fragment may arrive
const REORDER_WINDOW: u32 = 4096;

/// Failures that end a session
///
/// Every variant is scoped to one remote peer. The server tears down that
/// connection and keeps serving the others.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed datagram: {0}")]
    Codec(#[from] bincode::Error),

    #[error("protocol version {0} is not supported")]
    VersionMismatch(u32),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("reliable message exceeds {MAX_MESSAGE_SIZE} bytes")]
    MessageTooLarge,

    #[error("reliable fragment of {0} bytes exceeds {MAX_FRAGMENT_SIZE}")]
    FragmentTooLarge(usize),

    #[error("peer timed out")]
    Timeout,
}

/// Datagram envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Connect { protocol_version: u32 },
    Accepted,
    Refused { reason: String },

    Reliable { seq: u32, more: bool, data: Vec<u8> },
    Ack { seq: u32 },
    Unreliable { data: Vec<u8> },

    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Disconnect,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_DATAGRAM_SIZE as u64)
}

/// Serializes a packet into one datagram payload
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, TransportError> {
    Ok(codec().serialize(packet)?)
}

/// Parses one datagram, rejecting anything past [`MAX_DATAGRAM_SIZE`]
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, TransportError> {
    Ok(codec().deserialize(bytes)?)
}

/// Encodes `packet` and sends it to `addr` in a single datagram
pub async fn send_packet(
    socket: &UdpSocket,
    packet: &Packet,
    addr: SocketAddr,
) -> Result<(), TransportError> {
    let data = encode_packet(packet)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

/// Something a peer hands back to its owner after receiving a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Message { channel: Channel, data: Vec<u8> },
    Disconnected,
}

#[derive(Debug)]
struct InFlight {
    more: bool,
    data: Vec<u8>,
    sent_at: Instant,
}

/// One end of a session
#[derive(Debug)]
pub struct Peer {
    next_send_seq: u32,
    in_flight: BTreeMap<u32, InFlight>,

    next_recv_seq: u32,
    reorder: BTreeMap<u32, (bool, Vec<u8>)>,
    assembling: Vec<u8>,
    /// Bytes held in `reorder` and `assembling` together
    buffered: usize,

    outgoing: VecDeque<Packet>,

    last_heard: Instant,
    last_ping: Instant,
    ping_nonce: u64,
    pending_ping: Option<(u64, Instant)>,
    rtt: Option<Duration>,
}

impl Peer {
    /// Fresh session state. `now` starts the timeout and ping clocks.
    pub fn new(now: Instant) -> Self {
        Self {
            next_send_seq: 0,
            in_flight: BTreeMap::new(),
            next_recv_seq: 0,
            reorder: BTreeMap::new(),
            assembling: Vec::new(),
            buffered: 0,
            outgoing: VecDeque::new(),
            last_heard: now,
            last_ping: now,
            ping_nonce: 0,
            pending_ping: None,
            rtt: None,
        }
    }

    /// Smoothed round trip time, once a ping has been answered
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Number of reliable fragments still waiting for an ack
    pub fn unacked(&self) -> usize {
        self.in_flight.len()
    }

    fn resend_delay(&self) -> Duration {
        (self.rtt.unwrap_or(INITIAL_RTT) * 2).clamp(MIN_RESEND_DELAY, MAX_RESEND_DELAY)
    }

    /// Queues one message. Reliable messages are fragmented as needed.
    pub fn send(&mut self, channel: Channel, data: &[u8], now: Instant) {
        match channel {
            Channel::Unreliable => self.outgoing.push_back(Packet::Unreliable {
                data: data.to_vec(),
            }),
            Channel::Reliable => {
                let mut fragments = data.chunks(MAX_FRAGMENT_SIZE).peekable();
                if fragments.peek().is_none() {
                    self.send_fragment(false, Vec::new(), now);
                }
                while let Some(fragment) = fragments.next() {
                    let more = fragments.peek().is_some();
                    self.send_fragment(more, fragment.to_vec(), now);
                }
            }
        }
    }

    fn send_fragment(&mut self, more: bool, data: Vec<u8>, now: Instant) {
        let seq = self.next_send_seq;
        self.next_send_seq = self.next_send_seq.wrapping_add(1);

        self.outgoing.push_back(Packet::Reliable {
            seq,
            more,
            data: data.clone(),
        });
        self.in_flight.insert(
            seq,
            InFlight {
                more,
                data,
                sent_at: now,
            },
        );
    }

    /// Queues a disconnect notice for the remote end
    pub fn disconnect(&mut self) {
        self.outgoing.push_back(Packet::Disconnect);
    }

    /// Handles one packet from the remote end and returns any completed
    /// messages. Handshake packets are the owner's concern and are ignored.
    pub fn receive(
        &mut self,
        packet: Packet,
        now: Instant,
    ) -> Result<Vec<PeerEvent>, TransportError> {
        self.last_heard = now;
        let mut events = Vec::new();

        match packet {
            Packet::Reliable { seq, more, data } => {
                self.receive_fragment(seq, more, data, &mut events)?;
            }
            Packet::Ack { seq } => {
                self.in_flight.remove(&seq);
            }
            Packet::Unreliable { data } => events.push(PeerEvent::Message {
                channel: Channel::Unreliable,
                data,
            }),
            Packet::Ping { nonce } => self.outgoing.push_back(Packet::Pong { nonce }),
            Packet::Pong { nonce } => self.receive_pong(nonce, now),
            Packet::Disconnect => events.push(PeerEvent::Disconnected),
            other => trace!("Ignoring {:?} on an established session", other),
        }

        Ok(events)
    }

    fn receive_fragment(
        &mut self,
        seq: u32,
        more: bool,
        data: Vec<u8>,
        events: &mut Vec<PeerEvent>,
    ) -> Result<(), TransportError> {
        if data.len() > MAX_FRAGMENT_SIZE {
            return Err(TransportError::FragmentTooLarge(data.len()));
        }
        if seq.wrapping_sub(self.next_recv_seq) >= REORDER_WINDOW {
            if seq < self.next_recv_seq {
                // duplicate of something already delivered; the ack was lost
                self.outgoing.push_back(Packet::Ack { seq });
            }
            return Ok(());
        }

        if !self.reorder.contains_key(&seq) {
            if self.buffered + data.len() > MAX_MESSAGE_SIZE {
                return Err(TransportError::MessageTooLarge);
            }
            self.buffered += data.len();
            self.reorder.insert(seq, (more, data));
        }
        self.outgoing.push_back(Packet::Ack { seq });

        while let Some((more, data)) = self.reorder.remove(&self.next_recv_seq) {
            self.next_recv_seq = self.next_recv_seq.wrapping_add(1);
            self.assembling.extend_from_slice(&data);
            if !more {
                self.buffered -= self.assembling.len();
                events.push(PeerEvent::Message {
                    channel: Channel::Reliable,
                    data: std::mem::take(&mut self.assembling),
                });
            }
        }
        Ok(())
    }

    fn receive_pong(&mut self, nonce: u64, now: Instant) {
        let Some((expected, sent_at)) = self.pending_ping else {
            return;
        };
        if nonce != expected {
            return;
        }
        self.pending_ping = None;

        let sample = now.saturating_duration_since(sent_at);
        self.rtt = Some(match self.rtt {
            Some(rtt) => (rtt * 7 + sample) / 8,
            None => sample,
        });
        trace!("RTT sample {:?}, smoothed {:?}", sample, self.rtt);
    }

    /// Runs resend, ping and timeout timers
    pub fn update(&mut self, now: Instant) -> Result<(), TransportError> {
        if now.saturating_duration_since(self.last_heard) >= PEER_TIMEOUT {
            return Err(TransportError::Timeout);
        }

        let delay = self.resend_delay();
        for (&seq, flight) in self.in_flight.iter_mut() {
            if now.saturating_duration_since(flight.sent_at) >= delay {
                debug!("Resending reliable fragment {}", seq);
                flight.sent_at = now;
                self.outgoing.push_back(Packet::Reliable {
                    seq,
                    more: flight.more,
                    data: flight.data.clone(),
                });
            }
        }

        if now.saturating_duration_since(self.last_ping) >= PING_INTERVAL {
            self.last_ping = now;
            self.ping_nonce = self.ping_nonce.wrapping_add(1);
            self.pending_ping = Some((self.ping_nonce, now));
            self.outgoing.push_back(Packet::Ping {
                nonce: self.ping_nonce,
            });
        }

        Ok(())
    }

    /// Takes every packet queued for sending, oldest first
    pub fn drain_outgoing(&mut self) -> Vec<Packet> {
        self.outgoing.drain(..).collect()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn deliver(from: &mut Peer, to: &mut Peer, now: Instant) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        for packet in from.drain_outgoing() {
            events.extend(to.receive(packet, now).unwrap());
        }
        events
    }

    fn messages(events: Vec<PeerEvent>) -> Vec<Vec<u8>> {
        events
            .into_iter()
            .filter_map(|event| match event {
                PeerEvent::Message { data, .. } => Some(data),
                PeerEvent::Disconnected => None,
            })
            .collect()
    }

    #[test]
    fn test_packet_serialization() {
        let packet = Packet::Reliable {
            seq: 7,
            more: true,
            data: vec![1, 2, 3],
        };
        let bytes = encode_packet(&packet).unwrap();
        assert_eq!(decode_packet(&bytes).unwrap(), packet);

        let bytes = encode_packet(&Packet::Connect {
            protocol_version: PROTOCOL_VERSION,
        })
        .unwrap();
        match decode_packet(&bytes).unwrap() {
            Packet::Connect { protocol_version } => assert_eq!(protocol_version, PROTOCOL_VERSION),
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_garbage_datagram_is_rejected() {
        assert!(matches!(
            decode_packet(&[0xFF, 0xFF, 0xFF]),
            Err(TransportError::Codec(_))
        ));
        assert!(decode_packet(&[]).is_err());
    }

    #[test]
    fn test_reliable_in_order_delivery() {
        let now = Instant::now();
        let mut a = Peer::new(now);
        let mut b = Peer::new(now);

        a.send(Channel::Reliable, b"first", now);
        a.send(Channel::Reliable, b"second", now);
        let received = messages(deliver(&mut a, &mut b, now));
        assert_eq!(received, vec![b"first".to_vec(), b"second".to_vec()]);

        deliver(&mut b, &mut a, now);
        assert_eq!(a.unacked(), 0);
    }

    #[test]
    fn test_fragmentation_reassembles_large_message() {
        let now = Instant::now();
        let mut a = Peer::new(now);
        let mut b = Peer::new(now);

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        a.send(Channel::Reliable, &payload, now);

        let packets = a.drain_outgoing();
        assert_eq!(packets.len(), 5);
        for packet in &packets {
            if let Packet::Reliable { data, .. } = packet {
                assert!(data.len() <= MAX_FRAGMENT_SIZE);
            }
        }

        let mut events = Vec::new();
        for packet in packets {
            events.extend(b.receive(packet, now).unwrap());
        }
        assert_eq!(messages(events), vec![payload]);
    }

    #[test]
    fn test_empty_reliable_message_is_delivered() {
        let now = Instant::now();
        let mut a = Peer::new(now);
        let mut b = Peer::new(now);

        a.send(Channel::Reliable, &[], now);
        assert_eq!(messages(deliver(&mut a, &mut b, now)), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_reordered_fragments_are_buffered() {
        let now = Instant::now();
        let mut a = Peer::new(now);
        let mut b = Peer::new(now);

        a.send(Channel::Reliable, b"one", now);
        a.send(Channel::Reliable, b"two", now);
        a.send(Channel::Reliable, b"three", now);

        let mut packets = a.drain_outgoing();
        packets.reverse();

        let mut delivered = Vec::new();
        for packet in packets {
            delivered.extend(messages(b.receive(packet, now).unwrap()));
        }
        assert_eq!(
            delivered,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn test_oversized_fragment_is_rejected() {
        let now = Instant::now();
        let mut peer = Peer::new(now);

        let result = peer.receive(
            Packet::Reliable {
                seq: 0,
                more: false,
                data: vec![0; MAX_FRAGMENT_SIZE + 1],
            },
            now,
        );
        assert!(matches!(
            result,
            Err(TransportError::FragmentTooLarge(len)) if len == MAX_FRAGMENT_SIZE + 1
        ));
    }

    #[test]
    fn test_withheld_fragment_caps_buffered_bytes() {
        let now = Instant::now();
        let mut peer = Peer::new(now);
        let parked = (MAX_MESSAGE_SIZE / MAX_FRAGMENT_SIZE) as u32;

        // seq 0 never arrives, so everything after it stays parked
        for seq in 1..=parked {
            let events = peer
                .receive(
                    Packet::Reliable {
                        seq,
                        more: true,
                        data: vec![0; MAX_FRAGMENT_SIZE],
                    },
                    now,
                )
                .unwrap();
            assert!(events.is_empty());
        }

        let overflow = peer.receive(
            Packet::Reliable {
                seq: parked + 1,
                more: true,
                data: vec![0; MAX_FRAGMENT_SIZE],
            },
            now,
        );
        assert!(matches!(overflow, Err(TransportError::MessageTooLarge)));
    }

    #[test]
    fn test_buffered_bytes_are_released_after_delivery() {
        let now = Instant::now();
        let mut a = Peer::new(now);
        let mut b = Peer::new(now);
        let payload = vec![7u8; MAX_MESSAGE_SIZE / 2];

        // three half-limit messages in a row only fit if each is released
        for _ in 0..3 {
            a.send(Channel::Reliable, &payload, now);
            assert_eq!(messages(deliver(&mut a, &mut b, now)), vec![payload.clone()]);
        }
    }

    #[test]
    fn test_lost_fragment_is_resent() {
        let start = Instant::now();
        let mut a = Peer::new(start);
        let mut b = Peer::new(start);

        a.send(Channel::Reliable, b"lost", start);
        a.send(Channel::Reliable, b"kept", start);
        let mut packets = a.drain_outgoing();
        let kept = packets.pop().unwrap();
        drop(packets);

        assert!(messages(b.receive(kept, start).unwrap()).is_empty());
        deliver(&mut b, &mut a, start);
        assert_eq!(a.unacked(), 1);

        // nothing due before the resend delay
        a.update(start + Duration::from_millis(10)).unwrap();
        assert!(!a.has_outgoing());

        let later = start + Duration::from_millis(250);
        a.update(later).unwrap();
        let received = messages(deliver(&mut a, &mut b, later));
        assert_eq!(received, vec![b"lost".to_vec(), b"kept".to_vec()]);

        deliver(&mut b, &mut a, later);
        assert_eq!(a.unacked(), 0);
    }

    #[test]
    fn test_duplicate_fragment_is_not_delivered_twice() {
        let now = Instant::now();
        let mut a = Peer::new(now);
        let mut b = Peer::new(now);

        a.send(Channel::Reliable, b"once", now);
        let packet = a.drain_outgoing().remove(0);

        assert_eq!(messages(b.receive(packet.clone(), now).unwrap()).len(), 1);
        assert!(messages(b.receive(packet, now).unwrap()).is_empty());

        // both copies are acked
        let acks = b
            .drain_outgoing()
            .into_iter()
            .filter(|p| matches!(p, Packet::Ack { seq: 0 }))
            .count();
        assert_eq!(acks, 2);
    }

    #[test]
    fn test_unreliable_passes_through() {
        let now = Instant::now();
        let mut a = Peer::new(now);
        let mut b = Peer::new(now);

        a.send(Channel::Unreliable, b"move", now);
        let events = deliver(&mut a, &mut b, now);
        assert_eq!(
            events,
            vec![PeerEvent::Message {
                channel: Channel::Unreliable,
                data: b"move".to_vec()
            }]
        );
        assert_eq!(a.unacked(), 0);
    }

    #[test]
    fn test_ping_measures_rtt() {
        let start = Instant::now();
        let mut a = Peer::new(start);
        let mut b = Peer::new(start);
        assert!(a.rtt().is_none());

        let ping_at = start + PING_INTERVAL;
        a.update(ping_at).unwrap();
        deliver(&mut a, &mut b, ping_at);

        let pong_at = ping_at + Duration::from_millis(40);
        deliver(&mut b, &mut a, pong_at);

        let rtt = a.rtt().unwrap();
        assert_approx_eq!(rtt.as_secs_f64(), 0.040, 1e-6);
    }

    #[test]
    fn test_silent_peer_times_out() {
        let start = Instant::now();
        let mut peer = Peer::new(start);
        assert!(peer.update(start + Duration::from_secs(4)).is_ok());
        assert!(matches!(
            peer.update(start + PEER_TIMEOUT),
            Err(TransportError::Timeout)
        ));
    }

    #[test]
    fn test_disconnect_event() {
        let now = Instant::now();
        let mut a = Peer::new(now);
        let mut b = Peer::new(now);

        a.disconnect();
        assert_eq!(deliver(&mut a, &mut b, now), vec![PeerEvent::Disconnected]);
    }

    #[tokio::test]
    async fn test_send_packet_over_loopback() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();

        send_packet(&sender, &Packet::Ping { nonce: 9 }, addr)
            .await
            .unwrap();

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = receiver.recv_from(&mut buffer).await.unwrap();
        assert_eq!(from, sender.local_addr().unwrap());
        assert_eq!(decode_packet(&buffer[..len]).unwrap(), Packet::Ping { nonce: 9 });
    }
}
