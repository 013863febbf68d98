//! Integration tests across the shared protocol, the server and the client
//!
//! These tests drive the real server components and check what a client
//! replica ends up seeing.

use bytes::Bytes;
use client::game::ClientReplica;
use client::network::{ClientEvent, NetworkClient};
use server::client_manager::{ConnectionId, SessionManager};
use server::config::ServerConfig;
use server::game::Simulator;
use server::network::Server;
use server::replication::ReplicationEncoder;
use shared::protocol::encode_batch;
use shared::{
    decode_batch, encode_input, Action, Cell, Channel, Chunk, Edge, Key, MessageKind, Region,
};
use std::time::{Duration, Instant};

/// Runs one server tick the way the server loop does and returns every
/// session's flushed batches
fn server_tick(
    sim: &mut Simulator,
    encoder: &mut ReplicationEncoder,
    sessions: &mut SessionManager,
) -> Vec<(ConnectionId, Vec<(Channel, Vec<u8>)>)> {
    let report = sim.step();
    encoder.record(&report);
    let chunks = encoder.encode_tick(sim);
    sessions.broadcast_all(&chunks);
    sessions.flush_all()
}

fn chat(text: &str) -> Vec<u8> {
    encode_batch(&[Chunk::ClientMsg {
        text: text.as_bytes().to_vec(),
    }
    .encode()])
}

/// BASELINE AND REPLICATION
mod replication_tests {
    use super::*;

    /// A new client receives the full terrain, every tank spawn and every
    /// name strictly before any per-tick delta
    #[test]
    fn new_client_baseline_precedes_deltas() {
        let mut sim = Simulator::new(0, 0);
        let mut encoder = ReplicationEncoder::new();
        let mut sessions = SessionManager::new(8, false);

        let a = ConnectionId(1);
        let b = ConnectionId(2);
        let c = ConnectionId(3);
        sessions.connect(a, &mut sim).unwrap();
        sessions.connect(b, &mut sim).unwrap();
        server_tick(&mut sim, &mut encoder, &mut sessions);

        sessions.connect(c, &mut sim).unwrap();
        let flushed = server_tick(&mut sim, &mut encoder, &mut sessions);
        let (_, batches) = flushed
            .into_iter()
            .find(|(conn, _)| *conn == c)
            .expect("new session was flushed");

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, Channel::Reliable);
        assert_eq!(batches[1].0, Channel::Unreliable);

        let reliable = decode_batch(&batches[0].1).unwrap();
        assert!(matches!(reliable[0], Chunk::PackedLand { .. }));
        let spawned: Vec<u8> = reliable[1..4]
            .iter()
            .map(|chunk| match chunk {
                Chunk::Tank {
                    id,
                    action: Action::Spawn,
                    ..
                } => *id,
                other => panic!("Expected a tank spawn, got {:?}", other),
            })
            .collect();
        assert_eq!(spawned, vec![0, 1, 2]);
        for (i, chunk) in reliable[4..7].iter().enumerate() {
            assert!(matches!(
                chunk,
                Chunk::ServerMsg { origin, kind: MessageKind::NameChange, .. } if *origin as usize == i
            ));
        }
        assert!(!reliable
            .iter()
            .any(|c| matches!(c, Chunk::Tank { action: Action::Move, .. })));

        let unreliable = decode_batch(&batches[1].1).unwrap();
        assert!(matches!(unreliable.last(), Some(Chunk::Bullets { .. })));

        // the replica built from those batches agrees with the server
        let mut replica = ClientReplica::new();
        let now = Instant::now();
        replica.apply_batch(&batches[0].1, now).unwrap();
        replica.apply_batch(&batches[1].1, now).unwrap();
        assert!(replica.is_synced());
        assert_eq!(&replica.snapshot().terrain, sim.terrain());
        assert_eq!(replica.snapshot().active_tanks().count(), 3);
        assert_eq!(replica.snapshot().tanks[2].name, "p2");
    }

    /// A charged missile fired next to another tank sends it back to its
    /// spawn and clears the crater, and the client replica follows
    #[test]
    fn missile_blast_respawns_tank_and_replicates() {
        let mut sim = Simulator::new(0, 0);
        let mut encoder = ReplicationEncoder::new();
        let mut replica = ClientReplica::new();
        let now = Instant::now();

        let a = sim.add_tank().unwrap();
        let b = sim.add_tank().unwrap();
        for chunk in ReplicationEncoder::baseline(&sim, std::iter::empty()) {
            replica.apply(chunk, now).unwrap();
        }

        // let both tanks settle on the surface
        for _ in 0..200 {
            encoder.record(&sim.step());
        }
        let ground_y = sim.store().tank(a).unwrap().y;
        let a_x = sim.store().tank(a).unwrap().x;
        {
            let tank_b = sim.store_mut().tank_mut(b).unwrap();
            tank_b.x = a_x + 6;
            tank_b.y = ground_y;
        }
        let spawn_b = sim.store().tank(b).unwrap().spawn;

        sim.apply_input(a, shared::InputKey::new(Key::Fire, Edge::Press));
        for _ in 0..3 {
            encoder.record(&sim.step());
        }
        sim.apply_input(a, shared::InputKey::new(Key::Fire, Edge::Release));

        let mut blast = None;
        let mut shots = 0;
        for _ in 0..100 {
            let report = sim.step();
            encoder.record(&report);
            shots += report.shots;
            if report.detonations > 0 {
                blast = Some(report);
                break;
            }
        }
        let report = blast.expect("the missile detonated");
        assert_eq!(shots, 1);
        assert_eq!(sim.shots_fired(), 1);
        assert!(report.respawned.contains(&b));

        let tank_b = sim.store().tank(b).unwrap();
        assert_eq!((tank_b.x, tank_b.y), spawn_b);

        let Region { x, y, .. } = report.dirty[0];
        let (cx, cy) = (x as i32 + 12, y as i32 + 12);
        for dy in -11..=11 {
            for dx in -11..=11 {
                if dx * dx + dy * dy < 144 {
                    assert_eq!(sim.terrain().get(cx + dx, cy + dy), Cell::Empty);
                }
            }
        }

        for chunk in encoder.encode_tick(&sim) {
            replica.apply(chunk, now).unwrap();
        }
        assert_eq!(&replica.snapshot().terrain, sim.terrain());
        let seen_b = replica.snapshot().tank(b).unwrap();
        assert_eq!((seen_b.x as i32, seen_b.y as i32), spawn_b);
    }
}

/// SESSION ISOLATION AND CHAT
mod session_tests {
    use super::*;

    /// An unknown chunk tag tears down only the connection that sent it
    #[test]
    fn unknown_tag_tears_down_only_the_sender() {
        let mut sim = Simulator::new(0, 0);
        let mut encoder = ReplicationEncoder::new();
        let mut sessions = SessionManager::new(8, false);
        let good = ConnectionId(1);
        let bad = ConnectionId(2);
        let good_tank = sessions.connect(good, &mut sim).unwrap();
        let bad_tank = sessions.connect(bad, &mut sim).unwrap();
        server_tick(&mut sim, &mut encoder, &mut sessions);

        sessions
            .handle_payload(
                good,
                &encode_batch(&[encode_input(Key::Right, Edge::Press, 0)]),
                &mut sim,
            )
            .unwrap();
        sessions
            .handle_payload(bad, &encode_batch(&[Bytes::from_static(&[0xEE, 1])]), &mut sim)
            .unwrap();
        assert_eq!(sessions.sweep(&mut sim), vec![bad]);

        assert!(sessions.session(bad).is_none());
        assert!(sim.store().tank(bad_tank).is_none());
        assert!(sessions.session(good).unwrap().is_active());
        assert!(sim.store().tank(good_tank).unwrap().input.right);

        let flushed = server_tick(&mut sim, &mut encoder, &mut sessions);
        assert_eq!(flushed.len(), 1);
        let chunks: Vec<Chunk> = flushed[0]
            .1
            .iter()
            .flat_map(|(_, batch)| decode_batch(batch).unwrap())
            .collect();
        assert!(chunks.contains(&Chunk::Tank {
            id: bad_tank,
            action: Action::Kill,
            x: shared::KILLED_COORD,
            y: shared::KILLED_COORD,
            angle: 0,
        }));
    }

    /// Chat from two clients in the same tick reaches everyone intact and
    /// tagged with the right sender
    #[test]
    fn simultaneous_chat_is_delivered_intact() {
        let mut sim = Simulator::new(0, 0);
        let mut encoder = ReplicationEncoder::new();
        let mut sessions = SessionManager::new(8, false);
        let conns = [ConnectionId(1), ConnectionId(2), ConnectionId(3)];
        for conn in conns {
            sessions.connect(conn, &mut sim).unwrap();
        }
        server_tick(&mut sim, &mut encoder, &mut sessions);

        let long = "x".repeat(255);
        sessions
            .handle_payload(conns[0], &chat("first message"), &mut sim)
            .unwrap();
        sessions.handle_payload(conns[1], &chat(&long), &mut sim).unwrap();

        let flushed = server_tick(&mut sim, &mut encoder, &mut sessions);
        assert_eq!(flushed.len(), 3);
        for (_, batches) in flushed {
            let (channel, reliable) = &batches[0];
            assert_eq!(*channel, Channel::Reliable);
            let chats: Vec<Chunk> = decode_batch(reliable).unwrap();
            assert_eq!(
                chats,
                vec![
                    Chunk::ServerMsg {
                        origin: 0,
                        kind: MessageKind::Chat,
                        text: b"first message".to_vec(),
                    },
                    Chunk::ServerMsg {
                        origin: 1,
                        kind: MessageKind::Chat,
                        text: long.as_bytes().to_vec(),
                    },
                ]
            );
        }
    }
}

/// REAL UDP SESSIONS
mod network_tests {
    use super::*;

    async fn poll_until(
        client: &mut NetworkClient,
        mut done: impl FnMut(&NetworkClient, &[ClientEvent]) -> bool,
    ) -> Vec<ClientEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            let events = client.poll(Duration::from_millis(20)).await.unwrap();
            seen.extend(events);
            if done(client, &seen) {
                return seen;
            }
            client.flush().await.unwrap();
        }
        panic!("condition not reached, saw {:?}", seen);
    }

    /// Two clients join a live server over loopback, chat, and one of them
    /// gets dropped for sending garbage
    #[tokio::test]
    async fn loopback_session_end_to_end() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            crate_chance: 0,
            seed: Some(42),
            ..ServerConfig::default()
        };
        let mut server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server_task = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let mut alice = NetworkClient::connect(addr).await.unwrap();
        poll_until(&mut alice, |c, _| {
            c.replica().is_synced() && c.replica().snapshot().tank(0).is_some()
        })
        .await;

        let mut bob = NetworkClient::connect(addr).await.unwrap();
        poll_until(&mut bob, |c, _| {
            c.replica().is_synced() && c.replica().snapshot().active_tanks().count() == 2
        })
        .await;

        alice.queue_chat("/nick alice");
        alice.flush().await.unwrap();
        poll_until(&mut bob, |c, _| c.replica().snapshot().tanks[0].name == "alice").await;

        alice.queue_chat("hello bob");
        alice.flush().await.unwrap();
        poll_until(&mut bob, |_, seen| {
            seen.contains(&ClientEvent::ChatLine("<alice> hello bob".to_string()))
        })
        .await;

        alice.queue_input(Bytes::from_static(&[0xEE]));
        alice.flush().await.unwrap();
        poll_until(&mut alice, |_, seen| seen.contains(&ClientEvent::Disconnected)).await;
        poll_until(&mut bob, |c, _| c.replica().snapshot().tank(0).is_none()).await;
        assert!(bob.replica().snapshot().tank(1).is_some());

        bob.disconnect().await.unwrap();
        let _ = stop_tx.send(());
        server_task.await.unwrap().unwrap();
    }
}
