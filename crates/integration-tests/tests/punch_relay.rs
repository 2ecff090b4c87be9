//! Punch relay end-to-end over loopback
//!
//! A fake rendezvous server pairs two real proxies; plain UDP sockets play
//! the emulators.

use std::net::SocketAddr;
use std::time::Duration;

use reflector_core::application::{shutdown_channel, RelayConfig};
use reflector_core::domain::{PlayerUid, PortPair, ProxyArgs, ProxyExit};
use reflector_infra_net::{BoundProxy, PunchProxy};
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(5);

/// Loopback port that was free a moment ago
async fn free_port() -> u16 {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sock.local_addr().unwrap().port()
}

async fn bind_proxy(server: SocketAddr, uid: &str, peer: &str, emulator: &UdpSocket, config: RelayConfig) -> BoundProxy {
    let emu_out = emulator.local_addr().unwrap().port();
    let mut emu_in = free_port().await;
    while emu_in == emu_out {
        emu_in = free_port().await;
    }
    let args = ProxyArgs::new(
        "127.0.0.1",
        server.port(),
        PlayerUid::new(uid).unwrap(),
        PlayerUid::new(peer).unwrap(),
        PortPair::new(emu_in, emu_out).unwrap(),
    )
    .unwrap();
    PunchProxy::new(args, config).bind().await.unwrap()
}

async fn recv_json(sock: &UdpSocket) -> (Value, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (n, from) = timeout(STEP, sock.recv_from(&mut buf))
        .await
        .expect("server receive timed out")
        .unwrap();
    (serde_json::from_slice(&buf[..n]).unwrap(), from)
}

async fn recv_bytes(sock: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    let (n, _) = timeout(STEP, sock.recv_from(&mut buf))
        .await
        .expect("emulator receive timed out")
        .unwrap();
    buf[..n].to_vec()
}

fn envelope(peer: SocketAddr) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "matchId": "m-42",
        "peer": { "address": peer.ip().to_string(), "port": peer.port() }
    }))
    .unwrap()
}

/// Receive registrations until both uids are seen; returns the punch endpoint per uid
async fn collect_registrations(server: &UdpSocket) -> (SocketAddr, SocketAddr) {
    let mut alice = None;
    let mut bob = None;
    while alice.is_none() || bob.is_none() {
        let (msg, from) = recv_json(server).await;
        assert_eq!(msg["kill"], false);
        match msg["uid"].as_str() {
            Some("alice") => {
                assert_eq!(msg["peerUid"], "bob");
                alice = Some(from);
            }
            Some("bob") => {
                assert_eq!(msg["peerUid"], "alice");
                bob = Some(from);
            }
            other => panic!("unexpected uid {:?}", other),
        }
    }
    (alice.unwrap(), bob.unwrap())
}

#[tokio::test]
async fn test_two_proxies_relay_game_traffic_both_ways() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let emu_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let emu_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let proxy_a = bind_proxy(server_addr, "alice", "bob", &emu_a, RelayConfig::default()).await;
    let proxy_b = bind_proxy(server_addr, "bob", "alice", &emu_b, RelayConfig::default()).await;
    let a_in = proxy_a.emulator_addr().unwrap();
    let b_in = proxy_b.emulator_addr().unwrap();

    let (stop_a, token_a) = shutdown_channel();
    let (stop_b, token_b) = shutdown_channel();
    let run_a = tokio::spawn(proxy_a.run(token_a));
    let run_b = tokio::spawn(proxy_b.run(token_b));

    let (alice_punch, bob_punch) = collect_registrations(&server).await;

    // No opponent yet: dropped
    emu_a.send_to(b"too-early", a_in).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.send_to(&envelope(bob_punch), alice_punch).await.unwrap();
    server.send_to(&envelope(alice_punch), bob_punch).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    emu_a.send_to(b"frame-a-1", a_in).await.unwrap();
    assert_eq!(recv_bytes(&emu_b).await, b"frame-a-1");

    emu_b.send_to(b"frame-b-1", b_in).await.unwrap();
    assert_eq!(recv_bytes(&emu_a).await, b"frame-b-1");

    // Keepalives run while the match is idle and never reach the emulator
    tokio::time::sleep(Duration::from_millis(1500)).await;
    emu_a.send_to(b"frame-a-2", a_in).await.unwrap();
    assert_eq!(recv_bytes(&emu_b).await, b"frame-a-2");

    stop_a.shutdown();
    stop_b.shutdown();
    let report_a = timeout(STEP, run_a).await.unwrap().unwrap();
    let report_b = timeout(STEP, run_b).await.unwrap().unwrap();

    assert_eq!(report_a.exit, ProxyExit::Stopped);
    assert_eq!(report_b.exit, ProxyExit::Stopped);
    assert_eq!(report_a.stats.to_peer, 2);
    assert_eq!(report_a.stats.dropped, 1);
    assert_eq!(report_a.stats.to_emulator, 1);
    assert_eq!(report_b.stats.to_emulator, 2);
    assert!(report_a.stats.keepalives_sent >= 2);

    // Both withdraw from the server on the way out
    let mut withdrawn = Vec::new();
    for _ in 0..2 {
        let (msg, _) = recv_json(&server).await;
        assert_eq!(msg["kill"], true);
        withdrawn.push(msg["uid"].as_str().unwrap().to_string());
    }
    withdrawn.sort();
    assert_eq!(withdrawn, vec!["alice", "bob"]);
}

#[tokio::test]
async fn test_silent_opponent_ends_with_peer_lost() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let emu = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // Opponent that swallows everything
    let silent_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let config = RelayConfig {
        peer_timeout: Some(Duration::from_millis(500)),
        ..RelayConfig::default()
    };
    let proxy = bind_proxy(server_addr, "alice", "bob", &emu, config).await;

    let (_stop, token) = shutdown_channel();
    let run = tokio::spawn(proxy.run(token));

    let (msg, punch) = recv_json(&server).await;
    assert_eq!(msg["uid"], "alice");
    server
        .send_to(&envelope(silent_peer.local_addr().unwrap()), punch)
        .await
        .unwrap();

    // First keepalive goes straight to the opponent
    assert_eq!(recv_bytes(&silent_peer).await, b"ping");

    let report = timeout(Duration::from_secs(10), run).await.unwrap().unwrap();
    assert_eq!(report.exit, ProxyExit::PeerLost);
    assert_eq!(report.exit.code(), 3);

    let (msg, _) = recv_json(&server).await;
    assert_eq!(msg["kill"], true);
}

#[tokio::test]
async fn test_server_chatter_is_not_forwarded() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let emu = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let proxy = bind_proxy(server_addr, "alice", "bob", &emu, RelayConfig::default()).await;
    let (stop, token) = shutdown_channel();
    let run = tokio::spawn(proxy.run(token));

    let (_, punch) = recv_json(&server).await;
    server
        .send_to(&envelope(peer.local_addr().unwrap()), punch)
        .await
        .unwrap();
    assert_eq!(recv_bytes(&peer).await, b"ping");

    // Control message mentioning a port is swallowed, game bytes are not
    server.send_to(br#"{"status":"waiting","port":1}"#, punch).await.unwrap();
    peer.send_to(b"\x01\x02game", punch).await.unwrap();
    assert_eq!(recv_bytes(&emu).await, b"\x01\x02game");

    stop.shutdown();
    let report = timeout(STEP, run).await.unwrap().unwrap();
    assert_eq!(report.exit, ProxyExit::Stopped);
    assert_eq!(report.stats.to_emulator, 1);
    assert_eq!(report.stats.dropped, 1);
}
