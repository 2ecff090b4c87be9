// UDP hole-punch adapter
// reason: tokio UdpSocket + select! loop; all decisions live in core::Relay
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{interval, sleep, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use reflector_core::application::constants::{MAX_DATAGRAM_SIZE, PEER_SILENCE_CHECK_INTERVAL};
use reflector_core::application::{Relay, RelayAction, RelayConfig, RelayEvent, RelayStats, ShutdownToken};
use reflector_core::domain::{ProxyArgs, ProxyExit};

use crate::error::NetError;

/// Outcome of one proxy run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyRunReport {
    pub exit: ProxyExit,
    pub stats: RelayStats,
}

/// Unbound proxy
pub struct PunchProxy {
    args: ProxyArgs,
    config: RelayConfig,
}

impl PunchProxy {
    pub fn new(args: ProxyArgs, config: RelayConfig) -> Self {
        Self { args, config }
    }

    /// Resolve the server and bind both sockets
    ///
    /// The emulator listener falls back to a random loopback port when
    /// `emu_in` is taken; callers read the real port from `emulator_addr`.
    pub async fn bind(self) -> Result<BoundProxy, NetError> {
        let server = resolve_server(&self.args).await?;

        let punch_bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let punch = UdpSocket::bind(punch_bind)
            .await
            .map_err(|source| NetError::Bind {
                addr: punch_bind,
                source,
            })?;

        let emu_bind: SocketAddr = (Ipv4Addr::LOCALHOST, self.args.ports.emu_in).into();
        let emulator = match UdpSocket::bind(emu_bind).await {
            Ok(sock) => sock,
            Err(e) => {
                warn!(port = self.args.ports.emu_in, error = %e, "Emulator port busy, using a random port");
                let fallback: SocketAddr = (Ipv4Addr::LOCALHOST, 0).into();
                UdpSocket::bind(fallback)
                    .await
                    .map_err(|source| NetError::Bind {
                        addr: fallback,
                        source,
                    })?
            }
        };

        let emulator_target = (Ipv4Addr::LOCALHOST, self.args.ports.emu_out).into();

        Ok(BoundProxy {
            args: self.args,
            config: self.config,
            server,
            punch,
            emulator,
            emulator_target,
        })
    }
}

async fn resolve_server(args: &ProxyArgs) -> Result<SocketAddr, NetError> {
    let authority = args.server_authority();
    let resolved: Vec<SocketAddr> = lookup_host(&authority)
        .await
        .map_err(|e| NetError::Resolve {
            host: authority.clone(),
            reason: e.to_string(),
        })?
        .collect();

    resolved
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| NetError::Resolve {
            host: authority,
            reason: "no addresses".to_string(),
        })
}

/// Proxy with bound sockets, ready to run
pub struct BoundProxy {
    args: ProxyArgs,
    config: RelayConfig,
    server: SocketAddr,
    punch: UdpSocket,
    emulator: UdpSocket,
    emulator_target: SocketAddr,
}

impl BoundProxy {
    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    pub fn punch_addr(&self) -> io::Result<SocketAddr> {
        self.punch.local_addr()
    }

    pub fn emulator_addr(&self) -> io::Result<SocketAddr> {
        self.emulator.local_addr()
    }

    /// Relay until the handshake times out, the peer is lost, a socket
    /// fails, or `shutdown` fires
    pub async fn run(self, mut shutdown: ShutdownToken) -> ProxyRunReport {
        let mut relay = Relay::new(
            self.args.uid.clone(),
            self.args.peer_uid.clone(),
            self.config,
        );

        let mut keepalive = interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut keepalive_on = false;

        let mut silence = interval(PEER_SILENCE_CHECK_INTERVAL);
        silence.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let handshake = sleep(self.config.handshake_timeout);
        tokio::pin!(handshake);
        let mut handshake_fired = false;

        let mut punch_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut emu_buf = vec![0u8; MAX_DATAGRAM_SIZE];

        let actions = relay.handle(RelayEvent::Started, Instant::now());
        self.apply(actions, &mut keepalive, &mut keepalive_on).await;

        while !relay.is_closed() {
            tokio::select! {
                r = self.punch.recv_from(&mut punch_buf) => match r {
                    Ok((n, from)) => {
                        let event = RelayEvent::PunchDatagram { from, payload: &punch_buf[..n] };
                        let actions = relay.handle(event, Instant::now());
                        self.apply(actions, &mut keepalive, &mut keepalive_on).await;
                    }
                    Err(e) if is_transient(&e) => {
                        debug!(error = %e, "Transient punch socket error");
                    }
                    Err(e) => {
                        error!(error = %e, "Punch socket receive failed");
                        let actions = relay.handle(RelayEvent::Fatal, Instant::now());
                        self.apply(actions, &mut keepalive, &mut keepalive_on).await;
                    }
                },
                r = self.emulator.recv_from(&mut emu_buf) => match r {
                    Ok((n, _from)) => {
                        let actions = relay.handle(RelayEvent::EmulatorDatagram(&emu_buf[..n]), Instant::now());
                        self.apply(actions, &mut keepalive, &mut keepalive_on).await;
                    }
                    Err(e) if is_transient(&e) => {
                        debug!(error = %e, "Transient emulator socket error");
                    }
                    Err(e) => {
                        error!(error = %e, "Emulator socket receive failed");
                        let actions = relay.handle(RelayEvent::Fatal, Instant::now());
                        self.apply(actions, &mut keepalive, &mut keepalive_on).await;
                    }
                },
                _ = keepalive.tick(), if keepalive_on => {
                    let actions = relay.handle(RelayEvent::KeepAliveTick, Instant::now());
                    self.apply(actions, &mut keepalive, &mut keepalive_on).await;
                }
                _ = &mut handshake, if !handshake_fired => {
                    handshake_fired = true;
                    let actions = relay.handle(RelayEvent::HandshakeDeadline, Instant::now());
                    self.apply(actions, &mut keepalive, &mut keepalive_on).await;
                }
                _ = silence.tick() => {
                    let actions = relay.handle(RelayEvent::PeerSilenceCheck, Instant::now());
                    self.apply(actions, &mut keepalive, &mut keepalive_on).await;
                }
                _ = shutdown.wait() => {
                    info!("Shutdown requested");
                    let actions = relay.handle(RelayEvent::Shutdown, Instant::now());
                    self.apply(actions, &mut keepalive, &mut keepalive_on).await;
                }
            }
        }

        let stats = relay.stats();
        let exit = relay.exit().unwrap_or(ProxyExit::Fatal);
        info!(
            exit = %exit,
            to_emulator = stats.to_emulator,
            to_peer = stats.to_peer,
            keepalives_sent = stats.keepalives_sent,
            dropped = stats.dropped,
            "Proxy finished"
        );
        ProxyRunReport { exit, stats }
    }

    async fn apply(
        &self,
        actions: Vec<RelayAction<'_>>,
        keepalive: &mut Interval,
        keepalive_on: &mut bool,
    ) {
        for action in actions {
            match action {
                RelayAction::SendToServer(request) => match serde_json::to_vec(&request) {
                    Ok(bytes) => match self.punch.send_to(&bytes, self.server).await {
                        Ok(_) => info!(server = %self.server, kill = request.kill, "UDP message sent to server"),
                        Err(e) => warn!(server = %self.server, error = %e, "Could not send message to server"),
                    },
                    Err(e) => error!(error = %e, "Failed to encode punch request"),
                },
                RelayAction::SendToPeer { to, payload } => {
                    if let Err(e) = self.punch.send_to(payload, to).await {
                        warn!(peer = %to, bytes = payload.len(), error = %e, "Could not send message to peer");
                    }
                }
                RelayAction::ForwardToEmulator(payload) => {
                    if let Err(e) = self.emulator.send_to(payload, self.emulator_target).await {
                        warn!(emulator = %self.emulator_target, error = %e, "Could not forward to emulator");
                    }
                }
                RelayAction::StartKeepAlive => {
                    debug!(interval_ms = self.config.keepalive_interval.as_millis() as u64, "Keepalive started");
                    keepalive.reset();
                    *keepalive_on = true;
                }
                RelayAction::Close(_) => {}
            }
        }
    }
}

/// ICMP port-unreachable surfaces as a reset on some platforms
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflector_core::application::shutdown_channel;
    use reflector_core::domain::{PlayerUid, PortPair};
    use std::time::Duration;

    fn args(server: SocketAddr, ports: PortPair) -> ProxyArgs {
        ProxyArgs::new(
            server.ip().to_string(),
            server.port(),
            PlayerUid::new("alice").unwrap(),
            PlayerUid::new("bob").unwrap(),
            ports,
        )
        .unwrap()
    }

    fn free_ports() -> PortPair {
        // bind-and-release to find two currently free loopback ports
        let a = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        PortPair::new(
            a.local_addr().unwrap().port(),
            b.local_addr().unwrap().port(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_busy_emulator_port_falls_back() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let ports = PortPair::new(taken.local_addr().unwrap().port(), 1).unwrap();

        let bound = PunchProxy::new(args(server.local_addr().unwrap(), ports), RelayConfig::default())
            .bind()
            .await
            .unwrap();

        let emu = bound.emulator_addr().unwrap();
        assert!(emu.ip().is_loopback());
        assert_ne!(emu.port(), ports.emu_in);
    }

    #[tokio::test]
    async fn test_unresolvable_server() {
        let mut a = args("127.0.0.1:9".parse().unwrap(), free_ports());
        a.server_host = "does-not-exist.invalid".to_string();

        let result = PunchProxy::new(a, RelayConfig::default()).bind().await;
        assert!(matches!(result, Err(NetError::Resolve { .. })));
    }

    #[tokio::test]
    async fn test_handshake_timeout_registers_then_withdraws() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = RelayConfig {
            handshake_timeout: Duration::from_millis(200),
            ..RelayConfig::default()
        };
        let bound = PunchProxy::new(args(server.local_addr().unwrap(), free_ports()), config)
            .bind()
            .await
            .unwrap();
        let (_tx, token) = shutdown_channel();

        let report = bound.run(token).await;
        assert_eq!(report.exit, ProxyExit::HandshakeTimeout);

        let mut buf = [0u8; 512];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        let register: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(register["kill"], false);
        assert_eq!(register["peerUid"], "bob");

        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        let withdraw: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(withdraw["kill"], true);
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bound = PunchProxy::new(args(server.local_addr().unwrap(), free_ports()), RelayConfig::default())
            .bind()
            .await
            .unwrap();
        let (tx, token) = shutdown_channel();

        let run = tokio::spawn(bound.run(token));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.shutdown();

        let report = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.exit, ProxyExit::Stopped);
    }
}
