// Punch relay state machine
//
// Pure logic: the network adapter feeds events in and executes the returned
// actions. No sockets or timers live here.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::application::constants::{DEFAULT_PEER_TIMEOUT, HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL};
use crate::domain::message::KEEPALIVE_PAYLOAD;
use crate::domain::{classify, Inbound, OpponentEnvelope, PlayerUid, ProxyExit, PunchRequest};

/// Relay timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    /// `None` disables the opponent silence check
    pub peer_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            peer_timeout: Some(DEFAULT_PEER_TIMEOUT),
        }
    }
}

/// Input to the relay
#[derive(Debug, Clone, Copy)]
pub enum RelayEvent<'a> {
    Started,
    PunchDatagram {
        from: SocketAddr,
        payload: &'a [u8],
    },
    EmulatorDatagram(&'a [u8]),
    KeepAliveTick,
    HandshakeDeadline,
    PeerSilenceCheck,
    /// Socket failure in the adapter
    Fatal,
    Shutdown,
}

/// Side effect requested by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction<'a> {
    SendToServer(PunchRequest),
    SendToPeer { to: SocketAddr, payload: &'a [u8] },
    ForwardToEmulator(&'a [u8]),
    StartKeepAlive,
    Close(ProxyExit),
}

/// Datagram counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_emulator: u64,
    pub to_peer: u64,
    pub keepalives_sent: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Registering,
    Connected {
        opponent: SocketAddr,
        match_id: Option<String>,
        last_seen: Instant,
    },
    Closed(ProxyExit),
}

/// Hole-punch relay between the local emulator and the opponent
pub struct Relay {
    uid: PlayerUid,
    peer_uid: PlayerUid,
    config: RelayConfig,
    phase: Phase,
    keepalive_running: bool,
    kill_sent: bool,
    stats: RelayStats,
}

impl Relay {
    pub fn new(uid: PlayerUid, peer_uid: PlayerUid, config: RelayConfig) -> Self {
        Self {
            uid,
            peer_uid,
            config,
            phase: Phase::Registering,
            keepalive_running: false,
            kill_sent: false,
            stats: RelayStats::default(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    pub fn opponent(&self) -> Option<SocketAddr> {
        match &self.phase {
            Phase::Connected { opponent, .. } => Some(*opponent),
            _ => None,
        }
    }

    pub fn match_id(&self) -> Option<&str> {
        match &self.phase {
            Phase::Connected { match_id, .. } => match_id.as_deref(),
            _ => None,
        }
    }

    /// Exit reason once closed
    pub fn exit(&self) -> Option<ProxyExit> {
        match self.phase {
            Phase::Closed(exit) => Some(exit),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed(_))
    }

    /// Feed one event; `now` is the time the event was observed
    pub fn handle<'a>(&mut self, event: RelayEvent<'a>, now: Instant) -> Vec<RelayAction<'a>> {
        if self.is_closed() {
            return Vec::new();
        }

        match event {
            RelayEvent::Started => {
                info!(uid = %self.uid, peer_uid = %self.peer_uid, "Registering with rendezvous server");
                vec![RelayAction::SendToServer(PunchRequest::register(
                    &self.uid,
                    &self.peer_uid,
                ))]
            }
            RelayEvent::PunchDatagram { from, payload } => self.on_punch(from, payload, now),
            RelayEvent::EmulatorDatagram(payload) => match self.opponent() {
                Some(to) => {
                    self.stats.to_peer += 1;
                    vec![RelayAction::SendToPeer { to, payload }]
                }
                None => {
                    self.stats.dropped += 1;
                    debug!(bytes = payload.len(), "Emulator datagram before opponent is known, dropped");
                    Vec::new()
                }
            },
            RelayEvent::KeepAliveTick => match self.opponent() {
                Some(to) => {
                    self.stats.keepalives_sent += 1;
                    vec![RelayAction::SendToPeer {
                        to,
                        payload: KEEPALIVE_PAYLOAD,
                    }]
                }
                None => Vec::new(),
            },
            RelayEvent::HandshakeDeadline => {
                if self.phase == Phase::Registering {
                    warn!(
                        timeout_secs = self.config.handshake_timeout.as_secs(),
                        "No response from the hole punching server"
                    );
                    self.close(ProxyExit::HandshakeTimeout)
                } else {
                    Vec::new()
                }
            }
            RelayEvent::PeerSilenceCheck => {
                let (Some(limit), Phase::Connected { last_seen, opponent, .. }) =
                    (self.config.peer_timeout, &self.phase)
                else {
                    return Vec::new();
                };
                let silent_for = now.saturating_duration_since(*last_seen);
                if silent_for > limit {
                    warn!(
                        peer = %opponent,
                        silent_ms = silent_for.as_millis() as u64,
                        "Opponent went silent"
                    );
                    self.close(ProxyExit::PeerLost)
                } else {
                    Vec::new()
                }
            }
            RelayEvent::Fatal => self.close(ProxyExit::Fatal),
            RelayEvent::Shutdown => self.close(ProxyExit::Stopped),
        }
    }

    fn on_punch<'a>(
        &mut self,
        from: SocketAddr,
        payload: &'a [u8],
        now: Instant,
    ) -> Vec<RelayAction<'a>> {
        match classify(payload) {
            Inbound::Envelope(envelope) => self.on_envelope(envelope, now),
            Inbound::KeepAlive => {
                self.touch(from, now);
                self.ensure_keepalive().into_iter().collect()
            }
            Inbound::Control => {
                self.stats.dropped += 1;
                debug!(from = %from, "Control datagram ignored");
                Vec::new()
            }
            Inbound::Game(bytes) => {
                self.touch(from, now);
                self.stats.to_emulator += 1;
                vec![RelayAction::ForwardToEmulator(bytes)]
            }
        }
    }

    fn on_envelope<'a>(&mut self, envelope: OpponentEnvelope, now: Instant) -> Vec<RelayAction<'a>> {
        let ip: IpAddr = match envelope.peer.address.parse() {
            Ok(ip) => ip,
            Err(_) => {
                self.stats.dropped += 1;
                warn!(address = %envelope.peer.address, "Opponent address is not an IP, ignored");
                return Vec::new();
            }
        };
        let opponent = SocketAddr::new(ip, envelope.peer.port);

        // only the opponent itself proves it is alive; a repeated envelope does not
        let last_seen = match &self.phase {
            Phase::Connected {
                opponent: current,
                last_seen,
                ..
            } if *current == opponent => *last_seen,
            Phase::Connected { opponent: current, .. } => {
                info!(old = %current, new = %opponent, "Opponent endpoint changed");
                now
            }
            _ => {
                info!(peer = %opponent, match_id = ?envelope.match_id, "Opponent endpoint learned");
                now
            }
        };
        self.phase = Phase::Connected {
            opponent,
            match_id: envelope.match_id,
            last_seen,
        };

        let mut actions = vec![RelayAction::SendToPeer {
            to: opponent,
            payload: KEEPALIVE_PAYLOAD,
        }];
        self.stats.keepalives_sent += 1;
        actions.extend(self.ensure_keepalive());
        actions
    }

    fn ensure_keepalive<'a>(&mut self) -> Option<RelayAction<'a>> {
        if self.keepalive_running || self.opponent().is_none() {
            return None;
        }
        self.keepalive_running = true;
        Some(RelayAction::StartKeepAlive)
    }

    fn touch(&mut self, from: SocketAddr, now: Instant) {
        if let Phase::Connected {
            opponent,
            last_seen,
            ..
        } = &mut self.phase
        {
            if *opponent == from {
                *last_seen = now;
            }
        }
    }

    fn close<'a>(&mut self, exit: ProxyExit) -> Vec<RelayAction<'a>> {
        let mut actions = Vec::with_capacity(2);
        if !self.kill_sent {
            self.kill_sent = true;
            actions.push(RelayAction::SendToServer(PunchRequest::withdraw(
                &self.uid,
                &self.peer_uid,
            )));
        }
        info!(exit = %exit, "Relay closed");
        self.phase = Phase::Closed(exit);
        actions.push(RelayAction::Close(exit));
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENVELOPE: &[u8] = br#"{"matchId":"m-7","peer":{"address":"198.51.100.4","port":50123}}"#;

    fn opponent() -> SocketAddr {
        "198.51.100.4:50123".parse().unwrap()
    }

    fn server() -> SocketAddr {
        "203.0.113.7:33333".parse().unwrap()
    }

    fn relay(peer_timeout: Option<Duration>) -> Relay {
        Relay::new(
            PlayerUid::new("alice").unwrap(),
            PlayerUid::new("bob").unwrap(),
            RelayConfig {
                peer_timeout,
                ..RelayConfig::default()
            },
        )
    }

    fn connect(relay: &mut Relay, now: Instant) {
        relay.handle(
            RelayEvent::PunchDatagram {
                from: server(),
                payload: ENVELOPE,
            },
            now,
        );
    }

    #[test]
    fn test_start_registers_with_server() {
        let mut relay = relay(None);
        let actions = relay.handle(RelayEvent::Started, Instant::now());

        match actions.as_slice() {
            [RelayAction::SendToServer(req)] => {
                assert!(!req.kill);
                assert_eq!(req.uid.as_str(), "alice");
                assert_eq!(req.peer_uid.as_str(), "bob");
            }
            other => panic!("unexpected actions: {:?}", other),
        }
    }

    #[test]
    fn test_envelope_pings_peer_and_starts_keepalive_once() {
        let mut relay = relay(None);
        let now = Instant::now();

        let actions = relay.handle(
            RelayEvent::PunchDatagram {
                from: server(),
                payload: ENVELOPE,
            },
            now,
        );
        assert_eq!(
            actions,
            vec![
                RelayAction::SendToPeer {
                    to: opponent(),
                    payload: b"ping"
                },
                RelayAction::StartKeepAlive,
            ]
        );
        assert_eq!(relay.opponent(), Some(opponent()));
        assert_eq!(relay.match_id(), Some("m-7"));

        // A repeated envelope pings again but does not start a second keepalive
        let again = relay.handle(
            RelayEvent::PunchDatagram {
                from: server(),
                payload: ENVELOPE,
            },
            now,
        );
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_emulator_traffic_dropped_until_connected() {
        let mut relay = relay(None);
        let now = Instant::now();

        assert!(relay
            .handle(RelayEvent::EmulatorDatagram(b"frame"), now)
            .is_empty());
        assert_eq!(relay.stats().dropped, 1);

        connect(&mut relay, now);
        let actions = relay.handle(RelayEvent::EmulatorDatagram(b"frame"), now);
        assert_eq!(
            actions,
            vec![RelayAction::SendToPeer {
                to: opponent(),
                payload: b"frame"
            }]
        );
        assert_eq!(relay.stats().to_peer, 1);
    }

    #[test]
    fn test_game_data_forwarded_to_emulator() {
        let mut relay = relay(None);
        let now = Instant::now();
        connect(&mut relay, now);

        let actions = relay.handle(
            RelayEvent::PunchDatagram {
                from: opponent(),
                payload: &[9, 8, 7],
            },
            now,
        );
        assert_eq!(actions, vec![RelayAction::ForwardToEmulator(&[9, 8, 7])]);
        assert_eq!(relay.stats().to_emulator, 1);
    }

    #[test]
    fn test_keepalive_tick_only_when_connected() {
        let mut relay = relay(None);
        let now = Instant::now();
        assert!(relay.handle(RelayEvent::KeepAliveTick, now).is_empty());

        connect(&mut relay, now);
        let actions = relay.handle(RelayEvent::KeepAliveTick, now);
        assert_eq!(
            actions,
            vec![RelayAction::SendToPeer {
                to: opponent(),
                payload: b"ping"
            }]
        );
    }

    #[test]
    fn test_handshake_timeout_withdraws_and_closes() {
        let mut relay = relay(None);
        let actions = relay.handle(RelayEvent::HandshakeDeadline, Instant::now());

        assert!(matches!(&actions[0], RelayAction::SendToServer(req) if req.kill));
        assert_eq!(actions[1], RelayAction::Close(ProxyExit::HandshakeTimeout));
        assert_eq!(relay.exit(), Some(ProxyExit::HandshakeTimeout));
    }

    #[test]
    fn test_handshake_deadline_ignored_once_connected() {
        let mut relay = relay(None);
        let now = Instant::now();
        connect(&mut relay, now);
        assert!(relay.handle(RelayEvent::HandshakeDeadline, now).is_empty());
        assert!(!relay.is_closed());
    }

    #[test]
    fn test_peer_silence_closes_with_peer_lost() {
        let mut relay = relay(Some(Duration::from_secs(5)));
        let start = Instant::now();
        connect(&mut relay, start);

        // keepalive from opponent refreshes liveness
        relay.handle(
            RelayEvent::PunchDatagram {
                from: opponent(),
                payload: b"ping",
            },
            start + Duration::from_secs(4),
        );
        assert!(relay
            .handle(RelayEvent::PeerSilenceCheck, start + Duration::from_secs(8))
            .is_empty());

        let actions = relay.handle(RelayEvent::PeerSilenceCheck, start + Duration::from_secs(10));
        assert_eq!(actions.last(), Some(&RelayAction::Close(ProxyExit::PeerLost)));
    }

    #[test]
    fn test_traffic_from_strangers_does_not_refresh_liveness() {
        let mut relay = relay(Some(Duration::from_secs(5)));
        let start = Instant::now();
        connect(&mut relay, start);

        relay.handle(
            RelayEvent::PunchDatagram {
                from: server(),
                payload: b"ping",
            },
            start + Duration::from_secs(4),
        );
        let actions = relay.handle(RelayEvent::PeerSilenceCheck, start + Duration::from_secs(6));
        assert_eq!(actions.last(), Some(&RelayAction::Close(ProxyExit::PeerLost)));
    }

    #[test]
    fn test_repeated_envelope_does_not_refresh_liveness() {
        let mut relay = relay(Some(Duration::from_secs(5)));
        let start = Instant::now();
        connect(&mut relay, start);

        // server repeats the same endpoint; the opponent itself stays silent
        connect(&mut relay, start + Duration::from_secs(4));
        assert_eq!(relay.opponent(), Some(opponent()));

        let actions = relay.handle(RelayEvent::PeerSilenceCheck, start + Duration::from_secs(6));
        assert_eq!(actions.last(), Some(&RelayAction::Close(ProxyExit::PeerLost)));
    }

    #[test]
    fn test_changed_endpoint_starts_fresh_liveness() {
        let mut relay = relay(Some(Duration::from_secs(5)));
        let start = Instant::now();
        connect(&mut relay, start);

        let moved = br#"{"peer":{"address":"198.51.100.4","port":50124}}"#;
        relay.handle(
            RelayEvent::PunchDatagram {
                from: server(),
                payload: moved,
            },
            start + Duration::from_secs(4),
        );
        assert_eq!(relay.opponent(), Some("198.51.100.4:50124".parse().unwrap()));
        assert!(relay
            .handle(RelayEvent::PeerSilenceCheck, start + Duration::from_secs(6))
            .is_empty());
    }

    #[test]
    fn test_disabled_peer_timeout_never_fires() {
        let mut relay = relay(None);
        let start = Instant::now();
        connect(&mut relay, start);
        assert!(relay
            .handle(RelayEvent::PeerSilenceCheck, start + Duration::from_secs(3600))
            .is_empty());
    }

    #[test]
    fn test_kill_sent_once_and_closed_relay_is_inert() {
        let mut relay = relay(None);
        let now = Instant::now();

        let first = relay.handle(RelayEvent::Shutdown, now);
        assert_eq!(first.len(), 2);
        assert_eq!(relay.exit(), Some(ProxyExit::Stopped));

        assert!(relay.handle(RelayEvent::Shutdown, now).is_empty());
        assert!(relay.handle(RelayEvent::HandshakeDeadline, now).is_empty());
        assert!(relay
            .handle(RelayEvent::EmulatorDatagram(b"late"), now)
            .is_empty());
    }

    #[test]
    fn test_fatal_still_withdraws_from_server() {
        let mut relay = relay(None);
        let now = Instant::now();
        connect(&mut relay, now);

        let actions = relay.handle(RelayEvent::Fatal, now);
        assert!(matches!(&actions[0], RelayAction::SendToServer(req) if req.kill));
        assert_eq!(relay.exit(), Some(ProxyExit::Fatal));
    }

    #[test]
    fn test_non_ip_envelope_is_ignored() {
        let mut relay = relay(None);
        let actions = relay.handle(
            RelayEvent::PunchDatagram {
                from: server(),
                payload: br#"{"peer":{"address":"peer.example","port":1}}"#,
            },
            Instant::now(),
        );
        assert!(actions.is_empty());
        assert_eq!(relay.opponent(), None);
    }
}
