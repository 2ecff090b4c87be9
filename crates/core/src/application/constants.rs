// Relay and session constants (no magic values)
use std::time::Duration;

/// How long to wait for the rendezvous server to announce the opponent (15s)
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval between keepalive pings to the opponent (1s)
/// Keeps the NAT mapping open on both sides
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Default opponent silence window before the match is abandoned (30s)
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// How often opponent silence is checked (1s)
pub const PEER_SILENCE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Largest UDP payload we accept
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Grace period between SIGTERM and SIGKILL when stopping a child (5s)
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a terminated child (100ms)
pub const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Loopback address the emulator uses to reach the proxy
pub const EMULATOR_REMOTE_IP: &str = "127.0.0.1";

/// Log label for the proxy child
pub const PROXY_LABEL: &str = "prxy";

/// Log label for the emulator child
pub const EMULATOR_LABEL: &str = "emu";

/// Environment variables passed through to children by default
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "RUST_LOG", "REFLECTOR_LOG_FORMAT"];
