// Proxy exit reasons

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a proxy run ended; each reason maps to a stable process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyExit {
    /// Stopped by signal or by the host
    Stopped,
    /// Socket or IO failure
    Fatal,
    /// Rendezvous server never sent the opponent endpoint
    HandshakeTimeout,
    /// Opponent went silent
    PeerLost,
    /// Bad command line
    InvalidArguments,
}

impl ProxyExit {
    pub fn code(self) -> i32 {
        match self {
            ProxyExit::Stopped => 0,
            ProxyExit::Fatal => 1,
            ProxyExit::HandshakeTimeout => 2,
            ProxyExit::PeerLost => 3,
            ProxyExit::InvalidArguments => 64,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ProxyExit::Stopped),
            1 => Some(ProxyExit::Fatal),
            2 => Some(ProxyExit::HandshakeTimeout),
            3 => Some(ProxyExit::PeerLost),
            64 => Some(ProxyExit::InvalidArguments),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyExit::Stopped => write!(f, "STOPPED"),
            ProxyExit::Fatal => write!(f, "FATAL"),
            ProxyExit::HandshakeTimeout => write!(f, "HANDSHAKE_TIMEOUT"),
            ProxyExit::PeerLost => write!(f, "PEER_LOST"),
            ProxyExit::InvalidArguments => write!(f, "INVALID_ARGUMENTS"),
        }
    }
}
