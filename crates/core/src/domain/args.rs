// Proxy invocation parameters

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{DomainError, Result};

/// Flag names understood by the proxy binary (Go `flag` package shape)
pub mod flag {
    pub const SERVER_HOST: &str = "serverHost";
    pub const SERVER_PORT: &str = "serverPort";
    pub const UID: &str = "uid";
    pub const PEER_UID: &str = "peerUID";
    pub const EMU_IN: &str = "emuIn";
    pub const EMU_OUT: &str = "emuOut";
}

/// Default emulator-facing ports used by the launcher
pub const DEFAULT_EMU_IN: u16 = 7004;
pub const DEFAULT_EMU_OUT: u16 = 7005;

/// Opaque player identifier assigned by the account backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlayerUid(String);

impl PlayerUid {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(DomainError::Validation(format!(
                "player uid must be non-empty without whitespace: {:?}",
                s
            )));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PlayerUid {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<PlayerUid> for String {
    fn from(uid: PlayerUid) -> Self {
        uid.0
    }
}

impl fmt::Display for PlayerUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local loopback ports shared between the proxy and the emulator
///
/// - `emu_in`: the proxy listens here for datagrams coming from the emulator
/// - `emu_out`: the emulator listens here; opponent traffic is delivered to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    pub emu_in: u16,
    pub emu_out: u16,
}

impl PortPair {
    pub fn new(emu_in: u16, emu_out: u16) -> Result<Self> {
        if emu_in == 0 {
            return Err(DomainError::InvalidPort {
                name: flag::EMU_IN,
                value: 0,
            });
        }
        if emu_out == 0 {
            return Err(DomainError::InvalidPort {
                name: flag::EMU_OUT,
                value: 0,
            });
        }
        if emu_in == emu_out {
            return Err(DomainError::Validation(format!(
                "emuIn and emuOut must differ (both {})",
                emu_in
            )));
        }
        Ok(Self { emu_in, emu_out })
    }
}

impl Default for PortPair {
    fn default() -> Self {
        Self {
            emu_in: DEFAULT_EMU_IN,
            emu_out: DEFAULT_EMU_OUT,
        }
    }
}

/// Full parameter set of one proxy run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyArgs {
    pub server_host: String,
    pub server_port: u16,
    pub uid: PlayerUid,
    pub peer_uid: PlayerUid,
    pub ports: PortPair,
}

impl ProxyArgs {
    /// Validate and build proxy arguments
    pub fn new(
        server_host: impl Into<String>,
        server_port: u16,
        uid: PlayerUid,
        peer_uid: PlayerUid,
        ports: PortPair,
    ) -> Result<Self> {
        let server_host = server_host.into();
        if server_host.trim().is_empty() {
            return Err(DomainError::Validation(
                "serverHost must not be empty".to_string(),
            ));
        }
        if server_port == 0 {
            return Err(DomainError::InvalidPort {
                name: flag::SERVER_PORT,
                value: 0,
            });
        }
        if uid == peer_uid {
            return Err(DomainError::Validation(format!(
                "uid and peerUID must differ ({})",
                uid
            )));
        }
        Ok(Self {
            server_host,
            server_port,
            uid,
            peer_uid,
            ports,
        })
    }

    /// Render the argument list in the proxy's `-name=value` flag shape
    pub fn to_cli_args(&self) -> Vec<String> {
        vec![
            format!("-{}={}", flag::SERVER_HOST, self.server_host),
            format!("-{}={}", flag::SERVER_PORT, self.server_port),
            format!("-{}={}", flag::UID, self.uid),
            format!("-{}={}", flag::PEER_UID, self.peer_uid),
            format!("-{}={}", flag::EMU_IN, self.ports.emu_in),
            format!("-{}={}", flag::EMU_OUT, self.ports.emu_out),
        ]
    }

    /// `host:port` of the rendezvous server
    pub fn server_authority(&self) -> String {
        if self.server_host.contains(':') && !self.server_host.starts_with('[') {
            // bare IPv6 literal
            format!("[{}]:{}", self.server_host, self.server_port)
        } else {
            format!("{}:{}", self.server_host, self.server_port)
        }
    }
}
