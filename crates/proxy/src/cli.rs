// Proxy command line
//
// The host passes Go-style flags (`-serverHost=1.2.3.4`). clap only knows
// `--long` flags, so single-dash long flags are rewritten before parsing.

use clap::Parser;
use std::ffi::OsString;
use std::time::Duration;

use reflector_core::application::constants::{DEFAULT_PEER_TIMEOUT, HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL};
use reflector_core::application::RelayConfig;
use reflector_core::domain::args::{DEFAULT_EMU_IN, DEFAULT_EMU_OUT};
use reflector_core::domain::{DomainError, PlayerUid, PortPair, ProxyArgs};

#[derive(Parser, Debug)]
#[command(name = "punch-proxy")]
#[command(about = "UDP hole-punch relay between a local emulator and a remote peer", long_about = None)]
#[command(version)]
pub struct ProxyCli {
    /// Rendezvous server host
    #[arg(long = "serverHost")]
    pub server_host: String,

    /// Rendezvous server UDP port
    #[arg(long = "serverPort")]
    pub server_port: u16,

    /// Our player uid
    #[arg(long = "uid")]
    pub uid: String,

    /// Opponent player uid
    #[arg(long = "peerUID")]
    pub peer_uid: String,

    /// Local port receiving emulator datagrams
    #[arg(long = "emuIn", default_value_t = DEFAULT_EMU_IN)]
    pub emu_in: u16,

    /// Local port the emulator listens on
    #[arg(long = "emuOut", default_value_t = DEFAULT_EMU_OUT)]
    pub emu_out: u16,

    /// Seconds to wait for the opponent endpoint
    #[arg(long = "handshakeTimeout", default_value_t = HANDSHAKE_TIMEOUT.as_secs())]
    pub handshake_timeout: u64,

    /// Seconds of opponent silence before giving up (0 disables)
    #[arg(long = "peerTimeout", default_value_t = DEFAULT_PEER_TIMEOUT.as_secs())]
    pub peer_timeout: u64,

    /// Log format: pretty or json
    #[arg(long = "logFormat", env = "REFLECTOR_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

impl ProxyCli {
    /// Parse Go-style or clap-style arguments
    pub fn parse_go_style<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::try_parse_from(normalize_go_flags(args))
    }

    /// Validate into domain arguments and relay timing
    pub fn into_parts(self) -> Result<(ProxyArgs, RelayConfig), DomainError> {
        let ports = PortPair::new(self.emu_in, self.emu_out)?;
        let args = ProxyArgs::new(
            self.server_host,
            self.server_port,
            PlayerUid::new(self.uid)?,
            PlayerUid::new(self.peer_uid)?,
            ports,
        )?;
        if self.handshake_timeout == 0 {
            return Err(DomainError::Validation(
                "handshakeTimeout must be at least 1 second".to_string(),
            ));
        }
        let config = RelayConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            keepalive_interval: KEEPALIVE_INTERVAL,
            peer_timeout: (self.peer_timeout > 0).then(|| Duration::from_secs(self.peer_timeout)),
        };
        Ok((args, config))
    }
}

/// Rewrite `-name[=value]` into `--name[=value]`; the program name, short
/// flags and everything after a bare `--` are left alone
pub fn normalize_go_flags<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut out = Vec::new();
    let mut passthrough = false;
    for (i, arg) in args.into_iter().map(Into::into).enumerate() {
        if i == 0 || passthrough {
            out.push(arg);
            continue;
        }
        let rewritten = match arg.to_str() {
            Some("--") => {
                passthrough = true;
                None
            }
            Some(s) if is_go_long_flag(s) => Some(OsString::from(format!("-{}", s))),
            _ => None,
        };
        out.push(rewritten.unwrap_or(arg));
    }
    out
}

fn is_go_long_flag(s: &str) -> bool {
    let Some(rest) = s.strip_prefix('-') else {
        return false;
    };
    if rest.starts_with('-') {
        return false;
    }
    let name = rest.split('=').next().unwrap_or_default();
    name.len() > 1 && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
}
