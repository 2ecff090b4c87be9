//! Launcher configuration
//!
//! Layering (lowest to highest priority):
//! 1. built-in defaults
//! 2. TOML file (`--config`, or `config.toml` in the platform config dir)
//! 3. `REFLECTOR_*` environment variables (`__` separates nested keys,
//!    e.g. `REFLECTOR_EMULATOR__PATH`)
//! 4. command line overrides

use clap::Args;
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reflector_core::application::constants::{
    DEFAULT_PEER_TIMEOUT, DEFAULT_STOP_GRACE, HANDSHAKE_TIMEOUT,
};
use reflector_core::application::{EmulatorPlan, SessionPlan};
use reflector_core::domain::args::{DEFAULT_EMU_IN, DEFAULT_EMU_OUT};
use reflector_core::domain::{PlayerUid, PortPair, ProxyArgs};
use reflector_core::{AppError, Result};
use reflector_infra_system::expand_path;

const ENV_PREFIX: &str = "REFLECTOR";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Emulator section
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EmulatorSettings {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_player")]
    pub player: u8,
    #[serde(default)]
    pub delay: u16,
    #[serde(default)]
    pub player_name: Option<String>,
}

fn default_player() -> u8 {
    1
}

/// Full launcher configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LauncherSettings {
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub uid: Option<String>,
    pub peer_uid: Option<String>,
    pub emu_in: u16,
    pub emu_out: u16,
    pub proxy_path: Option<String>,
    pub stop_grace_ms: u64,
    pub handshake_timeout_secs: u64,
    pub peer_timeout_secs: u64,
    pub log_dir: Option<String>,
    pub emulator: Option<EmulatorSettings>,
}

/// Command line overrides, highest priority
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Rendezvous server host
    #[arg(long, global = true)]
    pub server_host: Option<String>,

    /// Rendezvous server UDP port
    #[arg(long, global = true)]
    pub server_port: Option<u16>,

    /// Our player uid
    #[arg(long, global = true)]
    pub uid: Option<String>,

    /// Opponent player uid
    #[arg(long, global = true)]
    pub peer_uid: Option<String>,

    /// Port the proxy listens on for emulator traffic
    #[arg(long, global = true)]
    pub emu_in: Option<u16>,

    /// Port the emulator listens on
    #[arg(long, global = true)]
    pub emu_out: Option<u16>,

    /// Explicit proxy binary path
    #[arg(long, global = true)]
    pub proxy_path: Option<String>,

    /// Grace period before a child is force-killed
    #[arg(long, global = true)]
    pub stop_grace_ms: Option<u64>,

    /// Seconds the proxy waits for the opponent endpoint
    #[arg(long, global = true)]
    pub handshake_timeout_secs: Option<u64>,

    /// Seconds of opponent silence before the proxy gives up (0 disables)
    #[arg(long, global = true)]
    pub peer_timeout_secs: Option<u64>,

    /// Emulator binary; enables emulator supervision
    #[arg(long, global = true)]
    pub emulator_path: Option<String>,

    /// Emulator player slot (1-based)
    #[arg(long, global = true)]
    pub player: Option<u8>,

    /// Emulator input delay in frames
    #[arg(long, global = true)]
    pub delay: Option<u16>,

    /// Name shown in the emulator
    #[arg(long, global = true)]
    pub player_name: Option<String>,

    /// Exact emulator argument, repeatable; replaces the generated netplay arguments
    #[arg(long = "emulator-arg", global = true, allow_hyphen_values = true)]
    pub emulator_args: Vec<String>,

    /// Directory for rolling log files
    #[arg(long, global = true)]
    pub log_dir: Option<String>,
}

/// Default config file location for this platform
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "reflector").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

impl LauncherSettings {
    /// Load defaults, the config file and the environment
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("emu_in", i64::from(DEFAULT_EMU_IN))
            .and_then(|b| b.set_default("emu_out", i64::from(DEFAULT_EMU_OUT)))
            .and_then(|b| b.set_default("stop_grace_ms", DEFAULT_STOP_GRACE.as_millis() as i64))
            .and_then(|b| b.set_default("handshake_timeout_secs", HANDSHAKE_TIMEOUT.as_secs() as i64))
            .and_then(|b| b.set_default("peer_timeout_secs", DEFAULT_PEER_TIMEOUT.as_secs() as i64))
            .map_err(config_error)?;

        match path {
            Some(path) => builder = builder.add_source(File::from(path).required(true)),
            None => {
                if let Some(default) = default_config_path() {
                    builder = builder.add_source(File::from(default).required(false));
                }
            }
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)
    }

    /// Apply command line overrides
    pub fn apply(&mut self, o: &Overrides) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
        fn set_opt<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *slot = value.clone();
            }
        }

        set_opt(&mut self.server_host, &o.server_host);
        set_opt(&mut self.server_port, &o.server_port);
        set_opt(&mut self.uid, &o.uid);
        set_opt(&mut self.peer_uid, &o.peer_uid);
        set(&mut self.emu_in, &o.emu_in);
        set(&mut self.emu_out, &o.emu_out);
        set_opt(&mut self.proxy_path, &o.proxy_path);
        set(&mut self.stop_grace_ms, &o.stop_grace_ms);
        set(&mut self.handshake_timeout_secs, &o.handshake_timeout_secs);
        set(&mut self.peer_timeout_secs, &o.peer_timeout_secs);
        set_opt(&mut self.log_dir, &o.log_dir);

        if let Some(path) = &o.emulator_path {
            let emulator = self.emulator.get_or_insert_with(|| EmulatorSettings {
                path: path.clone(),
                args: Vec::new(),
                player: default_player(),
                delay: 0,
                player_name: None,
            });
            emulator.path = path.clone();
        }
        if let Some(emulator) = self.emulator.as_mut() {
            set(&mut emulator.player, &o.player);
            set(&mut emulator.delay, &o.delay);
            set_opt(&mut emulator.player_name, &o.player_name);
            if !o.emulator_args.is_empty() {
                emulator.args = o.emulator_args.clone();
            }
        }
    }

    /// Validated proxy arguments
    pub fn proxy_args(&self) -> Result<ProxyArgs> {
        let server_host = required(&self.server_host, "server_host")?;
        let server_port = self
            .server_port
            .ok_or_else(|| AppError::Config("missing server_port".to_string()))?;
        let uid = PlayerUid::new(required(&self.uid, "uid")?)?;
        let peer_uid = PlayerUid::new(required(&self.peer_uid, "peer_uid")?)?;
        let ports = PortPair::new(self.emu_in, self.emu_out)?;
        Ok(ProxyArgs::new(server_host, server_port, uid, peer_uid, ports)?)
    }

    /// Proxy flags beyond the standard six, only when they differ from the proxy defaults
    pub fn proxy_extra_args(&self) -> Vec<String> {
        let mut extra = Vec::new();
        if self.handshake_timeout_secs != HANDSHAKE_TIMEOUT.as_secs() {
            extra.push(format!("-handshakeTimeout={}", self.handshake_timeout_secs));
        }
        if self.peer_timeout_secs != DEFAULT_PEER_TIMEOUT.as_secs() {
            extra.push(format!("-peerTimeout={}", self.peer_timeout_secs));
        }
        extra
    }

    /// Session plan for a resolved proxy binary
    pub fn session_plan(&self, proxy_program: PathBuf) -> Result<SessionPlan> {
        let proxy_args = self.proxy_args()?;
        let mut plan = SessionPlan::new(proxy_program, proxy_args.clone());
        plan.proxy_extra_args = self.proxy_extra_args();
        plan.stop_grace = Duration::from_millis(self.stop_grace_ms);

        if let Some(emu) = &self.emulator {
            plan = plan.with_emulator(EmulatorPlan {
                program: expand_path(&emu.path),
                args: emu.args.clone(),
                player: emu.player,
                delay: emu.delay,
                player_name: emu
                    .player_name
                    .clone()
                    .unwrap_or_else(|| proxy_args.uid.to_string()),
            });
        }
        Ok(plan)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir.as_deref().map(expand_path)
    }
}

fn required(value: &Option<String>, key: &str) -> Result<String> {
    value
        .clone()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::Config(format!("missing {}", key)))
}

fn config_error(e: config::ConfigError) -> AppError {
    AppError::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_config(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("reflector-{}-{}.toml", name, std::process::id()));
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_file_values_and_defaults() {
        let path = write_config(
            "file",
            r#"
server_host = "203.0.113.7"
server_port = 33333
uid = "alice"
peer_uid = "bob"

[emulator]
path = "/opt/fbneo/fcadefbneo"
delay = 2
"#,
        );

        let settings = LauncherSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.server_port, Some(33333));
        assert_eq!(settings.emu_in, DEFAULT_EMU_IN);
        assert_eq!(settings.stop_grace_ms, 5000);
        let emulator = settings.emulator.clone().unwrap();
        assert_eq!(emulator.player, 1);
        assert_eq!(emulator.delay, 2);

        let plan = settings.session_plan(PathBuf::from("/bin/punch-proxy")).unwrap();
        assert_eq!(plan.proxy_args.uid.as_str(), "alice");
        assert!(plan.proxy_extra_args.is_empty());
        assert_eq!(plan.emulator.unwrap().player_name, "alice");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = LauncherSettings::load(Some(Path::new("/nonexistent/reflector.toml")));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_overrides_win() {
        let path = write_config(
            "overrides",
            r#"
server_host = "203.0.113.7"
server_port = 33333
uid = "alice"
peer_uid = "bob"
"#,
        );
        let mut settings = LauncherSettings::load(Some(&path)).unwrap();
        settings.apply(&Overrides {
            server_port: Some(4000),
            emu_in: Some(7100),
            emulator_path: Some("/usr/bin/fbneo".to_string()),
            player: Some(2),
            stop_grace_ms: Some(750),
            handshake_timeout_secs: Some(20),
            peer_timeout_secs: Some(0),
            emulator_args: vec!["--rom".to_string(), "sfiii3nr1".to_string()],
            ..Overrides::default()
        });

        assert_eq!(settings.server_port, Some(4000));
        assert_eq!(settings.emu_in, 7100);
        assert_eq!(settings.stop_grace_ms, 750);
        assert_eq!(
            settings.proxy_extra_args(),
            vec!["-handshakeTimeout=20", "-peerTimeout=0"]
        );

        let plan = settings.session_plan(PathBuf::from("/bin/punch-proxy")).unwrap();
        assert_eq!(plan.stop_grace, Duration::from_millis(750));

        let emulator = settings.emulator.unwrap();
        assert_eq!(emulator.path, "/usr/bin/fbneo");
        assert_eq!(emulator.player, 2);
        assert_eq!(emulator.args, vec!["--rom", "sfiii3nr1"]);
    }

    #[test]
    fn test_missing_identity_is_config_error() {
        let path = write_config("partial", "server_host = \"h\"\nserver_port = 1\n");
        let settings = LauncherSettings::load(Some(&path)).unwrap();

        match settings.proxy_args() {
            Err(AppError::Config(msg)) => assert_eq!(msg, "missing uid"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_extra_args_only_when_non_default() {
        let path = write_config(
            "extra",
            "server_host = \"h\"\nserver_port = 1\nuid = \"a\"\npeer_uid = \"b\"\npeer_timeout_secs = 0\n",
        );
        let settings = LauncherSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.proxy_extra_args(), vec!["-peerTimeout=0"]);
    }
}
