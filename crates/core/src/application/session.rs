// Match session supervision
//
// Launches the proxy (and optionally the emulator) and ends the whole
// session as soon as any one of them exits or shutdown is requested.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

use crate::application::constants::{
    DEFAULT_ENV_ALLOWLIST, DEFAULT_STOP_GRACE, EMULATOR_LABEL, EMULATOR_REMOTE_IP, PROXY_LABEL,
};
use crate::application::ShutdownToken;
use crate::domain::{PortPair, ProxyArgs, ProxyExit};
use crate::error::Result;
use crate::port::{ExitReport, IdProvider, LaunchError, LaunchSpec, ProcessLauncher, SupervisedProcess};

/// Emulator launch parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorPlan {
    pub program: PathBuf,
    /// Exact arguments; replaces the generated netplay arguments when non-empty
    pub args: Vec<String>,
    /// 1-based player slot
    pub player: u8,
    /// Input delay in frames
    pub delay: u16,
    pub player_name: String,
}

impl EmulatorPlan {
    /// Arguments pointing the emulator's netplay at the proxy's loopback ports
    pub fn launch_args(&self, ports: PortPair) -> Vec<String> {
        if !self.args.is_empty() {
            return self.args.clone();
        }
        vec![
            "--local-port".to_string(),
            ports.emu_out.to_string(),
            "--remote-ip".to_string(),
            EMULATOR_REMOTE_IP.to_string(),
            "--remote-port".to_string(),
            ports.emu_in.to_string(),
            "--player".to_string(),
            self.player.to_string(),
            "--delay".to_string(),
            self.delay.to_string(),
            "--name".to_string(),
            self.player_name.clone(),
        ]
    }
}

/// Everything needed to run one match
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub proxy_program: PathBuf,
    pub proxy_args: ProxyArgs,
    /// Optional proxy flags appended after the standard six
    pub proxy_extra_args: Vec<String>,
    pub emulator: Option<EmulatorPlan>,
    pub stop_grace: Duration,
    pub env_allowlist: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl SessionPlan {
    pub fn new(proxy_program: impl Into<PathBuf>, proxy_args: ProxyArgs) -> Self {
        Self {
            proxy_program: proxy_program.into(),
            proxy_args,
            proxy_extra_args: Vec::new(),
            emulator: None,
            stop_grace: DEFAULT_STOP_GRACE,
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            cwd: None,
        }
    }

    pub fn with_emulator(mut self, emulator: EmulatorPlan) -> Self {
        self.emulator = Some(emulator);
        self
    }

    pub fn proxy_spec(&self) -> LaunchSpec {
        self.spec(PROXY_LABEL, &self.proxy_program)
            .args(self.proxy_args.to_cli_args())
            .args(self.proxy_extra_args.iter().cloned())
    }

    pub fn emulator_spec(&self, emulator: &EmulatorPlan) -> LaunchSpec {
        self.spec(EMULATOR_LABEL, &emulator.program)
            .args(emulator.launch_args(self.proxy_args.ports))
    }

    fn spec(&self, label: &str, program: &PathBuf) -> LaunchSpec {
        let spec = LaunchSpec::new(label, program.clone()).env_allowlist(self.env_allowlist.clone());
        match &self.cwd {
            Some(cwd) => spec.cwd(cwd.clone()),
            None => spec,
        }
    }
}

/// What ended a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndedBy {
    ProxyExited,
    EmulatorExited,
    Shutdown,
}

/// Final state of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: String,
    pub ended_by: EndedBy,
    pub proxy: Option<ExitReport>,
    pub emulator: Option<ExitReport>,
}

impl SessionOutcome {
    /// Proxy exit reason, when the proxy exited with one of its own codes
    pub fn proxy_exit(&self) -> Option<ProxyExit> {
        self.proxy
            .and_then(|report| report.code)
            .and_then(ProxyExit::from_code)
    }

    /// Ended by request, or the proxy finished cleanly on its own
    pub fn is_clean(&self) -> bool {
        match self.ended_by {
            EndedBy::Shutdown => true,
            EndedBy::ProxyExited => self.proxy.is_some_and(|r| r.success()),
            EndedBy::EmulatorExited => self.emulator.is_some_and(|r| r.success()),
        }
    }
}

/// Supervises the proxy and emulator of one match
pub struct MatchSession {
    launcher: Arc<dyn ProcessLauncher>,
    id_provider: Arc<dyn IdProvider>,
}

impl MatchSession {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, id_provider: Arc<dyn IdProvider>) -> Self {
        Self {
            launcher,
            id_provider,
        }
    }

    /// Run a session until a child exits or `shutdown` fires
    ///
    /// # Errors
    /// - AppError::Launch if the proxy or the emulator cannot be spawned.
    ///   A proxy that was already running is stopped first.
    pub async fn run(&self, plan: &SessionPlan, shutdown: ShutdownToken) -> Result<SessionOutcome> {
        let session_id = self.id_provider.generate_id();
        let span = info_span!("session", session_id = %session_id);
        self.run_inner(session_id, plan, shutdown).instrument(span).await
    }

    async fn run_inner(
        &self,
        session_id: String,
        plan: &SessionPlan,
        mut shutdown: ShutdownToken,
    ) -> Result<SessionOutcome> {
        let mut proxy = self.launcher.launch(&plan.proxy_spec()).await?;
        info!(pid = ?proxy.pid(), program = %plan.proxy_program.display(), "Proxy launched");

        let mut emulator = match &plan.emulator {
            Some(emu) => match self.launcher.launch(&plan.emulator_spec(emu)).await {
                Ok(child) => {
                    info!(pid = ?child.pid(), program = %emu.program.display(), "Emulator launched");
                    Some(child)
                }
                Err(e) => {
                    error!(error = %e, "Emulator launch failed, stopping proxy");
                    stop_child(proxy.as_mut(), plan.stop_grace).await;
                    return Err(e.into());
                }
            },
            None => None,
        };

        let (ended_by, first) = tokio::select! {
            r = proxy.wait_exit() => (EndedBy::ProxyExited, Some(r)),
            r = wait_optional(emulator.as_deref_mut()) => (EndedBy::EmulatorExited, Some(r)),
            _ = shutdown.wait() => (EndedBy::Shutdown, None),
        };
        let first = first.and_then(|r| match r {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Failed to collect exit status");
                None
            }
        });

        info!(ended_by = ?ended_by, "Session ending");

        // the first child is reaped; let its output drain before stopping the other
        let first = match (ended_by, first, emulator.as_deref_mut()) {
            (EndedBy::ProxyExited, Some(_), _) => proxy.wait().await.ok(),
            (EndedBy::EmulatorExited, Some(_), Some(child)) => child.wait().await.ok(),
            (_, first, _) => first,
        };

        let proxy_report = if ended_by == EndedBy::ProxyExited {
            first
        } else {
            stop_child(proxy.as_mut(), plan.stop_grace).await
        };
        let emulator_report = match emulator.as_deref_mut() {
            Some(_) if ended_by == EndedBy::EmulatorExited => first,
            Some(child) => stop_child(child, plan.stop_grace).await,
            None => None,
        };

        let outcome = SessionOutcome {
            session_id,
            ended_by,
            proxy: proxy_report,
            emulator: emulator_report,
        };
        info!(
            proxy = ?outcome.proxy.map(|r| r.to_string()),
            emulator = ?outcome.emulator.map(|r| r.to_string()),
            proxy_exit = ?outcome.proxy_exit(),
            "Session ended"
        );
        Ok(outcome)
    }
}

async fn wait_optional(
    child: Option<&mut (dyn SupervisedProcess + 'static)>,
) -> std::result::Result<ExitReport, LaunchError> {
    match child {
        Some(child) => child.wait_exit().await,
        None => std::future::pending().await,
    }
}

async fn stop_child(
    child: &mut (dyn SupervisedProcess + 'static),
    grace: Duration,
) -> Option<ExitReport> {
    match child.stop(grace).await {
        Ok(report) => Some(report),
        Err(e) => {
            error!(label = %child.label(), error = %e, "Failed to stop child");
            None
        }
    }
}
