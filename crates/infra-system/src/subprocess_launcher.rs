// Subprocess launcher implementation
// reason: tokio for async process management, nix for unix signals
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use reflector_core::application::constants::KILL_POLL_INTERVAL;
use reflector_core::port::{ExitReport, LaunchError, LaunchSpec, ProcessLauncher, SupervisedProcess};

/// Upper bound on draining buffered output after the child exited
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Which child stream a relayed line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Subprocess launcher
///
/// Spawns children with piped stdio and relays every output line into
/// tracing, prefixed with the launch label.
#[derive(Debug, Clone, Default)]
pub struct SubprocessLauncher;

impl SubprocessLauncher {
    pub fn new() -> Self {
        Self
    }

    /// Filter the current environment to the allowlist
    fn filter_env(allowlist: &[String]) -> HashMap<String, String> {
        std::env::vars()
            .filter(|(k, _)| allowlist.contains(k))
            .collect()
    }

    fn command(spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(Self::filter_env(&spec.env_allowlist))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

#[async_trait]
impl ProcessLauncher for SubprocessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn SupervisedProcess>, LaunchError> {
        info!(
            label = %spec.label,
            program = %spec.program.display(),
            args = ?spec.args,
            "Spawning child process"
        );

        let mut child = Self::command(spec).spawn().map_err(|e| {
            error!(label = %spec.label, error = %e, "Launch error {}", spec.label);
            if e.kind() == std::io::ErrorKind::NotFound {
                LaunchError::NotFound(spec.program.display().to_string())
            } else {
                LaunchError::Spawn(e.to_string())
            }
        })?;

        let pid = child.id();
        let mut relays = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            relays.push(spawn_line_relay(spec.label.clone(), Stream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            relays.push(spawn_line_relay(spec.label.clone(), Stream::Stderr, stderr));
        }

        info!(label = %spec.label, pid = ?pid, "Child process started");

        Ok(Box::new(SupervisedChild {
            label: spec.label.clone(),
            pid,
            child,
            relays,
            status: None,
            report: None,
        }))
    }
}

/// Relay a child stream into tracing, one event per line
fn spawn_line_relay<R>(label: String, stream: Stream, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    match stream {
                        Stream::Stdout => info!(label = %label, "{} data: {}", label, line),
                        Stream::Stderr => warn!(label = %label, "{} error: {}", label, line),
                    }
                }
                Err(e) => {
                    warn!(label = %label, error = %e, "Output relay stopped");
                    break;
                }
            }
        }
    })
}

/// Convert an OS exit status into a report
pub fn exit_report(status: ExitStatus) -> ExitReport {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitReport::signal(signal);
        }
    }
    ExitReport {
        code: status.code(),
        signal: None,
    }
}

/// Running child with its output relays
pub struct SupervisedChild {
    label: String,
    pid: Option<u32>,
    child: Child,
    relays: Vec<JoinHandle<()>>,
    /// Set as soon as the child is reaped; the pid must not be signalled after that
    status: Option<ExitStatus>,
    report: Option<ExitReport>,
}

impl SupervisedChild {
    /// Reap the child once and keep its status
    async fn reap(&mut self) -> Result<ExitStatus, LaunchError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| LaunchError::Io(e.to_string()))?;
        self.status = Some(status);
        Ok(status)
    }

    /// Record and log the final status; waits for output to drain
    async fn finish(&mut self, status: ExitStatus) -> ExitReport {
        // a relay leaves the list only once it is done, so a dropped call resumes here
        while let Some(relay) = self.relays.first_mut() {
            // grandchildren may keep the pipe open after the child is gone
            if tokio::time::timeout(RELAY_DRAIN_TIMEOUT, &mut *relay).await.is_err() {
                warn!(label = %self.label, "Output relay still open after exit, detaching");
                relay.abort();
            }
            self.relays.remove(0);
        }

        let report = exit_report(status);
        if report.success() {
            info!(label = %self.label, pid = ?self.pid, "{} {}", self.label, report);
        } else {
            warn!(label = %self.label, pid = ?self.pid, "{} {}", self.label, report);
        }
        self.report = Some(report);
        report
    }

    /// SIGTERM first, then SIGKILL once `grace` has elapsed
    #[cfg(unix)]
    async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus, LaunchError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return self.child.wait().await.map_err(|e| LaunchError::Io(e.to_string()));
        };
        // exited on its own: the pid may already belong to someone else
        if let Ok(Some(status)) = self.child.try_wait() {
            return Ok(status);
        }

        info!(label = %self.label, pid = %pid, "Sending SIGTERM for graceful shutdown");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            // ESRCH: already gone, reap below
            if e != nix::errno::Errno::ESRCH {
                return Err(LaunchError::Kill(format!("SIGTERM failed: {}", e)));
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    info!(label = %self.label, pid = %pid, "Process exited after SIGTERM");
                    return Ok(status);
                }
                Ok(None) => {}
                Err(e) => return Err(LaunchError::Io(e.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(label = %self.label, pid = %pid, "Process did not exit after SIGTERM, sending SIGKILL");
                self.child
                    .start_kill()
                    .map_err(|e| LaunchError::Kill(format!("SIGKILL failed: {}", e)))?;
                return self.child.wait().await.map_err(|e| LaunchError::Io(e.to_string()));
            }
            tokio::time::sleep(KILL_POLL_INTERVAL).await;
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&mut self, _grace: Duration) -> Result<ExitStatus, LaunchError> {
        info!(label = %self.label, pid = ?self.pid, "Killing process");
        self.child
            .start_kill()
            .map_err(|e| LaunchError::Kill(e.to_string()))?;
        self.child.wait().await.map_err(|e| LaunchError::Io(e.to_string()))
    }
}

#[async_trait]
impl SupervisedProcess for SupervisedChild {
    fn label(&self) -> &str {
        &self.label
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait_exit(&mut self) -> Result<ExitReport, LaunchError> {
        self.reap().await.map(exit_report)
    }

    async fn wait(&mut self) -> Result<ExitReport, LaunchError> {
        if let Some(report) = self.report {
            return Ok(report);
        }
        let status = self.reap().await?;
        Ok(self.finish(status).await)
    }

    async fn stop(&mut self, grace: Duration) -> Result<ExitReport, LaunchError> {
        if let Some(report) = self.report {
            return Ok(report);
        }
        let status = match self.status {
            Some(status) => status,
            None => {
                let status = self.terminate(grace).await?;
                self.status = Some(status);
                status
            }
        };
        Ok(self.finish(status).await)
    }
}
