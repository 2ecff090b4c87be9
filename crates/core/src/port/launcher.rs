// Process Launcher Port
// Abstraction for spawning and supervising helper processes (proxy, emulator)

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Description of a child process to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Short name used as a prefix on every relayed log line
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Environment variables passed through to the child
    pub env_allowlist: Vec<String>,
}

impl LaunchSpec {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env_allowlist: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env_allowlist(mut self, vars: Vec<String>) -> Self {
        self.env_allowlist = vars;
        self
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    /// Terminating signal (unix only)
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit {}", code),
            (None, Some(signal)) => write!(f, "exit signal {}", signal),
            (None, None) => write!(f, "exit unknown"),
        }
    }
}

/// Launch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Binary not found: {0}")]
    NotFound(String),

    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Kill failed: {0}")]
    Kill(String),
}

/// Process launcher trait
///
/// Implementations:
/// - SubprocessLauncher: tokio child process with stdio relayed into tracing
/// - mocks::MockLauncher: scripted exits for session tests
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn a child process
    ///
    /// # Errors
    /// - LaunchError::NotFound if the program does not exist
    /// - LaunchError::Spawn if the OS refused to start it
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn SupervisedProcess>, LaunchError>;
}

/// Handle to a running child
#[async_trait]
pub trait SupervisedProcess: Send {
    fn label(&self) -> &str;

    fn pid(&self) -> Option<u32>;

    /// Wait for the child to exit, without waiting for its output
    ///
    /// Cancel-safe: once the child is reaped the status is kept, and a
    /// dropped call loses nothing.
    async fn wait_exit(&mut self) -> Result<ExitReport, LaunchError>;

    /// Wait for the child to exit and its output to drain
    async fn wait(&mut self) -> Result<ExitReport, LaunchError>;

    /// Ask the child to terminate, force-killing it after `grace`
    async fn stop(&mut self, grace: Duration) -> Result<ExitReport, LaunchError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    /// Scripted behavior for one label
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Exit on its own after the delay
        ExitAfter(Duration, ExitReport),
        /// Exit after the first delay; output keeps draining for the second
        ExitWithLingeringOutput(Duration, Duration, ExitReport),
        /// Run until stopped
        RunForever,
        /// Refuse to spawn
        FailSpawn(String),
    }

    /// Record of a launch, in order
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LaunchRecord {
        pub label: String,
        pub args: Vec<String>,
    }

    /// Mock launcher keyed by `LaunchSpec::label`
    #[derive(Clone, Default)]
    pub struct MockLauncher {
        behaviors: Arc<Mutex<HashMap<String, MockBehavior>>>,
        launches: Arc<Mutex<Vec<LaunchRecord>>>,
        stops: Arc<Mutex<Vec<String>>>,
    }

    impl MockLauncher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(self, label: &str, behavior: MockBehavior) -> Self {
            self.behaviors
                .lock()
                .unwrap()
                .insert(label.to_string(), behavior);
            self
        }

        pub fn launches(&self) -> Vec<LaunchRecord> {
            self.launches.lock().unwrap().clone()
        }

        /// Labels in the order `stop` was called on them
        pub fn stops(&self) -> Vec<String> {
            self.stops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessLauncher for MockLauncher {
        async fn launch(
            &self,
            spec: &LaunchSpec,
        ) -> Result<Box<dyn SupervisedProcess>, LaunchError> {
            let behavior = self
                .behaviors
                .lock()
                .unwrap()
                .get(&spec.label)
                .cloned()
                .unwrap_or(MockBehavior::RunForever);

            if let MockBehavior::FailSpawn(msg) = &behavior {
                return Err(LaunchError::Spawn(msg.clone()));
            }

            self.launches.lock().unwrap().push(LaunchRecord {
                label: spec.label.clone(),
                args: spec.args.clone(),
            });

            let (kill_tx, kill_rx) = oneshot::channel();
            let (scripted, drain) = match behavior {
                MockBehavior::ExitAfter(delay, report) => {
                    (Some((tokio::time::Instant::now() + delay, report)), Duration::ZERO)
                }
                MockBehavior::ExitWithLingeringOutput(delay, drain, report) => {
                    (Some((tokio::time::Instant::now() + delay, report)), drain)
                }
                _ => (None, Duration::ZERO),
            };
            Ok(Box::new(MockProcess {
                label: spec.label.clone(),
                scripted,
                kill_tx: Some(kill_tx),
                kill_rx,
                stops: Arc::clone(&self.stops),
                drain,
                exited: None,
                finished: None,
            }))
        }
    }

    pub struct MockProcess {
        label: String,
        scripted: Option<(tokio::time::Instant, ExitReport)>,
        kill_tx: Option<oneshot::Sender<()>>,
        kill_rx: oneshot::Receiver<()>,
        stops: Arc<Mutex<Vec<String>>>,
        drain: Duration,
        exited: Option<ExitReport>,
        finished: Option<ExitReport>,
    }

    /// SIGTERM
    const STOP_SIGNAL: i32 = 15;

    #[async_trait]
    impl SupervisedProcess for MockProcess {
        fn label(&self) -> &str {
            &self.label
        }

        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait_exit(&mut self) -> Result<ExitReport, LaunchError> {
            if let Some(report) = self.exited {
                return Ok(report);
            }
            let report = match self.scripted {
                Some((deadline, report)) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => report,
                        _ = &mut self.kill_rx => ExitReport::signal(STOP_SIGNAL),
                    }
                }
                None => {
                    let _ = (&mut self.kill_rx).await;
                    ExitReport::signal(STOP_SIGNAL)
                }
            };
            self.exited = Some(report);
            Ok(report)
        }

        async fn wait(&mut self) -> Result<ExitReport, LaunchError> {
            if let Some(report) = self.finished {
                return Ok(report);
            }
            let report = self.wait_exit().await?;
            tokio::time::sleep(self.drain).await;
            self.finished = Some(report);
            Ok(report)
        }

        async fn stop(&mut self, _grace: Duration) -> Result<ExitReport, LaunchError> {
            self.stops.lock().unwrap().push(self.label.clone());
            if self.exited.is_none() {
                if let Some(tx) = self.kill_tx.take() {
                    let _ = tx.send(());
                }
            }
            self.wait().await
        }
    }
}
