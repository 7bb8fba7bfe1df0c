//! Process descriptions, running-process handles, and launchers.
//!
//! Every spawned process gets a background waiter task that owns the OS
//! child handle. The waiter publishes the terminal [`ExitOutcome`] exactly
//! once, and forcefully kills the child when asked to through the
//! [`RunningProcess`] handle. The handle itself never touches the OS
//! process, which lets tests drive [`RunningProcess`] through the same
//! channels with a scripted [`ProcessLauncher`].

use crate::error::{CoreMeshError, Result};
use crate::logsink::LogSink;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

/// Token in an argument template replaced by the process's config path.
pub const CONFIG_PLACEHOLDER: &str = "{{config}}";

/// What a supervised process is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// A core proxy exposing a local endpoint the edge proxy forwards to
    CoreProxy,
    /// The edge proxy applications connect through
    EdgeProxy,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::CoreProxy => write!(f, "core-proxy"),
            ProcessRole::EdgeProxy => write!(f, "edge-proxy"),
        }
    }
}

/// Immutable description of one executable to supervise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub program: PathBuf,
    /// Argument template; see [`CONFIG_PLACEHOLDER`]
    pub args: Vec<String>,
    pub config_path: PathBuf,
    pub role: ProcessRole,
    pub log_sink: LogSink,
    /// Extra environment on top of the inherited one
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<PathBuf>,
        args: Vec<String>,
        config_path: impl Into<PathBuf>,
        role: ProcessRole,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            config_path: config_path.into(),
            role,
            log_sink: LogSink::default(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = sink;
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Arguments with the config placeholder substituted.
    ///
    /// An empty template yields the config path as the only argument.
    #[must_use]
    pub fn resolved_args(&self) -> Vec<String> {
        let config = self.config_path.to_string_lossy();
        if self.args.is_empty() {
            return vec![config.into_owned()];
        }
        self.args
            .iter()
            .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &config))
            .collect()
    }
}

/// Terminal status of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The OS reported an exit status
    Exited { success: bool, description: String },
    /// Waiting on the process failed
    WaitFailed(String),
}

impl ExitOutcome {
    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        ExitOutcome::Exited {
            success: status.success(),
            description: status.to_string(),
        }
    }

    /// True only for a clean, zero exit.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Exited { success: true, .. })
    }

    fn from_wait(result: std::io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => Self::from_status(status),
            Err(e) => ExitOutcome::WaitFailed(e.to_string()),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited { description, .. } => write!(f, "{}", description),
            ExitOutcome::WaitFailed(reason) => write!(f, "wait failed: {}", reason),
        }
    }
}

/// Observer of a process's completion. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ExitWatch {
    /// Wait for the process to terminate.
    pub async fn wait(&mut self) -> ExitOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or_else(|| ExitOutcome::WaitFailed("no exit status".to_string())),
            Err(_) => ExitOutcome::WaitFailed("process waiter went away".to_string()),
        }
    }

    /// The exit outcome if the process has already terminated.
    #[must_use]
    pub fn try_outcome(&self) -> Option<ExitOutcome> {
        self.rx.borrow().clone()
    }
}

/// Waiter side of a [`RunningProcess`].
///
/// Whoever owns the OS process holds this: it learns when a kill was
/// requested and reports the terminal outcome.
#[derive(Debug)]
pub struct ExitReporter {
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
}

impl ExitReporter {
    /// Resolve when the handle asks for the process to be killed.
    ///
    /// Dropping the handle without a kill request leaves the process alone,
    /// so this then never resolves.
    pub async fn kill_requested(&mut self) {
        if (&mut self.kill_rx).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Publish the terminal outcome. Consumes the reporter, so this happens once.
    pub fn report(self, outcome: ExitOutcome) {
        self.exit_tx.send_replace(Some(outcome));
    }
}

/// A spawned process tracked by the supervisor.
#[derive(Debug)]
pub struct RunningProcess {
    spec: ProcessSpec,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit: ExitWatch,
}

impl RunningProcess {
    /// Create a handle and the matching waiter side.
    #[must_use]
    pub fn channel(spec: ProcessSpec, pid: Option<u32>) -> (RunningProcess, ExitReporter) {
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let process = RunningProcess {
            spec,
            pid,
            kill_tx: Some(kill_tx),
            exit: ExitWatch { rx: exit_rx },
        };
        (process, ExitReporter { kill_rx, exit_tx })
    }

    #[must_use]
    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    /// Ask the waiter to forcefully terminate the process.
    ///
    /// Only the first call has an effect; a process that already exited
    /// ignores it.
    pub fn start_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the process to terminate.
    pub async fn wait(&self) -> ExitOutcome {
        self.exit.clone().wait().await
    }
}

/// Turns a [`ProcessSpec`] into a [`RunningProcess`].
pub trait ProcessLauncher: Send + Sync {
    /// Spawn the process. Must be called from within a tokio runtime.
    fn launch(&self, spec: &ProcessSpec) -> Result<RunningProcess>;
}

/// Launcher spawning real OS processes with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, spec: &ProcessSpec) -> Result<RunningProcess> {
        let spawn_err = |source: std::io::Error| CoreMeshError::Spawn {
            name: spec.name.clone(),
            source,
        };

        let args = spec.resolved_args();
        let (stdout, stderr) = spec.log_sink.open().map_err(spawn_err)?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        info!(
            name = %spec.name,
            role = %spec.role,
            "Starting {} {}",
            spec.program.display(),
            args.join(" ")
        );
        let mut child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id();

        let (process, mut reporter) = RunningProcess::channel(spec.clone(), pid);
        let name = spec.name.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => ExitOutcome::from_wait(status),
                _ = reporter.kill_requested() => {
                    if let Err(e) = child.start_kill() {
                        debug!(name = %name, "Kill failed: {}", e);
                    }
                    ExitOutcome::from_wait(child.wait().await)
                }
            };
            debug!(name = %name, status = %outcome, "Process terminated");
            reporter.report(outcome);
        });

        Ok(process)
    }
}
