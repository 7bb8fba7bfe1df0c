//! One supervised run: cores, then edge, then system proxy, then wait.
//!
//! ```text
//! Idle -> StartingCores -> StartingEdge -> ApplyingSystemProxy -> Running
//!                                                                   |
//!            any startup failure or cancellation ------------> ShuttingDown -> Terminated
//! ```
//!
//! Cleanup restores the system proxy snapshot and then kills every started
//! process in reverse start order. It is guarded so it executes once per run
//! no matter how many paths ask for it.

use crate::error::{CoreMeshError, Result};
use crate::process::{ExitWatch, ProcessLauncher, ProcessSpec, RunningProcess};
use crate::shutdown::ShutdownSignal;
use crate::supervisor::{Launch, ProcessSupervisor, StartedProcesses};
use crate::system_proxy::{ProxyRestore, SystemProxyController};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};

/// Ordered process specs for a run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Started in this order, all before the edge
    pub cores: Vec<ProcessSpec>,
    pub edge: ProcessSpec,
    /// Generated edge configuration, read to find the proxy endpoint
    pub edge_config: PathBuf,
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    StartingCores,
    StartingEdge,
    ApplyingSystemProxy,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::StartingCores => "starting-cores",
            RunState::StartingEdge => "starting-edge",
            RunState::ApplyingSystemProxy => "applying-system-proxy",
            RunState::Running => "running",
            RunState::ShuttingDown => "shutting-down",
            RunState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The edge proxy exited cleanly on its own
    Completed,
    /// Shutdown was requested by the operator
    Cancelled,
    /// The first error that aborted the run
    Failed(CoreMeshError),
}

impl RunOutcome {
    /// `Completed` and `Cancelled` are both successful terminations.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        !matches!(self, RunOutcome::Failed(_))
    }

    /// Process exit code for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_ok() {
            0
        } else {
            1
        }
    }

    /// Convert into a `Result`, dropping the success distinction.
    pub fn into_result(self) -> Result<()> {
        match self {
            RunOutcome::Failed(e) => Err(e),
            RunOutcome::Completed | RunOutcome::Cancelled => Ok(()),
        }
    }
}

/// Shared cleanup state of a run.
///
/// Holds the processes started so far and the system proxy restore. The
/// restore-then-kill sequence runs exactly once; concurrent callers of
/// [`RunCleanup::run`] wait for the first one to finish.
#[derive(Debug, Default)]
pub struct RunCleanup {
    started: StartedProcesses,
    restore: Mutex<Option<ProxyRestore>>,
    done: OnceCell<()>,
}

impl RunCleanup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a started process.
    pub fn track(&self, process: RunningProcess) {
        self.started.push(process);
    }

    /// Names of tracked processes, in start order.
    #[must_use]
    pub fn tracked(&self) -> Vec<String> {
        self.started.names()
    }

    /// Register the restore for the system proxy change.
    pub fn set_restore(&self, restore: ProxyRestore) {
        *self
            .restore
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(restore);
    }

    /// Whether the cleanup sequence has completed.
    #[must_use]
    pub fn has_run(&self) -> bool {
        self.done.initialized()
    }

    /// Restore the system proxy, then kill everything tracked, newest first.
    ///
    /// Failures are logged and never returned: by the time cleanup runs the
    /// outcome of the run is already decided.
    pub async fn run<L: ProcessLauncher>(&self, supervisor: &ProcessSupervisor<L>) {
        self.done
            .get_or_init(|| async move {
                let restore = self
                    .restore
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(restore) = restore {
                    let changed = restore.changed();
                    match restore.restore() {
                        Ok(()) if changed => info!("System proxy restored"),
                        Ok(()) => debug!("System proxy was not changed, nothing to restore"),
                        Err(e) => warn!("System proxy restore failed: {}", e),
                    }
                }
                supervisor.kill_all(&self.started).await;
            })
            .await;
    }
}

/// Drives a [`RunPlan`] through the run state machine.
pub struct RunController<L> {
    supervisor: ProcessSupervisor<L>,
    system_proxy: SystemProxyController,
    state: watch::Sender<RunState>,
}

impl<L: ProcessLauncher> RunController<L> {
    pub fn new(supervisor: ProcessSupervisor<L>, system_proxy: SystemProxyController) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            supervisor,
            system_proxy,
            state,
        }
    }

    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor<L> {
        &self.supervisor
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Execute the plan until the edge exits, shutdown is requested, or
    /// startup fails. Cleanup always runs before this returns.
    pub async fn run(&self, plan: &RunPlan, shutdown: ShutdownSignal) -> RunOutcome {
        let cleanup = RunCleanup::new();
        self.run_with_cleanup(plan, shutdown, &cleanup).await
    }

    /// Like [`RunController::run`], with cleanup state owned by the caller so
    /// that other paths can trigger [`RunCleanup::run`] as well.
    pub async fn run_with_cleanup(
        &self,
        plan: &RunPlan,
        mut shutdown: ShutdownSignal,
        cleanup: &RunCleanup,
    ) -> RunOutcome {
        let outcome = match self.start_and_wait(plan, &mut shutdown, cleanup).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(state = %self.state(), "Run failed: {}", e);
                RunOutcome::Failed(e)
            }
        };

        self.enter(RunState::ShuttingDown);
        cleanup.run(&self.supervisor).await;
        self.enter(RunState::Terminated);
        outcome
    }

    async fn start_and_wait(
        &self,
        plan: &RunPlan,
        shutdown: &mut ShutdownSignal,
        cleanup: &RunCleanup,
    ) -> Result<RunOutcome> {
        self.enter(RunState::StartingCores);
        for spec in &plan.cores {
            if self.start_tracked(spec, shutdown, cleanup).await?.is_none() {
                return Ok(RunOutcome::Cancelled);
            }
        }

        self.enter(RunState::StartingEdge);
        let Some(mut edge_exit) = self.start_tracked(&plan.edge, shutdown, cleanup).await? else {
            return Ok(RunOutcome::Cancelled);
        };
        if shutdown.is_requested() {
            info!("Shutdown requested before system proxy change");
            return Ok(RunOutcome::Cancelled);
        }

        self.enter(RunState::ApplyingSystemProxy);
        let restore = self.system_proxy.configure_for_run(&plan.edge_config)?;
        if restore.changed() {
            info!("System proxy enabled and pointed at {}", plan.edge.name);
        } else {
            info!(
                store = self.system_proxy.store_name(),
                "System proxy unchanged (already configured or unsupported platform)"
            );
        }
        cleanup.set_restore(restore);

        self.enter(RunState::Running);
        tokio::select! {
            outcome = edge_exit.wait() => {
                if outcome.is_success() {
                    info!(name = %plan.edge.name, "Edge proxy exited");
                    Ok(RunOutcome::Completed)
                } else {
                    Err(CoreMeshError::EdgeFailed {
                        name: plan.edge.name.clone(),
                        status: outcome.to_string(),
                    })
                }
            }
            _ = shutdown.requested() => {
                info!("Shutdown requested");
                Ok(RunOutcome::Cancelled)
            }
        }
    }

    /// Start one process and track it. `None` means shutdown interrupted it.
    async fn start_tracked(
        &self,
        spec: &ProcessSpec,
        shutdown: &mut ShutdownSignal,
        cleanup: &RunCleanup,
    ) -> Result<Option<ExitWatch>> {
        match self.supervisor.start_and_health_check(spec, shutdown).await? {
            Launch::Healthy(process) => {
                let exit = process.exit_watch();
                cleanup.track(process);
                Ok(Some(exit))
            }
            Launch::Interrupted(process) => {
                cleanup.track(process);
                Ok(None)
            }
        }
    }

    fn enter(&self, next: RunState) {
        let previous = self.state.send_replace(next);
        debug!(from = %previous, to = %next, "Run state changed");
    }
}

impl<L> fmt::Debug for RunController<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunController")
            .field("state", &*self.state.borrow())
            .field("system_proxy", &self.system_proxy)
            .finish()
    }
}
