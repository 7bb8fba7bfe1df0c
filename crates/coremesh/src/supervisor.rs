//! Spawn-and-smoke-check plus ordered reaping of supervised processes.

use crate::error::{CoreMeshError, Result};
use crate::process::{ProcessLauncher, ProcessSpec, RunningProcess};
use crate::shutdown::ShutdownSignal;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a freshly spawned process must stay alive to count as started.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_millis(600);

/// How long cleanup waits for each killed process to be reaped.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Timing knobs for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    pub grace_window: Duration,
    pub kill_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            grace_window: DEFAULT_GRACE_WINDOW,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }
}

/// Result of a successful spawn.
#[derive(Debug)]
pub enum Launch {
    /// The process survived the grace window
    Healthy(RunningProcess),
    /// Shutdown was requested during the grace window; the process is alive
    /// and must still be cleaned up
    Interrupted(RunningProcess),
}

/// Processes started during a run, in start order.
///
/// Draining is the only way out, so a second [`ProcessSupervisor::kill_all`]
/// over the same set finds nothing to do.
#[derive(Debug, Default)]
pub struct StartedProcesses {
    inner: Mutex<Vec<RunningProcess>>,
}

impl StartedProcesses {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, process: RunningProcess) {
        self.lock().push(process);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Names in start order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.lock().iter().map(|p| p.name().to_string()).collect()
    }

    fn take_all(&self) -> Vec<RunningProcess> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RunningProcess>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Starts processes through a [`ProcessLauncher`] and reaps them.
#[derive(Debug)]
pub struct ProcessSupervisor<L> {
    launcher: L,
    options: SupervisorOptions,
}

impl<L: ProcessLauncher> ProcessSupervisor<L> {
    pub fn new(launcher: L, options: SupervisorOptions) -> Self {
        Self { launcher, options }
    }

    #[must_use]
    pub fn options(&self) -> SupervisorOptions {
        self.options
    }

    #[must_use]
    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Spawn `spec` and make sure it does not exit within the grace window.
    ///
    /// Any exit inside the window, clean or not, is an
    /// [`CoreMeshError::EarlyExit`]: these are daemons and should never stop
    /// on their own this soon. Once the window elapses the process is
    /// considered started; this is a smoke check, not a readiness check.
    ///
    /// A shutdown request during the window returns
    /// [`Launch::Interrupted`] with the still-running process.
    pub async fn start_and_health_check(
        &self,
        spec: &ProcessSpec,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Launch> {
        let process = self.launcher.launch(spec)?;
        let mut exit = process.exit_watch();

        tokio::select! {
            biased;
            outcome = exit.wait() => {
                warn!(name = %spec.name, status = %outcome, "Process exited during grace window");
                Err(CoreMeshError::EarlyExit {
                    name: spec.name.clone(),
                    status: outcome.to_string(),
                })
            }
            _ = shutdown.requested() => {
                info!(name = %spec.name, "Shutdown requested while starting");
                Ok(Launch::Interrupted(process))
            }
            _ = tokio::time::sleep(self.options.grace_window) => {
                info!(name = %spec.name, pid = ?process.pid(), "Process started");
                Ok(Launch::Healthy(process))
            }
        }
    }

    /// Forcefully terminate every process in `started`, newest first.
    ///
    /// Each process gets up to the kill timeout to be reaped; past that it is
    /// left for the OS to collect. Never fails.
    pub async fn kill_all(&self, started: &StartedProcesses) {
        let processes = started.take_all();
        for mut process in processes.into_iter().rev() {
            debug!(name = %process.name(), pid = ?process.pid(), "Killing process");
            process.start_kill();
            match tokio::time::timeout(self.options.kill_timeout, process.wait()).await {
                Ok(outcome) => {
                    info!(name = %process.name(), status = %outcome, "Process stopped");
                }
                Err(_) => {
                    warn!(
                        name = %process.name(),
                        "Process not reaped within {:?}, leaving it to the OS",
                        self.options.kill_timeout
                    );
                }
            }
        }
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::testing::{Script, ScriptedLauncher};
    use super::*;
    use crate::process::{ExitOutcome, ProcessRole, TokioLauncher};

    fn options() -> SupervisorOptions {
        SupervisorOptions {
            grace_window: Duration::from_millis(100),
            kill_timeout: Duration::from_millis(200),
        }
    }

    fn core(name: &str) -> ProcessSpec {
        ProcessSpec::new(name, "core", vec![], "cfg.json", ProcessRole::CoreProxy)
    }

    #[tokio::test]
    async fn test_healthy_after_grace_window() {
        let launcher = ScriptedLauncher::new();
        let supervisor = ProcessSupervisor::new(launcher.clone(), options());
        let mut shutdown = ShutdownSignal::never();

        let launch = supervisor
            .start_and_health_check(&core("a"), &mut shutdown)
            .await
            .unwrap();
        assert!(matches!(launch, Launch::Healthy(ref p) if p.name() == "a"));
        assert_eq!(launcher.launched(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_clean_exit_inside_window_is_early_exit() {
        let launcher = ScriptedLauncher::new();
        launcher.script(
            "a",
            Script::ExitAfter(
                Duration::from_millis(10),
                ExitOutcome::Exited {
                    success: true,
                    description: "exit status: 0".to_string(),
                },
            ),
        );
        let supervisor = ProcessSupervisor::new(launcher, options());
        let mut shutdown = ShutdownSignal::never();

        let err = supervisor
            .start_and_health_check(&core("a"), &mut shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreMeshError::EarlyExit { ref name, .. } if name == "a"));
    }

    #[tokio::test]
    async fn test_spawn_failure_propagates() {
        let launcher = ScriptedLauncher::new();
        launcher.script("a", Script::SpawnFails);
        let supervisor = ProcessSupervisor::new(launcher, options());
        let mut shutdown = ShutdownSignal::never();

        let err = supervisor
            .start_and_health_check(&core("a"), &mut shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreMeshError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_during_grace_window_interrupts() {
        let launcher = ScriptedLauncher::new();
        let supervisor = ProcessSupervisor::new(
            launcher,
            SupervisorOptions {
                grace_window: Duration::from_secs(30),
                kill_timeout: Duration::from_millis(200),
            },
        );
        let (trigger, mut shutdown) = ShutdownSignal::channel();
        trigger.trigger();

        let launch = supervisor
            .start_and_health_check(&core("a"), &mut shutdown)
            .await
            .unwrap();
        assert!(matches!(launch, Launch::Interrupted(_)));
    }

    #[tokio::test]
    async fn test_kill_all_reverse_order_and_idempotent() {
        let launcher = ScriptedLauncher::new();
        let supervisor = ProcessSupervisor::new(launcher.clone(), options());
        let mut shutdown = ShutdownSignal::never();
        let started = StartedProcesses::new();

        for name in ["a", "b", "c"] {
            match supervisor
                .start_and_health_check(&core(name), &mut shutdown)
                .await
                .unwrap()
            {
                Launch::Healthy(p) | Launch::Interrupted(p) => started.push(p),
            }
        }
        assert_eq!(started.names(), vec!["a", "b", "c"]);

        supervisor.kill_all(&started).await;
        assert_eq!(launcher.killed(), vec!["c", "b", "a"]);
        assert!(started.is_empty());

        supervisor.kill_all(&started).await;
        assert_eq!(launcher.killed().len(), 3);
    }

    #[tokio::test]
    async fn test_kill_all_tolerates_unreaped_process() {
        let launcher = ScriptedLauncher::new();
        launcher.script("stuck", Script::Stubborn);
        let supervisor = ProcessSupervisor::new(launcher.clone(), options());
        let mut shutdown = ShutdownSignal::never();
        let started = StartedProcesses::new();

        for name in ["first", "stuck"] {
            if let Launch::Healthy(p) = supervisor
                .start_and_health_check(&core(name), &mut shutdown)
                .await
                .unwrap()
            {
                started.push(p);
            }
        }

        supervisor.kill_all(&started).await;
        assert_eq!(launcher.killed(), vec!["stuck", "first"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process_lifecycle() {
        let supervisor = ProcessSupervisor::new(TokioLauncher, options());
        let mut shutdown = ShutdownSignal::never();
        let started = StartedProcesses::new();

        let sleeper = ProcessSpec::new(
            "sleeper",
            "/bin/sh",
            vec!["-c".to_string(), "sleep 30".to_string()],
            "unused.json",
            ProcessRole::CoreProxy,
        );
        let launch = supervisor
            .start_and_health_check(&sleeper, &mut shutdown)
            .await
            .unwrap();
        let Launch::Healthy(process) = launch else {
            panic!("expected healthy process");
        };
        let mut exit = process.exit_watch();
        started.push(process);

        let crasher = ProcessSpec::new(
            "crasher",
            "/bin/sh",
            vec!["-c".to_string(), "exit 1".to_string()],
            "unused.json",
            ProcessRole::CoreProxy,
        );
        let err = supervisor
            .start_and_health_check(&crasher, &mut shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreMeshError::EarlyExit { .. }));

        supervisor.kill_all(&started).await;
        assert!(exit.try_outcome().is_some());
        assert!(!exit.wait().await.is_success());
    }
}
