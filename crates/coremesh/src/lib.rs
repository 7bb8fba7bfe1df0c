//! Process orchestration and system proxy lifecycle for a local proxy mesh.
//!
//! A run brings up a set of local **core proxies**, then one **edge proxy**
//! that applications connect through, and finally points the OS systemwide
//! proxy at the edge proxy. Every step is undone in reverse when the run
//! ends, whether it ends by the edge proxy exiting, a startup failure, or an
//! operator cancellation.
//!
//! The pieces:
//!
//! 1. **Process supervision** (`supervisor`) - spawn a process, make sure it
//!    survives a short grace window, and kill everything started so far in
//!    reverse order.
//!
//! 2. **System proxy control** (`system_proxy`) - snapshot the OS settings,
//!    apply the edge proxy endpoint with a merged bypass list, and restore
//!    the snapshot. Settings already managed elsewhere are left alone.
//!
//! 3. **Run control** (`runner`) - the state machine tying the two together
//!    with a cleanup path that runs exactly once.
//!
//! Configuration comes from the state file written by the upstream parse
//! step (`config`), checked by `validate` before anything is spawned. The
//! edge proxy's geo routing assets are kept fresh by `assets`.

pub mod assets;
pub mod config;
pub mod error;
pub mod logsink;
pub mod process;
pub mod runner;
pub mod shutdown;
pub mod supervisor;
pub mod system_proxy;
pub mod validate;

pub use config::{RunConfig, StateFile};
pub use error::{CoreMeshError, Result};
pub use logsink::LogSink;
pub use process::{ProcessLauncher, ProcessRole, ProcessSpec, RunningProcess, TokioLauncher};
pub use runner::{RunController, RunOutcome, RunPlan, RunState};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use supervisor::{ProcessSupervisor, SupervisorOptions};
pub use system_proxy::{ProxyRestore, SystemProxyController};
