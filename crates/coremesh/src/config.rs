//! Resolved run configuration and the state file that carries it.
//!
//! The upstream `parse` step imports client profiles, generates the edge
//! proxy configuration, and stores the result as
//! `<conf-dir>/coremesh.state.json`. A run only reads it back.

use crate::error::{CoreMeshError, Result};
use crate::logsink::{LogSink, APP_LOG_FILE_NAME, EDGE_LOG_FILE_NAME};
use crate::process::{ProcessRole, ProcessSpec};
use crate::runner::RunPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the state file inside the conf dir.
pub const STATE_FILE_NAME: &str = "coremesh.state.json";

/// Current state file format version.
pub const STATE_VERSION: u32 = 1;

/// Process name used for the edge proxy.
pub const EDGE_PROCESS_NAME: &str = "xray";

/// Environment variables pointing the edge proxy at its asset directory.
pub const EDGE_ASSET_ENV_VARS: [&str; 2] = ["XRAY_LOCATION_ASSET", "XRAY_LOCATION_CERT"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub work_dir: String,
    #[serde(default)]
    pub generated_xray_config: String,
}

/// The edge proxy binary and its argument template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub bin: String,
    #[serde(default)]
    pub base_config: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

/// One core proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profile_id: String,
    pub name: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    pub bin: String,
    pub config: String,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub outbound_tag: String,
    #[serde(default)]
    pub active: bool,
}

/// Fully resolved configuration for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default, rename = "xray")]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub cores: Vec<CoreConfig>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub routing_rules_file: String,
}

impl RunConfig {
    /// Working directory for logs; `.` when unset.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        let dir = self.app.work_dir.trim();
        if dir.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(dir)
        }
    }

    #[must_use]
    pub fn edge_config_path(&self) -> PathBuf {
        PathBuf::from(&self.app.generated_xray_config)
    }

    /// Build the ordered process specs for a run.
    ///
    /// Core output goes to the application log, edge output to its own log.
    /// `asset_dir` overrides the asset directory inferred from the edge binary.
    pub fn run_plan(&self, asset_dir: Option<&Path>) -> Result<RunPlan> {
        if self.edge.bin.trim().is_empty() {
            return Err(CoreMeshError::Config("xray.bin is required".to_string()));
        }
        if self.app.generated_xray_config.trim().is_empty() {
            return Err(CoreMeshError::Config(
                "app.generated_xray_config is required".to_string(),
            ));
        }

        let work_dir = self.work_dir();
        let app_log = LogSink::File(work_dir.join(APP_LOG_FILE_NAME));

        let cores = self
            .cores
            .iter()
            .map(|core| {
                ProcessSpec::new(
                    core.name.clone(),
                    &core.bin,
                    core.args.clone(),
                    &core.config,
                    ProcessRole::CoreProxy,
                )
                .with_log_sink(app_log.clone())
            })
            .collect();

        let asset_dir = asset_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| infer_asset_dir(Path::new(&self.edge.bin)));
        let asset_dir = asset_dir.to_string_lossy().into_owned();
        let edge_config = self.edge_config_path();
        let edge = EDGE_ASSET_ENV_VARS.iter().fold(
            ProcessSpec::new(
                EDGE_PROCESS_NAME,
                &self.edge.bin,
                self.edge.args.clone(),
                &edge_config,
                ProcessRole::EdgeProxy,
            )
            .with_log_sink(LogSink::File(work_dir.join(EDGE_LOG_FILE_NAME))),
            |spec, var| spec.with_env(*var, asset_dir.clone()),
        );

        Ok(RunPlan {
            cores,
            edge,
            edge_config,
        })
    }
}

/// Directory holding the edge proxy's geo assets.
///
/// Client layouts put the binary at `<home>/bin/xray/xray` with assets in
/// `<home>/bin`, so a directory named `xray` defers to its parent.
#[must_use]
pub fn infer_asset_dir(edge_bin: &Path) -> PathBuf {
    let dir = edge_bin.parent().unwrap_or_else(|| Path::new("."));
    let named_xray = dir
        .file_name()
        .is_some_and(|name| name.to_string_lossy().eq_ignore_ascii_case("xray"));
    match dir.parent() {
        Some(parent) if named_xray => parent.to_path_buf(),
        _ => dir.to_path_buf(),
    }
}

/// On-disk state written by the `parse` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub v2rayn_home: String,
    pub parsed_at: DateTime<Utc>,
    pub config: RunConfig,
}

impl StateFile {
    #[must_use]
    pub fn new(v2rayn_home: impl Into<String>, config: RunConfig) -> Self {
        Self {
            version: STATE_VERSION,
            v2rayn_home: v2rayn_home.into(),
            parsed_at: Utc::now(),
            config,
        }
    }

    #[must_use]
    pub fn path(conf_dir: &Path) -> PathBuf {
        conf_dir.join(STATE_FILE_NAME)
    }

    /// Load the state file from `conf_dir`.
    pub fn load(conf_dir: &Path) -> Result<Self> {
        let path = Self::path(conf_dir);
        let state_err = |reason: String| CoreMeshError::StateFile {
            path: path.display().to_string(),
            reason,
        };

        let content =
            std::fs::read_to_string(&path).map_err(|e| state_err(format!("read failed: {}", e)))?;
        let state: StateFile = serde_json::from_str(&content)
            .map_err(|e| state_err(format!("parse failed: {}", e)))?;
        if state.version == 0 {
            return Err(state_err(format!("invalid version: {}", state.version)));
        }
        Ok(state)
    }

    /// Load the state for a run out of `conf_dir`.
    ///
    /// The conf dir is the run's working directory whatever `app.work_dir`
    /// was recorded at parse time, so the application log lands next to the
    /// state file.
    pub fn load_for_run(conf_dir: &Path) -> Result<Self> {
        let mut state = Self::load(conf_dir)?;
        state.config.app.work_dir = conf_dir.to_string_lossy().into_owned();
        Ok(state)
    }

    /// Write the state file atomically (temp file, then rename).
    ///
    /// The parse step that imports the v2rayN configuration is the writer;
    /// `run` only ever reads the file.
    pub fn save(&self, conf_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(conf_dir)?;
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| CoreMeshError::Config(format!("serialize state: {}", e)))?;

        let target = Self::path(conf_dir);
        let tmp = target.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }
}
