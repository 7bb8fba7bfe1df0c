//! Output destinations for supervised processes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Application log file, shared by coremesh itself and the core proxies.
pub const APP_LOG_FILE_NAME: &str = "coremesh.log";

/// Log file receiving the edge proxy's stdout and stderr.
pub const EDGE_LOG_FILE_NAME: &str = "xray.log";

/// Where a child process writes its stdout and stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogSink {
    /// Share the supervisor's own stdout/stderr
    Inherit,
    /// Discard all output
    #[default]
    Null,
    /// Append to a file, creating it (and its parent directory) if needed
    File(PathBuf),
}

impl LogSink {
    /// Open the sink, returning handles for stdout and stderr.
    pub fn open(&self) -> std::io::Result<(Stdio, Stdio)> {
        match self {
            LogSink::Inherit => Ok((Stdio::inherit(), Stdio::inherit())),
            LogSink::Null => Ok((Stdio::null(), Stdio::null())),
            LogSink::File(path) => {
                let file = open_append(path)?;
                let err = file.try_clone()?;
                Ok((Stdio::from(file), Stdio::from(err)))
            }
        }
    }
}

/// Open `path` for appending, creating parent directories first.
pub fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}
