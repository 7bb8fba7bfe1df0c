//! Pre-run checks over a [`RunConfig`].
//!
//! Catches missing binaries and config files before anything is spawned, so
//! a typo does not surface as a confusing early exit.

use crate::config::RunConfig;
use crate::error::{CoreMeshError, Result};
use std::collections::HashSet;
use std::path::Path;

/// Validate `config` for a run.
pub fn for_run(config: &RunConfig) -> Result<()> {
    check_file(&config.edge.bin, "xray.bin")?;
    check_file(&config.app.generated_xray_config, "app.generated_xray_config")?;

    let mut names = HashSet::new();
    let mut listens = HashSet::new();
    for (i, core) in config.cores.iter().enumerate() {
        let field = format!("cores[{}]", i);
        if core.name.trim().is_empty() {
            return Err(CoreMeshError::Validation(format!(
                "{}.name is required",
                field
            )));
        }
        check_file(&core.bin, &format!("{}.bin", field))?;
        check_file(&core.config, &format!("{}.config", field))?;

        if !names.insert(core.name.as_str()) {
            return Err(CoreMeshError::Validation(format!(
                "duplicate core name: {}",
                core.name
            )));
        }
        let listen = format!("{}:{}", core.listen.host, core.listen.port);
        if !listens.insert(listen.clone()) {
            return Err(CoreMeshError::Validation(format!(
                "duplicate listen endpoint: {}",
                listen
            )));
        }
    }
    Ok(())
}

fn check_file(path: &str, field: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(CoreMeshError::Validation(format!("{} is required", field)));
    }
    let meta = std::fs::metadata(Path::new(path))
        .map_err(|e| CoreMeshError::Validation(format!("{} invalid: {}", field, e)))?;
    if meta.is_dir() {
        return Err(CoreMeshError::Validation(format!(
            "{} points to directory: {}",
            field, path
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, CoreConfig, EdgeConfig, ListenConfig};

    struct Fixture {
        _dir: tempfile::TempDir,
        config: RunConfig,
    }

    fn touch(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, "").unwrap();
        path.to_string_lossy().into_owned()
    }

    fn core(dir: &Path, name: &str, port: u16) -> CoreConfig {
        CoreConfig {
            name: name.to_string(),
            bin: touch(dir, &format!("{}-bin", name)),
            config: touch(dir, &format!("{}.json", name)),
            listen: ListenConfig {
                host: "127.0.0.1".to_string(),
                port,
            },
            ..CoreConfig::default()
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            app: AppConfig {
                work_dir: dir.path().to_string_lossy().into_owned(),
                generated_xray_config: touch(dir.path(), "xray.generated.json"),
            },
            edge: EdgeConfig {
                bin: touch(dir.path(), "xray"),
                ..EdgeConfig::default()
            },
            cores: vec![core(dir.path(), "a", 1081), core(dir.path(), "b", 1082)],
            routing_rules_file: String::new(),
        };
        Fixture { _dir: dir, config }
    }

    #[test]
    fn test_valid_config_passes() {
        let fx = fixture();
        assert!(for_run(&fx.config).is_ok());
    }

    #[test]
    fn test_missing_edge_binary() {
        let mut fx = fixture();
        fx.config.edge.bin = "/nonexistent/xray".to_string();
        let err = for_run(&fx.config).unwrap_err();
        assert!(err.to_string().contains("xray.bin invalid"));
    }

    #[test]
    fn test_directory_is_rejected() {
        let mut fx = fixture();
        fx.config.cores[0].config = fx.config.app.work_dir.clone();
        let err = for_run(&fx.config).unwrap_err();
        assert!(err.to_string().contains("cores[0].config points to directory"));
    }

    #[test]
    fn test_duplicate_name_and_listen() {
        let mut fx = fixture();
        fx.config.cores[1].name = "a".to_string();
        assert!(for_run(&fx.config)
            .unwrap_err()
            .to_string()
            .contains("duplicate core name: a"));

        let mut fx = fixture();
        fx.config.cores[1].listen.port = 1081;
        assert!(for_run(&fx.config)
            .unwrap_err()
            .to_string()
            .contains("duplicate listen endpoint: 127.0.0.1:1081"));
    }

    #[test]
    fn test_empty_core_name() {
        let mut fx = fixture();
        fx.config.cores[0].name = " ".to_string();
        assert!(matches!(
            for_run(&fx.config).unwrap_err(),
            CoreMeshError::Validation(_)
        ));
    }
}
