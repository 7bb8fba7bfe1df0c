//! Geo routing assets for the edge proxy.
//!
//! The edge proxy resolves `geosite:` and `geoip:` routing rules from
//! `geosite.dat` and `geoip.dat` in its asset directory. Before a run, each
//! file that is missing or older than [`GEO_MAX_AGE_DAYS`] is downloaded
//! again. Downloads land in a `.tmp` sibling first and are renamed into place,
//! so a failed download never leaves a truncated asset behind.

use crate::error::{CoreMeshError, Result};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Assets refreshed before every run.
pub const GEO_FILE_NAMES: [&str; 2] = ["geosite", "geoip"];

/// Assets older than this are downloaded again.
pub const GEO_MAX_AGE_DAYS: i64 = 30;

/// Download location; `{name}` is one of [`GEO_FILE_NAMES`].
pub const GEO_URL_TEMPLATE: &str =
    "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/{name}.dat";

/// Overall timeout for one asset download.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(90);

/// Fetches an asset and streams it into `out`.
pub trait GeoDownloader {
    /// Download `url` into `out`, returning the number of bytes written.
    fn download(&self, url: &str, out: &mut dyn Write) -> Result<u64>;
}

/// Downloader over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    timeout: Duration,
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self {
            timeout: DOWNLOAD_TIMEOUT,
        }
    }
}

impl HttpDownloader {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl GeoDownloader for HttpDownloader {
    fn download(&self, url: &str, out: &mut dyn Write) -> Result<u64> {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .http_status_as_error(false)
            .build()
            .new_agent();

        let response = agent
            .get(url)
            .header(
                "User-Agent",
                &format!("coremesh/{}", env!("CARGO_PKG_VERSION")),
            )
            .call()
            .map_err(|e| CoreMeshError::Asset(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreMeshError::Asset(format!(
                "GET {}: unexpected status {}",
                url,
                status.as_u16()
            )));
        }

        let mut body = response.into_body().into_reader();
        Ok(std::io::copy(&mut body, out)?)
    }
}

/// Download URL of the asset `name`.
#[must_use]
pub fn geo_url(name: &str) -> String {
    GEO_URL_TEMPLATE.replace("{name}", name)
}

/// Make sure every geo asset in `asset_dir` exists and is fresh as of `now`.
///
/// Creates `asset_dir` if needed. Returns the paths that were downloaded.
pub fn ensure_geo_files(
    asset_dir: &Path,
    now: DateTime<Utc>,
    downloader: &dyn GeoDownloader,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(asset_dir).map_err(|e| {
        CoreMeshError::Asset(format!("create {}: {}", asset_dir.display(), e))
    })?;

    let max_age = chrono::Duration::days(GEO_MAX_AGE_DAYS);
    let mut refreshed = Vec::new();
    for name in GEO_FILE_NAMES {
        let target = asset_dir.join(format!("{}.dat", name));
        if !needs_refresh(&target, now, max_age)? {
            debug!(path = %target.display(), "Geo asset is fresh");
            continue;
        }

        let url = geo_url(name);
        info!(path = %target.display(), %url, "Downloading geo asset");
        download_into_place(downloader, &url, &target)
            .map_err(|e| CoreMeshError::Asset(format!("download {}: {}", name, e)))?;
        refreshed.push(target);
    }
    Ok(refreshed)
}

fn needs_refresh(path: &Path, now: DateTime<Utc>, max_age: chrono::Duration) -> Result<bool> {
    let check_err = |e: std::io::Error| {
        CoreMeshError::Asset(format!("check {}: {}", path.display(), e))
    };
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(check_err(e)),
    };
    if meta.is_dir() {
        return Err(CoreMeshError::Asset(format!(
            "check {}: expected file but got directory",
            path.display()
        )));
    }
    let modified: DateTime<Utc> = meta.modified().map_err(check_err)?.into();
    Ok(now.signed_duration_since(modified) > max_age)
}

fn download_into_place(downloader: &dyn GeoDownloader, url: &str, target: &Path) -> Result<()> {
    let tmp = target.with_extension("dat.tmp");
    if let Err(e) = write_file(downloader, url, &tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, target)?;
    Ok(())
}

fn write_file(downloader: &dyn GeoDownloader, url: &str, path: &Path) -> Result<()> {
    let mut file = File::create(path)?;
    let written = downloader.download(url, &mut file)?;
    file.sync_all()?;
    debug!(path = %path.display(), bytes = written, "Geo asset written");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Writes `name:<url>` for every request, or fails when asked to.
    #[derive(Default)]
    struct FakeDownloader {
        requested: Mutex<Vec<String>>,
        fail: bool,
    }

    impl FakeDownloader {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    impl GeoDownloader for FakeDownloader {
        fn download(&self, url: &str, out: &mut dyn Write) -> Result<u64> {
            self.requested.lock().unwrap().push(url.to_string());
            out.write_all(b"partial")?;
            if self.fail {
                return Err(CoreMeshError::Asset("connection reset".to_string()));
            }
            let body = format!("data:{}", url);
            out.write_all(body.as_bytes())?;
            Ok((b"partial".len() + body.len()) as u64)
        }
    }

    #[test]
    fn test_missing_files_are_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let asset_dir = dir.path().join("conf");
        let downloader = FakeDownloader::default();

        let refreshed = ensure_geo_files(&asset_dir, Utc::now(), &downloader).unwrap();

        assert_eq!(
            refreshed,
            vec![asset_dir.join("geosite.dat"), asset_dir.join("geoip.dat")]
        );
        assert_eq!(
            downloader.requested(),
            vec![
                "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/geosite.dat",
                "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/geoip.dat",
            ]
        );
        let content = std::fs::read_to_string(asset_dir.join("geoip.dat")).unwrap();
        assert!(content.ends_with("geoip.dat"));
        assert!(!asset_dir.join("geoip.dat.tmp").exists());
    }

    #[test]
    fn test_fresh_files_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        for name in GEO_FILE_NAMES {
            std::fs::write(dir.path().join(format!("{}.dat", name)), "cached").unwrap();
        }
        let downloader = FakeDownloader::default();

        let refreshed = ensure_geo_files(dir.path(), Utc::now(), &downloader).unwrap();

        assert!(refreshed.is_empty());
        assert!(downloader.requested().is_empty());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("geosite.dat")).unwrap(),
            "cached"
        );
    }

    #[test]
    fn test_stale_files_are_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        for name in GEO_FILE_NAMES {
            std::fs::write(dir.path().join(format!("{}.dat", name)), "old").unwrap();
        }
        let downloader = FakeDownloader::default();
        let later = Utc::now() + chrono::Duration::days(GEO_MAX_AGE_DAYS + 1);

        let refreshed = ensure_geo_files(dir.path(), later, &downloader).unwrap();

        assert_eq!(refreshed.len(), 2);
        assert_ne!(
            std::fs::read_to_string(dir.path().join("geosite.dat")).unwrap(),
            "old"
        );
    }

    #[test]
    fn test_directory_at_target_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("geosite.dat")).unwrap();
        let downloader = FakeDownloader::default();

        let err = ensure_geo_files(dir.path(), Utc::now(), &downloader).unwrap_err();

        assert!(matches!(err, CoreMeshError::Asset(_)));
        assert!(err.to_string().contains("expected file but got directory"));
        assert!(downloader.requested().is_empty());
    }

    #[test]
    fn test_download_failure_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = FakeDownloader::failing();

        let err = ensure_geo_files(dir.path(), Utc::now(), &downloader).unwrap_err();

        assert!(err.to_string().contains("download geosite"));
        assert!(!dir.path().join("geosite.dat").exists());
        assert!(!dir.path().join("geosite.dat.tmp").exists());
        // The first failure stops the refresh.
        assert_eq!(downloader.requested().len(), 1);
    }

    #[test]
    fn test_failed_refresh_keeps_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("geosite.dat"), "old").unwrap();
        let later = Utc::now() + chrono::Duration::days(GEO_MAX_AGE_DAYS + 1);

        assert!(ensure_geo_files(dir.path(), later, &FakeDownloader::failing()).is_err());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("geosite.dat")).unwrap(),
            "old"
        );
    }

    #[test]
    fn test_http_downloader_default_timeout() {
        assert_eq!(HttpDownloader::default().timeout, DOWNLOAD_TIMEOUT);
        assert_eq!(
            HttpDownloader::with_timeout(Duration::from_secs(5)).timeout,
            Duration::from_secs(5)
        );
    }
}
