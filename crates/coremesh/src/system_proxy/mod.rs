//! Systemwide proxy lifecycle for a run.
//!
//! [`SystemProxyController::configure_for_run`] snapshots the OS settings,
//! points them at the edge proxy, and hands back a [`ProxyRestore`] that
//! writes the snapshot back. Settings that are already managed by something
//! else (a manual proxy or an autoconfig script) are left untouched.
//!
//! The OS side sits behind [`ProxySettingsStore`]; [`platform_store`] picks
//! the implementation for the running platform.

pub mod bypass;
pub mod endpoint;
pub mod store;
pub mod windows;

pub use bypass::{merge_bypass, split_bypass, REQUIRED_BYPASS_LIST};
pub use endpoint::{detect_endpoint, normalize_host, ProxyEndpoint};
pub use store::{MemoryStore, ProxySettings, ProxySettingsStore, UnsupportedStore};
pub use windows::WindowsRegistryStore;

use crate::error::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// The settings store for the current platform.
#[must_use]
pub fn platform_store() -> Arc<dyn ProxySettingsStore> {
    let windows = WindowsRegistryStore;
    if windows.is_supported() {
        Arc::new(windows)
    } else {
        Arc::new(UnsupportedStore)
    }
}

/// Undo handle returned by [`SystemProxyController::configure_for_run`].
///
/// Consumed by [`ProxyRestore::restore`], so a snapshot is written back at
/// most once.
#[must_use = "dropping a ProxyRestore leaves the system proxy pointed at the edge proxy"]
pub struct ProxyRestore {
    pending: Option<(Arc<dyn ProxySettingsStore>, ProxySettings)>,
}

impl ProxyRestore {
    /// A restore that does nothing.
    pub fn noop() -> Self {
        Self { pending: None }
    }

    /// Whether the run changed the system settings.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.pending.is_some()
    }

    /// The snapshot that will be written back, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<&ProxySettings> {
        self.pending.as_ref().map(|(_, snapshot)| snapshot)
    }

    /// Write the snapshot back verbatim.
    pub fn restore(self) -> Result<()> {
        match self.pending {
            Some((store, snapshot)) => {
                store.apply(&snapshot)?;
                info!(store = store.name(), "Restored previous system proxy settings");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ProxyRestore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRestore")
            .field("changed", &self.changed())
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Points the systemwide proxy at the edge proxy for the duration of a run.
#[derive(Clone)]
pub struct SystemProxyController {
    store: Arc<dyn ProxySettingsStore>,
}

impl SystemProxyController {
    pub fn new(store: Arc<dyn ProxySettingsStore>) -> Self {
        Self { store }
    }

    /// Controller over [`platform_store`].
    pub fn for_platform() -> Self {
        Self::new(platform_store())
    }

    #[must_use]
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Snapshot the current settings and point them at the edge proxy.
    ///
    /// Returns an unchanged [`ProxyRestore`] when the platform has no store,
    /// or when the snapshot shows proxying already managed elsewhere.
    pub fn configure_for_run(&self, edge_config: &Path) -> Result<ProxyRestore> {
        if !self.store.is_supported() {
            debug!(store = self.store.name(), "No systemwide proxy store on this platform");
            return Ok(ProxyRestore::noop());
        }

        let snapshot = self.store.snapshot()?;
        if snapshot.is_externally_managed() {
            info!(
                enabled = snapshot.enabled,
                autoconfig = %snapshot.autoconfig_url,
                "System proxy already configured, leaving it alone"
            );
            return Ok(ProxyRestore::noop());
        }

        let endpoint = detect_endpoint(edge_config)?;
        let settings = ProxySettings {
            enabled: true,
            server: endpoint.server_address(),
            bypass: merge_bypass(&snapshot.bypass, REQUIRED_BYPASS_LIST),
            autoconfig_url: String::new(),
        };
        self.store.apply(&settings)?;
        info!(
            store = self.store.name(),
            endpoint = %endpoint,
            "System proxy pointed at edge proxy"
        );

        Ok(ProxyRestore {
            pending: Some((Arc::clone(&self.store), snapshot)),
        })
    }
}

impl std::fmt::Debug for SystemProxyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProxyController")
            .field("store", &self.store.name())
            .finish()
    }
}
