//! Access to the OS systemwide proxy settings.

use crate::error::{CoreMeshError, Result};
use std::sync::Mutex;

/// The four values of the systemwide proxy configuration.
///
/// Captured as a snapshot before a run changes anything, and written back
/// verbatim on restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub enabled: bool,
    /// `host:port`
    pub server: String,
    /// `;`-separated bypass entries
    pub bypass: String,
    pub autoconfig_url: String,
}

impl ProxySettings {
    /// Proxying is already arranged by something else: a manual proxy is on,
    /// or an autoconfig script is set.
    #[must_use]
    pub fn is_externally_managed(&self) -> bool {
        self.enabled || !self.autoconfig_url.trim().is_empty()
    }
}

/// A systemwide proxy settings store.
pub trait ProxySettingsStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether this platform has a store at all.
    fn is_supported(&self) -> bool {
        true
    }

    /// Read the current settings.
    fn snapshot(&self) -> Result<ProxySettings>;

    /// Replace the current settings.
    fn apply(&self, settings: &ProxySettings) -> Result<()>;
}

/// Store for platforms without systemwide proxy settings.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedStore;

impl ProxySettingsStore for UnsupportedStore {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn snapshot(&self) -> Result<ProxySettings> {
        Ok(ProxySettings::default())
    }

    fn apply(&self, _settings: &ProxySettings) -> Result<()> {
        Ok(())
    }
}

/// In-process store. Keeps every applied value, in order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    current: Mutex<ProxySettings>,
    applied: Mutex<Vec<ProxySettings>>,
    fail_apply: bool,
}

impl MemoryStore {
    #[must_use]
    pub fn new(initial: ProxySettings) -> Self {
        Self {
            current: Mutex::new(initial),
            applied: Mutex::new(Vec::new()),
            fail_apply: false,
        }
    }

    /// A store whose `apply` always fails.
    #[must_use]
    pub fn failing(initial: ProxySettings) -> Self {
        Self {
            fail_apply: true,
            ..Self::new(initial)
        }
    }

    #[must_use]
    pub fn current(&self) -> ProxySettings {
        lock(&self.current).clone()
    }

    /// Every value passed to `apply`, oldest first.
    #[must_use]
    pub fn applied(&self) -> Vec<ProxySettings> {
        lock(&self.applied).clone()
    }
}

impl ProxySettingsStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn snapshot(&self) -> Result<ProxySettings> {
        Ok(self.current())
    }

    fn apply(&self, settings: &ProxySettings) -> Result<()> {
        if self.fail_apply {
            return Err(CoreMeshError::SystemProxy(
                "settings store rejected the update".to_string(),
            ));
        }
        lock(&self.applied).push(settings.clone());
        *lock(&self.current) = settings.clone();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
