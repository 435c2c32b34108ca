//! Remembered baud rates per device
//!
//! Every successful start records `(device, baud)`; the next start of the
//! same device without an explicit rate picks the remembered one. Stored as
//! a small JSON document:
//!
//! ```json
//! { "device_baud_rates": { "USBBUS1": "500k", "USBBUS2": "125k" } }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use canmon_core::{BaudRate, LogicalDeviceId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PreferenceError;

/// Device to baud-rate map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaudPreferences {
    #[serde(default)]
    pub device_baud_rates: BTreeMap<LogicalDeviceId, BaudRate>,
}

impl BaudPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `baud` for `device`. Returns true if the stored value changed.
    pub fn remember(&mut self, device: &LogicalDeviceId, baud: BaudRate) -> bool {
        self.device_baud_rates.insert(device.clone(), baud) != Some(baud)
    }

    pub fn get(&self, device: &LogicalDeviceId) -> Option<BaudRate> {
        self.device_baud_rates.get(device).copied()
    }

    /// Remembered rate, or the 500 kbit/s default
    pub fn selection_for(&self, device: &LogicalDeviceId) -> BaudRate {
        self.get(device).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.device_baud_rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.device_baud_rates.is_empty()
    }
}

/// Persistence backend for [`BaudPreferences`]
pub trait PreferenceStore: Send + Sync {
    /// Load saved preferences. A store that has never been written yields
    /// an empty map.
    fn load(&self) -> Result<BaudPreferences, PreferenceError>;

    fn save(&self, preferences: &BaudPreferences) -> Result<(), PreferenceError>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct JsonPreferenceStore {
    path: PathBuf,
}

impl JsonPreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> PreferenceError {
        PreferenceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn load(&self) -> Result<BaudPreferences, PreferenceError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No preference file yet");
                return Ok(BaudPreferences::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        serde_json::from_str(&content).map_err(|source| PreferenceError::Format {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, preferences: &BaudPreferences) -> Result<(), PreferenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let json = serde_json::to_string_pretty(preferences).map_err(|source| {
            PreferenceError::Format {
                path: self.path.clone(),
                source,
            }
        })?;

        // Write-then-rename: readers never see a partial file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;

        debug!(path = %self.path.display(), entries = preferences.len(), "Saved baud preferences");
        Ok(())
    }
}

/// In-memory store for tests and `--no-preferences` runs
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    saved: Mutex<BaudPreferences>,
    saves: AtomicUsize,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preferences(preferences: BaudPreferences) -> Self {
        Self {
            saved: Mutex::new(preferences),
            saves: AtomicUsize::new(0),
        }
    }

    /// What was last saved
    pub fn snapshot(&self) -> BaudPreferences {
        self.saved.lock().clone()
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> Result<BaudPreferences, PreferenceError> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, preferences: &BaudPreferences) -> Result<(), PreferenceError> {
        *self.saved.lock() = preferences.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
