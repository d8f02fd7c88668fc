//! Durable, thread-safe store for the alert temperature threshold.
//!
//! The settings live in a small JSON object on disk. It is read once when
//! the store is constructed and rewritten in full on every change. A single
//! mutex covers both the in-memory copy and the file write, and the
//! in-memory copy is only replaced after the new file is safely in place, so
//! a failed write never leaves memory and disk disagreeing.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---

/// Threshold used when nothing has been persisted yet.
pub const DEFAULT_TEMP_THRESHOLD: f64 = 200.0;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("threshold must be a finite number, got {0}")]
    NonFinite(f64),

    #[error("failed to write settings file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode settings: {0}")]
    Encode(#[from] serde_json::Error),
}

/// On-disk shape. Keys this build does not know about are carried through
/// untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temp_threshold: Option<f64>,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    default_threshold: f64,
    settings: Mutex<Settings>,
}

impl SettingsStore {
    // ---
    /// Load settings from `path`.
    ///
    /// A missing file means "use defaults". An unreadable or corrupt file is
    /// logged and also falls back to defaults; the next successful
    /// [`set_threshold`](Self::set_threshold) overwrites it.
    pub fn load(path: impl Into<PathBuf>, default_threshold: f64) -> Self {
        // ---
        let path = path.into();
        let settings = match read_settings(&path) {
            Ok(Some(settings)) => {
                tracing::info!(path = %path.display(), threshold = ?settings.temp_threshold, "Loaded settings");
                settings
            }
            Ok(None) => {
                tracing::info!(path = %path.display(), default_threshold, "No settings file, using defaults");
                Settings::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load settings, using defaults");
                Settings::default()
            }
        };

        Self {
            path,
            default_threshold,
            settings: Mutex::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current threshold, or the configured default if none was ever stored.
    pub fn threshold(&self) -> f64 {
        self.lock().temp_threshold.unwrap_or(self.default_threshold)
    }

    /// Persist `value` and make it visible to subsequent reads.
    ///
    /// Returns the stored value. On error the previous value stays in effect.
    pub fn set_threshold(&self, value: f64) -> Result<f64, SettingsError> {
        // ---
        if !value.is_finite() {
            return Err(SettingsError::NonFinite(value));
        }

        let mut guard = self.lock();
        let mut next = guard.clone();
        next.temp_threshold = Some(value);

        if let Err(e) = write_settings(&self.path, &next) {
            tracing::error!(path = %self.path.display(), error = %e, value, "Failed to persist threshold");
            return Err(e);
        }

        *guard = next;
        tracing::info!(threshold = value, "Temperature threshold updated");
        Ok(value)
    }

    fn lock(&self) -> MutexGuard<'_, Settings> {
        // A poisoned lock still holds a fully committed value.
        self.settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read_settings(path: &Path) -> io::Result<Option<Settings>> {
    // ---
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write to a sibling temp file, fsync, then rename over the target.
fn write_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    // ---
    let body = serde_json::to_vec_pretty(settings)?;
    let tmp = path.with_extension("json.tmp");

    let write = || -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };

    write().map_err(|source| {
        let _ = fs::remove_file(&tmp);
        SettingsError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}
