//! Settings store abstraction.
//!
//! The persisted server list lives in a key/value store with a maximum
//! string length per value; the codec splits oversized payloads across
//! numbered auxiliary keys. Two implementations are provided: a TOML file
//! under the config directory, and an in-memory store for tests and
//! embedding.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;

use crate::error::{QdeskError, Result};

/// Default per-value length limit, matching common preference stores.
pub const DEFAULT_MAX_VALUE_LEN: usize = 8192;

/// Key/value settings store with bounded value lengths.
pub trait SettingsStore: Send + Sync {
    /// Read a value, or `None` if the key has never been written.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value. Fails if `value` exceeds [`max_value_len`](Self::max_value_len).
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key. Deleting an absent key is a no-op.
    fn remove(&self, key: &str);

    /// All stored keys, sorted.
    fn keys(&self) -> Vec<String>;

    /// Maximum byte length accepted per value.
    fn max_value_len(&self) -> usize;
}

fn check_len(key: &str, value: &str, limit: usize) -> Result<()> {
    if value.len() > limit {
        return Err(QdeskError::Store(format!(
            "value for '{}' exceeds the {} byte limit",
            key, limit
        )));
    }
    Ok(())
}

/// In-memory store with a configurable value-length limit.
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
    limit: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_VALUE_LEN)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            values: Mutex::new(BTreeMap::new()),
            limit,
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        check_len(key, value, self.limit)?;
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.values.lock().unwrap().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.values.lock().unwrap().keys().cloned().collect()
    }

    fn max_value_len(&self) -> usize {
        self.limit
    }
}

/// Returns the config directory path.
///
/// Checks `QDESK_CONFIG_DIR` first, then falls back to the system default
/// (~/.config/qdesk on Linux/macOS).
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("QDESK_CONFIG_DIR") {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|p| p.join("qdesk"))
}

/// Returns the default settings file path (`<config_dir>/settings.toml`).
pub fn settings_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.toml"))
}

/// File-backed settings store: a flat TOML table of string values.
///
/// Every write is flushed to disk atomically (temp file + rename) so a
/// crash mid-save cannot corrupt the file.
pub struct FileSettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
    limit: usize,
}

impl FileSettingsStore {
    /// Open the store at the default path.
    pub fn open_default() -> Result<Self> {
        let path = settings_path()
            .ok_or_else(|| QdeskError::Store("could not determine config directory".into()))?;
        Self::open(&path)
    }

    /// Open (or create) the store at a specific path.
    pub fn open(path: &Path) -> Result<Self> {
        let values = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| {
                QdeskError::Store(format!("failed to parse {}: {}", path.display(), e))
            })?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
            limit: DEFAULT_MAX_VALUE_LEN,
        })
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| QdeskError::Store("settings path has no parent directory".into()))?;
        std::fs::create_dir_all(parent)?;

        let content = toml::to_string(values)
            .map_err(|e| QdeskError::Store(format!("failed to serialize settings: {}", e)))?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|e| QdeskError::Store(format!("failed to persist settings file: {}", e)))?;

        Ok(())
    }
}

impl SettingsStore for FileSettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        check_len(key, value, self.limit)?;
        let mut values = self.values.lock().unwrap();
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn remove(&self, key: &str) {
        let mut values = self.values.lock().unwrap();
        if values.remove(key).is_some() {
            // Best-effort flush; a failed delete will be retried on the next write.
            if let Err(e) = self.save(&values) {
                tracing::warn!("failed to flush settings after remove: {}", e);
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        self.values.lock().unwrap().keys().cloned().collect()
    }

    fn max_value_len(&self) -> usize {
        self.limit
    }
}
