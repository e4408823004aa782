//! Expiring key-value persistence.
//!
//! Stands in for the host's option and transient tables: a value written
//! with `ttl = None` lives until deleted, a value written with
//! `ttl = Some(n)` at time `t` is visible while `now <= t + n`.

use crate::clock::Clock;
use crate::error::{LicenseError, LicenseResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Abstract expiring key-value store.
pub trait KeyValueStore: Send + Sync {
    /// Reads a live value.
    fn get(&self, key: &str) -> LicenseResult<Option<String>>;

    /// Writes a value, optionally expiring after `ttl_secs`.
    fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> LicenseResult<()>;

    /// Removes a value. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> LicenseResult<()>;

    /// Reads and decodes a JSON value.
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> LicenseResult<Option<T>>
    where
        Self: Sized,
    {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Encodes and writes a JSON value.
    fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: Option<u64>) -> LicenseResult<()>
    where
        Self: Sized,
    {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl_secs)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> LicenseResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> LicenseResult<()> {
        (**self).set(key, value, ttl_secs)
    }

    fn delete(&self, key: &str) -> LicenseResult<()> {
        (**self).delete(key)
    }
}

/// A stored value and its absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

impl StoredEntry {
    fn new(value: &str, ttl_secs: Option<u64>, now: i64) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl_secs
                .map(|ttl| now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX))),
        }
    }

    fn is_live(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|exp| now <= exp)
    }
}

// ── In-memory store ──────────────────────────────────────────────

/// Process-local store; expiry is evaluated against the injected clock.
///
/// Expired entries are dropped on every write, so keys that are never read
/// again do not accumulate.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
    clock: Box<dyn Clock>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock: Box::new(clock),
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.lock()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    /// Returns true if no live entries remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> LicenseResult<std::sync::MutexGuard<'_, HashMap<String, StoredEntry>>> {
        self.entries
            .lock()
            .map_err(|_| LicenseError::Storage("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> LicenseResult<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> LicenseResult<()> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        entries.retain(|_, entry| entry.is_live(now));
        entries.insert(key.to_string(), StoredEntry::new(value, ttl_secs, now));
        Ok(())
    }

    fn delete(&self, key: &str) -> LicenseResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

// ── File-backed store ────────────────────────────────────────────

/// JSON file-backed store.
///
/// The whole map is rewritten on every mutation through a temp file and a
/// rename, so a crash mid-write leaves the previous file intact.
pub struct FileStore {
    path: PathBuf,
    clock: Box<dyn Clock>,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens a store at `path`. The file is created on first write.
    pub fn open(path: impl Into<PathBuf>, clock: impl Clock + 'static) -> LicenseResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                LicenseError::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        Ok(Self {
            path,
            clock: Box::new(clock),
            write_lock: Mutex::new(()),
        })
    }

    /// Default location: `<platform data dir>/verifytheme/options.json`.
    pub fn default_path() -> LicenseResult<PathBuf> {
        dirs::data_dir()
            .map(|dir| dir.join("verifytheme").join("options.json"))
            .ok_or_else(|| LicenseError::Storage("no platform data directory".to_string()))
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> LicenseResult<HashMap<String, StoredEntry>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                LicenseError::Storage(format!("corrupt store {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(LicenseError::Storage(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, entries: &HashMap<String, StoredEntry>) -> LicenseResult<()> {
        let raw = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .map_err(|e| LicenseError::Storage(format!("failed to write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            LicenseError::Storage(format!("failed to replace {}: {e}", self.path.display()))
        })
    }

    fn mutate(&self, f: impl FnOnce(&mut HashMap<String, StoredEntry>, i64)) -> LicenseResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| LicenseError::Storage("file store lock poisoned".to_string()))?;
        let now = self.clock.now();
        let mut entries = self.load()?;
        f(&mut entries, now);
        entries.retain(|_, entry| entry.is_live(now));
        self.save(&entries)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> LicenseResult<Option<String>> {
        let now = self.clock.now();
        Ok(self
            .load()?
            .remove(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }

    fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> LicenseResult<()> {
        debug!(key, path = %self.path.display(), "writing store entry");
        self.mutate(|entries, now| {
            entries.insert(key.to_string(), StoredEntry::new(value, ttl_secs, now));
        })
    }

    fn delete(&self, key: &str) -> LicenseResult<()> {
        self.mutate(|entries, _| {
            entries.remove(key);
        })
    }
}
