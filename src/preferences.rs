use crate::error::{TrackerError, TrackerResult};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

pub const AUTO_TRACKING_KEY: &str = "autoTrackingEnabled";
pub const PERMISSIONS_KEY: &str = "permissionState";

/// Device-local key/value store. Synchronous from the caller's side.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> TrackerResult<()>;
}

/// Typed read; a value that no longer deserializes reads as absent.
pub fn load<T: DeserializeOwned>(store: &dyn PreferenceStore, key: &str) -> Option<T> {
    let value = store.get(key)?;
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("[prefs] ignoring unreadable '{}': {}", key, e);
            None
        }
    }
}

pub fn save<T: Serialize>(store: &dyn PreferenceStore, key: &str, value: &T) -> TrackerResult<()> {
    let value = serde_json::to_value(value).map_err(|e| TrackerError::Preferences(e.to_string()))?;
    store.set(key, value)
}

#[derive(Debug, Default)]
pub struct MemoryPreferences {
    data: RwLock<HashMap<String, Value>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> TrackerResult<()> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| TrackerError::Preferences("preference lock poisoned".into()))?;
        guard.insert(key.to_string(), value);
        Ok(())
    }
}

/// Preferences kept in one pretty-printed JSON object on disk, rewritten on every set.
pub struct JsonFilePreferences {
    path: PathBuf,
    data: RwLock<Map<String, Value>>,
}

impl JsonFilePreferences {
    pub fn open(path: PathBuf) -> TrackerResult<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|e| {
                TrackerError::Preferences(format!("failed to read {}: {e}", path.display()))
            })?;
            serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("[prefs] {} is corrupt, starting empty: {}", path.display(), e);
                Map::new()
            })
        } else {
            Map::new()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    fn persist(&self, data: &Map<String, Value>) -> TrackerResult<()> {
        let serialized = serde_json::to_string_pretty(data)
            .map_err(|e| TrackerError::Preferences(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| TrackerError::Preferences(e.to_string()))?;
        }
        fs::write(&self.path, serialized).map_err(|e| {
            TrackerError::Preferences(format!("failed to write {}: {e}", self.path.display()))
        })
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> TrackerResult<()> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| TrackerError::Preferences("preference lock poisoned".into()))?;
        guard.insert(key.to_string(), value);
        self.persist(&guard)
    }
}
