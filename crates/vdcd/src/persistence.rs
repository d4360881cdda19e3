//! Crash-safe YAML persistence with shadow backup.
//!
//! One file, three sections keyed by canonical dSUID: `host`, `connectors`,
//! `devices`. Devices carry a back-reference to their connector. Every save
//! follows the same dance:
//!
//! 1. take the store lock,
//! 2. copy the current file (if any) to `<path>.bak`,
//! 3. serialize to a temp file in the same directory,
//! 4. atomically rename over the target.
//!
//! The temp file lives next to the target so the rename never crosses a
//! filesystem. On load the primary is tried first, then the backup; only a
//! double failure surfaces. Internal (auto-)saves swallow I/O errors and keep
//! the in-memory state — the next save retries; [`Store::flush`] reports.
//!
//! Legacy files stored some device keys as stringified singleton lists
//! (`"['ABC…']"`); the loader rewrites those to canonical form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use vdcproto::{DsUid, PropertyMap, PropertyValue};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to parse {path}: {message} (backup also unusable: {backup_message})")]
    Unreadable {
        path: PathBuf,
        message: String,
        backup_message: String,
    },

    #[error("failed to serialize store: {0}")]
    Serialize(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    host: PropertyMap,
    #[serde(default)]
    connectors: BTreeMap<String, PropertyMap>,
    #[serde(default)]
    devices: BTreeMap<String, PropertyMap>,
}

struct Inner {
    path: PathBuf,
    backup_path: PathBuf,
    auto_save: bool,
    data: Mutex<StoreData>,
}

/// Handle to the persistent store. Cheap to clone; all clones share the same
/// lock and file.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// Open a store, loading the file when it exists. Parse failure falls
    /// back to the `.bak` shadow copy; only a double failure errors.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with(path, true)
    }

    pub fn open_with(path: impl Into<PathBuf>, auto_save: bool) -> Result<Self, StoreError> {
        let path = path.into();
        let backup_path = backup_path_for(&path);

        let data = if path.exists() {
            load(&path, &backup_path)?
        } else {
            info!(path = %path.display(), "creating new persistence store");
            StoreData::default()
        };

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                backup_path,
                auto_save,
                data: Mutex::new(data),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    // --- host section ---

    pub fn host_properties(&self) -> PropertyMap {
        self.inner.data.lock().unwrap().host.clone()
    }

    pub fn set_host(&self, properties: PropertyMap) {
        {
            let mut data = self.inner.data.lock().unwrap();
            data.host = properties;
        }
        self.auto_save();
    }

    // --- connector section ---

    pub fn connector(&self, dsuid: &DsUid) -> Option<PropertyMap> {
        self.inner
            .data
            .lock()
            .unwrap()
            .connectors
            .get(&dsuid.to_hex())
            .cloned()
    }

    pub fn all_connectors(&self) -> BTreeMap<String, PropertyMap> {
        self.inner.data.lock().unwrap().connectors.clone()
    }

    pub fn set_connector(&self, dsuid: &DsUid, properties: PropertyMap) {
        {
            let mut data = self.inner.data.lock().unwrap();
            data.connectors.insert(dsuid.to_hex(), properties);
        }
        self.auto_save();
    }

    /// Remove a connector and cascade-remove every device that references it.
    pub fn remove_connector(&self, dsuid: &DsUid) -> bool {
        let removed = {
            let mut data = self.inner.data.lock().unwrap();
            let key = dsuid.to_hex();
            let removed = data.connectors.remove(&key).is_some();
            if removed {
                data.devices.retain(|_, device| {
                    device
                        .get("connector")
                        .and_then(|v| v.as_str())
                        .map(|c| c != key)
                        .unwrap_or(true)
                });
            }
            removed
        };
        if removed {
            self.auto_save();
        }
        removed
    }

    // --- device section ---

    pub fn device(&self, dsuid: &DsUid) -> Option<PropertyMap> {
        self.inner
            .data
            .lock()
            .unwrap()
            .devices
            .get(&dsuid.to_hex())
            .cloned()
    }

    pub fn all_devices(&self) -> BTreeMap<String, PropertyMap> {
        self.inner.data.lock().unwrap().devices.clone()
    }

    /// Devices belonging to one connector, by back-reference.
    pub fn devices_for_connector(&self, connector: &DsUid) -> BTreeMap<String, PropertyMap> {
        let key = connector.to_hex();
        self.inner
            .data
            .lock()
            .unwrap()
            .devices
            .iter()
            .filter(|(_, device)| {
                device.get("connector").and_then(|v| v.as_str()) == Some(key.as_str())
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Store a device's serialized form, stamping the connector back-ref.
    pub fn set_device(&self, dsuid: &DsUid, connector: &DsUid, mut properties: PropertyMap) {
        properties.insert("connector".into(), connector.to_hex().into());
        {
            let mut data = self.inner.data.lock().unwrap();
            data.devices.insert(dsuid.to_hex(), properties);
        }
        self.auto_save();
    }

    pub fn remove_device(&self, dsuid: &DsUid) -> bool {
        let removed = {
            let mut data = self.inner.data.lock().unwrap();
            data.devices.remove(&dsuid.to_hex()).is_some()
        };
        if removed {
            self.auto_save();
        }
        removed
    }

    /// Fine-grained update of one dotted path inside a device's map,
    /// creating intermediate maps as needed.
    pub fn update_device_property(&self, dsuid: &DsUid, path: &str, value: PropertyValue) {
        {
            let mut data = self.inner.data.lock().unwrap();
            let map = data.devices.entry(dsuid.to_hex()).or_default();
            let mut root = PropertyValue::Map(std::mem::take(map));
            if !root.set_path(path, value) {
                warn!(dsuid = %dsuid, path, "device property path blocked by non-map node");
            }
            if let PropertyValue::Map(m) = root {
                *map = m;
            }
        }
        self.auto_save();
    }

    // --- saving ---

    fn auto_save(&self) {
        if !self.inner.auto_save {
            return;
        }
        if let Err(e) = self.save_now() {
            // Keep in-memory state; the next save retries.
            error!(error = %e, "persistence save failed");
        }
    }

    /// Explicit flush, reporting failure to the caller.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.save_now()
    }

    fn save_now(&self) -> Result<(), StoreError> {
        let data = self.inner.data.lock().unwrap();

        if self.inner.path.exists() {
            if let Err(e) = std::fs::copy(&self.inner.path, &self.inner.backup_path) {
                warn!(error = %e, "failed to refresh shadow backup");
            }
        }

        let dir = self
            .inner
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Write {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|source| StoreError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
        serde_yaml::to_writer(&mut temp, &*data).map_err(|e| StoreError::Serialize(e.to_string()))?;

        temp.persist(&self.inner.path)
            .map_err(|e| StoreError::Write {
                path: self.inner.path.clone(),
                source: e.error,
            })?;

        debug!(path = %self.inner.path.display(), "persistence saved");
        Ok(())
    }
}

fn backup_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".bak");
    PathBuf::from(os)
}

fn load(path: &Path, backup_path: &Path) -> Result<StoreData, StoreError> {
    match load_one(path) {
        Ok(data) => Ok(data),
        Err(primary_err) => {
            error!(path = %path.display(), error = %primary_err, "persistence load failed");
            if backup_path.exists() {
                info!(path = %backup_path.display(), "attempting restore from backup");
                match load_one(backup_path) {
                    Ok(data) => {
                        info!("restored persistence from backup");
                        Ok(data)
                    }
                    Err(backup_err) => Err(StoreError::Unreadable {
                        path: path.to_path_buf(),
                        message: primary_err,
                        backup_message: backup_err,
                    }),
                }
            } else {
                Err(StoreError::Unreadable {
                    path: path.to_path_buf(),
                    message: primary_err,
                    backup_message: "no backup file".to_string(),
                })
            }
        }
    }
}

fn load_one(path: &Path) -> Result<StoreData, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut data: StoreData = serde_yaml::from_str(&text).map_err(|e| e.to_string())?;
    data.connectors = canonicalize_keys(std::mem::take(&mut data.connectors));
    data.devices = canonicalize_keys(std::mem::take(&mut data.devices));
    Ok(data)
}

/// Rewrite section keys to canonical dSUID form, merging entries that map to
/// the same canonical key (later entries win per-field).
fn canonicalize_keys(section: BTreeMap<String, PropertyMap>) -> BTreeMap<String, PropertyMap> {
    let mut out: BTreeMap<String, PropertyMap> = BTreeMap::new();
    for (raw, map) in section {
        let key = canonicalize_key(&raw);
        match out.get_mut(&key) {
            Some(existing) => existing.extend(map),
            None => {
                out.insert(key, map);
            }
        }
    }
    out
}

/// Canonical key form: separators stripped, uppercased. Unwraps the legacy
/// stringified-singleton-list artifact (`"['ABC']"`).
fn canonicalize_key(raw: &str) -> String {
    let mut s = raw.trim();
    if s.starts_with('[') && s.ends_with(']') {
        let inner = s[1..s.len() - 1].trim();
        s = inner
            .strip_prefix('\'')
            .and_then(|i| i.strip_suffix('\''))
            .or_else(|| inner.strip_prefix('"').and_then(|i| i.strip_suffix('"')))
            .unwrap_or(inner);
    }
    s.chars()
        .filter(|c| *c != '-' && *c != ':')
        .collect::<String>()
        .to_uppercase()
}
