//! # Device Identity
//!
//! Stable per-installation device identifier.
//!
//! The identifier is looked up in an `IdentityStore` and minted on first use.
//! Storage failures never stop tracking: the provider falls back to an
//! ephemeral identifier for the rest of the process.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, UplinkError};

/// Store key holding the device identifier
pub const DEVICE_ID_KEY: &str = "device_id";

/// Durable key/value storage for identifiers
pub trait IdentityStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// JSON file backed store.
///
/// Each write replaces the file via a temporary sibling and `rename`, so
/// readers see either the old or the new contents, never a partial write.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(UplinkError::IdentityUnavailable(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl IdentityStore for FileIdentityStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| UplinkError::IdentityUnavailable("identity store poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| UplinkError::IdentityUnavailable("identity store poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Resolved device identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    /// False when the store was unavailable and the id lives only for this run
    pub persisted: bool,
}

/// Get-or-create access to the device identity.
///
/// Resolution happens once per provider under a single lock; every caller
/// afterwards gets the same value.
pub struct IdentityProvider {
    store: Arc<dyn IdentityStore>,
    resolved: Mutex<Option<DeviceIdentity>>,
}

impl std::fmt::Debug for IdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityProvider").finish_non_exhaustive()
    }
}

impl IdentityProvider {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self {
            store,
            resolved: Mutex::new(None),
        }
    }

    /// Return the device identity, minting and persisting it on first use
    pub fn device_identity(&self) -> DeviceIdentity {
        let mut resolved = match self.resolved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(identity) = resolved.as_ref() {
            return identity.clone();
        }

        let identity = self.resolve();
        *resolved = Some(identity.clone());
        identity
    }

    fn resolve(&self) -> DeviceIdentity {
        match self.store.get(DEVICE_ID_KEY) {
            Ok(Some(device_id)) if !device_id.is_empty() => {
                return DeviceIdentity { device_id, persisted: true };
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Device identity lookup failed, using ephemeral id: {}", e);
                return Self::ephemeral();
            }
        }

        let device_id = Uuid::new_v4().to_string();
        match self.store.set(DEVICE_ID_KEY, &device_id) {
            Ok(()) => {
                info!("Created device identity {}", device_id);
                DeviceIdentity { device_id, persisted: true }
            }
            Err(e) => {
                warn!("Device identity could not be persisted, using ephemeral id: {}", e);
                DeviceIdentity { device_id, persisted: false }
            }
        }
    }

    fn ephemeral() -> DeviceIdentity {
        DeviceIdentity {
            device_id: Uuid::new_v4().to_string(),
            persisted: false,
        }
    }
}
