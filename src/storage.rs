//! Persistence of manually created mappings
//!
//! Manual mappings survive restarts through a single JSON file under the data
//! directory. Writes go to a temporary file first and are renamed into place.

use crate::mapping::{MappingKey, Protocol};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// File name of the mapping store inside the data directory
pub const MAPPINGS_FILE: &str = "manual_mappings.json";

/// A manual mapping as persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMapping {
    /// Internal (local) port
    pub internal_port: u16,
    /// Requested external port (0 = any)
    pub external_port: u16,
    /// Transport protocol
    pub protocol: Protocol,
    /// Human readable description
    pub description: String,
    /// When the mapping was first stored
    pub created_at: DateTime<Utc>,
}

impl StoredMapping {
    /// Create a record stamped with the current time
    pub fn new(
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        description: impl Into<String>,
    ) -> Self {
        Self {
            internal_port,
            external_port,
            protocol,
            description: description.into(),
            created_at: Utc::now(),
        }
    }

    /// Identity key
    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.internal_port, self.external_port, self.protocol)
    }
}

/// JSON file store for [`StoredMapping`] records
pub struct MappingStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MappingStore {
    /// Store at `<data_dir>/manual_mappings.json`
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self::at_path(data_dir.as_ref().join(MAPPINGS_FILE))
    }

    /// Store at an explicit file path
    pub fn at_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| Error::Storage("Mapping store lock poisoned".to_string()))
    }

    /// Load every stored mapping
    ///
    /// A missing or empty file yields an empty list. A corrupt file is moved
    /// aside to `*.json.corrupt` and also yields an empty list.
    pub fn load(&self) -> Result<Vec<StoredMapping>> {
        let _guard = self.guard()?;
        self.read()
    }

    fn read(&self) -> Result<Vec<StoredMapping>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Storage(format!("Failed to read mappings: {}", e)))?;
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }

        match serde_json::from_str(&data) {
            Ok(mappings) => Ok(mappings),
            Err(e) => {
                warn!("Corrupt {} ({}), moving it aside", self.path.display(), e);
                let backup = self.path.with_extension("json.corrupt");
                let _ = std::fs::rename(&self.path, &backup);
                Ok(Vec::new())
            }
        }
    }

    /// Replace the stored list
    pub fn save(&self, mappings: &[StoredMapping]) -> Result<()> {
        let _guard = self.guard()?;
        self.write(mappings)
    }

    fn write(&self, mappings: &[StoredMapping]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(mappings)
            .map_err(|e| Error::Storage(format!("Failed to serialize mappings: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| Error::Storage(format!("Failed to write mappings: {}", e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Storage(format!("Failed to replace mappings file: {}", e)))?;

        debug!("Saved {} manual mappings", mappings.len());
        Ok(())
    }

    /// Add a mapping, replacing any record with the same key
    pub fn add(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        description: &str,
    ) -> Result<StoredMapping> {
        let _guard = self.guard()?;
        let mut mappings = self.read()?;
        let record = StoredMapping::new(internal_port, external_port, protocol, description);
        mappings.retain(|m| m.key() != record.key());
        mappings.push(record.clone());
        self.write(&mappings)?;
        Ok(record)
    }

    /// Remove the record with this key
    pub fn remove(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<StoredMapping> {
        let _guard = self.guard()?;
        let mut mappings = self.read()?;
        let key = MappingKey::new(internal_port, external_port, protocol);
        let pos = mappings
            .iter()
            .position(|m| m.key() == key)
            .ok_or_else(|| Error::Storage(format!("Mapping {} not stored", key)))?;
        let removed = mappings.remove(pos);
        self.write(&mappings)?;
        Ok(removed)
    }
}
