//! On-disk resource inventory
//!
//! Cloud providers report each resource as they create it. The latest
//! snapshot is written to `inventory-<instance>.json` in the keel home so a
//! later deletion knows what to tear down, even if this process dies halfway
//! through provisioning. The payload is opaque to everything but the
//! provider that wrote it.

use std::path::{Path, PathBuf};

use serde_json::Value;

use keel_common::{Error, Result};

use crate::store::write_atomically;

/// The inventory file of one control-plane instance
#[derive(Debug, Clone)]
pub struct InventoryFile {
    path: PathBuf,
}

impl InventoryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/inventory-<instance>.json`
    pub fn for_instance(dir: &Path, instance: &str) -> Self {
        Self::new(dir.join(format!("inventory-{}.json", instance)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored snapshot
    pub fn write(&self, snapshot: &Value) -> Result<()> {
        let data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| Error::serialization(format!("failed to serialize inventory: {}", e)))?;
        write_atomically(&self.path, &data)
    }

    /// The last durably written snapshot
    ///
    /// A missing file means nothing was recorded and yields `None`; a file
    /// that exists but can't be read or parsed is an error.
    pub fn read(&self) -> Result<Option<Value>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(format!("read {}", self.path.display()), e)),
        };
        serde_json::from_str(&data).map(Some).map_err(|e| {
            Error::serialization(format!(
                "inventory {} is corrupt: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Delete the file; a missing file is not an error
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("remove {}", self.path.display()), e)),
        }
    }
}
