//! Persisted control-plane instance records
//!
//! Records are stored in `$KEEL_HOME/config.json` (default `~/.keel/`), one
//! entry per instance keyed by name, plus the name of the current instance.
//! Every operation reads or rewrites the whole document; writes go through a
//! temporary file and a rename so readers never see a half-written file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_common::{ControlPlaneInstanceConfig, Error, Result};

const CONFIG_DIR_NAME: &str = ".keel";
const CONFIG_FILE_NAME: &str = "config.json";

/// Returns the keel home directory, creating it if it doesn't exist.
///
/// `override_dir` (from `--keel-home` / `KEEL_HOME`) wins over `~/.keel`.
pub fn keel_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => dirs::home_dir()
            .ok_or_else(|| {
                Error::internal_with_context("keel_dir", "could not determine home directory")
            })?
            .join(CONFIG_DIR_NAME),
    };
    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("create {}", dir.display()), e))?;
    }
    Ok(dir)
}

/// Read/write access to instance records
///
/// Each call is atomic for a single record.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigStore: Send + Sync {
    /// Look up an instance record by name
    fn get(&self, name: &str) -> Result<Option<ControlPlaneInstanceConfig>>;

    /// All instance records
    fn list(&self) -> Result<Vec<ControlPlaneInstanceConfig>>;

    /// Insert a record, replacing any record with the same name
    fn upsert(&self, config: &ControlPlaneInstanceConfig) -> Result<()>;

    /// Remove a record; returns whether it existed
    fn delete(&self, name: &str) -> Result<bool>;

    /// Name of the instance commands default to
    fn current(&self) -> Result<Option<String>>;

    fn set_current(&self, name: Option<String>) -> Result<()>;
}

/// On-disk layout of the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_instance: Option<String>,
    #[serde(default)]
    instances: Vec<ControlPlaneInstanceConfig>,
}

/// [`ConfigStore`] backed by a JSON file
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<keel dir>/config.json`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<ConfigDocument> {
        if !self.path.exists() {
            return Ok(ConfigDocument::default());
        }
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::io(format!("read {}", self.path.display()), e))?;
        if data.trim().is_empty() {
            return Ok(ConfigDocument::default());
        }
        serde_json::from_str(&data).map_err(|e| {
            Error::serialization(format!("failed to parse {}: {}", self.path.display(), e))
        })
    }

    fn save(&self, doc: &ConfigDocument) -> Result<()> {
        let data = serde_json::to_string_pretty(doc)
            .map_err(|e| Error::serialization(format!("failed to serialize config: {}", e)))?;
        write_atomically(&self.path, data.as_bytes())
    }
}

/// Write `data` to a sibling temp file, then rename it over `path`
pub(crate) fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).map_err(|e| Error::io(format!("write {}", tmp.display()), e))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::io(format!("rename {}", path.display()), e))
}

impl ConfigStore for FileConfigStore {
    fn get(&self, name: &str) -> Result<Option<ControlPlaneInstanceConfig>> {
        Ok(self.load()?.instances.into_iter().find(|c| c.name == name))
    }

    fn list(&self) -> Result<Vec<ControlPlaneInstanceConfig>> {
        Ok(self.load()?.instances)
    }

    fn upsert(&self, config: &ControlPlaneInstanceConfig) -> Result<()> {
        let mut doc = self.load()?;
        match doc.instances.iter_mut().find(|c| c.name == config.name) {
            Some(existing) => *existing = config.clone(),
            None => doc.instances.push(config.clone()),
        }
        self.save(&doc)?;
        debug!(instance = %config.name, path = %self.path.display(), "saved instance config");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let mut doc = self.load()?;
        let before = doc.instances.len();
        doc.instances.retain(|c| c.name != name);
        let removed = doc.instances.len() != before;
        if doc.current_instance.as_deref() == Some(name) {
            doc.current_instance = None;
        }
        self.save(&doc)?;
        Ok(removed)
    }

    fn current(&self) -> Result<Option<String>> {
        Ok(self.load()?.current_instance)
    }

    fn set_current(&self, name: Option<String>) -> Result<()> {
        let mut doc = self.load()?;
        doc.current_instance = name;
        self.save(&doc)
    }
}
