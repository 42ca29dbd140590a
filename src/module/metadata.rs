//! Per-module metadata, keyed by module id.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Last-run record of one module.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleMetadata {
    /// Persisted context of a timer-driven module.
    pub context: Option<Value>,
    /// Fingerprint of the policies a transaction-driven module was
    /// initialized with.
    pub policies_fingerprint: Option<u64>,
    /// Wall-clock end of the last invocation, in ms since the Unix epoch.
    pub last_run_unix_ms: Option<u64>,
    /// Delay chosen after the last invocation.
    pub last_delay_ms: Option<u64>,
    /// Consecutive failed invocations.
    pub consecutive_failures: u32,
}

/// Storage for [`ModuleMetadata`].
///
/// Records are isolated per module id; the runtime never hands one module
/// another module's record.
pub trait MetadataRepository: Send + Sync {
    /// Record of `module_id`, if any.
    fn load(&self, module_id: &str) -> Result<Option<ModuleMetadata>>;

    /// Replaces the record of `module_id`.
    fn store(&self, module_id: &str, metadata: &ModuleMetadata) -> Result<()>;

    /// Deletes the record of `module_id`.
    fn remove(&self, module_id: &str) -> Result<()>;
}

/// Process-local repository; records are lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryMetadataRepository {
    records: RwLock<BTreeMap<String, ModuleMetadata>>,
}

impl InMemoryMetadataRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataRepository for InMemoryMetadataRepository {
    fn load(&self, module_id: &str) -> Result<Option<ModuleMetadata>> {
        Ok(self.records.read().get(module_id).cloned())
    }

    fn store(&self, module_id: &str, metadata: &ModuleMetadata) -> Result<()> {
        self.records
            .write()
            .insert(module_id.to_owned(), metadata.clone());
        Ok(())
    }

    fn remove(&self, module_id: &str) -> Result<()> {
        self.records.write().remove(module_id);
        Ok(())
    }
}

/// Repository persisted as one pretty-printed JSON file.
///
/// Every store rewrites the file through a temporary sibling and a rename,
/// so a crash leaves either the old or the new content.
#[derive(Debug)]
pub struct JsonFileMetadataRepository {
    path: PathBuf,
    records: Mutex<BTreeMap<String, ModuleMetadata>>,
}

impl JsonFileMetadataRepository {
    /// Opens `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let text = fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// File backing this repository.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &BTreeMap<String, ModuleMetadata>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, records)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl MetadataRepository for JsonFileMetadataRepository {
    fn load(&self, module_id: &str) -> Result<Option<ModuleMetadata>> {
        Ok(self.records.lock().get(module_id).cloned())
    }

    fn store(&self, module_id: &str, metadata: &ModuleMetadata) -> Result<()> {
        let mut records = self.records.lock();
        records.insert(module_id.to_owned(), metadata.clone());
        self.persist(&records)
    }

    fn remove(&self, module_id: &str) -> Result<()> {
        let mut records = self.records.lock();
        if records.remove(module_id).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn file_repository_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("modules.json");
        let record = ModuleMetadata {
            context: Some(json!({ "last": 42 })),
            consecutive_failures: 1,
            ..ModuleMetadata::default()
        };
        {
            let repo = JsonFileMetadataRepository::open(&path)?;
            repo.store("pagerank", &record)?;
        }
        let repo = JsonFileMetadataRepository::open(&path)?;
        assert_eq!(repo.load("pagerank")?, Some(record));
        assert_eq!(repo.load("other")?, None);
        repo.remove("pagerank")?;
        assert_eq!(JsonFileMetadataRepository::open(&path)?.load("pagerank")?, None);
        Ok(())
    }

    #[test]
    fn records_are_keyed_by_module() -> Result<()> {
        let repo = InMemoryMetadataRepository::new();
        repo.store("a", &ModuleMetadata::default())?;
        assert!(repo.load("a")?.is_some());
        assert!(repo.load("b")?.is_none());
        Ok(())
    }
}
