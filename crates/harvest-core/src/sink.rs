//! Record persistence.
//!
//! The engine treats payloads as opaque JSON text: one record per unit id,
//! upsert semantics so re-attempts cannot corrupt. The embedded-database
//! implementation lives in its own crate; this module provides the trait,
//! the per-record file sink, and the combinators.

use std::collections::HashSet;
use std::fs;
use std::future::Future;
use std::path::PathBuf;

use crate::error::HarvestError;

/// Persists one raw JSON document per unit id.
pub trait RecordStore: Send + Sync + Clone {
    /// Insert or replace the record for `id`.
    fn put(&self, id: &str, json: &str) -> impl Future<Output = Result<(), HarvestError>> + Send;

    /// Fetch a record back (diagnostics and tests).
    fn get(&self, id: &str)
    -> impl Future<Output = Result<Option<String>, HarvestError>> + Send;

    /// Number of records currently stored.
    fn count(&self) -> impl Future<Output = Result<u64, HarvestError>> + Send;
}

/// One file per record under a directory, named by substituting the unit id
/// into a template (`"{id}.json"`, `"dump-page-{id}-5000.json"`, …).
#[derive(Clone)]
pub struct FileStore {
    dir: PathBuf,
    template: String,
}

impl FileStore {
    const ID_SLOT: &'static str = "{id}";

    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, HarvestError> {
        Self::with_template(dir, format!("{}.json", Self::ID_SLOT))
    }

    pub fn with_template(
        dir: impl Into<PathBuf>,
        template: impl Into<String>,
    ) -> Result<Self, HarvestError> {
        let dir = dir.into();
        let template = template.into();
        if !template.contains(Self::ID_SLOT) {
            return Err(HarvestError::Config(format!(
                "file template '{template}' has no {} slot",
                Self::ID_SLOT
            )));
        }
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, template })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(self.template.replace(Self::ID_SLOT, id))
    }

    /// Unit ids already written to this directory under the current template.
    /// Used by the page stage to resume past completed pages even when the
    /// successful ledger is missing.
    pub fn existing_ids(&self) -> Result<HashSet<String>, HarvestError> {
        let (prefix, suffix) = self
            .template
            .split_once(Self::ID_SLOT)
            .unwrap_or(("", ""));
        let mut ids = HashSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(stripped) = name.strip_prefix(prefix)
                && let Some(id) = stripped.strip_suffix(suffix)
                && !id.is_empty()
            {
                ids.insert(id.to_string());
            }
        }
        Ok(ids)
    }
}

impl RecordStore for FileStore {
    async fn put(&self, id: &str, json: &str) -> Result<(), HarvestError> {
        fs::write(self.path_for(id), json)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<String>, HarvestError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    async fn count(&self) -> Result<u64, HarvestError> {
        Ok(self.existing_ids()?.len() as u64)
    }
}

/// Writes every record to both stores (database plus per-record files).
/// The primary store is authoritative for reads.
#[derive(Clone)]
pub struct DualStore<A, B> {
    primary: A,
    secondary: B,
}

impl<A: RecordStore, B: RecordStore> DualStore<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }
}

impl<A: RecordStore, B: RecordStore> RecordStore for DualStore<A, B> {
    async fn put(&self, id: &str, json: &str) -> Result<(), HarvestError> {
        self.primary.put(id, json).await?;
        self.secondary.put(id, json).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<String>, HarvestError> {
        self.primary.get(id).await
    }

    async fn count(&self) -> Result<u64, HarvestError> {
        self.primary.count().await
    }
}

/// Discards everything. Dry runs and tests that only care about ledgers.
#[derive(Clone, Copy, Default)]
pub struct NullStore;

impl RecordStore for NullStore {
    async fn put(&self, _id: &str, _json: &str) -> Result<(), HarvestError> {
        Ok(())
    }

    async fn get(&self, _id: &str) -> Result<Option<String>, HarvestError> {
        Ok(None)
    }

    async fn count(&self) -> Result<u64, HarvestError> {
        Ok(0)
    }
}
