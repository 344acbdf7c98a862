//! Append-only outcome ledgers.
//!
//! Each category keeps a line-oriented `.txt` file (written through on every
//! append, one id per line; this is the authoritative record used for crash
//! recovery) and a `.json` array rewritten on periodic flushes and at
//! shutdown. Appends take a short per-category lock and are safe under the
//! concurrent worker pool.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::HarvestError;

/// Outcome categories recorded on disk.
///
/// The first four are terminal: every unit ends in exactly one of them.
/// `Dropped` marks blocked-only units; the transport buckets are per-attempt
/// diagnostics and may repeat an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Successful,
    Failed,
    Exception,
    Blocked,
    Dropped,
    ConnectError,
    TlsError,
    ResetError,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Successful,
        Category::Failed,
        Category::Exception,
        Category::Blocked,
        Category::Dropped,
        Category::ConnectError,
        Category::TlsError,
        Category::ResetError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Successful => "successful",
            Category::Failed => "failed",
            Category::Exception => "exception",
            Category::Blocked => "blocked",
            Category::Dropped => "dropped",
            Category::ConnectError => "connect_error",
            Category::TlsError => "tls_error",
            Category::ResetError => "reset_error",
        }
    }

    fn txt_name(&self) -> String {
        format!("{}_ids.txt", self.as_str())
    }

    fn json_name(&self) -> String {
        format!("{}_ids.json", self.as_str())
    }
}

struct LedgerFile {
    path: PathBuf,
    ids: Vec<String>,
}

pub struct LedgerSet {
    dir: PathBuf,
    files: BTreeMap<Category, Mutex<LedgerFile>>,
}

impl LedgerSet {
    /// Open (creating if needed) the ledger directory and load any ids left
    /// by previous runs, so JSON flushes stay complete across restarts.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, HarvestError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut files = BTreeMap::new();
        for category in Category::ALL {
            let path = dir.join(category.txt_name());
            let ids = load_ids(&path)?;
            files.insert(category, Mutex::new(LedgerFile { path, ids }));
        }

        Ok(Self { dir, files })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn txt_path(&self, category: Category) -> PathBuf {
        self.dir.join(category.txt_name())
    }

    /// Append an id: written through to the txt file immediately.
    pub fn append(&self, category: Category, id: &str) -> Result<(), HarvestError> {
        let mut file = self.files[&category]
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file.path)?;
        writeln!(handle, "{id}")?;
        file.ids.push(id.to_string());
        Ok(())
    }

    /// Ids currently recorded for a category (previous runs included).
    pub fn ids(&self, category: Category) -> Vec<String> {
        self.files[&category]
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .ids
            .clone()
    }

    pub fn count(&self, category: Category) -> usize {
        self.files[&category]
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .ids
            .len()
    }

    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        Category::ALL
            .iter()
            .map(|c| (c.as_str(), self.count(*c)))
            .collect()
    }

    /// Rewrite every category's JSON array variant.
    pub fn flush_json(&self) -> Result<(), HarvestError> {
        for category in Category::ALL {
            let ids = self.ids(category);
            let path = self.dir.join(category.json_name());
            let body = serde_json::to_string_pretty(&ids)?;
            fs::write(path, body)?;
        }
        Ok(())
    }
}

fn load_ids(path: &Path) -> Result<Vec<String>, HarvestError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Per-unit raw dumps of offending response bodies or fault text.
#[derive(Clone)]
pub struct RawDumps {
    dir: PathBuf,
}

impl RawDumps {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, HarvestError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn write(&self, id: &str, text: &str) -> Result<(), HarvestError> {
        let path = self.dir.join(format!("{id}_raw.txt"));
        fs::write(path, text)?;
        Ok(())
    }
}
