use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::Durability;
use crate::object::{MigrationObject, SourceAnnotation};

pub const LEDGER_VERSION: u32 = 1;
pub const LEDGER_SUFFIX: &str = ".ledger.json";

/// One processed marker plus the provenance recorded while producing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub object_id: String,
    pub processed_at_unix: i64,
    #[serde(default)]
    pub sources: Vec<SourceAnnotation>,
}

/// Persisted processed-marker state for one input file under one run key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLedger {
    pub version: u32,
    pub run_key: String,
    pub source_path: String,
    pub source_sha256: String,
    pub created_at_unix: i64,
    pub updated_at_unix: i64,
    #[serde(default)]
    pub entries: Vec<LedgerEntry>,
    #[serde(skip)]
    path: PathBuf,
    #[serde(skip)]
    durability: Durability,
    #[serde(skip)]
    index: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerSummary {
    pub path: PathBuf,
    pub run_key: String,
    pub source_path: String,
    pub processed: usize,
    pub updated_at_unix: i64,
}

impl RunLedger {
    /// Reads an existing ledger; `None` when nothing has been processed yet.
    pub fn load(path: &Path, durability: Durability) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read run ledger {}", path.display()))?;
        let mut ledger: RunLedger = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse run ledger {}", path.display()))?;
        if ledger.version != LEDGER_VERSION {
            bail!(
                "unsupported run ledger version {} in {} (expected {LEDGER_VERSION})",
                ledger.version,
                path.display()
            );
        }
        ledger.path = path.to_path_buf();
        ledger.durability = durability;
        ledger.index = ledger
            .entries
            .iter()
            .map(|entry| entry.object_id.clone())
            .collect();
        Ok(Some(ledger))
    }

    pub fn load_or_new(
        path: &Path,
        run_key: &str,
        source_path: &str,
        source_sha256: &str,
        durability: Durability,
    ) -> Result<Self> {
        if let Some(ledger) = Self::load(path, durability)? {
            if ledger.run_key != run_key {
                bail!(
                    "run ledger {} belongs to run `{}`, not `{run_key}`",
                    path.display(),
                    ledger.run_key
                );
            }
            if ledger.source_path != source_path {
                bail!(
                    "run ledger {} tracks input `{}`, not `{source_path}`",
                    path.display(),
                    ledger.source_path
                );
            }
            return Ok(ledger);
        }

        let now = unix_timestamp()?;
        Ok(Self {
            version: LEDGER_VERSION,
            run_key: run_key.to_string(),
            source_path: source_path.to_string(),
            source_sha256: source_sha256.to_string(),
            created_at_unix: now,
            updated_at_unix: now,
            entries: Vec::new(),
            path: path.to_path_buf(),
            durability,
            index: HashSet::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_processed(&self, object_id: &str) -> bool {
        self.index.contains(object_id)
    }

    pub fn processed_ids(&self) -> BTreeSet<&str> {
        self.entries
            .iter()
            .map(|entry| entry.object_id.as_str())
            .collect()
    }

    /// Appends the marker for `object` and persists the ledger before returning.
    /// When the write fails the in-memory state is left as it was.
    pub fn mark_processed(&mut self, object: &MigrationObject) -> Result<()> {
        if self.is_processed(object.id()) {
            bail!(
                "object {} is already marked processed in {}",
                object.id(),
                self.path.display()
            );
        }
        let now = unix_timestamp()?;
        let previous_updated_at = self.updated_at_unix;
        self.entries.push(LedgerEntry {
            object_id: object.id().to_string(),
            processed_at_unix: now,
            sources: object.sources().to_vec(),
        });
        self.updated_at_unix = now;
        if let Err(err) = self.save() {
            self.entries.pop();
            self.updated_at_unix = previous_updated_at;
            return Err(err);
        }
        self.index.insert(object.id().to_string());
        Ok(())
    }

    /// Drops one marker. Returns `false` when the object was not marked.
    pub fn remove_entry(&mut self, object_id: &str) -> Result<bool> {
        if !self.index.remove(object_id) {
            return Ok(false);
        }
        self.entries.retain(|entry| entry.object_id != object_id);
        self.updated_at_unix = unix_timestamp()?;
        self.save()?;
        Ok(true)
    }

    /// Deletes the ledger file and forgets every marker. Returns how many were dropped.
    pub fn clear(&mut self) -> Result<usize> {
        let count = self.entries.len();
        clear_ledger(&self.path)?;
        self.entries.clear();
        self.index.clear();
        Ok(count)
    }

    /// Re-stamps the input hash after the operator accepted a changed input file.
    pub fn set_source_sha256(&mut self, source_sha256: &str) {
        self.source_sha256 = source_sha256.to_string();
    }

    pub fn save(&self) -> Result<()> {
        let rendered =
            serde_json::to_string_pretty(self).context("failed to serialize run ledger")?;
        write_atomically(&self.path, rendered.as_bytes(), self.durability)
    }
}

/// Deletes the ledger file. Returns `false` when there was nothing to delete.
pub fn clear_ledger(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(path)
        .with_context(|| format!("failed to remove run ledger {}", path.display()))?;
    Ok(true)
}

pub fn list_ledgers(runs_dir: &Path) -> Result<Vec<LedgerSummary>> {
    if !runs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for entry in WalkDir::new(runs_dir) {
        let entry = entry.with_context(|| format!("failed to walk {}", runs_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_ledger = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(LEDGER_SUFFIX));
        if !is_ledger {
            continue;
        }
        let Some(ledger) = RunLedger::load(entry.path(), Durability::Buffered)? else {
            continue;
        };
        out.push(LedgerSummary {
            path: entry.path().to_path_buf(),
            run_key: ledger.run_key,
            source_path: ledger.source_path,
            processed: ledger.entries.len(),
            updated_at_unix: ledger.updated_at_unix,
        });
    }

    out.sort_by(|left, right| {
        left.run_key
            .cmp(&right.run_key)
            .then_with(|| left.path.cmp(&right.path))
    });
    Ok(out)
}

// Write to a sibling temp file and rename over the target, so readers only ever
// see the previous or the next complete ledger.
fn write_atomically(path: &Path, content: &[u8], durability: Durability) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("ledger path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create ledger directory {}", parent.display()))?;

    let mut temp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = parent.join(temp_name);

    let mut file = File::create(&temp_path)
        .with_context(|| format!("failed to create {}", temp_path.display()))?;
    file.write_all(content)
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", temp_path.display()))?;
    if durability == Durability::Sync {
        file.sync_all()
            .with_context(|| format!("failed to sync {}", temp_path.display()))?;
    }
    drop(file);

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            temp_path.display(),
            path.display()
        )
    })?;

    if durability == Durability::Sync {
        sync_directory(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .with_context(|| format!("failed to sync directory {}", dir.display()))
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> Result<()> {
    Ok(())
}

fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}
