use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::Durability;
use crate::ledger::RunLedger;
use crate::object::MigrationObject;
use crate::runtime::source_location;

/// Where pending migration objects come from.
pub trait MigrationObjectSource {
    fn run_key(&self) -> &str;

    /// Stable identity of the input, used to scope markers kept outside the source.
    fn source_key(&self) -> &str;

    /// Number of objects in the source, processed or not.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_processed(&self, object_id: &str) -> bool;

    /// Objects without a processed marker, in source order.
    fn get_unprocessed(&self) -> Vec<MigrationObject>;

    /// Persists the processed marker for `object`. Must be durable on return.
    fn store_processed_marker(&mut self, object: &MigrationObject) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    /// Field holding each record's identifier; records are keyed by 1-based position when unset.
    pub id_field: Option<String>,
    pub durability: Durability,
}

/// A JSON array of records on disk plus the run ledger that tracks processed markers.
#[derive(Debug)]
pub struct JsonObjectSource {
    input_path: PathBuf,
    location: String,
    source_sha256: String,
    objects: Vec<MigrationObject>,
    object_ids: HashSet<String>,
    ledger: RunLedger,
    source_changed: bool,
}

impl JsonObjectSource {
    pub fn load(
        input_path: &Path,
        ledger_path: &Path,
        run_key: &str,
        options: &SourceOptions,
    ) -> Result<Self> {
        let run_key = run_key.trim();
        if run_key.is_empty() {
            bail!("run key must not be empty");
        }

        let bytes = fs::read(input_path)
            .with_context(|| format!("failed to read input {}", input_path.display()))?;
        let source_sha256 = sha256_hex(&bytes);
        let objects = parse_objects(&bytes, input_path, options.id_field.as_deref())?;

        // Ledgers are bound to the input's canonical location, so a ledger
        // written for another file with the same name is refused here.
        let location = source_location(input_path);
        let ledger = RunLedger::load_or_new(
            ledger_path,
            run_key,
            &location,
            &source_sha256,
            options.durability,
        )?;

        let source_changed = !ledger.entries.is_empty() && ledger.source_sha256 != source_sha256;
        if source_changed {
            log::warn!(
                "input {} changed since run `{run_key}` last recorded progress; processed markers are matched by object id",
                input_path.display()
            );
        }

        let object_ids: HashSet<String> = objects
            .iter()
            .map(|object| object.id().to_string())
            .collect();
        let stale = ledger
            .entries
            .iter()
            .filter(|entry| !object_ids.contains(&entry.object_id))
            .count();
        if stale > 0 {
            log::warn!(
                "run `{run_key}` has {stale} processed marker(s) for objects no longer present in {}",
                input_path.display()
            );
        }

        Ok(Self {
            input_path: input_path.to_path_buf(),
            location,
            source_sha256,
            objects,
            object_ids,
            ledger,
            source_changed,
        })
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    /// Canonical location recorded in the ledger.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn ledger_path(&self) -> &Path {
        self.ledger.path()
    }

    pub fn source_sha256(&self) -> &str {
        &self.source_sha256
    }

    /// True when markers exist that were recorded against a different version of the input.
    pub fn source_changed(&self) -> bool {
        self.source_changed
    }

    pub fn objects(&self) -> &[MigrationObject] {
        &self.objects
    }

    pub fn processed_count(&self) -> usize {
        self.objects
            .iter()
            .filter(|object| self.ledger.is_processed(object.id()))
            .count()
    }

    /// Removes the marker for `object_id`, or every marker when `None`.
    /// Returns how many markers were dropped.
    pub fn reset_markers(&mut self, object_id: Option<&str>) -> Result<usize> {
        match object_id {
            Some(object_id) => {
                let removed = self.ledger.remove_entry(object_id)?;
                if !removed && !self.object_ids.contains(object_id) {
                    bail!(
                        "object {object_id} is not present in {}",
                        self.input_path.display()
                    );
                }
                Ok(usize::from(removed))
            }
            None => {
                let count = self.ledger.clear()?;
                self.ledger.set_source_sha256(&self.source_sha256);
                self.source_changed = false;
                Ok(count)
            }
        }
    }
}

impl MigrationObjectSource for JsonObjectSource {
    fn run_key(&self) -> &str {
        &self.ledger.run_key
    }

    fn source_key(&self) -> &str {
        &self.location
    }

    fn len(&self) -> usize {
        self.objects.len()
    }

    fn is_processed(&self, object_id: &str) -> bool {
        self.ledger.is_processed(object_id)
    }

    fn get_unprocessed(&self) -> Vec<MigrationObject> {
        let processed = self.ledger.processed_ids();
        self.objects
            .iter()
            .filter(|object| !processed.contains(object.id()))
            .cloned()
            .collect()
    }

    fn store_processed_marker(&mut self, object: &MigrationObject) -> Result<()> {
        if !self.object_ids.contains(object.id()) {
            bail!(
                "object {} does not belong to {}",
                object.id(),
                self.input_path.display()
            );
        }
        self.ledger.set_source_sha256(&self.source_sha256);
        self.ledger.mark_processed(object).with_context(|| {
            format!(
                "failed to persist processed marker for object {}",
                object.id()
            )
        })
    }
}

fn parse_objects(
    bytes: &[u8],
    input_path: &Path,
    id_field: Option<&str>,
) -> Result<Vec<MigrationObject>> {
    let value: Value = serde_json::from_slice(bytes)
        .with_context(|| format!("failed to parse {} as JSON", input_path.display()))?;
    let Value::Array(records) = value else {
        bail!(
            "{} must contain a JSON array of records",
            input_path.display()
        );
    };

    let mut seen = HashSet::new();
    let mut objects = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let position = index + 1;
        let Value::Object(fields) = record else {
            bail!(
                "record {position} in {} is not a JSON object",
                input_path.display()
            );
        };

        let id = match id_field {
            Some(field) => match fields.get(field) {
                Some(Value::String(text)) if !text.trim().is_empty() => text.trim().to_string(),
                Some(Value::Number(number)) => number.to_string(),
                _ => bail!(
                    "record {position} in {} has no usable `{field}` identifier",
                    input_path.display()
                ),
            },
            None => position.to_string(),
        };

        if !seen.insert(id.clone()) {
            bail!(
                "duplicate object id `{id}` at record {position} in {}",
                input_path.display()
            );
        }
        objects.push(MigrationObject::new(id, position, fields));
    }
    Ok(objects)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
