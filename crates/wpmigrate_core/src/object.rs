use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a value produced by a transform landed, and which input field it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceAnnotation {
    pub table: String,
    pub column: String,
    pub id: i64,
    pub source_field: String,
}

/// One input record slated for migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationObject {
    id: String,
    position: usize,
    fields: Map<String, Value>,
    sources: Vec<SourceAnnotation>,
}

impl MigrationObject {
    pub fn new(id: impl Into<String>, position: usize, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            position,
            fields,
            sources: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 1-based position in the input file.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Trimmed string value; empty strings and non-strings read as absent.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn require_str(&self, field: &str) -> Result<&str> {
        self.get_str(field)
            .ok_or_else(|| anyhow!("object {} is missing required field `{field}`", self.id))
    }

    /// Integer value; numeric strings such as `"42"` are accepted.
    pub fn get_i64(&self, field: &str) -> Option<i64> {
        match self.fields.get(field)? {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn require_i64(&self, field: &str) -> Result<i64> {
        self.get_i64(field).ok_or_else(|| {
            anyhow!(
                "object {} is missing required integer field `{field}`",
                self.id
            )
        })
    }

    /// Boolean flag. Absent or `null` is `None`; a value that is present but
    /// not a recognizable boolean is an error rather than a silent default.
    pub fn get_bool(&self, field: &str) -> Result<Option<bool>> {
        let parsed = match self.fields.get(field) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Bool(flag)) => Some(*flag),
            Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            Some(Value::Number(number)) => match number.as_i64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            Some(_) => None,
        };
        match parsed {
            Some(flag) => Ok(Some(flag)),
            None => Err(anyhow!(
                "object {} has invalid boolean field `{field}`: {}",
                self.id,
                self.fields.get(field).map(Value::to_string).unwrap_or_default()
            )),
        }
    }

    pub fn record_source(
        &mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        id: i64,
        source_field: impl Into<String>,
    ) {
        self.sources.push(SourceAnnotation {
            table: table.into(),
            column: column.into(),
            id,
            source_field: source_field.into(),
        });
    }

    pub fn sources(&self) -> &[SourceAnnotation] {
        &self.sources
    }

    pub(crate) fn clear_sources(&mut self) {
        self.sources.clear();
    }
}
