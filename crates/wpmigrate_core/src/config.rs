use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TABLE_PREFIX: &str = "wp_";
pub const DEFAULT_ROLE: &str = "subscriber";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrateConfig {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub runs: RunsSection,
    #[serde(default)]
    pub users: UsersSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DatabaseSection {
    pub table_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RunsSection {
    pub durability: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct UsersSection {
    pub default_role: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LoggingSection {
    pub level: Option<String>,
}

/// How hard a processed marker is pushed to disk before the run moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// fsync the ledger file and its directory after every marker.
    #[default]
    Sync,
    /// Atomic rename only; flushing is left to the OS.
    Buffered,
}

impl Durability {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("sync") {
            return Ok(Self::Sync);
        }
        if value.eq_ignore_ascii_case("buffered") {
            return Ok(Self::Buffered);
        }
        bail!("unknown durability mode `{value}` (expected `sync` or `buffered`)")
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Buffered => "buffered",
        }
    }
}

impl MigrateConfig {
    /// Resolve the table prefix: env WPMIGRATE_TABLE_PREFIX > config > DEFAULT_TABLE_PREFIX.
    pub fn table_prefix(&self) -> Result<String> {
        self.table_prefix_with_lookup(|key| env::var(key).ok())
    }

    fn table_prefix_with_lookup<F>(&self, lookup_env: F) -> Result<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = lookup_env("WPMIGRATE_TABLE_PREFIX")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| self.database.table_prefix.clone())
            .unwrap_or_else(|| DEFAULT_TABLE_PREFIX.to_string());
        validate_table_prefix(&prefix)?;
        Ok(prefix)
    }

    pub fn durability(&self) -> Result<Durability> {
        match self.runs.durability.as_deref() {
            Some(value) => Durability::parse(value),
            None => Ok(Durability::default()),
        }
    }

    pub fn default_role(&self) -> String {
        self.users
            .default_role
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_ROLE)
            .to_string()
    }

    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

/// Load and parse a MigrateConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrateConfig> {
    if !config_path.exists() {
        return Ok(MigrateConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrateConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

// Table names are spliced into SQL text, so the prefix must stay identifier-safe.
fn validate_table_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty()
        || !prefix
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        bail!("invalid table prefix `{prefix}`: only ASCII letters, digits and `_` are allowed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, MigrateConfig::default());
        assert_eq!(config.durability().expect("durability"), Durability::Sync);
        assert_eq!(config.default_role(), "subscriber");
        assert_eq!(config.log_level(), "info");
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[database]
table_prefix = "site2_"

[runs]
durability = "buffered"

[users]
default_role = "author"

[logging]
level = "debug"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config
                .table_prefix_with_lookup(|_| None)
                .expect("prefix"),
            "site2_"
        );
        assert_eq!(config.durability().expect("durability"), Durability::Buffered);
        assert_eq!(config.default_role(), "author");
        assert_eq!(config.log_level(), "debug");
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[database\ntable_prefix = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn env_prefix_overrides_config() {
        let config = MigrateConfig {
            database: DatabaseSection {
                table_prefix: Some("cfg_".to_string()),
            },
            ..MigrateConfig::default()
        };
        let env = HashMap::from([("WPMIGRATE_TABLE_PREFIX".to_string(), " env_ ".to_string())]);
        let prefix = config
            .table_prefix_with_lookup(|key| env.get(key).cloned())
            .expect("prefix");
        assert_eq!(prefix, "env_");
    }

    #[test]
    fn rejects_prefix_with_sql_characters() {
        let config = MigrateConfig {
            database: DatabaseSection {
                table_prefix: Some("wp; DROP".to_string()),
            },
            ..MigrateConfig::default()
        };
        assert!(config.table_prefix_with_lookup(|_| None).is_err());
    }

    #[test]
    fn unknown_durability_is_an_error() {
        let error = Durability::parse("eventually").expect_err("must fail");
        assert!(error.to_string().contains("unknown durability mode"));
    }
}
