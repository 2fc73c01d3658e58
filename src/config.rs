use std::env;
use std::path::{Path, PathBuf};

use chrono::{FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::clock::parse_offset;
use crate::db::default_path;
use crate::error::{Error, Result};
use crate::types::WorkerId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Authoritative clock ledger. Defaults to a sibling file of the local
    /// database so a single machine can run both ends.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            ledger_path: default_ledger_path(),
            snapshot: SnapshotConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Reference offset that defines a calendar day, e.g. `+05:30`.
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    /// Local time (in the reference offset) of the daily sweep, `HH:MM`.
    #[serde(default = "default_sweep_at")]
    pub sweep_at: String,
    #[serde(default = "default_note")]
    pub note: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            utc_offset: default_utc_offset(),
            sweep_at: default_sweep_at(),
            note: default_note(),
        }
    }
}

impl SnapshotConfig {
    pub fn offset(&self) -> Result<FixedOffset> {
        parse_offset(&self.utc_offset)
    }

    pub fn sweep_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(self.sweep_at.trim(), "%H:%M")
            .map_err(|err| Error::Config(format!("sweep_at '{}': {err}", self.sweep_at)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Worker this device records clock events for.
    #[serde(default)]
    pub worker: Option<WorkerId>,
}

fn default_db_path() -> PathBuf {
    default_path("sitelog.db")
}

fn default_ledger_path() -> PathBuf {
    default_path("ledger.db")
}

fn default_utc_offset() -> String {
    "+05:30".to_string()
}

fn default_sweep_at() -> String {
    "23:59".to_string()
}

fn default_note() -> String {
    "Daily auto snapshot".to_string()
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sitelog/config.toml"))
}

/// Loads the config file at `path`, or defaults when it does not exist.
pub fn load_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|err| Error::Config(format!("failed to read {}: {err}", path.display())))?;
    parse(&content).map_err(|err| match err {
        Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

pub fn parse(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).map_err(|err| Error::Config(err.to_string()))?;
    config.snapshot.offset()?;
    config.snapshot.sweep_time()?;
    Ok(config)
}

/// Loads the user config and applies `SITELOG_DB` / `SITELOG_LEDGER`.
pub fn load() -> Result<Config> {
    let mut config = match config_path() {
        Some(path) => load_from(&path)?,
        None => Config::default(),
    };
    if let Ok(db) = env::var("SITELOG_DB") {
        config.db_path = PathBuf::from(db);
    }
    if let Ok(ledger) = env::var("SITELOG_LEDGER") {
        config.ledger_path = PathBuf::from(ledger);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.snapshot.utc_offset, "+05:30");
        assert_eq!(config.snapshot.sweep_time().unwrap(), NaiveTime::from_hms_opt(23, 59, 0).unwrap());
        assert_eq!(config.session.worker, None);
    }

    #[test]
    fn sections_override_defaults() {
        let config = parse(
            r#"
            db_path = "/tmp/site.db"

            [snapshot]
            utc_offset = "-03:00"
            sweep_at = "18:00"

            [session]
            worker = 14
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/site.db"));
        assert_eq!(config.snapshot.offset().unwrap().local_minus_utc(), -3 * 3600);
        assert_eq!(config.snapshot.note, "Daily auto snapshot");
        assert_eq!(config.session.worker, Some(14));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        assert!(matches!(parse("[snapshot]\nsweep_at = \"25:00\""), Err(Error::Config(_))));
        assert!(matches!(parse("[snapshot]\nutc_offset = \"IST\""), Err(Error::Config(_))));
        assert!(matches!(parse("db_path = 3"), Err(Error::Config(_))));
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.snapshot.sweep_at, "23:59");
    }
}
