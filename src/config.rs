//! Configuration loading for orchestra-relay.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable overriding the relay home directory.
pub const HOME_ENV: &str = "ORCHESTRA_RELAY_HOME";

/// Get the relay home directory (`$ORCHESTRA_RELAY_HOME` or ~/.orchestra-relay).
pub fn get_home_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }

    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".orchestra-relay"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from the relay home directory.
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_home_dir()?)
}

/// Load `settings.json` under `home`. A missing file yields defaults.
pub fn load_settings_from(home: &Path) -> Result<Settings> {
    let path = home.join("settings.json");

    let mut settings: Settings = if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content)?
    } else {
        Settings::default()
    };

    settings.resolve_paths(home);
    validate_settings(&settings)?;
    Ok(settings)
}

/// Write settings as pretty JSON to `home/settings.json`.
pub fn save_settings(settings: &Settings, home: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(home)?;
    let path = home.join("settings.json");
    std::fs::write(&path, serde_json::to_string_pretty(settings)?)?;
    Ok(path)
}

/// Upper bound for retention periods (100 years).
const MAX_RETENTION_DAYS: u32 = 36_500;

/// Upper bound for stale retry metadata (one year).
const MAX_STALE_RETRY_HOURS: u32 = 8_760;

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.actor.trim().is_empty() {
        return Err(Error::Config("actor must not be empty".to_string()));
    }
    if settings.maintenance.interval_seconds == 0 {
        return Err(Error::Config(
            "maintenance.interval_seconds must be greater than 0".to_string(),
        ));
    }
    for (name, days) in [
        ("retention.message_days", settings.retention.message_days),
        ("retention.audit_days", settings.retention.audit_days),
    ] {
        if days == 0 || days > MAX_RETENTION_DAYS {
            return Err(Error::Config(format!(
                "{} must be between 1 and {}",
                name, MAX_RETENTION_DAYS
            )));
        }
    }
    if settings.maintenance.stale_retry_hours == 0
        || settings.maintenance.stale_retry_hours > MAX_STALE_RETRY_HOURS
    {
        return Err(Error::Config(format!(
            "maintenance.stale_retry_hours must be between 1 and {}",
            MAX_STALE_RETRY_HOURS
        )));
    }
    Ok(())
}

/// Routing policy.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Routing {
    /// Reject envelopes whose sender and recipient the registry cannot route.
    #[serde(default)]
    pub enforce_registry: bool,
    /// Treat rule warnings as rejections.
    #[serde(default)]
    pub reject_warnings: bool,
}

/// Retention periods, in days.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Retention {
    #[serde(default = "default_message_days")]
    pub message_days: u32,
    #[serde(default = "default_audit_days")]
    pub audit_days: u32,
}

fn default_message_days() -> u32 {
    30
}

fn default_audit_days() -> u32 {
    365
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            message_days: default_message_days(),
            audit_days: default_audit_days(),
        }
    }
}

/// Maintenance loop configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Maintenance {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_stale_retry_hours")]
    pub stale_retry_hours: u32,
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_stale_retry_hours() -> u32 {
    24
}

impl Default for Maintenance {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            stale_retry_hours: default_stale_retry_hours(),
        }
    }
}

fn default_actor() -> String {
    "relay".to_string()
}

/// Relay settings.
///
/// Empty paths are filled from the home directory on load; relative paths
/// are taken relative to it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub database_path: PathBuf,

    #[serde(default)]
    pub audit_database_path: PathBuf,

    #[serde(default)]
    pub agents_dir: PathBuf,

    #[serde(default = "default_actor")]
    pub actor: String,

    #[serde(default)]
    pub routing: Routing,

    #[serde(default)]
    pub retention: Retention,

    #[serde(default)]
    pub maintenance: Maintenance,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::new(),
            audit_database_path: PathBuf::new(),
            agents_dir: PathBuf::new(),
            actor: default_actor(),
            routing: Routing::default(),
            retention: Retention::default(),
            maintenance: Maintenance::default(),
        }
    }
}

impl Settings {
    /// Defaults with every path placed under `home`.
    pub fn with_home(home: &Path) -> Self {
        let mut settings = Self::default();
        settings.resolve_paths(home);
        settings
    }

    fn resolve_paths(&mut self, home: &Path) {
        resolve(&mut self.database_path, home, "relay.db");
        resolve(&mut self.audit_database_path, home, "audit.db");
        resolve(&mut self.agents_dir, home, "agents");
    }
}

fn resolve(path: &mut PathBuf, home: &Path, default: &str) {
    if path.as_os_str().is_empty() {
        *path = home.join(default);
    } else if path.is_relative() {
        *path = home.join(&*path);
    }
}
