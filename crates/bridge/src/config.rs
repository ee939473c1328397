//! TOML config file loading and validation.
//!
//! Every key has a default, and a missing file means "all defaults". The
//! retention and firmware settings are re-read from disk by the operations
//! that use them, so edits take effect without a restart.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::io::ErrorKind;
use std::net::SocketAddr;

/// A century. Anything longer is a typo.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// UTC offsets a controller clock can sensibly be set to.
const MAX_CLOCK_OFFSET_MIN: i64 = 18 * 60;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub database: DatabaseConfig,
    pub firmware: FirmwareConfig,
    pub recipes: RecipeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Controllers connect here to stream SENSOR / ACK lines.
    pub telemetry_addr: String,
    /// Controllers connect here to receive commands.
    pub command_addr: String,
    pub web_addr: String,
    /// Packets waiting for the database before new ones are dropped.
    pub persist_queue: i64,
    /// A command write that makes no progress for this long drops the
    /// command connection.
    pub write_timeout_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub retention_days: i64,
    pub max_size_mb: i64,
    pub eviction_interval_sec: i64,
    /// Offset of the controllers' wall clock from UTC, in minutes.
    pub clock_offset_min: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Local directory holding images, also served at `/firmware/`.
    pub dir: String,
    /// Controller endpoint that accepts the image as a multipart upload.
    pub upload_url: String,
    /// Where the controller stores the uploaded image.
    pub remote_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecipeConfig {
    pub dir: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            telemetry_addr: "0.0.0.0:7000".into(),
            command_addr: "0.0.0.0:7001".into(),
            web_addr: "0.0.0.0:9000".into(),
            persist_queue: 1024,
            write_timeout_ms: 5000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:unitboard.db?mode=rwc".into(),
            retention_days: 30,
            max_size_mb: 1024,
            eviction_interval_sec: 3600,
            clock_offset_min: 0,
        }
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            dir: "firmware".into(),
            upload_url: "http://127.0.0.1:8000/upload".into(),
            remote_path: "/home/pi/firmware/firmware.bin".into(),
        }
    }
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            dir: "recipes".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_bridge(&mut errors);
        self.validate_database(&mut errors);
        self.validate_paths(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_bridge(&self, errors: &mut Vec<String>) {
        let b = &self.bridge;

        let mut parse = |key: &str, value: &str| -> Option<SocketAddr> {
            match value.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    errors.push(format!(
                        "bridge.{key}: {value:?} is not a valid socket address"
                    ));
                    None
                }
            }
        };
        let telemetry = parse("telemetry_addr", &b.telemetry_addr);
        let command = parse("command_addr", &b.command_addr);
        parse("web_addr", &b.web_addr);

        if let (Some(t), Some(c)) = (telemetry, command) {
            if t == c {
                errors.push(format!(
                    "bridge.telemetry_addr and bridge.command_addr are both {t}"
                ));
            }
        }

        if b.persist_queue <= 0 {
            errors.push(format!(
                "bridge.persist_queue must be positive, got {}",
                b.persist_queue
            ));
        }
        if b.write_timeout_ms <= 0 {
            errors.push(format!(
                "bridge.write_timeout_ms must be positive, got {}",
                b.write_timeout_ms
            ));
        }
    }

    fn validate_database(&self, errors: &mut Vec<String>) {
        let d = &self.database;

        if d.url.trim().is_empty() {
            errors.push("database.url is empty".to_string());
        }
        if d.retention_days <= 0 {
            errors.push(format!(
                "database.retention_days must be positive, got {}",
                d.retention_days
            ));
        } else if d.retention_days > MAX_RETENTION_DAYS {
            errors.push(format!(
                "database.retention_days must be at most {MAX_RETENTION_DAYS}, got {}",
                d.retention_days
            ));
        }
        if d.max_size_mb <= 0 {
            errors.push(format!(
                "database.max_size_mb must be positive, got {}",
                d.max_size_mb
            ));
        }
        if d.eviction_interval_sec <= 0 {
            errors.push(format!(
                "database.eviction_interval_sec must be positive, got {}",
                d.eviction_interval_sec
            ));
        }
        if d.clock_offset_min.abs() > MAX_CLOCK_OFFSET_MIN {
            errors.push(format!(
                "database.clock_offset_min must be within ±{MAX_CLOCK_OFFSET_MIN}, got {}",
                d.clock_offset_min
            ));
        }
    }

    fn validate_paths(&self, errors: &mut Vec<String>) {
        if self.firmware.dir.trim().is_empty() {
            errors.push("firmware.dir is empty".to_string());
        }
        let url = self.firmware.upload_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!(
                "firmware.upload_url: {url:?} is not an http(s) URL"
            ));
        }
        if self.firmware.remote_path.trim().is_empty() {
            errors.push("firmware.remote_path is empty".to_string());
        }
        if self.recipes.dir.trim().is_empty() {
            errors.push("recipes.dir is empty".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
