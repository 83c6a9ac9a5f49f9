//! Settings Resolver – layers defaults, the settings file and a temporary
//! override into one validated [`RuntimeSystemSettings`].
//!
//! Precedence is strictly `defaults < file < temp_override`, per key.
//!
//! | Source | Format | Location |
//! |---|---|---|
//! | file | TOML | `runtime/config/runtime.system.toml`, or `LILLY_SETTINGS_PATH` |
//! | temp override | JSON object | `LILLY_RUNTIME_TEMP_OVERRIDE_JSON` |
//!
//! Only `async_enabled`, `tick_interval_ms`, `log_level` and `log_format` are
//! recognised.  An unknown key in any layer fails resolution.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use lilly_runtime::LoggingConfig;
use lilly_types::{LillyError, LogFormat, LogLevel, RuntimeSystemSettings};
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_SETTINGS_PATH: &str = "runtime/config/runtime.system.toml";
pub const SETTINGS_PATH_ENV: &str = "LILLY_SETTINGS_PATH";
pub const TEMP_OVERRIDE_ENV: &str = "LILLY_RUNTIME_TEMP_OVERRIDE_JSON";
pub const HEARTBEAT_EVERY_ENV: &str = "LILLY_HEARTBEAT_EVERY";
pub const TICK_TIMING_ENV: &str = "LILLY_TICK_TIMING";
pub const FORCE_STOP_FAILURE_ENV: &str = "LILLY_FORCE_STOP_FAILURE";

const KNOWN_KEYS: [&str; 4] = ["async_enabled", "tick_interval_ms", "log_level", "log_format"];

// ─────────────────────────────────────────────────────────────────────────────
// Layers
// ─────────────────────────────────────────────────────────────────────────────

/// One partial settings source.  Absent keys leave earlier layers untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsLayer {
    pub async_enabled: Option<bool>,
    /// Signed so that a negative value is reported as a validation failure.
    pub tick_interval_ms: Option<i64>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

fn reject_unknown<'a>(keys: impl Iterator<Item = &'a String>) -> Result<(), LillyError> {
    let unknown: Vec<&str> = keys
        .map(String::as_str)
        .filter(|k| !KNOWN_KEYS.contains(k))
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(LillyError::InvalidSettings(format!(
            "unknown runtime system settings keys: {unknown:?}"
        )))
    }
}

/// Parse the TOML settings file body.
pub fn parse_file_layer(raw: &str) -> Result<SettingsLayer, LillyError> {
    let parse_err = |details: String| LillyError::SettingsParse {
        layer: "file".to_string(),
        details,
    };
    let table: toml::Table = toml::from_str(raw).map_err(|e| parse_err(e.to_string()))?;
    reject_unknown(table.keys())?;
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| parse_err(e.to_string()))
}

/// Parse a temporary override, which must be a JSON object.
pub fn parse_override_layer(raw: &str) -> Result<SettingsLayer, LillyError> {
    let parse_err = |details: String| LillyError::SettingsParse {
        layer: "temp_override".to_string(),
        details,
    };
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| parse_err(e.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(parse_err(format!("{TEMP_OVERRIDE_ENV} must be a JSON object")));
    };
    reject_unknown(object.keys())?;
    serde_json::from_value(value).map_err(|e| parse_err(e.to_string()))
}

/// Read the settings file.  A missing file is not an error.
pub fn load_file_layer(path: &Path) -> Result<Option<SettingsLayer>, LillyError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| LillyError::SettingsIo {
        path: path.display().to_string(),
        details: e.to_string(),
    })?;
    parse_file_layer(&raw).map(Some)
}

/// `LILLY_SETTINGS_PATH`, or the canonical location.
pub fn settings_path() -> PathBuf {
    std::env::var(SETTINGS_PATH_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH), PathBuf::from)
}

pub fn override_from_env() -> Result<Option<SettingsLayer>, LillyError> {
    match std::env::var(TEMP_OVERRIDE_ENV) {
        Ok(raw) if !raw.trim().is_empty() => parse_override_layer(&raw).map(Some),
        _ => Ok(None),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Resolved settings plus a description of how they were obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub settings: RuntimeSystemSettings,
    /// Layers that were present, in precedence order.
    pub sources: Vec<&'static str>,
    /// Names of the keys each layer changed.  Values are never recorded.
    pub changed: BTreeMap<&'static str, Vec<&'static str>>,
    /// Non-fatal observations, such as a missing settings file.
    pub notes: Vec<String>,
}

impl Resolution {
    /// Emit the resolution summary through `tracing`.
    pub fn report(&self) {
        for note in &self.notes {
            warn!("{note}");
        }
        info!(
            sources = ?self.sources,
            changed_keys = ?self.changed,
            "runtime system settings resolved"
        );
    }
}

/// Unvalidated merge state.
struct Merged {
    async_enabled: bool,
    tick_interval_ms: i64,
    log_level: String,
    log_format: String,
}

impl Merged {
    fn defaults() -> Self {
        let d = RuntimeSystemSettings::default();
        Self {
            async_enabled: d.async_enabled,
            tick_interval_ms: i64::try_from(d.tick_interval_ms).unwrap_or(i64::MAX),
            log_level: d.log_level.to_string(),
            log_format: d.log_format.to_string(),
        }
    }

    /// Overlay `layer`, returning the names of keys whose value changed.
    fn apply(&mut self, layer: &SettingsLayer) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if let Some(v) = layer.async_enabled {
            if v != self.async_enabled {
                changed.push("async_enabled");
            }
            self.async_enabled = v;
        }
        if let Some(v) = layer.tick_interval_ms {
            if v != self.tick_interval_ms {
                changed.push("tick_interval_ms");
            }
            self.tick_interval_ms = v;
        }
        if let Some(v) = &layer.log_level {
            if *v != self.log_level {
                changed.push("log_level");
            }
            self.log_level = v.clone();
        }
        if let Some(v) = &layer.log_format {
            if *v != self.log_format {
                changed.push("log_format");
            }
            self.log_format = v.clone();
        }
        changed
    }

    fn validate(self) -> Result<RuntimeSystemSettings, LillyError> {
        let tick_interval_ms = u64::try_from(self.tick_interval_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or_else(|| {
                LillyError::InvalidSettings(format!(
                    "tick_interval_ms must be > 0, got {}",
                    self.tick_interval_ms
                ))
            })?;
        Ok(RuntimeSystemSettings {
            async_enabled: self.async_enabled,
            tick_interval_ms,
            log_level: self.log_level.parse::<LogLevel>()?,
            log_format: self.log_format.parse::<LogFormat>()?,
        })
    }
}

/// Merge the given layers over the built-in defaults and validate.
///
/// # Errors
///
/// [`LillyError::InvalidSettings`] when the merged values are out of range.
pub fn resolve_layers(
    file: Option<&SettingsLayer>,
    temp_override: Option<&SettingsLayer>,
) -> Result<Resolution, LillyError> {
    let mut merged = Merged::defaults();
    let mut sources = vec!["defaults"];
    let mut changed = BTreeMap::new();

    for (name, layer) in [("file", file), ("temp_override", temp_override)] {
        let Some(layer) = layer else { continue };
        sources.push(name);
        let keys = merged.apply(layer);
        if !keys.is_empty() {
            changed.insert(name, keys);
        }
    }

    Ok(Resolution {
        settings: merged.validate()?,
        sources,
        changed,
        notes: Vec::new(),
    })
}

/// Resolve settings from the settings file and the process environment.
///
/// # Errors
///
/// Any parse, I/O or validation failure of any layer.
pub fn resolve() -> Result<Resolution, LillyError> {
    resolve_from(&settings_path(), override_from_env()?)
}

fn resolve_from(
    path: &Path,
    temp_override: Option<SettingsLayer>,
) -> Result<Resolution, LillyError> {
    let file = load_file_layer(path)?;
    let mut resolution = resolve_layers(file.as_ref(), temp_override.as_ref())?;
    if file.is_none() {
        resolution.notes.push(format!(
            "runtime system settings file not found at '{}' (using defaults)",
            path.display()
        ));
    }
    Ok(resolution)
}

// ─────────────────────────────────────────────────────────────────────────────
// Process toggles
// ─────────────────────────────────────────────────────────────────────────────

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Heartbeat policy for the runtime logger.
///
/// A positive `LILLY_HEARTBEAT_EVERY` enables heartbeat records every that
/// many ticks; a truthy `LILLY_TICK_TIMING` adds `tick_dt_seconds`.
pub fn logging_config_from_env() -> LoggingConfig {
    logging_config_from(
        std::env::var(HEARTBEAT_EVERY_ENV).ok().as_deref(),
        std::env::var(TICK_TIMING_ENV).ok().as_deref(),
    )
}

fn logging_config_from(heartbeat_every: Option<&str>, tick_timing: Option<&str>) -> LoggingConfig {
    let mut config = LoggingConfig::default();
    if let Some(every) = heartbeat_every.and_then(|v| v.trim().parse::<u64>().ok()) {
        if every > 0 {
            config.heartbeat_enabled = true;
            config.heartbeat_every_n_ticks = every;
        }
    }
    config.include_tick_timing = tick_timing.is_some_and(is_truthy);
    config
}

/// Whether the stop hook should fail on purpose.
pub fn force_stop_failure_from_env() -> bool {
    std::env::var(FORCE_STOP_FAILURE_ENV).is_ok_and(|v| is_truthy(&v))
}
