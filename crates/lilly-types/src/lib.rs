use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How serious a captured failure is.  Carried by every error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    #[default]
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warn"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Operational log verbosity accepted by the runtime system settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = LillyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(LillyError::InvalidSettings(format!(
                "unsupported log_level: {other}"
            ))),
        }
    }
}

/// Output shape for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = LillyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(LillyError::InvalidSettings(format!(
                "unsupported log_format: {other}"
            ))),
        }
    }
}

/// Operational settings for one process run.
///
/// Built once at startup by layering defaults, the settings file and a
/// temporary override, then handed by value to whoever drives the loop.
/// Persona or behaviour settings never live here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSystemSettings {
    pub async_enabled: bool,
    /// Always greater than zero once validated.
    pub tick_interval_ms: u64,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
}

impl RuntimeSystemSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for RuntimeSystemSettings {
    fn default() -> Self {
        Self {
            async_enabled: true,
            tick_interval_ms: 100,
            log_level: LogLevel::Info,
            log_format: LogFormat::Text,
        }
    }
}

/// Control-flow outcome of a runtime hook.
///
/// A stop request is not a failure: hooks return `Ok(Flow::Stop { .. })`
/// to end the heartbeat loop and reserve `Err` for real problems, which are
/// enveloped and reported instead.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Flow {
    #[default]
    Continue,
    Stop { reason: Option<String> },
}

impl Flow {
    pub fn stop(reason: impl Into<String>) -> Self {
        Flow::Stop {
            reason: Some(reason.into()),
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Flow::Stop { .. })
    }
}

/// Workspace-wide error type covering settings resolution and the failures
/// the heartbeat loop is allowed to hand back to its caller.
#[derive(Error, Debug)]
pub enum LillyError {
    #[error("Invalid runtime settings: {0}")]
    InvalidSettings(String),

    #[error("Failed to parse {layer} settings layer: {details}")]
    SettingsParse { layer: String, details: String },

    #[error("Failed to read settings file {path}: {details}")]
    SettingsIo { path: String, details: String },

    #[error("Envelope sink failed while reporting {origin}")]
    EnvelopeSink {
        origin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Unhandled failure at {origin}: {source:#}")]
    Unhandled {
        origin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Command ingress error: {0}")]
    Ingress(String),
}
