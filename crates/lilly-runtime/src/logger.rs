//! Structured runtime logger and the narrow logging capabilities the
//! heartbeat loop consumes.
//!
//! # Capabilities
//!
//! The loop never checks a logger for methods at call time.  Each optional capability is
//! its own trait, and [`LoggerHooks`] holds an optional handle per
//! capability:
//!
//! | Trait | Used for |
//! |---|---|
//! | [`EventLog`] | generic `info` / `warn` / `error` events |
//! | [`LifecycleLog`] | `runtime.lifecycle.start` / `runtime.lifecycle.stop` |
//! | [`HeartbeatLog`] | bounded per-tick heartbeat |
//! | [`EnvelopeLog`] | `runtime.envelope.received` |
//! | [`Finalize`] | one flush at shutdown |
//! | [`ConfigureFromSettings`] | applying [`RuntimeSystemSettings`] |
//!
//! [`RuntimeLogger`] implements all of them.
//!
//! # Records
//!
//! Every accepted event becomes one self-contained record with a timestamp,
//! a level, the event name and a sanitised field map.  In JSON mode a record
//! is a single JSON line:
//!
//! ```text
//! {"ts":"2024-01-02T03:04:05.000000Z","level":"INFO","event":"runtime.lifecycle.start","fields":{"run_id":"…"}}
//! ```
//!
//! Values that have no direct JSON form are never dropped; they are written
//! as `{"__type__": "<type>", "__repr__": "<debug text>"}`.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use lilly_types::{LogFormat, LogLevel, RuntimeSystemSettings};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::envelope::Envelope;

// ─────────────────────────────────────────────────────────────────────────────
// Levels and fields
// ─────────────────────────────────────────────────────────────────────────────

/// Record severity.  Ordered `Debug < Info < Warn < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Level::Debug,
            LogLevel::Info => Level::Info,
            LogLevel::Warning => Level::Warn,
            LogLevel::Error | LogLevel::Critical => Level::Error,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        };
        f.pad(name)
    }
}

/// A single field value attached to a log event.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Json(Value),
    /// A value with no direct JSON form, kept as its type name and debug text.
    Opaque { type_name: String, repr: String },
}

impl FieldValue {
    pub fn opaque<T: fmt::Debug + ?Sized>(value: &T) -> Self {
        let full = std::any::type_name::<T>();
        let type_name = full.rsplit("::").next().unwrap_or(full).to_string();
        FieldValue::Opaque {
            type_name,
            repr: format!("{value:?}"),
        }
    }

    fn sanitize(self) -> Value {
        match self {
            FieldValue::Json(value) => value,
            FieldValue::Opaque { type_name, repr } => json!({
                "__type__": type_name,
                "__repr__": repr,
            }),
        }
    }
}

macro_rules! json_field_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::Json(Value::from(value))
                }
            }
        )*
    };
}

json_field_from!(bool, i32, i64, u32, u64, usize, f64, String, &str);

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Json(value)
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        FieldValue::Json(value.map_or(Value::Null, Value::String))
    }
}

/// Key → value metadata for one event, kept in insertion order.
///
/// Inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(Vec<(String, FieldValue)>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(existing, _)| existing == key).map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn sanitize(self) -> Map<String, Value> {
        self.0
            .into_iter()
            .map(|(key, value)| (key, value.sanitize()))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability traits
// ─────────────────────────────────────────────────────────────────────────────

/// Generic named events.
pub trait EventLog {
    fn info(&self, event: &str, fields: Fields) -> anyhow::Result<()>;
    fn warn(&self, event: &str, fields: Fields) -> anyhow::Result<()>;
    fn error(&self, event: &str, fields: Fields) -> anyhow::Result<()>;
}

/// Run start / stop markers.
pub trait LifecycleLog {
    fn lifecycle_start(&self, fields: Fields) -> anyhow::Result<()>;
    fn lifecycle_stop(&self, fields: Fields) -> anyhow::Result<()>;
}

/// Per-tick heartbeat.  Implementations own the throttling policy.
pub trait HeartbeatLog {
    fn tick(&self, tick_id: u64, fields: Fields) -> anyhow::Result<()>;
}

/// Receives error envelopes without looking inside them.
pub trait EnvelopeLog {
    fn envelope(&self, envelope: &Envelope, fields: Fields) -> anyhow::Result<()>;
}

/// Shutdown flush.  Called at most once per run by the heartbeat loop.
pub trait Finalize {
    fn finalize(&self) -> anyhow::Result<()>;
}

/// Accepts the resolved runtime settings.
pub trait ConfigureFromSettings {
    fn configure_from_settings(&self, settings: &RuntimeSystemSettings) -> anyhow::Result<()>;
}

/// Optional logging capabilities handed to the heartbeat loop.
///
/// Any handle may be `None`; the loop skips the corresponding call.
#[derive(Clone, Default)]
pub struct LoggerHooks {
    pub events: Option<Arc<dyn EventLog>>,
    pub lifecycle: Option<Arc<dyn LifecycleLog>>,
    pub heartbeat: Option<Arc<dyn HeartbeatLog>>,
    pub envelopes: Option<Arc<dyn EnvelopeLog>>,
    pub finalizer: Option<Arc<dyn Finalize>>,
}

impl LoggerHooks {
    /// No logging at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Wire every capability to the same logger.
    pub fn full<L>(logger: &Arc<L>) -> Self
    where
        L: EventLog + LifecycleLog + HeartbeatLog + EnvelopeLog + Finalize + 'static,
    {
        Self {
            events: Some(logger.clone() as Arc<dyn EventLog>),
            lifecycle: Some(logger.clone() as Arc<dyn LifecycleLog>),
            heartbeat: Some(logger.clone() as Arc<dyn HeartbeatLog>),
            envelopes: Some(logger.clone() as Arc<dyn EnvelopeLog>),
            finalizer: Some(logger.clone() as Arc<dyn Finalize>),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RuntimeLogger
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for [`RuntimeLogger`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Minimum level a record needs to be written.
    pub level: Level,
    pub format: LogFormat,
    /// Heartbeat records are off by default to keep long runs quiet.
    pub heartbeat_enabled: bool,
    /// Emit a heartbeat every n ticks.  Values below 1 are treated as 1.
    pub heartbeat_every_n_ticks: u64,
    /// Add `tick_dt_seconds` (time since the previous heartbeat record).
    pub include_tick_timing: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: LogFormat::Json,
            heartbeat_enabled: false,
            heartbeat_every_n_ticks: 10,
            include_tick_timing: false,
        }
    }
}

impl LoggingConfig {
    /// Take level and format from `settings`; the heartbeat policy is kept.
    pub fn apply_settings(&mut self, settings: &RuntimeSystemSettings) {
        self.level = settings.log_level.into();
        self.format = settings.log_format;
    }
}

#[derive(Serialize)]
struct Record<'a> {
    ts: String,
    level: Level,
    event: &'a str,
    fields: Map<String, Value>,
}

struct LoggerState {
    config: LoggingConfig,
    writer: Box<dyn Write + Send>,
    tick_counter: u64,
    last_heartbeat: Option<Instant>,
    finalized: bool,
}

impl LoggerState {
    fn write_record(&mut self, level: Level, event: &str, fields: Fields) -> anyhow::Result<()> {
        if level < self.config.level {
            return Ok(());
        }

        let record = Record {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            level,
            event,
            fields: fields.sanitize(),
        };
        let line = match self.config.format {
            LogFormat::Json => serde_json::to_string(&record)?,
            LogFormat::Text => render_text(&record),
        };
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }
}

fn render_text(record: &Record<'_>) -> String {
    let mut line = format!("{} {:<5} {}", record.ts, record.level, record.event);
    for (key, value) in &record.fields {
        line.push_str(&format!(" {key}={value}"));
    }
    line
}

/// Unified runtime logger writing one record per line.
///
/// All methods take `&self`; state lives behind a mutex so a single
/// instance can be shared as every [`LoggerHooks`] capability at once.
pub struct RuntimeLogger {
    state: Mutex<LoggerState>,
}

impl RuntimeLogger {
    /// Logger writing to standard output.
    pub fn new(config: LoggingConfig) -> Self {
        Self::with_writer(config, io::stdout())
    }

    pub fn with_writer(config: LoggingConfig, writer: impl Write + Send + 'static) -> Self {
        Self {
            state: Mutex::new(LoggerState {
                config,
                writer: Box::new(writer),
                tick_counter: 0,
                last_heartbeat: None,
                finalized: false,
            }),
        }
    }

    pub fn config(&self) -> LoggingConfig {
        self.lock().config.clone()
    }

    pub fn reconfigure(&self, config: LoggingConfig) {
        self.lock().config = config;
    }

    /// Number of ticks seen so far, whether or not they were written.
    pub fn ticks_seen(&self) -> u64 {
        self.lock().tick_counter
    }

    pub fn emit(&self, level: Level, event: &str, fields: Fields) -> anyhow::Result<()> {
        self.lock().write_record(level, event, fields)
    }

    /// Flush buffered output.  The finalize record is written only once.
    pub fn finalize(&self) -> anyhow::Result<()> {
        let mut state = self.lock();
        if !state.finalized {
            state.finalized = true;
            state.write_record(Level::Info, "runtime.logging.finalize", Fields::new())?;
        }
        state.writer.flush()?;
        Ok(())
    }

    /// Alias of [`RuntimeLogger::finalize`].
    pub fn flush(&self) -> anyhow::Result<()> {
        self.finalize()
    }

    /// Alias of [`RuntimeLogger::finalize`].
    pub fn finish(&self) -> anyhow::Result<()> {
        self.finalize()
    }

    fn lock(&self) -> MutexGuard<'_, LoggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventLog for RuntimeLogger {
    fn info(&self, event: &str, fields: Fields) -> anyhow::Result<()> {
        self.emit(Level::Info, event, fields)
    }

    fn warn(&self, event: &str, fields: Fields) -> anyhow::Result<()> {
        self.emit(Level::Warn, event, fields)
    }

    fn error(&self, event: &str, fields: Fields) -> anyhow::Result<()> {
        self.emit(Level::Error, event, fields)
    }
}

impl LifecycleLog for RuntimeLogger {
    fn lifecycle_start(&self, fields: Fields) -> anyhow::Result<()> {
        self.emit(Level::Info, "runtime.lifecycle.start", fields)
    }

    fn lifecycle_stop(&self, fields: Fields) -> anyhow::Result<()> {
        self.emit(Level::Info, "runtime.lifecycle.stop", fields)
    }
}

impl HeartbeatLog for RuntimeLogger {
    fn tick(&self, tick_id: u64, mut fields: Fields) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.tick_counter += 1;

        if !state.config.heartbeat_enabled {
            return Ok(());
        }
        let every = state.config.heartbeat_every_n_ticks.max(1);
        if state.tick_counter % every != 0 {
            return Ok(());
        }

        fields.insert("tick_id", tick_id);
        fields.insert("heartbeat_every_n_ticks", every);
        if state.config.include_tick_timing {
            let now = Instant::now();
            if let Some(previous) = state.last_heartbeat {
                fields.insert("tick_dt_seconds", (now - previous).as_secs_f64());
            }
            state.last_heartbeat = Some(now);
        }
        state.write_record(Level::Info, "runtime.heartbeat.tick", fields)
    }
}

impl EnvelopeLog for RuntimeLogger {
    fn envelope(&self, envelope: &Envelope, mut fields: Fields) -> anyhow::Result<()> {
        fields.insert("envelope", FieldValue::opaque(envelope));
        self.emit(Level::Error, "runtime.envelope.received", fields)
    }
}

impl Finalize for RuntimeLogger {
    fn finalize(&self) -> anyhow::Result<()> {
        RuntimeLogger::finalize(self)
    }
}

impl ConfigureFromSettings for RuntimeLogger {
    fn configure_from_settings(&self, settings: &RuntimeSystemSettings) -> anyhow::Result<()> {
        self.lock().config.apply_settings(settings);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test support
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory writer shared between a logger under test and its assertions.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl CaptureWriter {
    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Parse every captured line as a JSON record.
    pub(crate) fn records(&self) -> Vec<Value> {
        self.text()
            .lines()
            .map(|line| serde_json::from_str(line).expect("record should be valid JSON"))
            .collect()
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.records()
            .iter()
            .map(|r| r["event"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

#[cfg(test)]
impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
