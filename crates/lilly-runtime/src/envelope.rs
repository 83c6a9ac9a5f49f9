//! [`Envelope`] – the error envelope authority.
//!
//! Every unexpected failure observed by the runtime is converted, exactly
//! once, into an immutable [`Envelope`] by [`wrap`] (or its shorthand
//! [`wrap_at`]).  The envelope captures:
//!
//! - the originating failure (kept opaque, never downcast),
//! - a free-text origin label (`where`), rendered as `unknown` when absent,
//! - a [`Severity`],
//! - `context` and `tags` maps kept in insertion order,
//! - a wall-clock timestamp taken at creation,
//! - the formatted cause chain and backtrace of the failure.
//!
//! The fields are private and there are no accessors.  Sinks receive the
//! envelope by value and may only pass it on or render it through its
//! [`Debug`] implementation; nothing outside this module can build one.
//!
//! # Example
//!
//! ```rust
//! use lilly_runtime::envelope::{wrap, WrapOptions};
//! use lilly_types::Severity;
//!
//! let envelope = wrap(
//!     anyhow::anyhow!("disk full"),
//!     WrapOptions::at("runtime.tick")
//!         .severity(Severity::Warn)
//!         .context("attempt", 3),
//! );
//! assert!(format!("{envelope:?}").contains("runtime.tick"));
//! ```

use std::backtrace::BacktraceStatus;
use std::fmt::{self, Write as _};

use chrono::{DateTime, Utc};
use lilly_types::Severity;
use serde_json::{Map, Value};

/// Label used whenever a failure arrives without an origin.
const UNKNOWN_ORIGIN: &str = "unknown";

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque, immutable diagnostic record produced from a failure.
pub struct Envelope {
    failure: anyhow::Error,
    origin: Option<String>,
    severity: Severity,
    context: Map<String, Value>,
    tags: Map<String, Value>,
    timestamp: DateTime<Utc>,
    trace: String,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("where", &self.origin.as_deref().unwrap_or(UNKNOWN_ORIGIN))
            .field("severity", &format_args!("{}", self.severity))
            .field("timestamp", &format_args!("{}", self.timestamp.to_rfc3339()))
            .field("context", &self.context)
            .field("tags", &self.tags)
            .field("failure", &format_args!("{:#}", self.failure))
            .field("trace", &self.trace)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wrap options
// ─────────────────────────────────────────────────────────────────────────────

/// Optional metadata attached to an envelope at creation time.
#[derive(Debug, Clone, Default)]
pub struct WrapOptions {
    origin: Option<String>,
    severity: Severity,
    context: Map<String, Value>,
    tags: Map<String, Value>,
    clock: Option<DateTime<Utc>>,
}

impl WrapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a failure observed at `origin`.
    pub fn at(origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..Self::default()
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Pin the envelope timestamp instead of reading the system clock.
    pub fn clock(mut self, timestamp: DateTime<Utc>) -> Self {
        self.clock = Some(timestamp);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authority entry points
// ─────────────────────────────────────────────────────────────────────────────

/// Convert `failure` into an [`Envelope`].
///
/// Apart from reading the clock and formatting the failure's trace this has
/// no side effects, and it never fails.
pub fn wrap(failure: anyhow::Error, options: WrapOptions) -> Envelope {
    let WrapOptions {
        origin,
        severity,
        context,
        tags,
        clock,
    } = options;

    let trace = format_trace(&failure);
    Envelope {
        failure,
        origin,
        severity,
        context,
        tags,
        timestamp: clock.unwrap_or_else(Utc::now),
        trace,
    }
}

/// Shorthand for an error-severity envelope with only an origin label.
///
/// This is the default envelope factory used by the heartbeat loop.
pub fn wrap_at(failure: anyhow::Error, origin: &str) -> Envelope {
    wrap(failure, WrapOptions::at(origin))
}

fn format_trace(failure: &anyhow::Error) -> String {
    let mut out = String::new();
    for (depth, cause) in failure.chain().enumerate() {
        // Writing into a String cannot fail.
        let _ = writeln!(out, "{depth}: {cause}");
    }
    let backtrace = failure.backtrace();
    match backtrace.status() {
        BacktraceStatus::Captured => {
            let _ = write!(out, "stack backtrace:\n{backtrace}");
        }
        _ => out.push_str("stack backtrace: not captured (set RUST_BACKTRACE=1)\n"),
    }
    out
}
