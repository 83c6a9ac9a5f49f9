//! `lilly-runtime` – the interactive process runtime.
//!
//! A bounded tick loop that drives lifecycle events, drains console commands
//! without ever blocking the tick path, and turns every unexpected failure
//! into an opaque envelope for the logging sink.
//!
//! # Modules
//!
//! - [`heartbeat`] – [`HeartbeatLoop`][heartbeat::HeartbeatLoop]: the
//!   scheduler.  Owns the stop flag, the tick counter and the exactly-once
//!   start → tick* → stop → finalize sequence.
//! - [`ingress`] – [`CommandIngress`][ingress::CommandIngress] and
//!   [`TerminalIngress`][ingress::TerminalIngress]: a blocking reader thread
//!   feeding a queue that the loop drains with a non-blocking `poll()`.
//! - [`commands`] – stop-token classification and the default command
//!   handler.
//! - [`envelope`] – [`wrap`][envelope::wrap]: the only way to build an
//!   [`Envelope`][envelope::Envelope].
//! - [`logger`] – [`RuntimeLogger`][logger::RuntimeLogger] and the narrow
//!   capability traits the loop consumes through
//!   [`LoggerHooks`][logger::LoggerHooks].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing] for process
//!   diagnostics with optional OTLP export.

pub mod commands;
pub mod envelope;
pub mod heartbeat;
pub mod ingress;
pub mod logger;
pub mod telemetry;

pub use commands::{classify, command_handler, is_stop_command};
pub use envelope::{Envelope, WrapOptions, wrap, wrap_at};
pub use heartbeat::{HeartbeatLoop, LoopState, StopHandle};
pub use ingress::{
    CommandIngress, IngressOptions, LineOpener, LineSource, StdinSource, TerminalIngress,
};
pub use logger::{Fields, Level, LoggerHooks, LoggingConfig, RuntimeLogger};
pub use telemetry::{TracerProviderGuard, init_tracing};
