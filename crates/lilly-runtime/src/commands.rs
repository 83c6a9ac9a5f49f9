//! Command classification for the interactive runtime.
//!
//! Only stop semantics live here: `stop`, `quit` and `exit` (case-insensitive,
//! optionally slash-prefixed) end the heartbeat loop, as does the end of
//! console input.  Every other command is logged and otherwise ignored.

use std::sync::Arc;

use lilly_types::Flow;
use tracing::{info, warn};

use crate::ingress::{CommandHandler, EOF_COMMAND};
use crate::logger::{EventLog, Fields};

/// Commands that request a clean shutdown.
pub const STOP_TOKENS: [&str; 3] = ["stop", "quit", "exit"];

/// `true` for `stop`, `/QUIT`, ` exit ` and friends.
pub fn is_stop_command(command: &str) -> bool {
    let command = command.trim();
    let command = command.strip_prefix('/').unwrap_or(command);
    STOP_TOKENS
        .iter()
        .any(|token| command.eq_ignore_ascii_case(token))
}

/// Map a command to the loop control flow it implies.
pub fn classify(command: &str) -> Flow {
    if command == EOF_COMMAND {
        Flow::stop("end of input")
    } else if is_stop_command(command) {
        Flow::stop(format!("command: {}", command.trim()))
    } else {
        Flow::Continue
    }
}

/// The runtime's command handler.
///
/// Every command is recorded as `runtime.command.received` on `events` (or
/// through `tracing` when no event log is wired), tagged with the action
/// taken.  A failing event log is reported through `tracing` and never
/// overrides the classified flow.
pub fn command_handler(events: Option<Arc<dyn EventLog>>) -> CommandHandler {
    Box::new(move |command: &str| -> anyhow::Result<Flow> {
        let flow = classify(command);
        let action = if flow.is_stop() { "stop" } else { "ignored" };
        match &events {
            Some(log) => {
                let fields = Fields::new().with("command", command).with("action", action);
                if let Err(e) = log.info("runtime.command.received", fields) {
                    warn!(command, action, error = %e, "failed to log command");
                }
            }
            None => info!(command, action, "command received"),
        }
        Ok(flow)
    })
}
