//! Interactive runner – wires settings, the runtime logger, the console and
//! the envelope route into a ready-to-run [`HeartbeatLoop`].

use std::sync::Arc;

use lilly_runtime::heartbeat::{EnvelopeSink, Hook};
use lilly_runtime::logger::{ConfigureFromSettings, EnvelopeLog, EventLog};
use lilly_runtime::{
    CommandIngress, Envelope, Fields, HeartbeatLoop, IngressOptions, LineOpener, LoggerHooks,
    RuntimeLogger, TerminalIngress, command_handler,
};
use lilly_types::{Flow, RuntimeSystemSettings};
use tracing::{info, warn};

/// Everything [`run_interactive`] needs.  All integrations are optional.
pub struct RunnerOptions {
    pub settings: RuntimeSystemSettings,
    pub logger: LoggerHooks,
    pub configure: Option<Arc<dyn ConfigureFromSettings>>,
    pub console: Option<LineOpener>,
    pub ingress_options: IngressOptions,
    pub on_tick: Option<Hook>,
    /// Receives every envelope after it has been logged.
    pub envelope_sink: Option<EnvelopeSink>,
    pub force_stop_failure: bool,
}

impl RunnerOptions {
    pub fn new(settings: RuntimeSystemSettings) -> Self {
        Self {
            settings,
            logger: LoggerHooks::none(),
            configure: None,
            console: None,
            ingress_options: IngressOptions::default(),
            on_tick: None,
            envelope_sink: None,
            force_stop_failure: false,
        }
    }

    /// Use `logger` for every logging capability and settings configuration.
    pub fn with_runtime_logger(mut self, logger: &Arc<RuntimeLogger>) -> Self {
        self.logger = LoggerHooks::full(logger);
        self.configure = Some(logger.clone() as Arc<dyn ConfigureFromSettings>);
        self
    }

    pub fn with_console(mut self, opener: LineOpener) -> Self {
        self.console = Some(opener);
        self
    }

    pub fn with_on_tick(mut self, hook: Hook) -> Self {
        self.on_tick = Some(hook);
        self
    }

    pub fn with_envelope_sink(mut self, sink: EnvelopeSink) -> Self {
        self.envelope_sink = Some(sink);
        self
    }

    pub fn force_stop_failure(mut self, enabled: bool) -> Self {
        self.force_stop_failure = enabled;
        self
    }
}

/// Build the interactive heartbeat loop.  Nothing runs until
/// [`HeartbeatLoop::run`] is called.
pub fn run_interactive(options: RunnerOptions) -> HeartbeatLoop {
    let RunnerOptions {
        settings,
        logger,
        configure,
        console,
        ingress_options,
        on_tick,
        envelope_sink,
        force_stop_failure,
    } = options;

    if let Some(configure) = &configure {
        if let Err(e) = configure.configure_from_settings(&settings) {
            warn!(error = %e, "logger rejected runtime settings; keeping its configuration");
        }
    }

    let ingress: Option<Box<dyn CommandIngress>> = match console {
        Some(opener) if settings.async_enabled => Some(Box::new(TerminalIngress::new(
            command_handler(logger.events.clone()),
            ingress_options,
            opener,
        ))),
        Some(_) => {
            info!("async_enabled is false; console input disabled");
            None
        }
        None => None,
    };

    let start_events = logger.events.clone();
    let stop_events = logger.events.clone();
    let async_enabled = settings.async_enabled;
    let tick_interval_ms = settings.tick_interval_ms;
    let sink = boundary_sink(logger.envelopes.clone(), envelope_sink);

    let mut heartbeat = HeartbeatLoop::new()
        .with_logger(logger)
        .with_tick_interval(settings.tick_interval())
        .with_envelope_sink(sink)
        .with_on_start(move || {
            let fields = Fields::new()
                .with("async_enabled", async_enabled)
                .with("tick_interval_ms", tick_interval_ms);
            match &start_events {
                Some(events) => events.info("runtime.runner.starting", fields)?,
                None => info!(async_enabled, tick_interval_ms, "runtime starting"),
            }
            Ok(Flow::Continue)
        })
        .with_on_stop(move || {
            match &stop_events {
                Some(events) => events.info("runtime.runner.stopping", Fields::new())?,
                None => info!("runtime stopping"),
            }
            if force_stop_failure {
                anyhow::bail!("forced stop-hook failure (LILLY_FORCE_STOP_FAILURE)");
            }
            Ok(Flow::Continue)
        });

    if let Some(ingress) = ingress {
        heartbeat = heartbeat.with_ingress(ingress);
    }
    if let Some(on_tick) = on_tick {
        heartbeat = heartbeat.with_on_tick(on_tick);
    }
    heartbeat
}

/// Log each envelope at the runtime boundary, then hand it downstream.
fn boundary_sink(
    log: Option<Arc<dyn EnvelopeLog>>,
    mut downstream: Option<EnvelopeSink>,
) -> impl FnMut(Envelope) -> anyhow::Result<()> + 'static {
    move |envelope: Envelope| -> anyhow::Result<()> {
        if let Some(log) = &log {
            let fields = Fields::new().with("source", "runtime_boundary");
            if let Err(e) = log.envelope(&envelope, fields) {
                warn!(error = %e, "failed to log envelope");
            }
        }
        match downstream.as_mut() {
            Some(sink) => sink(envelope),
            None => Ok(()),
        }
    }
}
