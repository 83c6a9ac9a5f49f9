//! [`HeartbeatLoop`] – the runtime scheduler.
//!
//! The loop owns the stop flag, the tick counter and the exactly-once
//! lifecycle sequence:
//!
//! ```text
//!  NotStarted ──run()──► lifecycle start ─► on_start ─► ingress.start
//!                                                            │
//!            ┌───────────────────── Running ◄────────────────┘
//!            │  while !stop_requested:
//!            │    1. ingress.poll()        (Stop ends the iteration here)
//!            │    2. tick_id += 1
//!            │    3. heartbeat tick
//!            │    4. on_tick
//!            │    5. sleep the rest of the tick interval
//!            ▼
//!        Stopping ─► lifecycle stop ─► on_stop ─► finalize ─► Stopped
//! ```
//!
//! # Failure routing
//!
//! Hooks return `anyhow::Result<Flow>`.  `Ok(Flow::Stop { .. })` is a
//! control-flow signal and is never reported.  Every `Err` is routed, tagged
//! with an origin label (`runtime.tick`, `runtime.shutdown.on_stop`, …):
//!
//! 1. through the envelope factory and sink when both are configured,
//! 2. otherwise to [`EventLog::error`] as `runtime.heartbeat.unhandled`,
//! 3. otherwise back to the caller of [`HeartbeatLoop::run`].
//!
//! A failing sink is also handed back to the caller.  In both propagating
//! cases the loop body ends, the stop sequence still runs in full, and
//! `run()` returns the first such failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use lilly_types::{Flow, LillyError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::envelope::{Envelope, wrap_at};
use crate::ingress::CommandIngress;
use crate::logger::{EventLog, Fields, Finalize, HeartbeatLog, LifecycleLog, LoggerHooks};

/// Lifecycle hook (`on_start`, `on_tick`, `on_stop`).
pub type Hook = Box<dyn FnMut() -> anyhow::Result<Flow>>;

/// Builds an envelope from a failure and its origin label.
pub type EnvelopeFactory = Box<dyn Fn(anyhow::Error, &str) -> Envelope>;

/// Final destination of every envelope.
pub type EnvelopeSink = Box<dyn FnMut(Envelope) -> anyhow::Result<()>>;

// ─────────────────────────────────────────────────────────────────────────────
// Stop signal
// ─────────────────────────────────────────────────────────────────────────────

/// Scheduler state.  Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

#[derive(Default)]
struct StopSignal {
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Cloneable handle onto a loop's one-way stop flag.
///
/// Safe to use from hooks, from a Ctrl-C handler thread, or after the loop
/// has finished.
#[derive(Clone, Default)]
pub struct StopHandle(Arc<StopSignal>);

impl StopHandle {
    /// Request a cooperative stop.  Idempotent; a later reason replaces an
    /// earlier one but the flag never resets.
    pub fn request_stop(&self, reason: Option<&str>) {
        if let Some(reason) = reason {
            *self
                .0
                .reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
        }
        self.0.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.0
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HeartbeatLoop
// ─────────────────────────────────────────────────────────────────────────────

/// Single-threaded cooperative tick loop.
///
/// Built with the `with_*` methods, then driven by one blocking call to
/// [`HeartbeatLoop::run`].
pub struct HeartbeatLoop {
    run_id: Uuid,
    state: LoopState,
    stop: StopHandle,
    tick_id: u64,
    tick_interval: Option<Duration>,
    on_start: Option<Hook>,
    on_tick: Option<Hook>,
    on_stop: Option<Hook>,
    logger: LoggerHooks,
    ingress: Option<Box<dyn CommandIngress>>,
    envelopes: Option<(EnvelopeFactory, EnvelopeSink)>,
    escaped: Option<LillyError>,
}

impl Default for HeartbeatLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatLoop {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            state: LoopState::NotStarted,
            stop: StopHandle::default(),
            tick_id: 0,
            tick_interval: None,
            on_start: None,
            on_tick: None,
            on_stop: None,
            logger: LoggerHooks::none(),
            ingress: None,
            envelopes: None,
            escaped: None,
        }
    }

    pub fn with_on_start<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> anyhow::Result<Flow> + 'static,
    {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn with_on_tick<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> anyhow::Result<Flow> + 'static,
    {
        self.on_tick = Some(Box::new(hook));
        self
    }

    pub fn with_on_stop<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> anyhow::Result<Flow> + 'static,
    {
        self.on_stop = Some(Box::new(hook));
        self
    }

    pub fn with_logger(mut self, logger: LoggerHooks) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_ingress(mut self, ingress: Box<dyn CommandIngress>) -> Self {
        self.ingress = Some(ingress);
        self
    }

    /// Route failures through `factory` into `sink`.
    pub fn with_envelopes<F, S>(mut self, factory: F, sink: S) -> Self
    where
        F: Fn(anyhow::Error, &str) -> Envelope + 'static,
        S: FnMut(Envelope) -> anyhow::Result<()> + 'static,
    {
        let factory: EnvelopeFactory = Box::new(factory);
        let sink: EnvelopeSink = Box::new(sink);
        self.envelopes = Some((factory, sink));
        self
    }

    /// [`HeartbeatLoop::with_envelopes`] using [`wrap_at`] as the factory.
    pub fn with_envelope_sink<S>(self, sink: S) -> Self
    where
        S: FnMut(Envelope) -> anyhow::Result<()> + 'static,
    {
        self.with_envelopes(wrap_at, sink)
    }

    /// Pace iterations to `interval`.  A zero interval means no pacing.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval).filter(|d| !d.is_zero());
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Number of iterations that reached step 2.
    pub fn tick_id(&self) -> u64 {
        self.tick_id
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn request_stop(&self, reason: Option<&str>) {
        self.stop.request_stop(reason);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_stop_requested()
    }

    /// Run the loop to completion.
    ///
    /// # Errors
    ///
    /// [`LillyError::EnvelopeSink`] when the envelope sink fails, or
    /// [`LillyError::Unhandled`] when a failure occurs with neither an
    /// envelope route nor an event log.  All other failures are contained.
    pub fn run(&mut self) -> Result<(), LillyError> {
        if self.state != LoopState::NotStarted {
            warn!(run_id = %self.run_id, state = ?self.state, "heartbeat loop already ran; ignoring");
            return Ok(());
        }

        info!(run_id = %self.run_id, "heartbeat loop starting");
        self.start_sequence();
        self.state = LoopState::Running;

        while !self.stop.is_stop_requested() {
            self.iterate();
        }

        self.state = LoopState::Stopping;
        self.stop_sequence();
        self.state = LoopState::Stopped;
        info!(run_id = %self.run_id, ticks = self.tick_id, "heartbeat loop stopped");

        match self.escaped.take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn start_sequence(&mut self) {
        if let Some(lifecycle) = self.logger.lifecycle.clone() {
            let fields = Fields::new().with("run_id", self.run_id.to_string());
            if let Err(e) = lifecycle.lifecycle_start(fields) {
                self.contain(e, "runtime.lifecycle.start");
            }
        }

        match call_hook(&mut self.on_start) {
            Ok(flow) => self.apply(flow),
            Err(e) => self.contain(e, "runtime.start"),
        }

        if self.stop.is_stop_requested() {
            debug!("stop requested before the first tick; ingress not started");
            return;
        }
        let started = self.ingress.as_mut().map_or(Ok(()), |ingress| ingress.start());
        if let Err(e) = started {
            self.contain(e, "runtime.ingress.start");
        }
    }

    fn iterate(&mut self) {
        let began = Instant::now();

        let polled = self
            .ingress
            .as_mut()
            .map_or(Ok(Flow::Continue), |ingress| ingress.poll());
        match polled {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop { reason }) => {
                debug!(?reason, "ingress requested stop");
                self.stop.request_stop(reason.as_deref());
                return;
            }
            Err(e) => self.contain(e, "runtime.ingress.poll"),
        }
        if self.escaped.is_some() {
            return;
        }

        self.tick_id += 1;

        if let Some(heartbeat) = self.logger.heartbeat.clone() {
            if let Err(e) = heartbeat.tick(self.tick_id, Fields::new()) {
                self.contain(e, "runtime.logger.tick");
            }
        }
        if self.escaped.is_some() {
            return;
        }

        match call_hook(&mut self.on_tick) {
            Ok(flow) => self.apply(flow),
            Err(e) => self.contain(e, "runtime.tick"),
        }

        self.pace(began);
    }

    fn pace(&self, began: Instant) {
        let Some(interval) = self.tick_interval else {
            return;
        };
        if self.stop.is_stop_requested() {
            return;
        }
        if let Some(remaining) = interval.checked_sub(began.elapsed()) {
            thread::sleep(remaining);
        }
    }

    fn stop_sequence(&mut self) {
        let reason = self.stop.reason();

        if let Some(lifecycle) = self.logger.lifecycle.clone() {
            let fields = Fields::new()
                .with("run_id", self.run_id.to_string())
                .with("ticks", self.tick_id)
                .with("reason", reason.clone());
            if let Err(e) = lifecycle.lifecycle_stop(fields) {
                self.contain(e, "runtime.lifecycle.stop");
            }
        }

        match call_hook(&mut self.on_stop) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop { .. }) => debug!("stop hook returned stop during shutdown; ignored"),
            Err(e) => self.contain(e, "runtime.shutdown.on_stop"),
        }

        if let Some(finalizer) = self.logger.finalizer.clone() {
            if let Err(e) = finalizer.finalize() {
                self.contain(e, "runtime.shutdown.finalize");
            }
        }
    }

    fn apply(&self, flow: Flow) {
        if let Flow::Stop { reason } = flow {
            self.stop.request_stop(reason.as_deref());
        }
    }

    /// Report a failure; remember it and end the body if it escapes.
    fn contain(&mut self, failure: anyhow::Error, origin: &str) {
        let Err(escaped) = self.report(failure, origin) else {
            return;
        };
        error!(origin, error = %escaped, "failure escaped the heartbeat loop");
        if !self.stop.is_stop_requested() {
            self.stop.request_stop(Some("unhandled failure"));
        }
        if self.escaped.is_none() {
            self.escaped = Some(escaped);
        }
    }

    fn report(&mut self, failure: anyhow::Error, origin: &str) -> Result<(), LillyError> {
        if let Some((factory, sink)) = self.envelopes.as_mut() {
            let envelope = factory(failure, origin);
            return sink(envelope).map_err(|source| LillyError::EnvelopeSink {
                origin: origin.to_string(),
                source,
            });
        }

        let Some(events) = self.logger.events.clone() else {
            return Err(LillyError::Unhandled {
                origin: origin.to_string(),
                source: failure,
            });
        };
        let fields = Fields::new()
            .with("where", origin)
            .with("error", format!("{failure:#}"));
        if let Err(e) = events.error("runtime.heartbeat.unhandled", fields) {
            error!(origin, error = %failure, logger_error = %e, "event log rejected unhandled failure");
        }
        Ok(())
    }
}

fn call_hook(hook: &mut Option<Hook>) -> anyhow::Result<Flow> {
    match hook {
        Some(hook) => hook(),
        None => Ok(Flow::Continue),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::command_handler;
    use crate::ingress::{IngressOptions, LineSource, TerminalIngress};
    use crate::logger::{CaptureWriter, EnvelopeLog, LoggingConfig, RuntimeLogger};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Logger double recording every capability call in order.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_tick: bool,
        fail_finalize: bool,
    }

    impl Recorder {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn ticks(&self) -> Vec<u64> {
            self.calls()
                .iter()
                .filter_map(|c| c.strip_prefix("tick:"))
                .map(|id| id.parse().unwrap())
                .collect()
        }

        fn count(&self, call: &str) -> usize {
            self.calls().iter().filter(|c| *c == call).count()
        }
    }

    impl EventLog for Recorder {
        fn info(&self, event: &str, _fields: Fields) -> anyhow::Result<()> {
            self.record(format!("info:{event}"));
            Ok(())
        }

        fn warn(&self, event: &str, _fields: Fields) -> anyhow::Result<()> {
            self.record(format!("warn:{event}"));
            Ok(())
        }

        fn error(&self, event: &str, _fields: Fields) -> anyhow::Result<()> {
            self.record(format!("error:{event}"));
            Ok(())
        }
    }

    impl LifecycleLog for Recorder {
        fn lifecycle_start(&self, _fields: Fields) -> anyhow::Result<()> {
            self.record("lifecycle_start");
            Ok(())
        }

        fn lifecycle_stop(&self, _fields: Fields) -> anyhow::Result<()> {
            self.record("lifecycle_stop");
            Ok(())
        }
    }

    impl HeartbeatLog for Recorder {
        fn tick(&self, tick_id: u64, _fields: Fields) -> anyhow::Result<()> {
            self.record(format!("tick:{tick_id}"));
            if self.fail_tick {
                anyhow::bail!("heartbeat writer closed");
            }
            Ok(())
        }
    }

    impl EnvelopeLog for Recorder {
        fn envelope(&self, _envelope: &Envelope, _fields: Fields) -> anyhow::Result<()> {
            self.record("envelope");
            Ok(())
        }
    }

    impl Finalize for Recorder {
        fn finalize(&self) -> anyhow::Result<()> {
            self.record("finalize");
            if self.fail_finalize {
                anyhow::bail!("flush failed");
            }
            Ok(())
        }
    }

    /// Sink collecting the debug rendering of every envelope.
    fn collecting_sink() -> (
        Rc<RefCell<Vec<String>>>,
        impl FnMut(Envelope) -> anyhow::Result<()> + 'static,
    ) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink = move |envelope: Envelope| -> anyhow::Result<()> {
            sink_seen.borrow_mut().push(format!("{envelope:?}"));
            Ok(())
        };
        (seen, sink)
    }

    /// Stop on the `n`th tick.
    fn stop_after(n: u64) -> impl FnMut() -> anyhow::Result<Flow> + 'static {
        let mut ticks = 0;
        move || -> anyhow::Result<Flow> {
            ticks += 1;
            Ok(if ticks >= n {
                Flow::stop("done")
            } else {
                Flow::Continue
            })
        }
    }

    /// Ingress returning a fixed sequence of poll results, then `Continue`.
    struct ScriptedIngress {
        polls: VecDeque<anyhow::Result<Flow>>,
        starts: Rc<Cell<u32>>,
    }

    impl CommandIngress for ScriptedIngress {
        fn start(&mut self) -> anyhow::Result<()> {
            self.starts.set(self.starts.get() + 1);
            Ok(())
        }

        fn poll(&mut self) -> anyhow::Result<Flow> {
            self.polls.pop_front().unwrap_or(Ok(Flow::Continue))
        }
    }

    #[test]
    fn tick_ids_start_at_one_and_increase_by_one() {
        let recorder = Arc::new(Recorder::default());
        let mut heartbeat = HeartbeatLoop::new()
            .with_logger(LoggerHooks::full(&recorder))
            .with_on_tick(stop_after(5));

        heartbeat.run().unwrap();

        assert_eq!(recorder.ticks(), vec![1, 2, 3, 4, 5]);
        assert_eq!(heartbeat.tick_id(), 5);
        assert_eq!(heartbeat.state(), LoopState::Stopped);
    }

    #[test]
    fn lifecycle_sequence_runs_exactly_once_in_order() {
        let recorder = Arc::new(Recorder::default());
        let mut heartbeat = HeartbeatLoop::new()
            .with_logger(LoggerHooks::full(&recorder))
            .with_on_tick(stop_after(2));

        heartbeat.run().unwrap();

        assert_eq!(
            recorder.calls(),
            vec!["lifecycle_start", "tick:1", "tick:2", "lifecycle_stop", "finalize"]
        );
    }

    #[test]
    fn request_stop_is_idempotent_and_run_is_single_shot() {
        let recorder = Arc::new(Recorder::default());
        let mut heartbeat = HeartbeatLoop::new().with_logger(LoggerHooks::full(&recorder));
        assert_eq!(heartbeat.state(), LoopState::NotStarted);

        heartbeat.request_stop(Some("operator"));
        heartbeat.request_stop(None);
        heartbeat.request_stop(None);
        assert!(heartbeat.is_stop_requested());
        assert_eq!(heartbeat.stop_handle().reason().as_deref(), Some("operator"));

        heartbeat.run().unwrap();
        assert_eq!(heartbeat.tick_id(), 0);
        assert_eq!(
            recorder.calls(),
            vec!["lifecycle_start", "lifecycle_stop", "finalize"]
        );

        heartbeat.run().unwrap();
        assert_eq!(recorder.calls().len(), 3, "second run() must be a no-op");
        assert_eq!(heartbeat.state(), LoopState::Stopped);
    }

    #[test]
    fn stop_handle_works_from_inside_a_hook() {
        let heartbeat = HeartbeatLoop::new();
        let stop = heartbeat.stop_handle();
        let mut heartbeat = heartbeat.with_on_tick(move || {
            stop.request_stop(Some("from hook"));
            Ok(Flow::Continue)
        });

        heartbeat.run().unwrap();
        assert_eq!(heartbeat.tick_id(), 1);
        assert_eq!(heartbeat.stop_handle().reason().as_deref(), Some("from hook"));
    }

    #[test]
    fn failing_tick_is_enveloped_and_loop_keeps_running() {
        let (seen, sink) = collecting_sink();
        let mut ticks = 0;
        let mut heartbeat = HeartbeatLoop::new()
            .with_envelope_sink(sink)
            .with_on_tick(move || {
                ticks += 1;
                match ticks {
                    1 | 2 => anyhow::bail!("tick {ticks} failed"),
                    4 => Ok(Flow::stop("done")),
                    _ => Ok(Flow::Continue),
                }
            });

        heartbeat.run().unwrap();

        assert_eq!(heartbeat.tick_id(), 4);
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| e.contains("runtime.tick")));
        assert!(seen[0].contains("tick 1 failed"));
    }

    #[test]
    fn stop_hook_failure_is_enveloped_before_finalize() {
        let recorder = Arc::new(Recorder::default());
        let sink_recorder = recorder.clone();
        let mut heartbeat = HeartbeatLoop::new()
            .with_logger(LoggerHooks::full(&recorder))
            .with_on_tick(stop_after(1))
            .with_on_stop(|| anyhow::bail!("forced stop failure"))
            .with_envelope_sink(move |envelope: Envelope| -> anyhow::Result<()> {
                sink_recorder.record(format!("sink:{envelope:?}"));
                Ok(())
            });

        heartbeat.run().unwrap();

        let calls = recorder.calls();
        let sink_at = calls.iter().position(|c| c.starts_with("sink:")).unwrap();
        let finalize_at = calls.iter().position(|c| c == "finalize").unwrap();
        assert!(sink_at < finalize_at, "finalize must run after the stop hook failure");
        assert!(calls[sink_at].contains("runtime.shutdown.on_stop"));
        assert!(calls[sink_at].contains("forced stop failure"));
    }

    #[test]
    fn stop_signal_from_stop_hook_is_benign() {
        let recorder = Arc::new(Recorder::default());
        let (seen, sink) = collecting_sink();
        let mut heartbeat = HeartbeatLoop::new()
            .with_logger(LoggerHooks::full(&recorder))
            .with_on_tick(stop_after(1))
            .with_on_stop(|| Ok(Flow::stop("again")))
            .with_envelope_sink(sink);

        heartbeat.run().unwrap();

        assert!(seen.borrow().is_empty());
        assert_eq!(recorder.count("finalize"), 1);
    }

    #[test]
    fn finalize_failure_is_enveloped() {
        let recorder = Arc::new(Recorder {
            fail_finalize: true,
            ..Recorder::default()
        });
        let (seen, sink) = collecting_sink();
        let mut heartbeat = HeartbeatLoop::new()
            .with_logger(LoggerHooks::full(&recorder))
            .with_on_tick(stop_after(1))
            .with_envelope_sink(sink);

        heartbeat.run().unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("runtime.shutdown.finalize"));
    }

    #[test]
    fn logger_tick_failure_is_enveloped_not_propagated() {
        let recorder = Arc::new(Recorder {
            fail_tick: true,
            ..Recorder::default()
        });
        let (seen, sink) = collecting_sink();
        let mut heartbeat = HeartbeatLoop::new()
            .with_logger(LoggerHooks::full(&recorder))
            .with_on_tick(stop_after(3))
            .with_envelope_sink(sink);

        heartbeat.run().unwrap();

        assert_eq!(heartbeat.tick_id(), 3);
        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|e| e.contains("runtime.logger.tick")));
    }

    #[test]
    fn ingress_stop_skips_the_rest_of_the_iteration() {
        let recorder = Arc::new(Recorder::default());
        let starts = Rc::new(Cell::new(0));
        let ingress = ScriptedIngress {
            polls: VecDeque::from([
                Ok(Flow::Continue),
                Err(anyhow::anyhow!("console vanished")),
                Ok(Flow::stop("command: quit")),
            ]),
            starts: starts.clone(),
        };
        let (seen, sink) = collecting_sink();
        let tick_calls = Rc::new(Cell::new(0));
        let tick_counter = tick_calls.clone();
        let mut heartbeat = HeartbeatLoop::new()
            .with_logger(LoggerHooks::full(&recorder))
            .with_ingress(Box::new(ingress))
            .with_envelope_sink(sink)
            .with_on_tick(move || {
                tick_counter.set(tick_counter.get() + 1);
                Ok(Flow::Continue)
            });

        heartbeat.run().unwrap();

        assert_eq!(starts.get(), 1);
        assert_eq!(recorder.ticks(), vec![1, 2]);
        assert_eq!(tick_calls.get(), 2);
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("runtime.ingress.poll"));
        assert_eq!(heartbeat.stop_handle().reason().as_deref(), Some("command: quit"));
    }

    #[test]
    fn start_hook_stop_prevents_any_tick() {
        let tick_calls = Rc::new(Cell::new(0));
        let tick_counter = tick_calls.clone();
        let mut heartbeat = HeartbeatLoop::new()
            .with_on_start(|| Ok(Flow::stop("not today")))
            .with_on_tick(move || {
                tick_counter.set(tick_counter.get() + 1);
                Ok(Flow::Continue)
            });

        heartbeat.run().unwrap();

        assert_eq!(heartbeat.tick_id(), 0);
        assert_eq!(tick_calls.get(), 0);
    }

    #[test]
    fn start_hook_failure_is_enveloped_and_loop_still_runs() {
        let (seen, sink) = collecting_sink();
        let mut heartbeat = HeartbeatLoop::new()
            .with_on_start(|| anyhow::bail!("warm-up failed"))
            .with_on_tick(stop_after(2))
            .with_envelope_sink(sink);

        heartbeat.run().unwrap();

        assert_eq!(heartbeat.tick_id(), 2);
        assert!(seen.borrow()[0].contains("runtime.start"));
    }

    #[test]
    fn without_envelope_route_failures_fall_back_to_event_log() {
        let recorder = Arc::new(Recorder::default());
        let mut ticks = 0;
        let mut heartbeat = HeartbeatLoop::new()
            .with_logger(LoggerHooks::full(&recorder))
            .with_on_tick(move || {
                ticks += 1;
                if ticks == 1 {
                    anyhow::bail!("first tick failed");
                }
                Ok(Flow::stop("done"))
            });

        heartbeat.run().unwrap();

        assert_eq!(recorder.count("error:runtime.heartbeat.unhandled"), 1);
        assert_eq!(heartbeat.tick_id(), 2);
    }

    #[test]
    fn without_route_or_logger_failure_propagates_after_shutdown() {
        let stopped = Rc::new(Cell::new(false));
        let stop_flag = stopped.clone();
        let mut heartbeat = HeartbeatLoop::new()
            .with_on_tick(|| anyhow::bail!("nobody is listening"))
            .with_on_stop(move || {
                stop_flag.set(true);
                Ok(Flow::Continue)
            });

        let err = heartbeat.run().unwrap_err();

        assert!(
            matches!(&err, LillyError::Unhandled { origin, .. } if origin == "runtime.tick"),
            "unexpected error: {err}"
        );
        assert!(err.to_string().contains("nobody is listening"));
        assert!(stopped.get(), "stop hook must still run");
        assert_eq!(heartbeat.tick_id(), 1);
        assert_eq!(heartbeat.state(), LoopState::Stopped);
    }

    #[test]
    fn sink_failure_propagates_after_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let mut heartbeat = HeartbeatLoop::new()
            .with_logger(LoggerHooks::full(&recorder))
            .with_on_tick(|| anyhow::bail!("tick failed"))
            .with_envelope_sink(|_envelope: Envelope| -> anyhow::Result<()> {
                anyhow::bail!("sink offline")
            });

        let err = heartbeat.run().unwrap_err();

        assert!(matches!(&err, LillyError::EnvelopeSink { origin, .. } if origin == "runtime.tick"));
        assert_eq!(recorder.count("lifecycle_stop"), 1);
        assert_eq!(recorder.count("finalize"), 1);
    }

    #[test]
    fn sink_failure_on_logger_tick_skips_the_tick_hook() {
        let recorder = Arc::new(Recorder {
            fail_tick: true,
            ..Recorder::default()
        });
        let tick_calls = Rc::new(Cell::new(0));
        let tick_counter = tick_calls.clone();
        let mut heartbeat = HeartbeatLoop::new()
            .with_logger(LoggerHooks::full(&recorder))
            .with_on_tick(move || {
                tick_counter.set(tick_counter.get() + 1);
                Ok(Flow::Continue)
            })
            .with_envelope_sink(|_envelope: Envelope| -> anyhow::Result<()> {
                anyhow::bail!("sink offline")
            });

        let err = heartbeat.run().unwrap_err();

        assert!(
            matches!(&err, LillyError::EnvelopeSink { origin, .. } if origin == "runtime.logger.tick"),
            "unexpected error: {err}"
        );
        assert_eq!(tick_calls.get(), 0, "tick hook must not run after the sink failed");
        assert_eq!(heartbeat.tick_id(), 1);
        assert_eq!(recorder.count("finalize"), 1);
    }

    #[test]
    fn ingress_is_not_started_once_stop_is_requested() {
        let starts = Rc::new(Cell::new(0));
        let ingress = ScriptedIngress {
            polls: VecDeque::new(),
            starts: starts.clone(),
        };
        let mut heartbeat = HeartbeatLoop::new()
            .with_on_start(|| Ok(Flow::stop("not today")))
            .with_ingress(Box::new(ingress));
        heartbeat.run().unwrap();
        assert_eq!(starts.get(), 0);

        let starts = Rc::new(Cell::new(0));
        let ingress = ScriptedIngress {
            polls: VecDeque::new(),
            starts: starts.clone(),
        };
        let mut heartbeat = HeartbeatLoop::new().with_ingress(Box::new(ingress));
        heartbeat.request_stop(Some("operator"));
        heartbeat.run().unwrap();
        assert_eq!(starts.get(), 0);
        assert_eq!(heartbeat.state(), LoopState::Stopped);
    }

    #[test]
    fn custom_factory_receives_origin_labels() {
        let origins = Rc::new(RefCell::new(Vec::new()));
        let factory_origins = origins.clone();
        let mut heartbeat = HeartbeatLoop::new()
            .with_on_tick(|| anyhow::bail!("tick failed"))
            .with_on_stop(|| anyhow::bail!("stop failed"))
            .with_envelopes(
                move |failure: anyhow::Error, origin: &str| {
                    factory_origins.borrow_mut().push(origin.to_string());
                    wrap_at(failure, origin)
                },
                |_envelope: Envelope| -> anyhow::Result<()> { Ok(()) },
            );
        let stop = heartbeat.stop_handle();
        heartbeat = heartbeat.with_on_start(move || {
            stop.request_stop(Some("one tick only"));
            Ok(Flow::Continue)
        });

        heartbeat.run().unwrap();

        assert_eq!(*origins.borrow(), vec!["runtime.shutdown.on_stop"]);
    }

    #[test]
    fn tick_interval_paces_iterations() {
        let mut heartbeat = HeartbeatLoop::new()
            .with_tick_interval(Duration::from_millis(20))
            .with_on_tick(stop_after(3));

        let began = Instant::now();
        heartbeat.run().unwrap();

        assert!(
            began.elapsed() >= Duration::from_millis(40),
            "two paced iterations should take at least 40ms, took {:?}",
            began.elapsed()
        );
    }

    #[test]
    fn exit_command_ends_a_console_run_cleanly() {
        let capture = CaptureWriter::default();
        let logger = Arc::new(RuntimeLogger::with_writer(
            LoggingConfig {
                heartbeat_enabled: true,
                heartbeat_every_n_ticks: 1,
                ..LoggingConfig::default()
            },
            capture.clone(),
        ));
        let handler = command_handler(Some(logger.clone() as Arc<dyn EventLog>));
        let ingress = TerminalIngress::new(
            handler,
            IngressOptions::default(),
            Box::new(|| -> std::io::Result<Box<dyn LineSource>> {
                let lines = VecDeque::from(["exit".to_string()]);
                Ok(Box::new(lines) as Box<dyn LineSource>)
            }),
        );
        let envelopes = logger.clone();
        let deadline = Instant::now() + Duration::from_secs(5);

        let mut heartbeat = HeartbeatLoop::new()
            .with_logger(LoggerHooks::full(&logger))
            .with_ingress(Box::new(ingress))
            .with_tick_interval(Duration::ZERO)
            .with_envelope_sink(move |envelope: Envelope| {
                envelopes.envelope(&envelope, Fields::new().with("source", "runtime_boundary"))
            })
            .with_on_tick(move || {
                thread::sleep(Duration::ZERO);
                Ok(if Instant::now() > deadline {
                    Flow::stop("deadline")
                } else {
                    Flow::Continue
                })
            });

        heartbeat.run().unwrap();

        let records = capture.records();
        let count = |event: &str| records.iter().filter(|r| r["event"] == event).count();
        assert_eq!(count("runtime.lifecycle.start"), 1);
        assert_eq!(count("runtime.lifecycle.stop"), 1);
        assert_eq!(count("runtime.envelope.received"), 0);
        assert_eq!(count("runtime.command.received"), 1);
        assert!(records.iter().all(|r| r["level"] != "ERROR"));

        let stop = records
            .iter()
            .find(|r| r["event"] == "runtime.lifecycle.stop")
            .unwrap();
        assert_eq!(stop["fields"]["reason"], "command: exit");

        let tick_ids: Vec<u64> = records
            .iter()
            .filter(|r| r["event"] == "runtime.heartbeat.tick")
            .map(|r| r["fields"]["tick_id"].as_u64().unwrap())
            .collect();
        assert!(tick_ids.iter().copied().eq(1..=tick_ids.len() as u64));
        assert_eq!(
            records.last().unwrap()["event"],
            "runtime.logging.finalize"
        );
    }
}
