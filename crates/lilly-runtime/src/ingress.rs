//! Command ingress – turns console input into command invocations without
//! ever blocking the tick thread.
//!
//! [`CommandIngress`] is the boundary the heartbeat loop polls once per tick.
//! [`TerminalIngress`] is the console implementation:
//!
//! ```text
//!  reader thread                          tick thread
//!  ─────────────                          ───────────
//!  prompt + blocking read_line ──► queue ──► poll(): drain all, call handler
//!  end of input / read error  ──► None  ──► poll(): handler("EOF"), return
//! ```
//!
//! The reader thread is the only producer and `poll` the only consumer of an
//! unbounded FIFO.  The reader never calls the command handler itself.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::thread::{self, JoinHandle};

use anyhow::Context;
use lilly_types::Flow;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::{debug, warn};

/// Command delivered to the handler when the console reaches end of input.
pub const EOF_COMMAND: &str = "EOF";

/// Receives each non-empty command, on the tick thread.
pub type CommandHandler = Box<dyn FnMut(&str) -> anyhow::Result<Flow>>;

/// Replaceable boundary for command input.
pub trait CommandIngress {
    /// Prepare background resources.  Must be idempotent.
    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Deliver pending commands.  Must return without blocking.
    fn poll(&mut self) -> anyhow::Result<Flow>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Line sources
// ─────────────────────────────────────────────────────────────────────────────

/// Blocking source of console lines, driven from the reader thread.
pub trait LineSource {
    /// Show `prompt` and block for one line.  `Ok(None)` means end of input.
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>>;
}

/// Builds the line source on the reader thread, so the source itself does
/// not need to be `Send`.
pub type LineOpener = Box<dyn FnOnce() -> io::Result<Box<dyn LineSource>> + Send>;

/// Plain stdin/stdout console.
pub struct StdinSource<R = io::StdinLock<'static>, W = io::Stdout> {
    input: R,
    output: W,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            input: io::stdin().lock(),
            output: io::stdout(),
        }
    }

    pub fn opener() -> LineOpener {
        Box::new(|| Ok(Box::new(StdinSource::new()) as Box<dyn LineSource>))
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: BufRead, W: Write> StdinSource<R, W> {
    pub fn from_parts(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> LineSource for StdinSource<R, W> {
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        write!(self.output, "{prompt}")?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let content_len = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(content_len);
        Ok(Some(line))
    }
}

/// Fixed list of lines followed by end of input.
impl LineSource for VecDeque<String> {
    fn read_line(&mut self, _prompt: &str) -> io::Result<Option<String>> {
        Ok(self.pop_front())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TerminalIngress
// ─────────────────────────────────────────────────────────────────────────────

/// Options for [`TerminalIngress`].
#[derive(Debug, Clone)]
pub struct IngressOptions {
    pub prompt: String,
    /// Trim surrounding whitespace before dispatching a command.
    pub strip: bool,
}

impl Default for IngressOptions {
    fn default() -> Self {
        Self {
            prompt: "> ".to_string(),
            strip: true,
        }
    }
}

/// Console ingress backed by one blocking reader thread.
///
/// The command handler is fixed at construction.
pub struct TerminalIngress {
    handler: CommandHandler,
    options: IngressOptions,
    opener: Option<LineOpener>,
    queue_tx: Option<UnboundedSender<Option<String>>>,
    queue_rx: UnboundedReceiver<Option<String>>,
    reader: Option<JoinHandle<()>>,
    started: bool,
    eof_delivered: bool,
}

impl TerminalIngress {
    pub fn new(handler: CommandHandler, options: IngressOptions, opener: LineOpener) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            handler,
            options,
            opener: Some(opener),
            queue_tx: Some(queue_tx),
            queue_rx,
            reader: None,
            started: false,
            eof_delivered: false,
        }
    }

    /// Console ingress on the process stdin.
    pub fn stdin(handler: CommandHandler, options: IngressOptions) -> Self {
        Self::new(handler, options, StdinSource::opener())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn deliver_eof(&mut self) -> anyhow::Result<Flow> {
        self.eof_delivered = true;
        (self.handler)(EOF_COMMAND)
    }

    #[cfg(test)]
    fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.join().expect("reader thread panicked");
        }
    }
}

impl CommandIngress for TerminalIngress {
    fn start(&mut self) -> anyhow::Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        let (Some(open), Some(queue_tx)) = (self.opener.take(), self.queue_tx.take()) else {
            return Ok(());
        };
        let prompt = self.options.prompt.clone();
        let reader = thread::Builder::new()
            .name("terminal-ingress".to_string())
            .spawn(move || read_lines(open, &prompt, &queue_tx))
            .context("failed to spawn terminal ingress reader")?;
        self.reader = Some(reader);
        Ok(())
    }

    fn poll(&mut self) -> anyhow::Result<Flow> {
        if !self.started {
            self.start()?;
        }

        loop {
            match self.queue_rx.try_recv() {
                Ok(Some(line)) => {
                    let command = if self.options.strip {
                        line.trim()
                    } else {
                        line.as_str()
                    };
                    if command.is_empty() {
                        continue;
                    }
                    let flow = (self.handler)(command)?;
                    if flow.is_stop() {
                        return Ok(flow);
                    }
                }
                // End of input wins over anything still queued behind it.
                Ok(None) => return self.deliver_eof(),
                Err(TryRecvError::Empty) => return Ok(Flow::Continue),
                Err(TryRecvError::Disconnected) => {
                    // The reader died without sending its end marker.
                    if self.eof_delivered {
                        return Ok(Flow::Continue);
                    }
                    return self.deliver_eof();
                }
            }
        }
    }
}

/// Reader thread body.  Any failure is reported to the consumer as end of
/// input.
fn read_lines(open: LineOpener, prompt: &str, queue: &UnboundedSender<Option<String>>) {
    let mut source = match open() {
        Ok(source) => source,
        Err(e) => {
            warn!(error = %e, "failed to open console; treating as end of input");
            let _ = queue.send(None);
            return;
        }
    };

    loop {
        match source.read_line(prompt) {
            Ok(Some(line)) => {
                if queue.send(Some(line)).is_err() {
                    debug!("command ingress dropped; reader exiting");
                    return;
                }
            }
            Ok(None) => {
                debug!("console reached end of input");
                let _ = queue.send(None);
                return;
            }
            Err(e) => {
                warn!(error = %e, "console read failed; treating as end of input");
                let _ = queue.send(None);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, mpsc as std_mpsc};

    use crate::commands::classify;

    /// Handler that records every command and classifies it like the runtime does.
    fn recording_handler() -> (CommandHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: CommandHandler = Box::new(move |command: &str| -> anyhow::Result<Flow> {
            sink.lock().unwrap().push(command.to_string());
            Ok(classify(command))
        });
        (handler, seen)
    }

    fn scripted(lines: &[&str]) -> LineOpener {
        let lines: VecDeque<String> = lines.iter().map(|l| l.to_string()).collect();
        Box::new(move || Ok(Box::new(lines) as Box<dyn LineSource>))
    }

    /// Start the reader and wait until it has queued everything it will.
    fn drained_ingress(handler: CommandHandler, lines: &[&str], options: IngressOptions) -> TerminalIngress {
        let mut ingress = TerminalIngress::new(handler, options, scripted(lines));
        ingress.start().unwrap();
        ingress.join_reader();
        ingress
    }

    /// Blocks until its sender is dropped.
    struct BlockingSource(std_mpsc::Receiver<String>);

    impl LineSource for BlockingSource {
        fn read_line(&mut self, _prompt: &str) -> io::Result<Option<String>> {
            Ok(self.0.recv().ok())
        }
    }

    struct FailingSource;

    impl LineSource for FailingSource {
        fn read_line(&mut self, _prompt: &str) -> io::Result<Option<String>> {
            Err(io::Error::other("terminal vanished"))
        }
    }

    #[test]
    fn empty_lines_are_skipped_and_quit_stops() {
        let (handler, seen) = recording_handler();
        let mut ingress = drained_ingress(handler, &["help", "", "quit"], IngressOptions::default());

        let flow = ingress.poll().unwrap();
        assert!(flow.is_stop(), "quit must request a stop, got {flow:?}");
        assert_eq!(*seen.lock().unwrap(), vec!["help", "quit"]);
    }

    #[test]
    fn stop_leaves_remaining_entries_for_the_next_poll() {
        let (handler, seen) = recording_handler();
        let mut ingress = drained_ingress(handler, &["quit", "status"], IngressOptions::default());

        assert!(ingress.poll().unwrap().is_stop());
        assert_eq!(*seen.lock().unwrap(), vec!["quit"]);

        // "status" is ignored, then the end marker stops again.
        assert!(ingress.poll().unwrap().is_stop());
        assert_eq!(*seen.lock().unwrap(), vec!["quit", "status", EOF_COMMAND]);
    }

    #[test]
    fn poll_drains_everything_queued_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: CommandHandler = Box::new(move |command: &str| -> anyhow::Result<Flow> {
            sink.lock().unwrap().push(command.to_string());
            Ok(Flow::Continue)
        });
        let mut ingress = drained_ingress(handler, &["one", "two", "three"], IngressOptions::default());

        assert_eq!(ingress.poll().unwrap(), Flow::Continue);
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three", EOF_COMMAND]);

        // End of input is delivered exactly once.
        assert_eq!(ingress.poll().unwrap(), Flow::Continue);
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn strip_disabled_passes_raw_commands() {
        let (handler, seen) = recording_handler();
        let options = IngressOptions {
            strip: false,
            ..IngressOptions::default()
        };
        let mut ingress = drained_ingress(handler, &["  spaced  "], options);
        let _ = ingress.poll().unwrap();
        assert_eq!(seen.lock().unwrap()[0], "  spaced  ");
    }

    #[test]
    fn poll_returns_immediately_when_nothing_is_queued() {
        let (handler, seen) = recording_handler();
        let (tx, rx) = std_mpsc::channel::<String>();
        let opener: LineOpener = Box::new(move || Ok(Box::new(BlockingSource(rx)) as Box<dyn LineSource>));
        let mut ingress = TerminalIngress::new(handler, IngressOptions::default(), opener);

        assert_eq!(ingress.poll().unwrap(), Flow::Continue);
        assert!(ingress.is_started(), "poll must lazily start the reader");
        assert!(seen.lock().unwrap().is_empty());

        drop(tx);
        ingress.join_reader();
    }

    #[test]
    fn start_is_idempotent() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();
        let opener: LineOpener = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(VecDeque::<String>::new()) as Box<dyn LineSource>)
        });
        let (handler, _) = recording_handler();
        let mut ingress = TerminalIngress::new(handler, IngressOptions::default(), opener);

        ingress.start().unwrap();
        ingress.start().unwrap();
        ingress.join_reader();
        ingress.start().unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_failure_is_reported_as_end_of_input() {
        let (handler, seen) = recording_handler();
        let opener: LineOpener = Box::new(|| Ok(Box::new(FailingSource) as Box<dyn LineSource>));
        let mut ingress = TerminalIngress::new(handler, IngressOptions::default(), opener);
        ingress.start().unwrap();
        ingress.join_reader();

        assert!(ingress.poll().unwrap().is_stop());
        assert_eq!(*seen.lock().unwrap(), vec![EOF_COMMAND]);
    }

    #[test]
    fn open_failure_is_reported_as_end_of_input() {
        let (handler, seen) = recording_handler();
        let opener: LineOpener = Box::new(|| Err(io::Error::other("no tty")));
        let mut ingress = TerminalIngress::new(handler, IngressOptions::default(), opener);
        ingress.start().unwrap();
        ingress.join_reader();

        assert!(ingress.poll().unwrap().is_stop());
        assert_eq!(*seen.lock().unwrap(), vec![EOF_COMMAND]);
    }

    #[test]
    fn handler_failure_propagates_out_of_poll() {
        let handler: CommandHandler = Box::new(|_: &str| -> anyhow::Result<Flow> {
            Err(anyhow::anyhow!("handler broke"))
        });
        let mut ingress = drained_ingress(handler, &["help"], IngressOptions::default());
        let err = ingress.poll().unwrap_err();
        assert!(err.to_string().contains("handler broke"));
    }

    #[test]
    fn stdin_source_writes_prompt_and_trims_newline() {
        let input = io::Cursor::new(b"status\r\nnext\n".to_vec());
        let mut output = Vec::new();
        {
            let mut source = StdinSource::from_parts(input, &mut output);
            assert_eq!(source.read_line("> ").unwrap().as_deref(), Some("status"));
            assert_eq!(source.read_line("> ").unwrap().as_deref(), Some("next"));
            assert_eq!(source.read_line("> ").unwrap(), None);
        }
        assert_eq!(String::from_utf8(output).unwrap(), "> > > ");
    }
}
