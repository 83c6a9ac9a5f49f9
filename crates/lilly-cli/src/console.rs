//! Interactive console line source backed by `rustyline`.
//!
//! The editor is created on the ingress reader thread through
//! [`RustylineSource::opener`], so it never has to cross threads.

use std::io;

use lilly_runtime::{LineOpener, LineSource};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

pub struct RustylineSource {
    editor: DefaultEditor,
}

impl RustylineSource {
    pub fn new() -> rustyline::Result<Self> {
        Ok(Self {
            editor: DefaultEditor::new()?,
        })
    }

    pub fn opener() -> LineOpener {
        Box::new(|| -> io::Result<Box<dyn LineSource>> {
            let source = RustylineSource::new().map_err(|e| io::Error::other(e.to_string()))?;
            Ok(Box::new(source))
        })
    }
}

impl LineSource for RustylineSource {
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        let line = map_readline(self.editor.readline(prompt))?;
        if let Some(line) = &line {
            if !line.trim().is_empty() {
                // History is a convenience; a failure here is not worth a stop.
                let _ = self.editor.add_history_entry(line.as_str());
            }
        }
        Ok(line)
    }
}

/// Ctrl-D and Ctrl-C at the prompt both end console input.
fn map_readline(result: Result<String, ReadlineError>) -> io::Result<Option<String>> {
    match result {
        Ok(line) => Ok(Some(line)),
        Err(ReadlineError::Eof | ReadlineError::Interrupted) => Ok(None),
        Err(ReadlineError::Io(e)) => Err(e),
        Err(other) => Err(io::Error::other(other.to_string())),
    }
}
