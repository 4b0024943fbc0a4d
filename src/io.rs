//! Input and output collaborators.
//!
//! The notifier reads its payload from an [`Input`] when no message was given
//! and the listener writes every delivered payload to an [`OutputSink`].

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use crate::{PipeError, Result};

/// Where a notifier payload comes from.
pub enum Input {
    /// Literal text.
    Text(String),

    /// Everything readable from the process's standard input.
    Stdin,

    /// Everything readable from an arbitrary reader.
    Reader(Box<dyn Read + Send>),
}

impl Input {
    /// Literal text, or stdin when `message` is empty.
    pub fn from_message(message: impl Into<String>) -> Self {
        // ---
        let message = message.into();
        if message.is_empty() {
            Input::Stdin
        } else {
            Input::Text(message)
        }
    }

    /// Read the whole payload.
    ///
    /// # Errors
    ///
    /// [`PipeError::Input`] on an I/O error or when the input is not UTF-8.
    pub async fn read(self) -> Result<String> {
        // ---
        match self {
            Input::Text(text) => Ok(text),
            Input::Stdin => read_blocking(Box::new(std::io::stdin())).await,
            Input::Reader(reader) => read_blocking(reader).await,
        }
    }
}

async fn read_blocking(mut reader: Box<dyn Read + Send>) -> Result<String> {
    // ---
    let raw = tokio::task::spawn_blocking(move || {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).map(|_| raw)
    })
    .await
    .map_err(|err| PipeError::Input(format!("reader task failed: {err}")))?
    .map_err(|err| PipeError::Input(err.to_string()))?;

    String::from_utf8(raw).map_err(|err| PipeError::Input(format!("input is not valid UTF-8: {err}")))
}

/// Destination of delivered payloads.
pub trait OutputSink: Send + Sync {
    /// Write one payload.
    fn write(&self, text: &str) -> Result<()>;
}

/// Shared sink pointer.
pub type SinkPtr = Arc<dyn OutputSink>;

/// Writes each payload to stdout followed by a newline.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write(&self, text: &str) -> Result<()> {
        // ---
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{text}")
            .and_then(|_| stdout.flush())
            .map_err(|err| PipeError::Output(err.to_string()))
    }
}

/// Collects payloads in memory.
#[derive(Debug, Default, Clone)]
pub struct CaptureSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads written so far.
    pub fn lines(&self) -> Vec<String> {
        // ---
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl OutputSink for CaptureSink {
    fn write(&self, text: &str) -> Result<()> {
        // ---
        let mut lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.push(text.to_string());
        Ok(())
    }
}
