//! Streaming event types and utilities

use crate::types::Usage;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Events emitted while a provider streams a generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeltaEvent {
    /// Incremental text fragment, in generation order
    Delta { text: String },
    /// Generation completed; `text` is the full output
    Done { text: String, usage: Usage },
    /// Generation ended abnormally
    Error { message: String },
}

/// A stream of delta events. Finite and not restartable.
pub type DeltaStream = Pin<Box<dyn Stream<Item = DeltaEvent> + Send>>;

/// Accumulates deltas into the cumulative generated text
#[derive(Debug, Default)]
pub struct TextAccumulator {
    text: String,
    deltas: usize,
}

impl TextAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return the cumulative text so far
    pub fn push(&mut self, delta: &str) -> &str {
        self.text.push_str(delta);
        self.deltas += 1;
        &self.text
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn delta_count(&self) -> usize {
        self.deltas
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// Splits a byte stream into newline-delimited records.
///
/// Chunks may split records (and UTF-8 sequences) at arbitrary offsets;
/// bytes are buffered until a full line is available.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every complete, non-blank line it finished
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Return any trailing record left without a newline
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        if text.is_empty() { None } else { Some(text) }
    }
}
