//! Streaming inference support
//!
//! Hands generated text from the engine thread to whoever polls for it, and
//! describes the notifications a listener receives along the way.

use std::sync::{Mutex, PoisonError};

use crate::inference::worker::StopReason;

/// Represents a notification emitted during streaming inference.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A fragment of generated text
    Token(String),
    /// Generation ended normally
    Done(StopReason),
    /// Generation ended abnormally
    Error(String),
}

impl StreamEvent {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamEvent::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done(_))
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error(_))
    }

    /// Extracts the fragment if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamEvent::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error message if this is an Error variant
    pub fn as_error(&self) -> Option<&str> {
        match self {
            StreamEvent::Error(s) => Some(s),
            _ => None,
        }
    }
}

/// Pending output between the producer and the polling caller.
///
/// `push` appends, `drain` takes everything accumulated so far. Each fragment
/// is returned by exactly one `drain`. There is no bound: text piles up until
/// somebody polls.
#[derive(Debug, Default)]
pub struct StreamChannel {
    pending: Mutex<String>,
}

impl StreamChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, fragment: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(fragment);
    }

    pub fn drain(&self) -> String {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn clear(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Reassembles token bytes into text without splitting characters.
///
/// A token can end halfway through a multi-byte UTF-8 sequence; the incomplete
/// tail is held back until the next token completes it. Bytes that can never
/// form valid UTF-8 come out as U+FFFD; a tail still unfinished when the run
/// ends is dropped.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `bytes` and returns whatever text is now complete.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid_len = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_len]));
                    match e.error_len() {
                        // Incomplete sequence at the end, wait for more bytes
                        None => {
                            self.pending.drain(..valid_len);
                            return text;
                        }
                        Some(bad_len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_len + bad_len);
                        }
                    }
                }
            }
        }
    }

    /// Throws away an unfinished sequence, returning how many bytes it had.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}
