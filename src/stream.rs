//! Stream aggregator
//!
//! Statements arrive as many partial frames. A single shared accumulator
//! (at most one stream is active at a time) collects them into one value
//! and exposes the live buffer for progressive rendering.

use std::sync::Mutex;

#[derive(Default)]
struct StreamState {
    active: bool,
    buffer: String,
}

/// Accumulates an in-progress statement across partial frames.
#[derive(Default)]
pub struct StreamAggregator {
    inner: Mutex<StreamState>,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark streaming active. Idempotent; every chunk re-asserts it.
    pub fn begin(&self) {
        self.inner.lock().unwrap().active = true;
    }

    /// Extend the live buffer with one chunk.
    pub fn append(&self, chunk: &str) {
        self.inner.lock().unwrap().buffer.push_str(chunk);
    }

    /// Finalize the stream: hand back the assembled text, clear the buffer
    /// and the active flag. Returns `None` when the buffer is empty; a
    /// sentinel with nothing accumulated finalizes nothing.
    pub fn finish(&self) -> Option<String> {
        let mut state = self.inner.lock().unwrap();
        if state.buffer.is_empty() {
            return None;
        }
        state.active = false;
        Some(std::mem::take(&mut state.buffer))
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().active
    }

    /// Current contents of the live buffer.
    pub fn snapshot(&self) -> String {
        self.inner.lock().unwrap().buffer.clone()
    }
}
