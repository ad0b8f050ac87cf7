//! Thread-safe output buffer with lazy compaction
//!
//! The reader task appends raw bytes as they arrive from the child's pipes;
//! consumers pull complete lines out. Consumed bytes are not removed
//! immediately: a cursor advances past them, and the backing storage is only
//! compacted once the consumed prefix crosses a threshold. Appends stay cheap
//! and line reads avoid a copy of the whole remaining buffer on every call.

use std::sync::Mutex;

/// Consumed-prefix length that triggers compaction on the next line read.
pub const DEFAULT_COMPACT_THRESHOLD: usize = 4096;

#[derive(Debug, Default)]
struct Inner {
    data: Vec<u8>,
    cursor: usize,
}

/// Append-only byte buffer with line-oriented extraction.
///
/// All operations lock the same internal mutex, so producers and consumers
/// may share a `LineBuffer` freely across tasks.
#[derive(Debug)]
pub struct LineBuffer {
    inner: Mutex<Inner>,
    compact_threshold: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_COMPACT_THRESHOLD)
    }
}

impl LineBuffer {
    /// Create a buffer that compacts once the consumed prefix reaches
    /// `compact_threshold` bytes.
    pub fn new(compact_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            compact_threshold,
        }
    }

    /// Append bytes to the end of the buffer.
    ///
    /// Never compacts, so a producer on the hot path does not pay for the
    /// consumer's bookkeeping.
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.data.extend_from_slice(bytes);
    }

    /// Read the next complete line, including its `\n` terminator.
    ///
    /// Returns an empty string when no complete line is buffered; partial
    /// lines are never surfaced. Compacts the consumed prefix once it has
    /// grown past the configured threshold.
    pub fn read_line(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        if inner.cursor >= inner.data.len() {
            return String::new();
        }
        let Some(offset) = inner.data[inner.cursor..].iter().position(|&b| b == b'\n') else {
            return String::new();
        };
        let end = inner.cursor + offset + 1;
        let line = String::from_utf8_lossy(&inner.data[inner.cursor..end]).into_owned();
        inner.cursor = end;

        if inner.cursor >= self.compact_threshold {
            let cursor = inner.cursor;
            inner.data.drain(..cursor);
            inner.cursor = 0;
        }

        line
    }

    /// Read everything from the cursor to the end and clear the buffer.
    pub fn read_all(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        if inner.cursor >= inner.data.len() {
            return String::new();
        }
        let rest = String::from_utf8_lossy(&inner.data[inner.cursor..]).into_owned();
        inner.data.clear();
        inner.cursor = 0;
        rest
    }

    /// Drop all content and reset the cursor.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.data.clear();
        inner.cursor = 0;
    }

    /// True when no unread content remains.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.cursor >= inner.data.len()
    }
}
