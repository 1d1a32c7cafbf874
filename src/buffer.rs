//! Per-scrape output accumulator.

use std::fmt;

/// Append-only text buffer for one scrape.
///
/// Growth is amortised by the underlying `String`. The session passes the
/// size of the previous scrape as capacity so that steady-state scrapes
/// allocate once.
#[derive(Debug, Default, Clone)]
pub struct MetricBuffer {
    text: String,
}

impl MetricBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with room for `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { text: String::with_capacity(capacity) }
    }

    /// Appends `text`.
    #[inline]
    pub fn append(&mut self, text: &str) {
        self.text.push_str(text);
    }

    /// Number of bytes appended so far.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Whether nothing has been appended.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// The accumulated text.
    #[must_use]
    pub fn render(&self) -> &str {
        &self.text
    }

    /// Consumes the buffer, returning its text.
    #[must_use]
    pub fn into_string(self) -> String {
        self.text
    }
}

impl fmt::Write for MetricBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s);
        Ok(())
    }
}
