// Truncating message text and the shared buffer used by output readers

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Maximum number of characters kept in one attempt message
pub const MAX_MESSAGE_LENGTH: usize = 500_000;

/// MessageText is a length-bounded text with a one-way truncation flag.
///
/// Length is counted in characters. Once `is_truncated` is set it stays set,
/// and the text only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredMessage", into = "StoredMessage")]
pub struct MessageText {
    text: String,
    char_count: usize,
    is_truncated: bool,
}

#[derive(Serialize, Deserialize)]
struct StoredMessage {
    message: String,
    #[serde(default)]
    is_truncated: bool,
}

impl From<StoredMessage> for MessageText {
    fn from(stored: StoredMessage) -> Self {
        let mut text = MessageText::new(stored.message);
        text.is_truncated |= stored.is_truncated;
        text
    }
}

impl From<MessageText> for StoredMessage {
    fn from(text: MessageText) -> Self {
        StoredMessage {
            message: text.text,
            is_truncated: text.is_truncated,
        }
    }
}

impl MessageText {
    /// Create a message, truncating it to the maximum length
    pub fn new(text: impl Into<String>) -> Self {
        let mut message = MessageText::default();
        message.push_str(&text.into());
        message
    }

    /// Create a message snapshot reported by another process
    pub fn with_truncation(text: impl Into<String>, is_truncated: bool) -> Self {
        let mut message = MessageText::new(text);
        message.is_truncated |= is_truncated;
        message
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in characters
    pub fn len(&self) -> usize {
        self.char_count
    }

    pub fn is_empty(&self) -> bool {
        self.char_count == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.is_truncated
    }

    /// Append text. Returns false when nothing could be appended.
    pub fn push_str(&mut self, value: &str) -> bool {
        if self.is_truncated || value.is_empty() {
            return false;
        }

        let remaining = MAX_MESSAGE_LENGTH - self.char_count;
        let incoming = value.chars().count();

        if incoming <= remaining {
            self.text.push_str(value);
            self.char_count += incoming;
            return true;
        }

        let cut = value
            .char_indices()
            .nth(remaining)
            .map(|(index, _)| index)
            .unwrap_or(value.len());
        self.text.push_str(&value[..cut]);
        self.char_count += remaining;
        self.is_truncated = true;
        tracing::debug!(
            max_length = MAX_MESSAGE_LENGTH,
            "Message reached maximum length and was truncated"
        );
        true
    }

    /// Append a line followed by a newline
    pub fn push_line(&mut self, line: &str) -> bool {
        let appended = self.push_str(line);
        self.push_str("\n") || appended
    }

    /// Replace the content with a newer snapshot of the same stream.
    ///
    /// Only snapshots that extend the current text are taken; the truncation
    /// flag never reverts.
    pub fn replace_with(&mut self, snapshot: &MessageText) -> bool {
        if snapshot.char_count < self.char_count || !snapshot.text.starts_with(&self.text) {
            return false;
        }
        let changed = snapshot.text != self.text || (snapshot.is_truncated && !self.is_truncated);
        self.text.clone_from(&snapshot.text);
        self.char_count = snapshot.char_count;
        self.is_truncated |= snapshot.is_truncated;
        changed
    }
}

impl From<&str> for MessageText {
    fn from(value: &str) -> Self {
        MessageText::new(value)
    }
}

impl From<String> for MessageText {
    fn from(value: String) -> Self {
        MessageText::new(value)
    }
}

/// MessageBuffer is a MessageText shared between an output reader and the
/// publisher that flushes it, guarded by a reader/writer lock.
#[derive(Debug, Clone, Default)]
pub struct MessageBuffer {
    inner: Arc<RwLock<MessageText>>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line of output. Returns true when the content changed.
    pub fn push_line(&self, line: &str) -> bool {
        self.inner.write().push_line(line)
    }

    pub fn snapshot(&self) -> MessageText {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.inner.read().is_truncated()
    }
}
