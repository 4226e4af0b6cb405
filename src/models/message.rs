//! Raw inbound messages.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a channel message. Every edit of a message shares the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub channel_id: i64,
    pub message_id: i64,
}

impl MessageKey {
    pub fn new(channel_id: i64, message_id: i64) -> Self {
        Self {
            channel_id,
            message_id,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.message_id)
    }
}

/// Text exactly as delivered by the message source.
///
/// Never mutated after receipt: an edit arrives as a new `RawMessage` with the
/// same key and a higher `edit_seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub channel_id: i64,
    pub message_id: i64,
    #[serde(default)]
    pub edit_seq: u32,
    pub text: String,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(
        channel_id: i64,
        message_id: i64,
        edit_seq: u32,
        text: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            channel_id,
            message_id,
            edit_seq,
            text: text.into(),
            received_at,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.channel_id, self.message_id)
    }
}
