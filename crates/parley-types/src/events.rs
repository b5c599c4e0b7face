use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::{DEFAULT_MESSAGE_KIND, Message, NewMessage};

/// A chat message submitted by a client over its WebSocket.
///
/// Every field is optional on the wire. Empty strings for `media_url` are
/// treated the same as an absent value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatSubmission {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub reply_to_message_id: Option<Uuid>,
}

impl ChatSubmission {
    pub fn into_new_message(self, sender_id: Uuid, conversation_id: Uuid) -> NewMessage {
        let kind = if self.kind.trim().is_empty() {
            DEFAULT_MESSAGE_KIND.to_string()
        } else {
            self.kind
        };

        NewMessage {
            sender_id,
            conversation_id,
            content: self.content,
            kind,
            media_url: self.media_url.filter(|url| !url.is_empty()),
            metadata: self.metadata.map(Value::Object),
            reply_to_message_id: self.reply_to_message_id,
        }
    }
}

/// A persisted message as delivered to every connection in its conversation.
/// Optional fields are always present and rendered as `null` when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub media_url: Option<String>,
    pub metadata: Option<Value>,
    pub reply_to_message_id: Option<Uuid>,
    #[serde(with = "rfc3339_seconds")]
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for OutboundMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            kind: message.kind.clone(),
            media_url: message.media_url.clone().filter(|url| !url.is_empty()),
            metadata: message.metadata.clone().filter(|m| !m.is_null()),
            reply_to_message_id: message.reply_to_message_id,
            created_at: message.created_at,
        }
    }
}

/// Non-fatal error reported to the single connection that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
}

impl ErrorFrame {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// `created_at` on the wire: RFC 3339, whole seconds, `Z` suffix.
mod rfc3339_seconds {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
