use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role given to participants unless a caller says otherwise.
pub const DEFAULT_ROLE: &str = "member";

/// Message kind stored when a submission leaves `type` empty.
pub const DEFAULT_MESSAGE_KIND: &str = "text";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Private,
    Group,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }
}

impl FromStr for ConversationType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Self::Private),
            "group" => Ok(Self::Group),
            other => Err(UnknownVariant::new("conversation type", other)),
        }
    }
}

impl fmt::Display for ConversationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a conversation is for. The set is closed: anything else is rejected
/// before it can reach storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPurpose {
    NikkahService,
    RevertService,
    GeneralSupport,
    AdminSupport,
}

impl ConversationPurpose {
    pub const ALL: [ConversationPurpose; 4] = [
        Self::NikkahService,
        Self::RevertService,
        Self::GeneralSupport,
        Self::AdminSupport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NikkahService => "nikkah_service",
            Self::RevertService => "revert_service",
            Self::GeneralSupport => "general_support",
            Self::AdminSupport => "admin_support",
        }
    }
}

impl FromStr for ConversationPurpose {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("conversation purpose", s))
    }
}

impl fmt::Display for ConversationPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name one of a closed enum's values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub creator_id: Uuid,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    pub purpose: ConversationPurpose,
    pub name: Option<String>,
    pub description: Option<String>,
    pub last_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub role: String,
    pub last_read_message_id: Option<Uuid>,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// A persisted chat message. Immutable apart from the soft-delete marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub kind: String,
    pub media_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub reply_to_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Everything the store needs to persist a new message.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub sender_id: Uuid,
    pub conversation_id: Uuid,
    pub content: String,
    pub kind: String,
    pub media_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub reply_to_message_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: Uuid,
    pub reader_id: Uuid,
    pub read_at: DateTime<Utc>,
}
