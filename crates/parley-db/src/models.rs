//! Database row types. These map directly to SQLite rows and are converted
//! into the `parley-types` domain models at the crate boundary.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::Row;
use uuid::Uuid;

use parley_types::models::{Conversation, Message, Participant, ReadReceipt};

use crate::{Result, StoreError};

pub struct ConversationRow {
    pub id: String,
    pub creator_id: String,
    pub kind: String,
    pub purpose: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub last_message_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

pub const CONVERSATION_COLUMNS: &str = "c.id, c.creator_id, c.type, c.purpose, c.name, c.description, \
     c.last_message_id, c.created_at, c.updated_at, c.deleted_at";

impl ConversationRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            creator_id: row.get(1)?,
            kind: row.get(2)?,
            purpose: row.get(3)?,
            name: row.get(4)?,
            description: row.get(5)?,
            last_message_id: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            deleted_at: row.get(9)?,
        })
    }
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = StoreError;

    fn try_from(row: ConversationRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(&row.id, "conversations.id")?,
            creator_id: parse_uuid(&row.creator_id, "conversations.creator_id")?,
            kind: row
                .kind
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("conversation {}: {}", row.id, e)))?,
            purpose: row
                .purpose
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("conversation {}: {}", row.id, e)))?,
            name: row.name,
            description: row.description,
            last_message_id: parse_opt_uuid(row.last_message_id.as_deref(), "conversations.last_message_id")?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            deleted_at: parse_opt_timestamp(row.deleted_at.as_deref())?,
        })
    }
}

pub struct ParticipantRow {
    pub conversation_id: String,
    pub user_id: String,
    pub joined_at: String,
    pub left_at: Option<String>,
    pub role: String,
    pub last_read_message_id: Option<String>,
}

pub const PARTICIPANT_COLUMNS: &str =
    "conversation_id, user_id, joined_at, left_at, role, last_read_message_id";

impl ParticipantRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            conversation_id: row.get(0)?,
            user_id: row.get(1)?,
            joined_at: row.get(2)?,
            left_at: row.get(3)?,
            role: row.get(4)?,
            last_read_message_id: row.get(5)?,
        })
    }
}

impl TryFrom<ParticipantRow> for Participant {
    type Error = StoreError;

    fn try_from(row: ParticipantRow) -> Result<Self> {
        Ok(Self {
            conversation_id: parse_uuid(&row.conversation_id, "participants.conversation_id")?,
            user_id: parse_uuid(&row.user_id, "participants.user_id")?,
            joined_at: parse_timestamp(&row.joined_at)?,
            left_at: parse_opt_timestamp(row.left_at.as_deref())?,
            role: row.role,
            last_read_message_id: parse_opt_uuid(
                row.last_read_message_id.as_deref(),
                "participants.last_read_message_id",
            )?,
        })
    }
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub message_type: String,
    pub media_url: Option<String>,
    pub metadata: Option<String>,
    pub reply_to_message_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

pub const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, message_type, media_url, \
     metadata, reply_to_message_id, created_at, updated_at, deleted_at";

impl MessageRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            content: row.get(3)?,
            message_type: row.get(4)?,
            media_url: row.get(5)?,
            metadata: row.get(6)?,
            reply_to_message_id: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            deleted_at: row.get(10)?,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self> {
        let metadata = match row.metadata.as_deref() {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };

        Ok(Self {
            id: parse_uuid(&row.id, "messages.id")?,
            conversation_id: parse_uuid(&row.conversation_id, "messages.conversation_id")?,
            sender_id: parse_uuid(&row.sender_id, "messages.sender_id")?,
            content: row.content,
            kind: row.message_type,
            media_url: row.media_url.filter(|url| !url.is_empty()),
            metadata,
            reply_to_message_id: parse_opt_uuid(row.reply_to_message_id.as_deref(), "messages.reply_to_message_id")?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            deleted_at: parse_opt_timestamp(row.deleted_at.as_deref())?,
        })
    }
}

pub struct ReadReceiptRow {
    pub message_id: String,
    pub reader_id: String,
    pub read_at: String,
}

impl TryFrom<ReadReceiptRow> for ReadReceipt {
    type Error = StoreError;

    fn try_from(row: ReadReceiptRow) -> Result<Self> {
        Ok(Self {
            message_id: parse_uuid(&row.message_id, "message_reads.message_id")?,
            reader_id: parse_uuid(&row.reader_id, "message_reads.reader_id")?,
            read_at: parse_timestamp(&row.read_at)?,
        })
    }
}

/// Timestamps are stored as RFC 3339 with millisecond precision so that
/// lexical order matches chronological order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by SQLite's datetime('now') carry no timezone.
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

fn parse_opt_timestamp(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_timestamp).transpose()
}

fn parse_uuid(raw: &str, column: &str) -> Result<Uuid> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("{} '{}': {}", column, raw, e)))
}

fn parse_opt_uuid(raw: Option<&str>, column: &str) -> Result<Option<Uuid>> {
    raw.filter(|s| !s.is_empty())
        .map(|s| parse_uuid(s, column))
        .transpose()
}
