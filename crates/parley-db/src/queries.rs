use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::{debug, info};
use uuid::Uuid;

use parley_types::models::{
    Conversation, ConversationPurpose, ConversationType, DEFAULT_ROLE, Message, NewMessage,
    Participant, ReadReceipt,
};

use crate::models::{
    CONVERSATION_COLUMNS, ConversationRow, MESSAGE_COLUMNS, MessageRow, PARTICIPANT_COLUMNS,
    ParticipantRow, ReadReceiptRow, timestamp,
};
use crate::{Database, Result, StoreError};

impl Database {
    // -- Conversations --

    /// Oldest live private conversation between `user_a` and `user_b` for
    /// `purpose` that has exactly those two participants.
    pub fn find_direct_conversation(
        &self,
        user_a: Uuid,
        user_b: Uuid,
        purpose: ConversationPurpose,
    ) -> Result<Option<Conversation>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS}
                 FROM conversations c
                 JOIN conversation_participants p1 ON p1.conversation_id = c.id AND p1.user_id = ?1
                 JOIN conversation_participants p2 ON p2.conversation_id = c.id AND p2.user_id = ?2
                 WHERE c.purpose = ?3
                   AND c.type = 'private'
                   AND c.deleted_at IS NULL
                   AND (SELECT COUNT(*) FROM conversation_participants p
                        WHERE p.conversation_id = c.id) = 2
                 ORDER BY c.created_at ASC, c.id ASC
                 LIMIT 1"
            );

            let row = conn
                .query_row(
                    &sql,
                    params![user_a.to_string(), user_b.to_string(), purpose.as_str()],
                    ConversationRow::from_row,
                )
                .optional()?;

            row.map(Conversation::try_from).transpose()
        })
    }

    /// Create a private conversation plus both participant rows in one
    /// transaction.
    ///
    /// If a live conversation for the same pair and purpose already exists
    /// (a concurrent first contact won), nothing new is written: the
    /// existing conversation is returned with both participants ensured.
    pub fn create_conversation_with_participants(
        &self,
        creator_id: Uuid,
        partner_id: Uuid,
        purpose: ConversationPurpose,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let key = direct_key(creator_id, partner_id, purpose);
        let conversation = Conversation {
            id: Uuid::new_v4(),
            creator_id,
            kind: ConversationType::Private,
            purpose,
            name: Some(direct_name(creator_id, partner_id, purpose)),
            description: None,
            last_message_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let at = timestamp(now);

            let inserted = tx.execute(
                "INSERT INTO conversations
                    (id, creator_id, type, purpose, name, direct_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT DO NOTHING",
                params![
                    conversation.id.to_string(),
                    creator_id.to_string(),
                    conversation.kind.as_str(),
                    purpose.as_str(),
                    conversation.name,
                    key,
                    at,
                ],
            )?;

            if inserted == 0 {
                let existing = query_conversation_by_direct_key(&tx, &key)?
                    .ok_or(StoreError::NotFound("conversation"))?;
                upsert_participant(&tx, existing.id, creator_id, &at)?;
                upsert_participant(&tx, existing.id, partner_id, &at)?;
                tx.commit()?;

                info!(
                    "Conversation {} already exists for {} and {} ({}), reusing it",
                    existing.id, creator_id, partner_id, purpose
                );
                return Ok(existing);
            }

            for user_id in [creator_id, partner_id] {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id, joined_at, role)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![conversation.id.to_string(), user_id.to_string(), at, DEFAULT_ROLE],
                )?;
            }

            tx.commit()?;
            Ok(conversation)
        })
    }

    #[cfg(test)]
    pub(crate) fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    // -- Participants --

    /// Make sure `user_id` has an active participant row in the conversation.
    /// Returns true when a row was created or re-activated.
    pub fn ensure_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        let at = timestamp(Utc::now());
        self.with_conn(|conn| upsert_participant(conn, conversation_id, user_id, &at))
    }

    pub fn get_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Option<Participant>> {
        self.with_conn(|conn| query_participant(conn, conversation_id, user_id))
    }

    // -- Messages --

    pub fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            content: new.content.clone(),
            kind: new.kind.clone(),
            media_url: new.media_url.clone().filter(|url| !url.is_empty()),
            metadata: new.metadata.clone(),
            reply_to_message_id: new.reply_to_message_id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            match query_conversation(&tx, message.conversation_id)? {
                Some(conversation) if conversation.deleted_at.is_none() => {}
                _ => return Err(StoreError::NotFound("conversation")),
            }

            let at = timestamp(now);
            tx.execute(
                "INSERT INTO messages
                    (id, conversation_id, sender_id, content, message_type, media_url,
                     metadata, reply_to_message_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.sender_id.to_string(),
                    message.content,
                    message.kind,
                    message.media_url,
                    metadata,
                    message.reply_to_message_id.map(|id| id.to_string()),
                    at,
                ],
            )?;

            tx.execute(
                "UPDATE conversations SET last_message_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![message.id.to_string(), at, message.conversation_id.to_string()],
            )?;

            tx.commit()?;
            debug!("Message {} stored in conversation {}", message.id, message.conversation_id);
            Ok(message)
        })
    }

    /// Live messages of a conversation, oldest first.
    pub fn get_messages(&self, conversation_id: Uuid, limit: u32, offset: u32) -> Result<Vec<Message>> {
        self.with_conn(|conn| query_messages(conn, conversation_id, limit, offset))
    }

    // -- Read receipts --

    /// Record that `reader_id` has read `message_id`. Re-marking refreshes
    /// `read_at` on the existing receipt.
    pub fn upsert_read_receipt(&self, message_id: Uuid, reader_id: Uuid) -> Result<ReadReceipt> {
        let now = Utc::now();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let conversation_id: String = tx
                .query_row(
                    "SELECT conversation_id FROM messages WHERE id = ?1 AND deleted_at IS NULL",
                    [message_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(StoreError::NotFound("message"))?;

            let conversation_id: Uuid = conversation_id
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("messages.conversation_id: {}", e)))?;

            if query_participant(&tx, conversation_id, reader_id)?.is_none() {
                return Err(StoreError::NotParticipant {
                    user_id: reader_id,
                    conversation_id,
                });
            }

            let at = timestamp(now);
            tx.execute(
                "INSERT INTO message_reads (message_id, reader_id, read_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (message_id, reader_id) DO UPDATE SET read_at = excluded.read_at",
                params![message_id.to_string(), reader_id.to_string(), at],
            )?;

            tx.execute(
                "UPDATE conversation_participants SET last_read_message_id = ?1
                 WHERE conversation_id = ?2 AND user_id = ?3",
                params![message_id.to_string(), conversation_id.to_string(), reader_id.to_string()],
            )?;

            tx.commit()?;
            Ok(ReadReceipt {
                message_id,
                reader_id,
                read_at: now,
            })
        })
    }

    pub fn get_read_receipt(&self, message_id: Uuid, reader_id: Uuid) -> Result<Option<ReadReceipt>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT message_id, reader_id, read_at FROM message_reads
                     WHERE message_id = ?1 AND reader_id = ?2",
                    params![message_id.to_string(), reader_id.to_string()],
                    |row| {
                        Ok(ReadReceiptRow {
                            message_id: row.get(0)?,
                            reader_id: row.get(1)?,
                            read_at: row.get(2)?,
                        })
                    },
                )
                .optional()?;

            row.map(ReadReceipt::try_from).transpose()
        })
    }
}

/// Order-independent key for a private conversation between two users.
fn direct_key(user_a: Uuid, user_b: Uuid, purpose: ConversationPurpose) -> String {
    let (low, high) = if user_a <= user_b { (user_a, user_b) } else { (user_b, user_a) };
    format!("{}:{}:{}", low, high, purpose)
}

fn direct_name(creator_id: Uuid, partner_id: Uuid, purpose: ConversationPurpose) -> String {
    let creator = creator_id.to_string();
    let partner = partner_id.to_string();
    format!("Chat for {} & {} - {}", &creator[..8], &partner[..8], purpose)
}

fn upsert_participant(conn: &Connection, conversation_id: Uuid, user_id: Uuid, at: &str) -> Result<bool> {
    let changed = conn.execute(
        "INSERT INTO conversation_participants (conversation_id, user_id, joined_at, role)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (conversation_id, user_id) DO UPDATE
            SET left_at = NULL, joined_at = excluded.joined_at
            WHERE conversation_participants.left_at IS NOT NULL",
        params![conversation_id.to_string(), user_id.to_string(), at, DEFAULT_ROLE],
    )?;
    Ok(changed > 0)
}

fn query_conversation(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1");
    let row = conn
        .query_row(&sql, [id.to_string()], ConversationRow::from_row)
        .optional()?;
    row.map(Conversation::try_from).transpose()
}

fn query_conversation_by_direct_key(conn: &Connection, key: &str) -> Result<Option<Conversation>> {
    let sql = format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations c
         WHERE c.direct_key = ?1 AND c.deleted_at IS NULL"
    );
    let row = conn.query_row(&sql, [key], ConversationRow::from_row).optional()?;
    row.map(Conversation::try_from).transpose()
}

fn query_participant(conn: &Connection, conversation_id: Uuid, user_id: Uuid) -> Result<Option<Participant>> {
    let sql = format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM conversation_participants
         WHERE conversation_id = ?1 AND user_id = ?2"
    );
    let row = conn
        .query_row(
            &sql,
            params![conversation_id.to_string(), user_id.to_string()],
            ParticipantRow::from_row,
        )
        .optional()?;
    row.map(Participant::try_from).transpose()
}

fn query_messages(conn: &Connection, conversation_id: Uuid, limit: u32, offset: u32) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE conversation_id = ?1 AND deleted_at IS NULL
         ORDER BY created_at ASC, rowid ASC
         LIMIT ?2 OFFSET ?3"
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
        .query_map(params![conversation_id.to_string(), limit, offset], MessageRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(Message::try_from).collect()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
