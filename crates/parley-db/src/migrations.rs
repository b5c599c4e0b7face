use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            creator_id      TEXT NOT NULL,
            type            TEXT NOT NULL
                CHECK (type IN ('private', 'group')),
            purpose         TEXT NOT NULL
                CHECK (purpose IN ('nikkah_service', 'revert_service', 'general_support', 'admin_support')),
            name            TEXT,
            description     TEXT,
            direct_key      TEXT,
            last_message_id TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            deleted_at      TEXT
        );

        -- One live private conversation per (user pair, purpose)
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_direct_key
            ON conversations(direct_key)
            WHERE direct_key IS NOT NULL AND deleted_at IS NULL;

        CREATE TABLE IF NOT EXISTS conversation_participants (
            conversation_id      TEXT NOT NULL REFERENCES conversations(id),
            user_id              TEXT NOT NULL,
            joined_at            TEXT NOT NULL,
            left_at              TEXT,
            role                 TEXT NOT NULL DEFAULT 'member',
            last_read_message_id TEXT,
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON conversation_participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id                  TEXT PRIMARY KEY,
            conversation_id     TEXT NOT NULL REFERENCES conversations(id),
            sender_id           TEXT NOT NULL,
            content             TEXT NOT NULL DEFAULT '',
            message_type        TEXT NOT NULL,
            media_url           TEXT,
            metadata            TEXT,
            reply_to_message_id TEXT REFERENCES messages(id),
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            deleted_at          TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            reader_id   TEXT NOT NULL,
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, reader_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
