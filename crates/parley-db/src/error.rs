use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("user {user_id} is not a participant of conversation {conversation_id}")]
    NotParticipant { user_id: Uuid, conversation_id: Uuid },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("metadata encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database unavailable: {0}")]
    Unavailable(String),
}
