use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use tracing::debug;
use uuid::Uuid;

use parley_db::{ChatStore, StoreError};
use parley_gateway::ChatError;
use parley_types::api::{MessageListResponse, MessageQuery};
use parley_types::events::OutboundMessage;
use parley_types::models::ReadReceipt;

use crate::AppState;
use crate::middleware::AuthUser;

/// Largest page a client may ask for.
pub const MAX_PAGE: u32 = 200;

/// History of one conversation, oldest first. Only active participants may
/// read it.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<MessageQuery>,
) -> Result<Json<MessageListResponse>, ChatError> {
    let limit = query.limit.clamp(1, MAX_PAGE);
    let offset = query.offset;

    // Run blocking DB reads off the async runtime
    let store = state.store.clone();
    let messages = tokio::task::spawn_blocking(move || {
        require_participant(store.as_ref(), conversation_id, user_id)?;
        store.list_messages(conversation_id, limit, offset)
    })
    .await??;

    debug!(
        "{} messages from conversation {} for {}",
        messages.len(),
        conversation_id,
        user_id
    );

    Ok(Json(MessageListResponse {
        conversation_id,
        messages: messages.iter().map(OutboundMessage::from).collect(),
    }))
}

/// Record that the caller has read `message_id`.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<ReadReceipt>, ChatError> {
    let store = state.store.clone();
    let receipt = tokio::task::spawn_blocking(move || store.mark_read(message_id, user_id)).await??;
    Ok(Json(receipt))
}

fn require_participant(store: &dyn ChatStore, conversation_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
    match store.participant(conversation_id, user_id)? {
        Some(participant) if participant.is_active() => Ok(()),
        _ => Err(StoreError::NotParticipant {
            user_id,
            conversation_id,
        }),
    }
}
