use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use parley_db::ChatStore;
use parley_types::models::{Conversation, ConversationPurpose};

use crate::error::ChatError;

/// Finds or creates the private conversation a connection is admitted to.
#[derive(Clone)]
pub struct ConversationResolver {
    store: Arc<dyn ChatStore>,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Resolve the conversation between `requester` and `partner_id` for
    /// `purpose`, creating it (with both participants) on first contact.
    ///
    /// Two simultaneous first contacts for the same pair and purpose both
    /// end up with the same conversation: the store keeps one live private
    /// conversation per pair and purpose and hands the loser the winner's.
    pub async fn resolve(&self, requester: Uuid, partner_id: &str, purpose: &str) -> Result<Conversation, ChatError> {
        let (partner, purpose) = parse_request(requester, partner_id, purpose)?;
        let store = self.store.clone();

        tokio::task::spawn_blocking(move || resolve_blocking(store.as_ref(), requester, partner, purpose)).await?
    }
}

/// Validate admission parameters.
pub fn parse_request(
    requester: Uuid,
    partner_id: &str,
    purpose: &str,
) -> Result<(Uuid, ConversationPurpose), ChatError> {
    if purpose.is_empty() {
        return Err(ChatError::invalid("Conversation purpose is required"));
    }
    let purpose: ConversationPurpose = purpose
        .parse()
        .map_err(|_| ChatError::invalid("Invalid conversation purpose"))?;

    if partner_id.is_empty() {
        return Err(ChatError::invalid("Partner ID is required"));
    }
    let partner: Uuid = partner_id
        .parse()
        .map_err(|_| ChatError::invalid("Invalid partner ID format"))?;

    if partner == requester {
        return Err(ChatError::invalid("Cannot chat with yourself"));
    }

    Ok((partner, purpose))
}

fn resolve_blocking(
    store: &dyn ChatStore,
    requester: Uuid,
    partner: Uuid,
    purpose: ConversationPurpose,
) -> Result<Conversation, ChatError> {
    if let Some(conversation) = store.find_direct_conversation(requester, partner, purpose)? {
        for user_id in [requester, partner] {
            if store.ensure_participant(conversation.id, user_id)? {
                info!("User {} re-added to conversation {}", user_id, conversation.id);
            }
        }
        info!(
            "Found conversation {} for {} and {} ({})",
            conversation.id, requester, partner, purpose
        );
        return Ok(conversation);
    }

    info!(
        "No conversation for {} and {} ({}), creating one",
        requester, partner, purpose
    );
    let conversation = store.create_conversation_with_participants(requester, partner, purpose)?;
    info!("Conversation {} ready for {} and {}", conversation.id, requester, partner);
    Ok(conversation)
}
