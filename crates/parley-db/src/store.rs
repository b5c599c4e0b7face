use uuid::Uuid;

use parley_types::models::{Conversation, ConversationPurpose, Message, NewMessage, Participant, ReadReceipt};

use crate::{Database, Result};

/// The persistence operations the gateway and HTTP layer depend on.
///
/// Calls block; async callers run them under `spawn_blocking`.
pub trait ChatStore: Send + Sync + 'static {
    fn send_message(&self, new: &NewMessage) -> Result<Message>;

    fn list_messages(&self, conversation_id: Uuid, limit: u32, offset: u32) -> Result<Vec<Message>>;

    fn mark_read(&self, message_id: Uuid, reader_id: Uuid) -> Result<ReadReceipt>;

    fn read_receipt(&self, message_id: Uuid, reader_id: Uuid) -> Result<Option<ReadReceipt>>;

    fn find_direct_conversation(
        &self,
        user_a: Uuid,
        user_b: Uuid,
        purpose: ConversationPurpose,
    ) -> Result<Option<Conversation>>;

    fn create_conversation_with_participants(
        &self,
        creator_id: Uuid,
        partner_id: Uuid,
        purpose: ConversationPurpose,
    ) -> Result<Conversation>;

    fn ensure_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool>;

    fn participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Option<Participant>>;
}

impl ChatStore for Database {
    fn send_message(&self, new: &NewMessage) -> Result<Message> {
        self.insert_message(new)
    }

    fn list_messages(&self, conversation_id: Uuid, limit: u32, offset: u32) -> Result<Vec<Message>> {
        self.get_messages(conversation_id, limit, offset)
    }

    fn mark_read(&self, message_id: Uuid, reader_id: Uuid) -> Result<ReadReceipt> {
        self.upsert_read_receipt(message_id, reader_id)
    }

    fn read_receipt(&self, message_id: Uuid, reader_id: Uuid) -> Result<Option<ReadReceipt>> {
        self.get_read_receipt(message_id, reader_id)
    }

    fn find_direct_conversation(
        &self,
        user_a: Uuid,
        user_b: Uuid,
        purpose: ConversationPurpose,
    ) -> Result<Option<Conversation>> {
        Database::find_direct_conversation(self, user_a, user_b, purpose)
    }

    fn create_conversation_with_participants(
        &self,
        creator_id: Uuid,
        partner_id: Uuid,
        purpose: ConversationPurpose,
    ) -> Result<Conversation> {
        Database::create_conversation_with_participants(self, creator_id, partner_id, purpose)
    }

    fn ensure_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        Database::ensure_participant(self, conversation_id, user_id)
    }

    fn participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Option<Participant>> {
        self.get_participant(conversation_id, user_id)
    }
}
