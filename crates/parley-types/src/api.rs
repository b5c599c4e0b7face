use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::OutboundMessage;

// -- JWT Claims --

/// Bearer token claims. Shared by the REST middleware and the WebSocket
/// admission handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub exp: usize,
    pub iat: usize,
}

// -- Gateway admission --

/// Query string of `GET /ws`. Both fields are validated by the resolver so
/// that a missing value and a malformed one produce the same error path.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    pub purpose: Option<String>,
    pub partner_id: Option<String>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageListResponse {
    pub conversation_id: Uuid,
    pub messages: Vec<OutboundMessage>,
}

// -- Health --

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub conversations: usize,
    pub connections: usize,
}
