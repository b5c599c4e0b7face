use axum::{
    extract::{
        Query, State,
        rejection::QueryRejection,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use parley_gateway::ChatError;
use parley_types::api::ConnectParams;

use crate::AppState;

/// `GET /ws?purpose=..&partner_id=..`
///
/// The credential and the conversation are settled before the upgrade, so
/// a rejected client gets a plain HTTP status instead of a socket.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ConnectParams>, QueryRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let user_id = match state.tokens.authenticate(&headers) {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!("WebSocket admission refused: {}", e);
            return e.into_response();
        }
    };

    if state.gateway.is_shutting_down() {
        return ChatError::ShuttingDown.into_response();
    }

    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => {
            warn!("User {} sent unreadable admission query: {}", user_id, rejection);
            return ChatError::invalid(rejection.body_text()).into_response();
        }
    };

    let purpose = params.purpose.as_deref().unwrap_or_default();
    let partner_id = params.partner_id.as_deref().unwrap_or_default();
    let conversation = match state.gateway.resolver().resolve(user_id, partner_id, purpose).await {
        Ok(conversation) => conversation,
        Err(e) => {
            warn!("User {} refused admission: {}", user_id, e);
            return e.into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!(
        "User {} admitted to conversation {} ({})",
        user_id, conversation.id, conversation.purpose
    );

    let gateway = state.gateway.clone();
    ws.max_message_size(gateway.settings.max_message_size)
        .on_upgrade(move |socket| gateway.serve(socket, user_id, conversation.id))
}
