pub mod auth;
pub mod gateway;
pub mod health;
pub mod messages;
pub mod middleware;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parley_db::ChatStore;
use parley_gateway::Gateway;

use crate::auth::TokenKeys;
use crate::middleware::require_auth;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub store: Arc<dyn ChatStore>,
    pub gateway: Gateway,
    pub tokens: TokenKeys,
}

impl AppStateInner {
    pub fn new(gateway: Gateway, tokens: TokenKeys) -> AppState {
        Arc::new(Self {
            store: gateway.store.clone(),
            gateway,
            tokens,
        })
    }
}

/// Every route the server exposes. `/health` and `/ws` sit outside the auth
/// middleware; `/ws` authenticates in its handler before upgrading.
pub fn build_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/conversations/{conversation_id}/messages", get(messages::list_messages))
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health::health))
        .route("/ws", get(gateway::ws_upgrade))
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
