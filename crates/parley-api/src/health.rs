use axum::{Json, extract::State};

use parley_types::api::HealthResponse;

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.gateway.hub.stats().await;
    Json(HealthResponse {
        status: "ok".into(),
        conversations: stats.conversations,
        connections: stats.connections,
    })
}
