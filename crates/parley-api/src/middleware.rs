use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use parley_gateway::ChatError;

use crate::AppState;

/// The caller, as established by [`require_auth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub Uuid);

/// Extract and validate the JWT from the Authorization header.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ChatError> {
    let user_id = state.tokens.authenticate(req.headers())?;
    req.extensions_mut().insert(AuthUser(user_id));
    Ok(next.run(req).await)
}
