use axum::http::{HeaderMap, header};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

use parley_gateway::ChatError;
use parley_types::api::Claims;

/// HS256 signing and verification keys, built once from the configured
/// secret.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Mint a token for `user_id`. Token issuance belongs to the identity
    /// service; this exists for operators and tests.
    pub fn issue(&self, user_id: Uuid, ttl: chrono::Duration) -> anyhow::Result<String> {
        let now = chrono::Utc::now();
        let claims = Claims {
            user_id,
            iat: now.timestamp() as usize,
            exp: (now + ttl).timestamp() as usize,
        };

        let token = encode(&Header::default(), &claims, &self.encoding)?;
        Ok(token)
    }

    /// Validate signature and expiry, returning the authenticated user.
    pub fn verify(&self, token: &str) -> Result<Uuid, ChatError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims.user_id)
            .map_err(|e| ChatError::unauthorized(format!("Unauthorized: {}", e)))
    }

    /// Authenticate the `Authorization: Bearer <token>` header.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Uuid, ChatError> {
        self.verify(bearer_token(headers)?)
    }
}

/// Pull the token out of an `Authorization` header. The scheme is matched
/// case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ChatError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ChatError::unauthorized("Unauthorized: missing authorization header"))?;

    match value.trim().split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(ChatError::unauthorized("Unauthorized: expected a bearer token")),
    }
}
