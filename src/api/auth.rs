use std::sync::Arc;

use axum::{
    extract::{Query, Request},
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::error::ApiError;

/// Claims carried by a session access token. Issued by the gateway with
/// the secret the controller injects into every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub exp: i64,
}

/// HS256 signer/verifier over the shared secret.
#[derive(Clone)]
pub struct SessionTokens {
    enc: EncodingKey,
    dec: DecodingKey,
}

impl SessionTokens {
    pub fn new(secret: &str) -> Self {
        Self {
            enc: EncodingKey::from_secret(secret.as_bytes()),
            dec: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn sign(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = SessionClaims {
            user_id: user_id.to_string(),
            session_id: session_id.map(str::to_string),
            exp: (Utc::now() + ttl).timestamp(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.enc)
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims, jsonwebtoken::errors::Error> {
        let validation = Validation::new(Algorithm::HS256);
        Ok(jsonwebtoken::decode::<SessionClaims>(token, &self.dec, &validation)?.claims)
    }
}

/// Who may open a realtime connection on this worker.
#[derive(Clone)]
pub struct AuthPolicy {
    pub tokens: SessionTokens,
    pub user_id: String,
    pub session_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct AuthQuery {
    token: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.to_string())
}

fn parse_query(req: &Request) -> AuthQuery {
    Query::<AuthQuery>::try_from_uri(req.uri())
        .map(|Query(q)| q)
        .unwrap_or_default()
}

/// Gate the upgrade endpoint.
///
/// 1. Bearer header, falling back to `?token=` for browser websocket clients
///    that cannot set headers. Missing or unverifiable: 401.
/// 2. `userId` claim must equal the worker's owner: otherwise 403.
/// 3. `?sessionId=` must equal the worker's session (and the `sessionId`
///    claim, when present, must agree): otherwise 403.
pub async fn require_session_auth(
    policy: Arc<AuthPolicy>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let query = parse_query(&req);
    let token = extract_bearer(&req)
        .or(query.token)
        .ok_or(ApiError::AuthRequired)?;

    let claims = policy.tokens.verify(&token).map_err(|e| {
        tracing::debug!(error = %e, "rejected session token");
        ApiError::TokenInvalid
    })?;

    if claims.user_id != policy.user_id {
        tracing::warn!(token_user = %claims.user_id, "token user does not own this session");
        return Err(ApiError::UserMismatch);
    }
    if query.session_id.as_deref() != Some(policy.session_id.as_str()) {
        return Err(ApiError::SessionMismatch);
    }
    if let Some(claimed) = &claims.session_id {
        if claimed != &policy.session_id {
            return Err(ApiError::SessionMismatch);
        }
    }

    Ok(next.run(req).await)
}
