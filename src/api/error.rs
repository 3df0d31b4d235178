use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Errors returned by the worker's HTTP surface.
///
/// Each variant maps to a status code, a machine-readable code string, and
/// a human-readable message, rendered as `{"error":{"code","message"}}`.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No bearer token on the request.
    AuthRequired,
    /// 401 - Token present but not signed by the shared secret, or expired.
    TokenInvalid,
    /// 403 - Token belongs to a different user than this worker serves.
    UserMismatch,
    /// 403 - `sessionId` query parameter (or claim) names another session.
    SessionMismatch,
    /// 503 - Worker is draining connections.
    ShuttingDown,
    /// 503 - Realtime connection cap reached.
    TooManyConnections,
    /// 503 - Local tunnel listener refused the connection.
    TunnelUnavailable(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired | ApiError::TokenInvalid => StatusCode::UNAUTHORIZED,
            ApiError::UserMismatch | ApiError::SessionMismatch => StatusCode::FORBIDDEN,
            ApiError::ShuttingDown
            | ApiError::TooManyConnections
            | ApiError::TunnelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::TokenInvalid => "token_invalid",
            ApiError::UserMismatch => "user_mismatch",
            ApiError::SessionMismatch => "session_mismatch",
            ApiError::ShuttingDown => "shutting_down",
            ApiError::TooManyConnections => "too_many_connections",
            ApiError::TunnelUnavailable(_) => "tunnel_unavailable",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via Authorization header or ?token= query parameter.".to_string()
            }
            ApiError::TokenInvalid => "Invalid or expired token.".to_string(),
            ApiError::UserMismatch => "Token is not valid for this session's owner.".to_string(),
            ApiError::SessionMismatch => "Token is not valid for this session.".to_string(),
            ApiError::ShuttingDown => "Session is shutting down.".to_string(),
            ApiError::TooManyConnections => {
                "Too many viewers are connected to this session.".to_string()
            }
            ApiError::TunnelUnavailable(detail) => {
                format!("Desktop tunnel is unavailable: {}.", detail)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
