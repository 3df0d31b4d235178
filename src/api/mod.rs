//! HTTP surface of a session worker: a liveness probe and the realtime
//! upgrade endpoint that bridges browsers to the desktop tunnel.

pub mod auth;
pub mod error;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    routing::get,
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::shutdown::ShutdownCoordinator;

pub use auth::{AuthPolicy, SessionClaims, SessionTokens};

/// Upper bound on concurrent realtime connections per worker. One desktop
/// rarely has more than a couple of viewers; this stops a runaway client
/// from opening hundreds of forwards over the same SSH connection.
pub const MAX_REALTIME_CONNECTIONS: usize = 32;

#[derive(Clone)]
pub struct AppState {
    pub session_id: String,
    /// Local tunnel listener every realtime connection dials.
    pub tunnel_addr: SocketAddr,
    pub shutdown: ShutdownCoordinator,
}

pub fn router(state: AppState, policy: AuthPolicy) -> Router {
    let policy = Arc::new(policy);

    let protected = Router::new()
        .route("/ws", get(handlers::ws_desktop))
        .layer(axum::middleware::from_fn(move |req, next| {
            let p = policy.clone();
            async move { auth::require_session_auth(p, req, next).await }
        }));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .with_state(state)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http())
}
