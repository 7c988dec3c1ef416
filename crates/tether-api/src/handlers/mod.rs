//! HTTP API handlers. Each one maps an operator request onto the session layer.

pub mod sessions;
pub mod status;

use std::sync::Arc;

use axum::http::StatusCode;

use tether_session::{FilterError, SessionError, SessionMain};

#[derive(Clone)]
pub struct ApiState {
    pub main: Arc<SessionMain>,
    /// Shutdown broadcast sender, signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

type ApiError = (StatusCode, String);

fn bad_request(e: FilterError) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

/// Operator mistakes are 400s, everything else is on the daemon.
fn session_error(e: SessionError) -> ApiError {
    let status = match e {
        SessionError::InvalidThread(_) | SessionError::WrongThread { .. } => {
            StatusCode::BAD_REQUEST
        }
        SessionError::NoSession(_) => StatusCode::NOT_FOUND,
        SessionError::Post(_) | SessionError::NoReply(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

// Re-export handler functions for use in router setup.
pub use sessions::{handle_clear, handle_session_clear, handle_session_inspect, handle_show};
pub use status::{
    handle_events, handle_listeners, handle_protos, handle_shutdown, handle_states, handle_stats,
    handle_stats_clear,
};
