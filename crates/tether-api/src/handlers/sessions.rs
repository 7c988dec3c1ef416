//! /sessions handlers: show, inspect and clear.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use tether_core::{SessionHandle, ThreadIndex};
use tether_session::{ClearQuery, FilterResult, SessionSummary, ShowQuery, ThreadSummary};

use super::status::{EventsResponse, ListenersResponse, ProtosResponse, StatesResponse};
use super::{bad_request, session_error, ApiError, ApiState};

// ── /sessions?q=… (GET) ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ShowParams {
    /// Everything after `show session`, e.g. `thread 1 state ready verbose`.
    #[serde(default)]
    pub q: String,
}

#[derive(Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum ShowResponse {
    Threads { threads: Vec<ThreadSummary> },
    Filter(FilterResult),
    Session(SessionSummary),
    Protos(ProtosResponse),
    States(StatesResponse),
    Listeners(ListenersResponse),
    Events(EventsResponse),
}

pub async fn handle_show(
    State(state): State<ApiState>,
    Query(params): Query<ShowParams>,
) -> Result<Json<ShowResponse>, ApiError> {
    let query = ShowQuery::parse_str(&params.q).map_err(bad_request)?;
    tracing::debug!(?query, "show session");

    let response = match query {
        ShowQuery::Protos => ShowResponse::Protos(super::status::protos(&state)),
        ShowQuery::States => ShowResponse::States(super::status::states()),
        ShowQuery::Listeners(proto) => {
            ShowResponse::Listeners(super::status::listeners(&state, proto))
        }
        ShowQuery::Events(thread) => ShowResponse::Events(super::status::events(&state, thread)?),
        ShowQuery::One(handle) => ShowResponse::Session(inspect(&state, handle).await?),
        ShowQuery::Connection {
            thread,
            proto,
            index,
        } => {
            let main = &state.main;
            main.worker(thread).map_err(session_error)?;
            let handle = main
                .transports()
                .get(proto)
                .and_then(|t| t.get_connection(index, thread))
                .map(|c| c.session)
                .ok_or((
                    StatusCode::NOT_FOUND,
                    format!("no {proto} connection {index} on thread {thread}"),
                ))?;
            ShowResponse::Session(inspect(&state, handle).await?)
        }
        ShowQuery::Tuple(tuple) => {
            let main = &state.main;
            let handle = main
                .lookup()
                .find_session(&tuple, main.transports())
                .ok_or((StatusCode::NOT_FOUND, format!("no session matches {tuple}")))?;
            ShowResponse::Session(inspect(&state, handle).await?)
        }
        ShowQuery::Filter(filter) => {
            ShowResponse::Filter(state.main.filter(filter).await.map_err(session_error)?)
        }
        ShowQuery::All { verbose } => ShowResponse::Threads {
            threads: state
                .main
                .thread_summaries(verbose)
                .await
                .map_err(session_error)?,
        },
    };
    Ok(Json(response))
}

async fn inspect(state: &ApiState, handle: SessionHandle) -> Result<SessionSummary, ApiError> {
    state
        .main
        .rpc_call(handle.thread_index, move |wrk| wrk.session_summary(handle))
        .await
        .map_err(session_error)?
        .ok_or((StatusCode::NOT_FOUND, format!("no session {handle}")))
}

// ── /sessions/{thread}/{index} (GET) ──────────────────────────────────────────

pub async fn handle_session_inspect(
    State(state): State<ApiState>,
    Path((thread, index)): Path<(ThreadIndex, u32)>,
) -> Result<Json<SessionSummary>, ApiError> {
    inspect(&state, SessionHandle::new(thread, index)).await.map(Json)
}

// ── /sessions/{thread}/{index} (DELETE) ───────────────────────────────────────

#[derive(Serialize)]
pub struct ClearResponse {
    /// Sessions scheduled for clearing.
    pub cleared: usize,
}

pub async fn handle_session_clear(
    State(state): State<ApiState>,
    Path((thread, index)): Path<(ThreadIndex, u32)>,
) -> Result<Json<ClearResponse>, ApiError> {
    let handle = SessionHandle::new(thread, index);
    clear_one(&state, handle).await.map(Json)
}

async fn clear_one(state: &ApiState, handle: SessionHandle) -> Result<ClearResponse, ApiError> {
    let cleared = state
        .main
        .rpc_call(handle.thread_index, move |wrk| wrk.clear(handle))
        .await
        .map_err(session_error)?;
    if !cleared {
        return Err((StatusCode::NOT_FOUND, format!("no session {handle}")));
    }
    tracing::info!(%handle, "session cleared via API");
    Ok(ClearResponse { cleared: 1 })
}

// ── /sessions/clear (POST) ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ClearRequest {
    /// Everything after `clear session`, e.g. `thread 0 session 3` or `all`.
    pub query: String,
}

pub async fn handle_clear(
    State(state): State<ApiState>,
    Json(req): Json<ClearRequest>,
) -> Result<Json<ClearResponse>, ApiError> {
    match ClearQuery::parse_str(&req.query).map_err(bad_request)? {
        ClearQuery::One(handle) => clear_one(&state, handle).await.map(Json),
        ClearQuery::All => {
            let cleared = state.main.clear_all().await.map_err(session_error)?;
            tracing::info!(cleared, "all sessions cleared via API");
            Ok(Json(ClearResponse { cleared }))
        }
    }
}
