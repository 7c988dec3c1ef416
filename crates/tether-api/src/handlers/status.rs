//! /stats, /events, /states, /protos, /listeners, /daemon/shutdown handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use tether_core::{SegmentUsage, SessionHandle, ThreadIndex, TransportProto};
use tether_session::{QueueStatus, SessionState, StatsSnapshot};

use super::{session_error, ApiError, ApiState};

// ── /stats ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatsResponse {
    pub threads: Vec<ThreadStats>,
    pub segments: Vec<SegmentInfo>,
    pub lookup: LookupInfo,
}

#[derive(Serialize)]
pub struct ThreadStats {
    pub thread: ThreadIndex,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
}

#[derive(Serialize)]
pub struct SegmentInfo {
    pub name: String,
    #[serde(flatten)]
    pub usage: SegmentUsage,
}

#[derive(Serialize)]
pub struct LookupInfo {
    pub established: usize,
    pub half_open: usize,
    pub listeners: usize,
}

pub async fn handle_stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    let main = &state.main;
    let threads = main
        .stats()
        .into_iter()
        .map(|(thread, stats)| ThreadStats { thread, stats })
        .collect();
    let segments = main
        .segment_usage()
        .into_iter()
        .map(|(name, usage)| SegmentInfo { name, usage })
        .collect();
    let (established, half_open, listeners) = main.lookup().counts();

    Json(StatsResponse {
        threads,
        segments,
        lookup: LookupInfo {
            established,
            half_open,
            listeners,
        },
    })
}

#[derive(Serialize)]
pub struct StatsClearResponse {
    pub cleared: bool,
}

pub async fn handle_stats_clear(State(state): State<ApiState>) -> Json<StatsClearResponse> {
    state.main.clear_stats();
    tracing::info!("session stats cleared via API");
    Json(StatsClearResponse { cleared: true })
}

// ── /events ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventsResponse {
    pub queues: Vec<QueueStatus>,
}

pub(super) fn events(
    state: &ApiState,
    thread: Option<ThreadIndex>,
) -> Result<EventsResponse, ApiError> {
    if let Some(thread) = thread {
        state.main.worker(thread).map_err(session_error)?;
    }
    let queues = state
        .main
        .queue_status()
        .into_iter()
        .filter(|q| thread.map_or(true, |t| t == q.thread))
        .collect();
    Ok(EventsResponse { queues })
}

pub async fn handle_events(State(state): State<ApiState>) -> Result<Json<EventsResponse>, ApiError> {
    events(&state, None).map(Json)
}

// ── /states ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatesResponse {
    pub states: Vec<&'static str>,
}

pub(super) fn states() -> StatesResponse {
    StatesResponse {
        states: SessionState::ALL.iter().map(|s| s.as_str()).collect(),
    }
}

pub async fn handle_states() -> Json<StatesResponse> {
    Json(states())
}

// ── /protos ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ProtosResponse {
    /// Protocols with a registered transport.
    pub protos: Vec<TransportProto>,
}

pub(super) fn protos(state: &ApiState) -> ProtosResponse {
    ProtosResponse {
        protos: state.main.transports().protos(),
    }
}

pub async fn handle_protos(State(state): State<ApiState>) -> Json<ProtosResponse> {
    Json(protos(&state))
}

// ── /listeners/{proto} ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ListenersResponse {
    pub proto: TransportProto,
    pub listeners: Vec<ListenerInfo>,
}

#[derive(Serialize)]
pub struct ListenerInfo {
    pub local: String,
    pub fib_index: u32,
    pub session: Option<SessionHandle>,
    pub connection_index: u32,
}

pub(super) fn listeners(state: &ApiState, proto: TransportProto) -> ListenersResponse {
    let main = &state.main;
    let transport = main.transports().get(proto);
    let mut listeners: Vec<ListenerInfo> = main
        .lookup()
        .listeners_of(proto)
        .into_iter()
        .map(|(key, conn)| ListenerInfo {
            local: key.lcl.to_string(),
            fib_index: key.fib_index,
            session: transport
                .as_ref()
                .and_then(|t| t.get_listener(conn.connection_index))
                .map(|c| c.session),
            connection_index: conn.connection_index,
        })
        .collect();
    listeners.sort_by_key(|l| l.connection_index);
    ListenersResponse { proto, listeners }
}

pub async fn handle_listeners(
    State(state): State<ApiState>,
    Path(proto): Path<String>,
) -> Result<Json<ListenersResponse>, ApiError> {
    let proto: TransportProto = proto
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("unknown input `{proto}`")))?;
    Ok(Json(listeners(&state, proto)))
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
