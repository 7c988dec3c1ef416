use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;

use tether_api::handlers::sessions::{ClearRequest, ShowParams};
use tether_api::handlers::{
    handle_clear, handle_events, handle_listeners, handle_session_clear, handle_session_inspect,
    handle_show, handle_shutdown, handle_stats,
};
use tether_api::ApiState;

use crate::*;

fn api(layer: &Spawned) -> ApiState {
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    ApiState {
        main: layer.main.clone(),
        shutdown_tx,
    }
}

async fn show(state: &ApiState, q: &str) -> Result<Value, (StatusCode, String)> {
    let Json(resp) = handle_show(
        State(state.clone()),
        Query(ShowParams { q: q.to_string() }),
    )
    .await?;
    Ok(serde_json::to_value(resp).unwrap())
}

/// An echo-less pair: the recorder listens and connects to itself.
async fn open_pair(layer: &Spawned) -> (Arc<Recorder>, SessionHandle) {
    let app = Recorder::new();
    let index = layer.main.apps().attach(app.clone());
    layer.main.listen(index, server_key()).await.unwrap();
    let client = layer.main.connect(index, client_tuple(), 3).await.unwrap();
    assert!(wait_for(Duration::from_secs(5), || app.opened() == 2).await);
    (app, client)
}

#[tokio::test]
async fn show_without_filters_lists_every_thread() {
    let layer = Spawned::new(2);
    let state = api(&layer);

    let resp = show(&state, "").await.unwrap();
    assert_eq!(resp["view"], "threads");
    assert_eq!(resp["threads"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn malformed_queries_are_bad_requests() {
    let layer = Spawned::new(1);
    let state = api(&layer);

    let (status, msg) = show(&state, "bogus").await.unwrap_err();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(msg, "unknown input `bogus`");

    let (status, msg) = show(&state, "range 9 3").await.unwrap_err();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(msg, "invalid range start: 9 end: 3");

    let (status, msg) = handle_clear(
        State(state.clone()),
        Json(ClearRequest {
            query: "thread 1".to_string(),
        }),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(msg, "session <nn> required, but not set.");

    let (status, _) = show(&state, "thread 9").await.unwrap_err();
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = handle_listeners(State(state.clone()), Path("sctp".to_string()))
        .await
        .err()
        .unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn one_session_in_detail() {
    let layer = Spawned::new(1);
    let state = api(&layer);
    let (_app, client) = open_pair(&layer).await;

    let q = format!("thread {} index {}", client.thread_index, client.session_index);
    let resp = show(&state, &q).await.unwrap();
    assert_eq!(resp["view"], "session");
    assert_eq!(resp["state"], "READY");
    assert_eq!(resp["proto"], "loopback");
    assert_eq!(resp["opaque"], 3);

    // The same session, reached through its transport connection.
    let conn = resp["connection_index"].as_u64().unwrap();
    let q = format!("thread {} proto loopback index {conn}", client.thread_index);
    let by_conn = show(&state, &q).await.unwrap();
    assert_eq!(by_conn["view"], "session");
    assert_eq!(by_conn["handle"], resp["handle"]);

    let q = format!("thread {} proto loopback index 999", client.thread_index);
    let (status, _) = show(&state, &q).await.unwrap_err();
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = handle_session_inspect(State(state.clone()), Path((1, 999)))
        .await
        .err()
        .unwrap();
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn filtered_listing_counts_matches() {
    let layer = Spawned::new(1);
    let state = api(&layer);
    let _pair = open_pair(&layer).await;

    let resp = show(&state, "thread 1 state ready verbose").await.unwrap();
    assert_eq!(resp["view"], "filter");
    assert_eq!(resp["matched"], 2);
    assert_eq!(resp["sessions"].as_array().unwrap().len(), 2);

    let resp = show(&state, "listeners loopback").await.unwrap();
    assert_eq!(resp["view"], "listeners");
    let listeners = resp["listeners"].as_array().unwrap();
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0]["local"], SERVER);
}

#[tokio::test]
async fn clearing_a_session_twice_finds_nothing_the_second_time() {
    let layer = Spawned::new(1);
    let state = api(&layer);
    let (app, client) = open_pair(&layer).await;
    let path = (client.thread_index, client.session_index);

    let Json(resp) = handle_session_clear(State(state.clone()), Path(path))
        .await
        .unwrap();
    assert_eq!(resp.cleared, 1);
    assert!(
        wait_for(Duration::from_secs(5), || app
            .notes_for(client)
            .contains(&Note::Disconnected {
                handle: client,
                reset: true
            }))
        .await
    );

    let (status, _) = handle_session_clear(State(state.clone()), Path(path))
        .await
        .err()
        .unwrap();
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_views_cover_every_worker() {
    let layer = Spawned::new(2);
    let state = api(&layer);

    let Json(stats) = handle_stats(State(state.clone())).await;
    assert_eq!(stats.threads.len(), 3);
    assert_eq!(stats.segments.len(), 3);
    assert_eq!(stats.lookup.listeners, 0);

    let Json(events) = handle_events(State(state.clone())).await.unwrap();
    assert_eq!(events.queues.len(), 3);

    let resp = show(&state, "events thread 2").await.unwrap();
    assert_eq!(resp["view"], "events");
    assert_eq!(resp["queues"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn shutdown_is_broadcast() {
    let layer = Spawned::new(0);
    let state = api(&layer);
    let mut rx = state.shutdown_tx.subscribe();

    let Json(resp) = handle_shutdown(State(state.clone())).await;
    assert_eq!(resp.message, "Shutdown initiated");
    assert!(rx.recv().await.is_ok());
}
