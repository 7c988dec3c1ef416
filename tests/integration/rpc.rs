use tether_session::{EventKind, PostError, SessionError, SessionState};

use crate::*;

/// A close requested from outside runs on the owning worker and only there.
#[test]
fn close_from_another_thread_runs_on_owner() {
    let mut m = Manual::new(2);
    let app = Recorder::new();
    let (_, client, server) = m.pair(&app, 2);

    m.main.close_session(server).unwrap();
    // Nothing happens until thread 1 drains its queue.
    assert_eq!(m.wrk(1).session(server).unwrap().state, SessionState::Ready);
    m.wrk(1).run_once();
    assert_eq!(
        m.wrk(1).session(server).unwrap().state,
        SessionState::AppClosing
    );

    m.settle();
    assert!(m.wrk(1).session(server).is_none());
    assert!(m.wrk(2).session(client).is_none());
    assert!(app
        .notes_for(client)
        .contains(&Note::Disconnected {
            handle: client,
            reset: false
        }));
    assert_eq!(app.notes_for(server).last(), Some(&Note::Cleanup { handle: server }));
}

#[test]
fn control_pool_overflow_is_rejected_and_counted() {
    let mut m = Manual::with_config(SessionConfig {
        ctrl_pool_size: 2,
        ..config(1)
    });

    m.main.rpc(1, |_| {}).unwrap();
    m.main.rpc(1, |_| {}).unwrap();
    let err = m.main.rpc(1, |_| {}).unwrap_err();
    assert!(
        matches!(
            err,
            SessionError::Post(PostError::CtrlExhausted {
                thread: 1,
                capacity: 2
            })
        ),
        "{err}"
    );
    assert_eq!(m.main.stats()[1].1.ctrl_rejected, 1);
    assert_eq!(m.main.worker(1).unwrap().ctrl().in_use(), 2);

    // Slots come back once the worker has run the closures.
    m.wrk(1).run_once();
    assert_eq!(m.main.worker(1).unwrap().ctrl().in_use(), 0);
    m.main.rpc(1, |_| {}).unwrap();
}

#[test]
fn full_event_queue_drops_and_counts() {
    let mut m = Manual::with_config(SessionConfig {
        event_queue_size: 4,
        ..config(0)
    });

    for _ in 0..4 {
        m.main.rpc(0, |_| {}).unwrap();
    }
    let err = m.main.rpc(0, |_| {}).unwrap_err();
    assert!(
        matches!(
            err,
            SessionError::Post(PostError::QueueFull {
                thread: 0,
                kind: EventKind::Rpc
            })
        ),
        "{err}"
    );
    let sender = m.main.worker(0).unwrap();
    assert_eq!(sender.stats().overflow_count(EventKind::Rpc), 1);
    // The dropped closure gave its control slot back.
    assert_eq!(sender.ctrl().in_use(), 4);

    assert_eq!(m.wrk(0).run_once(), 4);
}

#[test]
fn rpc_to_unknown_thread_is_refused() {
    let m = Manual::new(1);
    let err = m.main.rpc(5, |_| {}).unwrap_err();
    assert!(matches!(err, SessionError::InvalidThread(5)), "{err}");
}

#[tokio::test]
async fn rpc_call_returns_the_owners_answer() {
    let layer = Spawned::new(2);
    for thread in 0..=2 {
        let answer = layer
            .main
            .rpc_call(thread, |wrk| wrk.thread_index())
            .await
            .unwrap();
        assert_eq!(answer, thread);
    }
}

#[tokio::test]
async fn clear_all_reaches_every_thread() {
    // One worker, so both halves of every connection are counted by the
    // same sweep.
    let layer = Spawned::new(1);
    let main = &layer.main;
    let app = Recorder::closing();
    let index = main.apps().attach(app.clone());
    main.listen(index, server_key()).await.unwrap();
    for opaque in 0..3 {
        main.connect(index, client_tuple(), opaque).await.unwrap();
    }
    assert!(wait_for(Duration::from_secs(5), || app.opened() == 6).await);

    // Listener plus both halves of three connections.
    assert_eq!(main.clear_all().await.unwrap(), 7);

    let mut empty = false;
    for _ in 0..500 {
        let summaries = main.thread_summaries(0).await.unwrap();
        if summaries.iter().all(|t| t.total == 0) {
            empty = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(empty, "sessions survived clear all");
    assert_eq!(main.lookup().counts(), (0, 0, 0));
}
