use tether_session::{SessionError, SessionState};

use crate::*;

#[test]
fn migrated_session_keeps_its_data() {
    let mut m = Manual::new(2);
    let app = Recorder::new();
    let (_, client, server) = m.pair(&app, 2);
    assert_eq!(server.thread_index, 1);

    app.send(client, b"before");
    m.settle();
    assert_eq!(app.received(server), b"before");

    m.main.migrate_session(server, 0).unwrap();
    m.settle();

    let new = app
        .notes()
        .into_iter()
        .find_map(|n| match n {
            Note::Migrated { old, new } if old == server => Some(new),
            _ => None,
        })
        .expect("no migration notice");
    assert_eq!(new.thread_index, 0);
    assert!(m.wrk(1).session(server).is_none());

    let s = m.wrk(0).session(new).unwrap();
    assert_eq!(s.state, SessionState::Ready);
    assert!(s.has_fifos());
    assert!(app.holds(new));
    assert!(!app.holds(server));

    app.send(client, b"after");
    m.settle();
    assert_eq!(app.received(new), b"beforeafter");
    assert_eq!(m.main.stats()[1].1.migrations, 1);

    // The old handle was never torn down from the app's point of view.
    assert!(!app.notes_for(server).contains(&Note::Cleanup { handle: server }));
}

#[test]
fn only_ready_sessions_migrate() {
    let mut m = Manual::new(1);
    let app = Recorder::new();
    let (listener, _, _) = m.pair(&app, 1);

    let err = m.wrk(0).migrate(listener, 1).unwrap_err();
    assert!(
        matches!(err, SessionError::BadState { op: "migrate", .. }),
        "{err}"
    );
    assert_eq!(
        m.wrk(0).session(listener).unwrap().state,
        SessionState::Listening
    );
}

#[test]
fn migrating_to_the_same_thread_is_a_no_op() {
    let mut m = Manual::new(1);
    let app = Recorder::new();
    let (_, client, _) = m.pair(&app, 1);

    m.wrk(1).migrate(client, 1).unwrap();
    m.settle();
    assert!(!app.notes().iter().any(|n| matches!(n, Note::Migrated { .. })));
    assert_eq!(m.wrk(1).session(client).unwrap().state, SessionState::Ready);
}

#[test]
fn migration_into_a_full_pool_resets_the_old_handle() {
    let mut m = Manual::with_config(SessionConfig {
        max_sessions_per_worker: 1,
        ..config(2)
    });
    let app = Recorder::new();
    // Thread 0 is filled by the listener.
    let (_, client, server) = m.pair(&app, 2);
    assert_eq!(server.thread_index, 1);

    m.main.migrate_session(server, 0).unwrap();
    m.settle();

    assert!(!app.notes().iter().any(|n| matches!(n, Note::Migrated { .. })));
    let notes = app.notes_for(server);
    assert_eq!(
        notes[notes.len() - 2..],
        [
            Note::Disconnected {
                handle: server,
                reset: true
            },
            Note::Cleanup { handle: server },
        ]
    );
    assert!(!app.holds(server));
    assert!(m.wrk(1).session(server).is_none());
    assert_eq!(m.main.stats()[0].1.pool_full, 1);

    // The peer sees its connection go away.
    assert!(app
        .notes_for(client)
        .iter()
        .any(|n| matches!(n, Note::Disconnected { .. })));
}
