use tether_session::{IoKind, SessionState};

use crate::*;

/// A session deleted in one quantum still resolves, as deleted, until the
/// end of the next one.
#[test]
fn deleted_session_resolves_until_end_of_next_quantum() {
    let mut m = Manual::new(0);
    let app = Recorder::new();
    let (_, client, _) = m.pair(&app, 0);
    let wrk = m.wrk(0);

    assert!(wrk.clear(client));
    let s = wrk.session(client).unwrap();
    assert_eq!(s.state, SessionState::TransportDeleted);
    assert!(wrk.pool().get_if_valid(client.session_index).is_none());

    // End of the deleting quantum: nothing freed yet.
    assert_eq!(wrk.end_quantum(), 0);
    assert!(wrk.session(client).is_some());

    // End of the following one.
    assert_eq!(wrk.end_quantum(), 1);
    assert!(wrk.session(client).is_none());
}

#[test]
fn events_for_deleted_sessions_are_dropped() {
    let mut m = Manual::new(1);
    let app = Recorder::new();
    let (_, client, _) = m.pair(&app, 1);

    assert!(m.wrk(1).clear(client));
    m.main.post_io(client, IoKind::Rx).unwrap();
    m.settle();

    let notes = app.notes_for(client);
    assert!(
        !notes.iter().any(|n| matches!(n, Note::Rx { .. })),
        "{notes:?}"
    );
    assert_eq!(notes.last(), Some(&Note::Cleanup { handle: client }));
}

/// Filters and summaries never count a deleted session as live.
#[test]
fn deleted_sessions_are_not_listed() {
    let mut m = Manual::new(0);
    let app = Recorder::new();
    let (_, client, _) = m.pair(&app, 0);
    let wrk = m.wrk(0);

    let before = wrk.summary(0);
    assert_eq!(before.active, 3);

    wrk.clear(client);
    assert!(!wrk.live_handles().contains(&client));
    let filter = tether_session::SessionFilter {
        verbose: 1,
        force_print: true,
        ..Default::default()
    };
    let listed = wrk.filter(&filter);
    assert!(listed.sessions.iter().all(|s| s.handle != client));
}
