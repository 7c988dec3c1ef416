use tether_session::EventKind;

use crate::*;

/// New-session comes first, cleanup comes last and only once, and the
/// closing side never hears its own close back.
#[test]
fn graceful_close_notifies_in_order() {
    let mut m = Manual::new(2);
    let app = Recorder::closing();
    let (_, client, server) = m.pair(&app, 2);

    assert_eq!(app.send(client, b"ping"), 4);
    m.settle();
    assert_eq!(app.received(server), b"ping");

    assert!(m.wrk(2).app_close(client));
    m.settle();

    assert_eq!(
        app.notes_for(server),
        vec![
            Note::Opened {
                handle: server,
                origin: SessionOrigin::Accepted {
                    listener: SessionHandle::new(0, 0)
                },
            },
            Note::Rx {
                handle: server,
                bytes: 4
            },
            Note::Disconnected {
                handle: server,
                reset: false
            },
            Note::Cleanup { handle: server },
        ]
    );
    assert_eq!(
        app.notes_for(client),
        vec![
            Note::Opened {
                handle: client,
                origin: SessionOrigin::Connected { opaque: 7 },
            },
            Note::Cleanup { handle: client },
        ]
    );
    assert!(m.wrk(1).pool().is_empty());
    assert!(m.wrk(2).pool().is_empty());
    assert_eq!(m.main.lookup().counts(), (0, 0, 1));
}

#[test]
fn reset_reaches_both_sides_once() {
    let mut m = Manual::new(2);
    let app = Recorder::closing();
    let (_, client, server) = m.pair(&app, 2);

    m.main.clear_session(client).unwrap();
    m.settle();

    for h in [client, server] {
        let notes = app.notes_for(h);
        assert_eq!(notes.len(), 3, "{h}: {notes:?}");
        assert_eq!(
            notes[1],
            Note::Disconnected {
                handle: h,
                reset: true
            }
        );
        assert_eq!(notes[2], Note::Cleanup { handle: h });
        assert!(!app.holds(h));
    }
}

/// Writes made while the transport has not yet been woken share one wakeup.
#[test]
fn tx_wakeups_coalesce() {
    let mut m = Manual::new(2);
    let app = Recorder::new();
    let (_, client, server) = m.pair(&app, 2);
    let io_before = m.main.worker(2).unwrap().stats().posted_count(EventKind::Io);

    app.send(client, b"one");
    app.send(client, b"two");
    app.send(client, b"three");
    let io_after = m.main.worker(2).unwrap().stats().posted_count(EventKind::Io);
    assert_eq!(io_after - io_before, 1);

    m.settle();
    assert_eq!(app.received(server), b"onetwothree");
    let rx: Vec<_> = app
        .notes_for(server)
        .into_iter()
        .filter(|n| matches!(n, Note::Rx { .. }))
        .collect();
    assert_eq!(rx.len(), 1, "{rx:?}");
}

/// Queue depth never shows up as a reordering: a burst of data sent before
/// the peer closes is fully read before the disconnect.
#[test]
fn data_is_drained_before_disconnect() {
    let mut m = Manual::new(2);
    let app = Recorder::new();
    let (_, client, server) = m.pair(&app, 2);

    app.send(server, b"last words");
    assert!(m.wrk(1).app_close(server));
    m.settle();

    let notes = app.notes_for(client);
    let rx = notes
        .iter()
        .position(|n| matches!(n, Note::Rx { .. }))
        .expect("no rx");
    let disconnect = notes
        .iter()
        .position(|n| matches!(n, Note::Disconnected { .. }))
        .expect("no disconnect");
    assert!(rx < disconnect, "{notes:?}");
    assert_eq!(app.received(client), b"last words");
}
