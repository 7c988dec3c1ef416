use tether_session::{SessionError, SessionState, TransportError};

use crate::*;

/// Client opened from thread 2 lands its server half on the first worker the
/// assigner hands out, with both halves READY and mirrored.
#[test]
fn cross_thread_connect_reaches_ready() {
    let mut m = Manual::new(2);
    let app = Recorder::new();
    let (listener, client, server) = m.pair(&app, 2);

    assert_eq!(listener.thread_index, 0);
    assert_eq!(client.thread_index, 2);
    assert_eq!(server.thread_index, 1);

    for h in [client, server] {
        let s = m.wrk(h.thread_index).session(h).unwrap();
        assert_eq!(s.state, SessionState::Ready, "{h}");
        assert!(s.has_fifos(), "{h}");
    }

    let c = m.wrk(2).session(client).unwrap().tuple;
    let s = m.wrk(1).session(server).unwrap().tuple;
    assert_eq!(c.reversed(), s);
    assert_eq!(c.rmt, SERVER.parse().unwrap());
    assert_ne!(c.lcl.port, 0, "ephemeral port not filled in");

    let lookup = m.main.lookup();
    assert_eq!(lookup.find_established(&c).map(|r| r.thread_index), Some(2));
    assert_eq!(lookup.find_established(&s).map(|r| r.thread_index), Some(1));
    assert!(lookup.find_half_open(&c.local_key()).is_none());
    assert_eq!(
        app.notes_for(client),
        vec![Note::Opened {
            handle: client,
            origin: SessionOrigin::Connected { opaque: 7 },
        }]
    );
    assert_eq!(app.opened(), 2);
}

#[test]
fn zero_workers_keeps_everything_on_the_main_thread() {
    let mut m = Manual::new(0);
    let app = Recorder::new();
    let (listener, client, server) = m.pair(&app, 0);

    for h in [listener, client, server] {
        assert_eq!(h.thread_index, 0);
    }
    assert_eq!(m.wrk(0).pool().len(), 3);
}

#[test]
fn connect_to_nothing_is_refused() {
    let mut m = Manual::new(1);
    let app = Recorder::new();
    let index = m.attach(&app);

    let err = m.wrk(1).connect(index, tuple_to("127.0.0.1:9"), 3).unwrap_err();
    assert!(
        matches!(err, SessionError::Transport(TransportError::Refused(_))),
        "{err}"
    );
    m.settle();
    assert!(m.wrk(1).pool().is_empty());
    assert_eq!(app.notes(), vec![]);
}

#[test]
fn local_pool_exhaustion_fails_the_connect() {
    let mut m = Manual::with_config(SessionConfig {
        max_sessions_per_worker: 1,
        ..config(2)
    });
    let app = Recorder::new();
    m.pair(&app, 2);
    let index = m.attach(&app);

    let err = m.wrk(2).connect(index, client_tuple(), 8).unwrap_err();
    assert!(matches!(err, SessionError::PoolFull(_)), "{err}");
    let stats = m.main.stats();
    assert_eq!(stats[2].1.pool_full, 1);
}

/// The accepting worker has no room: the client hears connect-failed with
/// its opaque tag and nothing is left behind.
#[test]
fn accept_side_exhaustion_fails_the_connect() {
    let mut m = Manual::with_config(SessionConfig {
        max_sessions_per_worker: 1,
        ..config(1)
    });
    let app = Recorder::new();
    let index = m.attach(&app);
    m.wrk(0).listen(index, server_key()).unwrap();

    // Thread 1 is the only worker, so client and server halves compete for
    // its single slot.
    let client = m.wrk(1).connect(index, client_tuple(), 5).unwrap();
    m.settle();

    assert_eq!(
        app.notes(),
        vec![Note::Failed {
            handle: client,
            opaque: 5
        }]
    );
    assert!(m.wrk(1).pool().is_empty());
    assert_eq!(m.main.lookup().counts(), (0, 0, 1));
    assert_eq!(m.main.stats()[1].1.pool_full, 1);
}
