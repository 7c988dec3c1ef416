//! Tether integration test harness.
//!
//! Everything runs in-process over the loopback transport. Tests either
//! drive the workers by hand from the test thread, which keeps event order
//! deterministic, or spawn them on their own threads the way tetherd does.
//!
//!   cargo test --test integration

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tether_core::config::SessionConfig;
use tether_core::{Endpoint, LocalKey, SessionHandle, SessionTuple, ThreadIndex, TransportProto};
use tether_session::{AppFifos, AppWorker, SessionMain, SessionOrigin, Worker};

mod api;
mod connect;
mod echo;
mod events;
mod migrate;
mod reclaim;
mod rpc;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Where every test server listens.
pub const SERVER: &str = "127.0.0.1:7";

pub fn config(workers: u16) -> SessionConfig {
    SessionConfig {
        workers,
        rx_fifo_size: 4096,
        tx_fifo_size: 4096,
        segment_size: 1 << 20,
        idle_wait_ms: 1,
        ..Default::default()
    }
}

pub fn server_key() -> LocalKey {
    LocalKey {
        proto: TransportProto::Loopback,
        fib_index: 0,
        lcl: SERVER.parse().unwrap(),
    }
}

/// Active open towards `rmt` with the local side left to the transport.
pub fn tuple_to(rmt: &str) -> SessionTuple {
    SessionTuple {
        proto: TransportProto::Loopback,
        fib_index: 0,
        lcl: Endpoint::unspecified(),
        rmt: rmt.parse().unwrap(),
    }
}

pub fn client_tuple() -> SessionTuple {
    tuple_to(SERVER)
}

/// Workers driven by hand from the test thread.
pub struct Manual {
    pub main: Arc<SessionMain>,
    pub workers: Vec<Worker>,
}

impl Manual {
    pub fn new(workers: u16) -> Self {
        Self::with_config(config(workers))
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let (main, workers) = SessionMain::enable(&config);
        Self { main, workers }
    }

    pub fn wrk(&mut self, thread: ThreadIndex) -> &mut Worker {
        &mut self.workers[thread as usize]
    }

    /// Run quanta round-robin over every worker until the dust settles.
    pub fn settle(&mut self) {
        for _ in 0..32 {
            for wrk in &mut self.workers {
                wrk.run_once();
            }
        }
    }

    pub fn attach(&self, app: &Arc<Recorder>) -> u32 {
        self.main.apps().attach(app.clone())
    }

    /// Listener on thread 0 and one session pair, the client opened from
    /// `client_thread`. Returns `(listener, client, server)`.
    pub fn pair(
        &mut self,
        app: &Arc<Recorder>,
        client_thread: ThreadIndex,
    ) -> (SessionHandle, SessionHandle, SessionHandle) {
        let index = self.attach(app);
        let listener = self.wrk(0).listen(index, server_key()).unwrap();
        let client = self
            .wrk(client_thread)
            .connect(index, client_tuple(), 7)
            .unwrap();
        self.settle();
        let server = app
            .accepted_on(listener)
            .into_iter()
            .next()
            .expect("server side never opened");
        (listener, client, server)
    }
}

/// Workers on their own threads. Stopped and joined on drop.
pub struct Spawned {
    pub main: Arc<SessionMain>,
    threads: Vec<JoinHandle<()>>,
}

impl Spawned {
    pub fn new(workers: u16) -> Self {
        let (main, workers) = SessionMain::enable(&config(workers));
        let threads = SessionMain::spawn_workers(workers).unwrap();
        Self { main, threads }
    }
}

impl Drop for Spawned {
    fn drop(&mut self) {
        self.main.shutdown();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

// ── Recording application ─────────────────────────────────────────────────────

/// What an application was told, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    Opened { handle: SessionHandle, origin: SessionOrigin },
    Failed { handle: SessionHandle, opaque: u64 },
    Rx { handle: SessionHandle, bytes: usize },
    Disconnected { handle: SessionHandle, reset: bool },
    Cleanup { handle: SessionHandle },
    Migrated { old: SessionHandle, new: SessionHandle },
}

impl Note {
    pub fn handle(&self) -> SessionHandle {
        match self {
            Note::Opened { handle, .. }
            | Note::Failed { handle, .. }
            | Note::Rx { handle, .. }
            | Note::Disconnected { handle, .. }
            | Note::Cleanup { handle } => *handle,
            Note::Migrated { old, .. } => *old,
        }
    }
}

#[derive(Default)]
pub struct Recorder {
    notes: Mutex<Vec<Note>>,
    fifos: Mutex<HashMap<SessionHandle, AppFifos>>,
    received: Mutex<HashMap<SessionHandle, Vec<u8>>>,
    /// Close as soon as the peer does.
    auto_close: bool,
    /// Active opens send `hello-<opaque>` once ready.
    greet: bool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn closing() -> Arc<Self> {
        Arc::new(Self {
            auto_close: true,
            ..Default::default()
        })
    }

    pub fn greeting() -> Arc<Self> {
        Arc::new(Self {
            greet: true,
            ..Default::default()
        })
    }

    fn note(&self, note: Note) {
        self.notes.lock().unwrap().push(note);
    }

    pub fn notes(&self) -> Vec<Note> {
        self.notes.lock().unwrap().clone()
    }

    /// Notes about one session, in delivery order.
    pub fn notes_for(&self, handle: SessionHandle) -> Vec<Note> {
        self.notes()
            .into_iter()
            .filter(|n| n.handle() == handle)
            .collect()
    }

    pub fn opened(&self) -> usize {
        self.notes()
            .iter()
            .filter(|n| matches!(n, Note::Opened { .. }))
            .count()
    }

    pub fn accepted_on(&self, listener: SessionHandle) -> Vec<SessionHandle> {
        self.notes()
            .into_iter()
            .filter_map(|n| match n {
                Note::Opened {
                    handle,
                    origin: SessionOrigin::Accepted { listener: l },
                } if l == listener => Some(handle),
                _ => None,
            })
            .collect()
    }

    /// Write into the session's tx fifo from the test thread.
    pub fn send(&self, handle: SessionHandle, data: &[u8]) -> usize {
        let mut fifos = self.fifos.lock().unwrap();
        let f = fifos.get_mut(&handle).expect("no fifos for session");
        f.send(data).unwrap()
    }

    pub fn received(&self, handle: SessionHandle) -> Vec<u8> {
        self.received
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .unwrap_or_default()
    }

    pub fn holds(&self, handle: SessionHandle) -> bool {
        self.fifos.lock().unwrap().contains_key(&handle)
    }
}

fn on_owner(wrk: &Worker, handle: SessionHandle) {
    assert_eq!(
        wrk.thread_index(),
        handle.thread_index,
        "{handle} notified on the wrong worker"
    );
}

impl AppWorker for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn session_opened(&self, wrk: &mut Worker, mut fifos: AppFifos, origin: SessionOrigin) {
        let handle = fifos.handle();
        on_owner(wrk, handle);
        self.note(Note::Opened { handle, origin });
        if let (true, SessionOrigin::Connected { opaque }) = (self.greet, origin) {
            fifos.send(format!("hello-{opaque}").as_bytes()).unwrap();
        }
        self.fifos.lock().unwrap().insert(handle, fifos);
    }

    fn connect_failed(&self, wrk: &mut Worker, handle: SessionHandle, opaque: u64) {
        on_owner(wrk, handle);
        self.note(Note::Failed { handle, opaque });
    }

    fn rx_ready(&self, wrk: &mut Worker, handle: SessionHandle) {
        on_owner(wrk, handle);
        let data = match self.fifos.lock().unwrap().get_mut(&handle) {
            Some(f) => f.recv(usize::MAX),
            None => return,
        };
        if data.is_empty() {
            return;
        }
        self.note(Note::Rx {
            handle,
            bytes: data.len(),
        });
        self.received
            .lock()
            .unwrap()
            .entry(handle)
            .or_default()
            .extend_from_slice(&data);
    }

    fn session_disconnected(&self, wrk: &mut Worker, handle: SessionHandle, reset: bool) {
        on_owner(wrk, handle);
        self.note(Note::Disconnected { handle, reset });
        if self.auto_close {
            wrk.app_close(handle);
        }
    }

    fn session_cleanup(&self, wrk: &mut Worker, handle: SessionHandle) {
        on_owner(wrk, handle);
        self.note(Note::Cleanup { handle });
        self.fifos.lock().unwrap().remove(&handle);
    }

    fn session_migrated(&self, wrk: &mut Worker, old: SessionHandle, new: SessionHandle) {
        on_owner(wrk, new);
        self.note(Note::Migrated { old, new });
        let mut fifos = self.fifos.lock().unwrap();
        if let Some(mut f) = fifos.remove(&old) {
            f.rebind(new, wrk.sender().clone());
            fifos.insert(new, f);
        }
        drop(fifos);
        let mut received = self.received.lock().unwrap();
        if let Some(data) = received.remove(&old) {
            received.insert(new, data);
        }
    }
}
