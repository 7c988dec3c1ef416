//! tether-session: the session layer. Per-worker session pools and event
//! queues, the session state machine, lookup tables and introspection.

pub mod app;
pub mod assign;
pub mod echo;
pub mod error;
pub mod event;
pub mod filter;
pub mod layer;
pub mod lookup;
pub mod loopback;
pub mod pool;
pub mod session;
pub mod state;
pub mod stats;
pub mod transport;
pub mod worker;

pub use app::{AppFifos, AppRegistry, AppWorker, SessionOrigin};
pub use assign::WorkerAssigner;
pub use echo::EchoApp;
pub use error::SessionError;
pub use event::{EventKind, EventSender, IoKind, PostError, QueueStatus, SessionEvent};
pub use filter::{ClearQuery, FilterError, FilterResult, SessionFilter, SessionSummary, ShowQuery, ThreadSummary};
pub use layer::SessionMain;
pub use lookup::LookupTable;
pub use loopback::LoopbackTransport;
pub use session::{Session, SessionFlag, SessionFlags, SessionState};
pub use stats::{StatsSnapshot, WorkerStats};
pub use transport::{ConnectionInfo, Transport, TransportError, TransportRegistry};
pub use worker::Worker;
