//! tether-core: shared identifiers, fifos, fifo segments and configuration.
//! Every other Tether crate depends on this one.

pub mod config;
pub mod fifo;
pub mod segment;
pub mod types;

pub use config::{ConfigError, TetherConfig};
pub use fifo::{Fifo, FifoConsumer, FifoError, FifoProducer};
pub use segment::{FifoSegment, SegmentUsage};
pub use types::{
    ConnectionRef, Endpoint, FibIndex, LocalKey, SessionHandle, SessionTuple, SessionType,
    ThreadIndex, TransportProto,
};
