use tether_core::{FifoError, SessionHandle, ThreadIndex};

use crate::event::PostError;
use crate::pool::PoolFull;
use crate::session::SessionState;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    PoolFull(#[from] PoolFull),
    #[error("fifo allocation failed: {0}")]
    Fifo(#[from] FifoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Post(#[from] PostError),
    #[error("no session {0}")]
    NoSession(SessionHandle),
    #[error("session {handle} is not owned by thread {thread}")]
    WrongThread {
        handle: SessionHandle,
        thread: ThreadIndex,
    },
    #[error("session {handle} is {state}, cannot {op}")]
    BadState {
        handle: SessionHandle,
        state: SessionState,
        op: &'static str,
    },
    #[error("no application worker {0}")]
    NoApp(u32),
    #[error("invalid thread index {0}")]
    InvalidThread(ThreadIndex),
    #[error("worker {0} did not reply")]
    NoReply(ThreadIndex),
}
