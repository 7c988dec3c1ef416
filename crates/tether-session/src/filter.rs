//! Session introspection: filters, summaries and the `show session` /
//! `clear session` token grammar.

use serde::Serialize;

use tether_core::{Endpoint, SessionHandle, SessionTuple, ThreadIndex, TransportProto};

use crate::pool::SessionPool;
use crate::session::{Session, SessionState};

/// Listing cap without force-print.
pub const LIST_CAP: usize = 50;
/// Listing cap at verbose level 2 and above.
pub const LIST_CAP_VERBOSE: usize = 10;
/// Width of a `range A` query.
const RANGE_SPAN: u32 = 50;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("unknown input `{0}`")]
    UnknownInput(String),
    #[error("invalid range start: {start} end: {end}")]
    InvalidRange { start: u32, end: u32 },
    #[error("session <nn> required, but not set.")]
    SessionRequired,
}

/// Which side of a session an endpoint pattern is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EndpointMatch {
    pub endpoint: Endpoint,
    pub local: bool,
    pub remote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionFilter {
    pub thread: ThreadIndex,
    /// Empty means any state.
    pub states: Vec<SessionState>,
    pub proto: Option<TransportProto>,
    /// Inclusive session-index range.
    pub range: (u32, u32),
    pub endpoint: Option<EndpointMatch>,
    pub force_print: bool,
    pub verbose: u32,
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self {
            thread: 0,
            states: Vec::new(),
            proto: None,
            range: (0, u32::MAX),
            endpoint: None,
            force_print: false,
            verbose: 0,
        }
    }
}

impl SessionFilter {
    pub fn check(&self, s: &Session) -> bool {
        if !self.states.is_empty() && !self.states.contains(&s.state) {
            return false;
        }
        if self.proto.is_some_and(|p| p != s.tuple.proto) {
            return false;
        }
        if s.state >= SessionState::TransportDeleted {
            return false;
        }
        let Some(m) = self.endpoint else {
            return true;
        };
        (m.local && m.endpoint.matches(&s.tuple.lcl)) || (m.remote && m.endpoint.matches(&s.tuple.rmt))
    }

    /// Maximum sessions listed, `None` when unbounded.
    pub fn cap(&self) -> Option<usize> {
        if self.force_print {
            None
        } else if self.verbose > 1 {
            Some(LIST_CAP_VERBOSE)
        } else {
            Some(LIST_CAP)
        }
    }

    /// A filter that selects nothing beyond the thread: answered with a
    /// count alone.
    pub fn is_trivial(&self) -> bool {
        self.proto.is_none()
            && self.states.is_empty()
            && self.verbose == 0
            && self.range == (0, u32::MAX)
    }

    fn validate(&self) -> Result<(), FilterError> {
        let (start, end) = self.range;
        if end < start {
            return Err(FilterError::InvalidRange { start, end });
        }
        Ok(())
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FifoStatus {
    pub capacity: u32,
    pub queued: u32,
    pub has_event: bool,
}

/// One session as the operator sees it.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub handle: SessionHandle,
    pub state: SessionState,
    pub proto: TransportProto,
    pub is_ip4: bool,
    pub lcl: Endpoint,
    pub rmt: Endpoint,
    pub flags: Vec<&'static str>,
    pub connection_index: u32,
    pub listener: Option<SessionHandle>,
    pub app_wrk_index: u32,
    pub opaque: u64,
    pub rx_fifo: Option<FifoStatus>,
    pub tx_fifo: Option<FifoStatus>,
    pub ooo_bytes: u64,
    pub age_ms: u64,
}

impl SessionSummary {
    pub fn of(s: &Session) -> Self {
        Self {
            handle: s.handle(),
            state: s.state,
            proto: s.tuple.proto,
            is_ip4: s.session_type.is_ip4,
            lcl: s.tuple.lcl,
            rmt: s.tuple.rmt,
            flags: s.flags.iter().map(|f| f.as_str()).collect(),
            connection_index: s.connection_index,
            listener: s.listener,
            app_wrk_index: s.app_wrk_index,
            opaque: s.opaque,
            rx_fifo: s.rx_fifo.as_ref().map(|f| FifoStatus {
                capacity: f.capacity(),
                queued: f.max_dequeue(),
                has_event: f.has_event(),
            }),
            tx_fifo: s.tx_fifo.as_ref().map(|f| FifoStatus {
                capacity: f.capacity(),
                queued: f.max_dequeue(),
                has_event: f.has_event(),
            }),
            ooo_bytes: s.rx_fifo.as_ref().map_or(0, |f| f.ooo_bytes()),
            age_ms: s.created_at.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterResult {
    pub thread: ThreadIndex,
    pub matched: usize,
    /// Listed sessions. Empty unless the filter is verbose.
    pub sessions: Vec<SessionSummary>,
    /// More sessions matched than were listed.
    pub truncated: bool,
    /// The filter was trivial; `matched` is the whole pool.
    pub count_only: bool,
}

/// Unfiltered per-thread view.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub thread: ThreadIndex,
    pub total: usize,
    pub active: usize,
    pub closed: usize,
    pub sessions: Vec<SessionSummary>,
    /// Verbose listing withheld because the pool is too large.
    pub suppressed: bool,
}

pub fn filter_pool(thread: ThreadIndex, pool: &SessionPool, filter: &SessionFilter) -> FilterResult {
    if filter.is_trivial() {
        return FilterResult {
            thread,
            matched: pool.len(),
            sessions: Vec::new(),
            truncated: false,
            count_only: true,
        };
    }
    let (start, end) = filter.range;
    let cap = filter.cap().unwrap_or(usize::MAX);
    let mut matched = 0;
    let mut sessions = Vec::new();
    let mut truncated = false;
    for s in pool.iter() {
        if s.session_index < start || s.session_index > end || !filter.check(s) {
            continue;
        }
        matched += 1;
        if filter.verbose == 0 {
            continue;
        }
        if matched > cap {
            truncated = true;
        } else {
            sessions.push(SessionSummary::of(s));
        }
    }
    FilterResult {
        thread,
        matched,
        sessions,
        truncated,
        count_only: false,
    }
}

pub fn summarize_pool(thread: ThreadIndex, pool: &SessionPool, verbose: u32) -> ThreadSummary {
    let total = pool.len();
    let closed = pool
        .iter()
        .filter(|s| s.state >= SessionState::TransportDeleted)
        .count();
    let suppressed = verbose > 0 && total > LIST_CAP;
    let sessions = if verbose > 0 && !suppressed {
        pool.iter()
            .filter(|s| s.state < SessionState::TransportDeleted)
            .map(SessionSummary::of)
            .collect()
    } else {
        Vec::new()
    };
    ThreadSummary {
        thread,
        total,
        active: total - closed,
        closed,
        sessions,
        suppressed,
    }
}

// ── Grammar ──────────────────────────────────────────────────────────────────

/// A parsed `show session …` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShowQuery {
    Protos,
    States,
    Listeners(TransportProto),
    /// Queue status for one thread, or all of them.
    Events(Option<ThreadIndex>),
    One(SessionHandle),
    /// A transport connection, resolved to its session through the
    /// connection's back-index.
    Connection {
        thread: ThreadIndex,
        proto: TransportProto,
        index: u32,
    },
    Tuple(SessionTuple),
    Filter(SessionFilter),
    All { verbose: u32 },
}

struct Tokens<'a> {
    toks: &'a [&'a str],
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn next(&mut self) -> Option<&'a str> {
        let t = self.toks.get(self.pos).copied();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn peek(&self) -> Option<&'a str> {
        self.toks.get(self.pos).copied()
    }

    /// Parse the next token, or fail with the input from `from` onwards.
    fn value<T: std::str::FromStr>(&mut self, from: usize) -> Result<T, FilterError> {
        match self.next().and_then(|t| t.parse().ok()) {
            Some(v) => Ok(v),
            None => Err(self.unknown(from)),
        }
    }

    fn unknown(&self, from: usize) -> FilterError {
        FilterError::UnknownInput(self.toks[from.min(self.toks.len())..].join(" "))
    }
}

impl ShowQuery {
    pub fn parse_str(input: &str) -> Result<Self, FilterError> {
        let toks: Vec<&str> = input.split_whitespace().collect();
        Self::parse(&toks)
    }

    pub fn parse(toks: &[&str]) -> Result<Self, FilterError> {
        let mut t = Tokens { toks, pos: 0 };
        let mut filter = SessionFilter::default();
        let mut do_filter = false;
        let mut thread_set = false;
        let mut verbose = 0;
        let mut listeners = None;
        let mut events = false;

        while let Some(tok) = t.next() {
            let at = t.pos - 1;
            match tok {
                "protos" => return Ok(ShowQuery::Protos),
                "states" => return Ok(ShowQuery::States),
                "verbose" => {
                    verbose = match t.peek().and_then(|v| v.parse().ok()) {
                        Some(n) => {
                            t.next();
                            n
                        }
                        None => 1,
                    };
                }
                "listeners" => listeners = Some(t.value::<TransportProto>(at)?),
                "events" => events = true,
                "thread" => {
                    let thread: ThreadIndex = t.value(at)?;
                    if t.peek() == Some("index") {
                        t.next();
                        let index: u32 = t.value(at)?;
                        return Ok(ShowQuery::One(SessionHandle::new(thread, index)));
                    }
                    filter.thread = thread;
                    thread_set = true;
                    do_filter = true;
                }
                "state" => {
                    filter.states.push(t.value::<SessionState>(at)?);
                    do_filter = true;
                }
                "proto" => {
                    let proto: TransportProto = t.value(at)?;
                    if thread_set && t.peek() == Some("index") {
                        t.next();
                        let index: u32 = t.value(at)?;
                        return Ok(ShowQuery::Connection {
                            thread: filter.thread,
                            proto,
                            index,
                        });
                    }
                    filter.proto = Some(proto);
                    do_filter = true;
                }
                "range" => {
                    let start: u32 = t.value(at)?;
                    let end = match t.peek().and_then(|v| v.parse::<u32>().ok()) {
                        Some(end) => {
                            t.next();
                            end
                        }
                        None => start.saturating_add(RANGE_SPAN),
                    };
                    filter.range = (start, end);
                    do_filter = true;
                }
                "lcl" | "rmt" | "ep" => {
                    let endpoint: Endpoint = t.value(at)?;
                    filter.endpoint = Some(EndpointMatch {
                        endpoint,
                        local: tok != "rmt",
                        remote: tok != "lcl",
                    });
                    do_filter = true;
                }
                "force-print" => {
                    filter.force_print = true;
                    do_filter = true;
                }
                other => match other.parse::<TransportProto>() {
                    Ok(proto) => return parse_tuple_id(proto, &mut t, at).map(ShowQuery::Tuple),
                    Err(_) => return Err(t.unknown(at)),
                },
            }
        }

        if let Some(proto) = listeners {
            return Ok(ShowQuery::Listeners(proto));
        }
        if events {
            return Ok(ShowQuery::Events(thread_set.then_some(filter.thread)));
        }
        if do_filter {
            filter.verbose = verbose;
            filter.validate()?;
            return Ok(ShowQuery::Filter(filter));
        }
        Ok(ShowQuery::All { verbose })
    }
}

/// `PROTO [vrf N] LCL:PORT->RMT:PORT`, with the arrow optionally spaced.
fn parse_tuple_id(proto: TransportProto, t: &mut Tokens<'_>, at: usize) -> Result<SessionTuple, FilterError> {
    let mut fib_index = 0;
    if t.peek() == Some("vrf") {
        t.next();
        fib_index = t.value(at)?;
    }
    let first = t.next().ok_or_else(|| t.unknown(at))?;
    let (lcl, rmt) = match first.split_once("->") {
        Some((l, r)) if !r.is_empty() => (l, r),
        Some((l, _)) => (l, t.next().ok_or_else(|| t.unknown(at))?),
        None => {
            if t.next() != Some("->") {
                return Err(t.unknown(at));
            }
            (first, t.next().ok_or_else(|| t.unknown(at))?)
        }
    };
    let lcl: Endpoint = lcl.parse().map_err(|_| t.unknown(at))?;
    let rmt: Endpoint = rmt.parse().map_err(|_| t.unknown(at))?;
    if t.peek().is_some() {
        return Err(t.unknown(t.pos));
    }
    Ok(SessionTuple {
        proto,
        fib_index,
        lcl,
        rmt,
    })
}

/// A parsed `clear session …` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearQuery {
    One(SessionHandle),
    All,
}

impl ClearQuery {
    pub fn parse_str(input: &str) -> Result<Self, FilterError> {
        let toks: Vec<&str> = input.split_whitespace().collect();
        Self::parse(&toks)
    }

    pub fn parse(toks: &[&str]) -> Result<Self, FilterError> {
        let mut t = Tokens { toks, pos: 0 };
        let mut thread: ThreadIndex = 0;
        let mut session: Option<u32> = None;
        let mut all = false;
        while let Some(tok) = t.next() {
            let at = t.pos - 1;
            match tok {
                "thread" => thread = t.value(at)?,
                "session" => session = Some(t.value(at)?),
                "all" => all = true,
                _ => return Err(t.unknown(at)),
            }
        }
        match (session, all) {
            (_, true) => Ok(ClearQuery::All),
            (Some(index), false) => Ok(ClearQuery::One(SessionHandle::new(thread, index))),
            (None, false) => Err(FilterError::SessionRequired),
        }
    }
}
