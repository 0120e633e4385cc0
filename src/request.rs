//! Request lifecycle.
//!
//! ```text
//! IDLE (pooled) ──start──► RUNNING ──set_completing──► COMPLETING ──set_completed──► COMPLETED
//!      ▲                                                                              │
//!      └──────────────────────────────────release─────────────────────────────────────┘
//! ```
//!
//! The result (`Valid`, `Invalid`, `TimedOut`) is tracked apart from the status and reset
//! to `Valid` on every start. A request owns at most one pending timeout; completing it
//! cancels the timeout, and a timeout that fires after completion does nothing.
use std::{
    fmt,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::{
    connection::Connection,
    error::EngineError,
    session::{Sequence, Session, SessionInner},
    statistics::{StatisticsRef, unix_millis},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    /// In the pool, never started or released.
    Idle,
    Running,
    Completing,
    Completed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestResult {
    Valid,
    /// Completed, but the response failed validation.
    Invalid,
    TimedOut,
}

/// Implementation-specific handling of abnormal completion (timeouts, I/O errors).
///
/// Implementations usually run the error handlers of the step that issued the request and
/// then call [`Request::set_completed`], which is safe to do from inside this callback.
pub trait RequestHandler: Send + Sync {
    fn handle_error(&self, request: &Arc<Request>, error: &EngineError);
}

struct RequestState {
    status: RequestStatus,
    result: RequestResult,
    start_millis: u64,
    start: Option<Instant>,
    sent: Option<Instant>,
    sequence: Option<Sequence>,
    statistics: Option<StatisticsRef>,
    timeout: Option<AbortHandle>,
    connection: Option<Arc<dyn Connection>>,
}

pub struct Request {
    session: Weak<SessionInner>,
    session_id: usize,
    handler: Arc<dyn RequestHandler>,
    state: Mutex<RequestState>,
}

impl Request {
    pub fn new(session: &Session, handler: Arc<dyn RequestHandler>) -> Arc<Self> {
        Arc::new(Self {
            session: session.downgrade(),
            session_id: session.unique_id(),
            handler,
            state: Mutex::new(RequestState {
                status: RequestStatus::Idle,
                result: RequestResult::Valid,
                start_millis: 0,
                start: None,
                sent: None,
                sequence: None,
                statistics: None,
                timeout: None,
                connection: None,
            }),
        })
    }

    fn session(&self) -> Option<Session> {
        Session::upgrade(&self.session)
    }

    /// Starts the request on behalf of `sequence`, counting it in `statistics`.
    pub fn start(self: &Arc<Self>, sequence: Sequence, statistics: StatisticsRef) {
        let start_millis = unix_millis();
        {
            let mut state = self.state.lock();
            state.start_millis = start_millis;
            state.start = Some(Instant::now());
            state.sent = None;
            state.sequence = Some(sequence);
            state.status = RequestStatus::Running;
            state.result = RequestResult::Valid;
            state.statistics = Some(statistics.clone());
        }
        statistics.increment_requests(start_millis);
        if let Some(session) = self.session() {
            session.track(self);
        }
    }

    pub fn attach(&self, connection: Arc<dyn Connection>) {
        self.state.lock().connection = Some(connection);
    }

    /// Schedules the timeout on the session's executor, replacing any pending one.
    pub fn set_timeout(self: &Arc<Self>, timeout: Duration) {
        let Some(session) = self.session() else {
            tracing::warn!("#{} Cannot set timeout, session is gone", self.session_id);
            return;
        };
        let request = Arc::downgrade(self);
        let handle = session.executor().schedule(timeout, move || {
            if let Some(request) = request.upgrade() {
                request.on_timeout();
            }
        });
        if let Some(previous) = self.state.lock().timeout.replace(handle) {
            previous.abort();
        }
    }

    /// Timeout callback. Runs on the session's executor when the timer fires.
    ///
    /// No-op if the request already completed; the completion won the race.
    pub fn on_timeout(self: &Arc<Self>) {
        let (statistics, start_millis, connection) = {
            let mut state = self.state.lock();
            state.timeout = None;
            if matches!(state.status, RequestStatus::Completed | RequestStatus::Idle) {
                tracing::trace!("#{} Request is already completed.", self.session_id);
                return;
            }
            tracing::warn!(
                "#{} Request timeout on connection {:?}",
                self.session_id,
                state.connection
            );
            state.result = RequestResult::TimedOut;
            (
                state.statistics.clone(),
                state.start_millis,
                state.connection.clone(),
            )
        };
        if let Some(statistics) = statistics {
            statistics.increment_timeouts(start_millis);
        }
        self.handler.handle_error(self, &EngineError::Timeout);
        if let Some(connection) = connection {
            connection.on_timeout(self);
        }
    }

    /// Called once the request is fully written to the wire.
    pub fn on_sent(&self) {
        self.state.lock().sent = Some(Instant::now());
    }

    /// Records the response in the bound statistics. Response time runs from start to
    /// now; the part before the request hit the wire is reported as blocked time.
    pub fn record_response(&self) {
        let now = Instant::now();
        let state = self.state.lock();
        let (Some(statistics), Some(start)) = (state.statistics.clone(), state.start) else {
            return;
        };
        let blocked = state.sent.map_or(Duration::ZERO, |sent| sent - start);
        let valid = state.result == RequestResult::Valid;
        let start_millis = state.start_millis;
        drop(state);
        statistics.record_response(start_millis, blocked, now - start, valid);
    }

    /// Cancels the pending timeout, detaches the connection and marks the request
    /// completed. Idempotent; an idle request stays idle.
    pub fn set_completed(&self) {
        {
            let mut state = self.state.lock();
            if let Some(timeout) = state.timeout.take() {
                timeout.abort();
            }
            state.connection = None;
            if state.status != RequestStatus::Idle {
                state.status = RequestStatus::Completed;
            }
        }
        if let Some(session) = self.session() {
            session.untrack(self);
        }
    }

    pub fn set_completing(&self) {
        self.state.lock().status = RequestStatus::Completing;
    }

    /// The response failed validation. Status is left alone.
    pub fn mark_invalid(&self) {
        let mut state = self.state.lock();
        state.result = RequestResult::Invalid;
        tracing::debug!(
            "#{} Request in sequence {:?} marked invalid",
            self.session_id,
            state.sequence.as_ref().map(Sequence::name)
        );
    }

    /// Returns the request to the idle state so it can be started again.
    pub fn release(&self) {
        self.set_completed();
        let mut state = self.state.lock();
        state.status = RequestStatus::Idle;
        state.result = RequestResult::Valid;
        state.sequence = None;
        state.statistics = None;
    }

    /// Makes this the session's current request and sequence while handlers run.
    pub fn enter(self: &Arc<Self>) {
        if let Some(session) = self.session() {
            session.set_current(self.sequence(), Some(self.clone()));
        }
    }

    pub fn exit(&self) {
        if let Some(session) = self.session() {
            session.set_current(None, None);
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.state.lock().status
    }

    pub fn result(&self) -> RequestResult {
        self.state.lock().result
    }

    pub fn is_valid(&self) -> bool {
        self.result() == RequestResult::Valid
    }

    pub fn is_running(&self) -> bool {
        self.status() == RequestStatus::Running
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status(), RequestStatus::Completed | RequestStatus::Idle)
    }

    pub fn has_pending_timeout(&self) -> bool {
        self.state.lock().timeout.is_some()
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.state.lock().connection.clone()
    }

    pub fn sequence(&self) -> Option<Sequence> {
        self.state.lock().sequence.clone()
    }

    pub fn statistics(&self) -> Option<StatisticsRef> {
        self.state.lock().statistics.clone()
    }

    pub fn session_id(&self) -> usize {
        self.session_id
    }

    pub fn start_timestamp_millis(&self) -> u64 {
        self.state.lock().start_millis
    }

    pub fn start_instant(&self) -> Option<Instant> {
        self.state.lock().start
    }

    pub fn send_instant(&self) -> Option<Instant> {
        self.state.lock().sent
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Request")
            .field("session", &self.session_id)
            .field("status", &state.status)
            .field("result", &state.result)
            .field("sequence", &state.sequence)
            .finish()
    }
}

/// Handler that just completes the request, for requests with no error handlers.
#[derive(Debug, Default)]
pub struct CompleteOnError;

impl RequestHandler for CompleteOnError {
    fn handle_error(&self, request: &Arc<Request>, error: &EngineError) {
        tracing::debug!("#{} {error}", request.session_id());
        request.set_completed();
    }
}
