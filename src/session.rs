//! Sessions: per-virtual-user execution contexts.
//!
//! A [`Session`] is created once per pool slot and pinned to one executor for its whole
//! life. It is either idle in its group's pool or owned by exactly one running iteration;
//! the pool enforces that, the handle itself is a cheap clone.
use std::{collections::HashMap, collections::VecDeque, fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{
    connection::DestinationTable,
    error::EngineError,
    executor::EventLoop,
    request::Request,
    statistics::{SessionStatistics, StatisticsRef},
};

/// Value of a session variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// A named sequence of steps inside a scenario.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sequence {
    name: Arc<str>,
    index: usize,
}

impl Sequence {
    pub fn new(name: impl Into<Arc<str>>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// Auxiliary data shared by all sessions of one group on one executor.
#[derive(Clone, Debug, Default)]
pub struct SharedData {
    queues: Arc<Mutex<HashMap<String, VecDeque<Value>>>>,
}

impl SharedData {
    pub fn push(&self, key: &str, value: Value) {
        self.queues
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(value);
    }

    pub fn pull(&self, key: &str) -> Option<Value> {
        self.queues.lock().get_mut(key)?.pop_front()
    }

    pub fn len(&self, key: &str) -> usize {
        self.queues.lock().get(key).map_or(0, VecDeque::len)
    }
}

#[derive(Default)]
struct SessionState {
    phase: Option<Arc<str>>,
    vars: HashMap<String, Value>,
    current_sequence: Option<Sequence>,
    current_request: Option<Arc<Request>>,
    in_flight: Vec<Arc<Request>>,
}

pub(crate) struct SessionInner {
    unique_id: usize,
    executor: Arc<EventLoop>,
    statistics: SessionStatistics,
    data: SharedData,
    destinations: Arc<DestinationTable>,
    state: Mutex<SessionState>,
}

/// Handle to a session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        unique_id: usize,
        executor: Arc<EventLoop>,
        statistics: SessionStatistics,
        data: SharedData,
        destinations: Arc<DestinationTable>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                unique_id,
                executor,
                statistics,
                data,
                destinations,
                state: Mutex::default(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &std::sync::Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn unique_id(&self) -> usize {
        self.inner.unique_id
    }

    pub fn executor_id(&self) -> usize {
        self.inner.executor.id()
    }

    pub fn executor(&self) -> &Arc<EventLoop> {
        &self.inner.executor
    }

    pub fn shared_data(&self) -> &SharedData {
        &self.inner.data
    }

    pub fn destinations(&self) -> &Arc<DestinationTable> {
        &self.inner.destinations
    }

    /// Phase this session currently runs for.
    pub fn phase(&self) -> Option<Arc<str>> {
        self.inner.state.lock().phase.clone()
    }

    pub(crate) fn attach_phase(&self, phase: Arc<str>) {
        self.inner.state.lock().phase = Some(phase);
    }

    /// Statistics bucket of `metric` for the bound phase, created on first use.
    pub fn statistics(&self, metric: &str) -> Result<StatisticsRef, EngineError> {
        let phase = self
            .phase()
            .ok_or(EngineError::SessionNotBound(self.unique_id()))?;
        Ok(StatisticsRef::new(
            self.inner.statistics.clone(),
            phase,
            Arc::from(metric),
        ))
    }

    pub fn set_var(&self, name: &str, value: impl Into<Value>) {
        self.inner
            .state
            .lock()
            .vars
            .insert(name.to_string(), value.into());
    }

    pub fn var(&self, name: &str) -> Option<Value> {
        self.inner.state.lock().vars.get(name).cloned()
    }

    pub fn unset_var(&self, name: &str) -> Option<Value> {
        self.inner.state.lock().vars.remove(name)
    }

    pub fn current_sequence(&self) -> Option<Sequence> {
        self.inner.state.lock().current_sequence.clone()
    }

    pub fn current_request(&self) -> Option<Arc<Request>> {
        self.inner.state.lock().current_request.clone()
    }

    pub(crate) fn set_current(&self, sequence: Option<Sequence>, request: Option<Arc<Request>>) {
        let mut state = self.inner.state.lock();
        state.current_sequence = sequence;
        state.current_request = request;
    }

    pub(crate) fn track(&self, request: &Arc<Request>) {
        let mut state = self.inner.state.lock();
        if !state.in_flight.iter().any(|r| Arc::ptr_eq(r, request)) {
            state.in_flight.push(request.clone());
        }
    }

    pub(crate) fn untrack(&self, request: &Request) {
        self.inner
            .state
            .lock()
            .in_flight
            .retain(|r| !std::ptr::eq(Arc::as_ptr(r), request));
    }

    /// Requests started and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Clears per-iteration state before the session runs again.
    pub(crate) fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.vars.clear();
        state.current_sequence = None;
        state.current_request = None;
    }

    /// Interrupts the session: every in-flight request is completed, which cancels its
    /// timeout.
    pub(crate) fn stop(&self) {
        let requests = std::mem::take(&mut self.inner.state.lock().in_flight);
        for request in requests {
            request.set_completed();
        }
        self.set_current(None, None);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("unique_id", &self.inner.unique_id)
            .field("executor", &self.inner.executor.id())
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Session on `executor` with fresh statistics and no destinations.
    pub fn session(unique_id: usize, executor: Arc<EventLoop>) -> Session {
        let statistics = SessionStatistics::new(executor.id());
        Session::new(
            unique_id,
            executor,
            statistics,
            SharedData::default(),
            Arc::new(DestinationTable::default()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EventLoopGroup;

    #[test]
    fn statistics_need_a_bound_phase() {
        let group = EventLoopGroup::new(1).unwrap();
        let session = test_support::session(7, group.executor(0).clone());
        assert!(matches!(
            session.statistics("get"),
            Err(EngineError::SessionNotBound(7))
        ));
        session.attach_phase(Arc::from("steady"));
        let stats = session.statistics("get").unwrap();
        assert_eq!(stats.phase(), "steady");
        assert_eq!(stats.metric(), "get");
    }

    #[test]
    fn reset_clears_variables() {
        let group = EventLoopGroup::new(1).unwrap();
        let session = test_support::session(0, group.executor(0).clone());
        session.set_var("user", "alice");
        session.set_var("count", 3);
        assert_eq!(session.var("count"), Some(Value::Int(3)));
        assert_eq!(session.var("user").map(|v| v.to_string()).as_deref(), Some("alice"));
        session.reset();
        assert_eq!(session.var("user"), None);
    }

    #[test]
    fn shared_data_is_a_fifo_per_key() {
        let data = SharedData::default();
        data.push("ids", Value::Int(1));
        data.push("ids", Value::Int(2));
        assert_eq!(data.len("ids"), 2);
        assert_eq!(data.pull("ids"), Some(Value::Int(1)));
        assert_eq!(data.pull("other"), None);
    }
}
