//! Phases: schedule definitions and their runtime state machine.
//!
//! ```text
//! NOT_STARTED ──start──► RUNNING ──finish──► FINISHED ──try_terminate──► TERMINATED
//!                           │                   │                            ▲
//!                           └────terminate──────┴──► TERMINATING ──last session──┘
//! ```
//!
//! A phase admits new sessions only while `RUNNING`. `finish` stops admission and lets
//! sessions in flight run their iteration to the end; `terminate` interrupts them. Every
//! transition is reported through the phase-change handler.
pub mod rate;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::watch;
use typed_builder::TypedBuilder;

use crate::{
    error::EngineError,
    executor::EventLoopGroup,
    pool::SessionPool,
    scenario::Scenario,
    session::Session,
    statistics::unix_millis,
};
use rate::{RateSchedule, internals::token_governor_task};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhaseStatus {
    NotStarted,
    Running,
    Finished,
    Terminating,
    Terminated,
}

impl PhaseStatus {
    pub fn is_started(self) -> bool {
        self != PhaseStatus::NotStarted
    }

    /// No longer admitting sessions.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            PhaseStatus::Finished | PhaseStatus::Terminating | PhaseStatus::Terminated
        )
    }

    /// Sessions in flight are being (or have been) interrupted.
    pub fn is_terminating(self) -> bool {
        matches!(self, PhaseStatus::Terminating | PhaseStatus::Terminated)
    }

    pub fn is_terminated(self) -> bool {
        self == PhaseStatus::Terminated
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PhaseStatus::NotStarted => "NOT_STARTED",
            PhaseStatus::Running => "RUNNING",
            PhaseStatus::Finished => "FINISHED",
            PhaseStatus::Terminating => "TERMINATING",
            PhaseStatus::Terminated => "TERMINATED",
        })
    }
}

/// Concurrency or arrival-rate model of a phase.
#[derive(Clone, Debug, PartialEq)]
pub enum PhaseModel {
    /// Coordination only, never starts a session.
    Noop,
    /// Starts `users` sessions once, then finishes.
    AtOnce { users: usize },
    /// Keeps `users` sessions looping until finished.
    Always { users: usize },
    /// Open model: `users_per_sec` new sessions per second.
    ConstantRate {
        users_per_sec: f64,
        max_sessions: usize,
    },
    /// Open model with the rate moving linearly from `initial` to `target`.
    RampRate {
        initial: f64,
        target: f64,
        duration: Duration,
        max_sessions: usize,
    },
}

impl PhaseModel {
    /// Declared concurrency, which sizes the session pool.
    pub fn max_sessions(&self) -> usize {
        match self {
            PhaseModel::Noop => 0,
            PhaseModel::AtOnce { users } | PhaseModel::Always { users } => *users,
            PhaseModel::ConstantRate { max_sessions, .. }
            | PhaseModel::RampRate { max_sessions, .. } => *max_sessions,
        }
    }
}

/// Immutable definition of one phase.
#[derive(Clone, Debug, TypedBuilder)]
pub struct PhaseDef {
    #[builder(setter(into))]
    pub name: String,
    pub scenario: Scenario,
    pub model: PhaseModel,
    /// Sharing key. Phases with the same key reuse one session pool and statistics.
    /// `None` means the phase holds no sessions.
    #[builder(default, setter(strip_option, into))]
    pub shared_resources: Option<String>,
    /// Granularity of the rate governor.
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
}

/// Receives `(phase, status, session_limit_exceeded, error)` on every transition.
pub type PhaseChangeHandler =
    Arc<dyn Fn(&Arc<PhaseDef>, PhaseStatus, bool, Option<Arc<EngineError>>) + Send + Sync>;

struct PhaseState {
    status: PhaseStatus,
    active: usize,
    started_at: Option<u64>,
    finished_at: Option<u64>,
    terminated_at: Option<u64>,
    error: Option<Arc<EngineError>>,
}

/// Runtime state of one phase.
pub struct PhaseInstance {
    def: Arc<PhaseDef>,
    name: Arc<str>,
    state: Mutex<PhaseState>,
    session_limit_exceeded: AtomicBool,
    status: watch::Sender<PhaseStatus>,
    pool: Option<SessionPool>,
    on_change: PhaseChangeHandler,
}

impl PhaseInstance {
    pub fn new(
        def: Arc<PhaseDef>,
        pool: Option<SessionPool>,
        on_change: PhaseChangeHandler,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(PhaseStatus::NotStarted);
        Arc::new(Self {
            name: Arc::from(def.name.as_str()),
            def,
            state: Mutex::new(PhaseState {
                status: PhaseStatus::NotStarted,
                active: 0,
                started_at: None,
                finished_at: None,
                terminated_at: None,
                error: None,
            }),
            session_limit_exceeded: AtomicBool::new(false),
            status,
            pool,
            on_change,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn def(&self) -> &Arc<PhaseDef> {
        &self.def
    }

    pub fn status(&self) -> PhaseStatus {
        self.state.lock().status
    }

    /// Watch channel following the status.
    pub fn subscribe(&self) -> watch::Receiver<PhaseStatus> {
        self.status.subscribe()
    }

    /// Sessions currently running an iteration for this phase.
    pub fn active_sessions(&self) -> usize {
        self.state.lock().active
    }

    pub fn started_at_millis(&self) -> Option<u64> {
        self.state.lock().started_at
    }

    pub fn finished_at_millis(&self) -> Option<u64> {
        self.state.lock().finished_at
    }

    pub fn terminated_at_millis(&self) -> Option<u64> {
        self.state.lock().terminated_at
    }

    pub fn error(&self) -> Option<Arc<EngineError>> {
        self.state.lock().error.clone()
    }

    pub fn session_limit_exceeded(&self) -> bool {
        self.session_limit_exceeded.load(Ordering::Relaxed)
    }

    /// One-way flag, reported with the next notification.
    pub fn set_session_limit_exceeded(&self) {
        self.session_limit_exceeded.store(true, Ordering::Relaxed);
    }

    pub fn pool(&self) -> Option<&SessionPool> {
        self.pool.as_ref()
    }

    fn notify(&self, status: PhaseStatus) {
        tracing::debug!(phase = %self.name, "Phase changed status to {status}");
        let error = self.error();
        (self.on_change)(&self.def, status, self.session_limit_exceeded(), error);
    }

    /// Status updates go to the watch channel under the state lock, so watchers never see
    /// transitions out of order.
    fn set_status(&self, state: &mut PhaseState, status: PhaseStatus) {
        state.status = status;
        self.status.send_replace(status);
    }

    fn invalid(&self, from: PhaseStatus, to: PhaseStatus) -> EngineError {
        EngineError::InvalidTransition {
            phase: self.name.to_string(),
            from,
            to,
        }
    }

    /// Starts issuing sessions according to the phase model. Calling it twice is an error.
    pub fn start(self: &Arc<Self>, loops: &EventLoopGroup) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            if state.status != PhaseStatus::NotStarted {
                return Err(self.invalid(state.status, PhaseStatus::Running));
            }
            self.set_status(&mut state, PhaseStatus::Running);
            state.started_at = Some(unix_millis());
        }
        tracing::info!(phase = %self.name, "Starting phase with {:?}", self.def.model);
        self.notify(PhaseStatus::Running);

        match &self.def.model {
            PhaseModel::Noop => {}
            PhaseModel::AtOnce { users } => {
                self.start_sessions(*users, false);
                self.finish()?;
            }
            PhaseModel::Always { users } => self.start_sessions(*users, true),
            PhaseModel::ConstantRate {
                users_per_sec,
                max_sessions,
            } => self.spawn_governor(loops, RateSchedule::constant(*users_per_sec), *max_sessions),
            PhaseModel::RampRate {
                initial,
                target,
                duration,
                max_sessions,
            } => self.spawn_governor(
                loops,
                RateSchedule::ramp(*initial, *target, *duration),
                *max_sessions,
            ),
        }
        Ok(())
    }

    fn start_sessions(self: &Arc<Self>, users: usize, repeat: bool) {
        for started in 0..users {
            if !self.start_session(repeat) {
                tracing::debug!(phase = %self.name, "Started {started} of {users} sessions");
                break;
            }
        }
    }

    fn spawn_governor(
        self: &Arc<Self>,
        loops: &EventLoopGroup,
        schedule: RateSchedule,
        burst: usize,
    ) {
        let phase = self.clone();
        loops.executor(0).spawn(token_governor_task(
            schedule,
            self.def.tick,
            burst,
            self.subscribe(),
            move || phase.start_session(false),
        ));
    }

    /// Takes a session from the pool and runs it on its executor. Returns `false` when
    /// the phase no longer admits sessions or the pool is depleted.
    fn start_session(self: &Arc<Self>, repeat: bool) -> bool {
        let Some(pool) = &self.pool else {
            return false;
        };
        let mut state = self.state.lock();
        if state.status != PhaseStatus::Running {
            return false;
        }
        let Some(session) = pool.lock().acquire() else {
            return false;
        };
        state.active += 1;
        drop(state);

        session.attach_phase(self.name.clone());
        let phase = self.clone();
        let executor = session.executor().clone();
        executor.spawn(phase.run_session(session, repeat));
        true
    }

    async fn run_session(self: Arc<Self>, session: Session, repeat: bool) {
        let mut status = self.subscribe();
        loop {
            session.reset();
            let iteration = (self.def.scenario.action)(session.clone());
            let result = tokio::select! {
                biased;
                _ = interrupted(&mut status) => {
                    tracing::trace!(phase = %self.name, "#{} interrupted", session.unique_id());
                    break;
                }
                result = iteration => result,
            };
            if let Err(e) = result {
                tracing::warn!(
                    phase = %self.name,
                    "#{} iteration failed: {e}",
                    session.unique_id()
                );
                self.fail(e);
                break;
            }
            if !repeat || *status.borrow() != PhaseStatus::Running {
                break;
            }
        }
        session.stop();
        if let Some(pool) = &self.pool {
            pool.lock().release(session);
        }
        self.session_finished();
    }

    fn session_finished(&self) {
        let terminated = {
            let mut state = self.state.lock();
            state.active -= 1;
            let done = state.active == 0 && state.status == PhaseStatus::Terminating;
            if done {
                self.set_status(&mut state, PhaseStatus::Terminated);
                state.terminated_at = Some(unix_millis());
            }
            done
        };
        if terminated {
            self.notify(PhaseStatus::Terminated);
        }
    }

    /// Stops admitting sessions. Sessions in flight finish their iteration.
    pub fn finish(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            match state.status {
                PhaseStatus::NotStarted => {
                    return Err(self.invalid(state.status, PhaseStatus::Finished));
                }
                PhaseStatus::Running => {
                    self.set_status(&mut state, PhaseStatus::Finished);
                    state.finished_at = Some(unix_millis());
                }
                _ => return Ok(()),
            }
        }
        self.notify(PhaseStatus::Finished);
        Ok(())
    }

    /// Moves a finished phase to `TERMINATED` once no session is in flight. Meant to be
    /// polled; returns whether the phase is terminated.
    pub fn try_terminate(&self) -> bool {
        {
            let mut state = self.state.lock();
            match state.status {
                PhaseStatus::Terminated => return true,
                PhaseStatus::Finished if state.active == 0 => {
                    self.set_status(&mut state, PhaseStatus::Terminated);
                    state.terminated_at = Some(unix_millis());
                }
                _ => return false,
            }
        }
        self.notify(PhaseStatus::Terminated);
        true
    }

    /// Forces termination, interrupting sessions in flight. The phase passes through
    /// `TERMINATING` while any of them is still unwinding.
    pub fn terminate(&self) {
        let next = {
            let mut state = self.state.lock();
            if state.status.is_terminating() {
                return;
            }
            if state.status == PhaseStatus::Running {
                state.finished_at = Some(unix_millis());
            }
            let next = if state.active == 0 {
                state.terminated_at = Some(unix_millis());
                PhaseStatus::Terminated
            } else {
                PhaseStatus::Terminating
            };
            self.set_status(&mut state, next);
            next
        };
        self.notify(next);
    }

    /// Records `error` (the first one wins) and terminates the phase.
    pub fn fail(&self, error: EngineError) {
        {
            let mut state = self.state.lock();
            if state.error.is_none() {
                state.error = Some(Arc::new(error));
            }
        }
        self.terminate();
    }
}

async fn interrupted(status: &mut watch::Receiver<PhaseStatus>) {
    let _ = status.wait_for(|s| s.is_terminating()).await;
}

impl fmt::Debug for PhaseInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PhaseInstance")
            .field("name", &self.name)
            .field("status", &state.status)
            .field("active", &state.active)
            .field("session_limit_exceeded", &self.session_limit_exceeded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pool::ElasticPool, session::test_support};
    use std::sync::atomic::AtomicUsize;

    type Events = Arc<Mutex<Vec<(PhaseStatus, bool, Option<String>)>>>;

    fn recorder() -> (PhaseChangeHandler, Events) {
        let events: Events = Arc::default();
        let sink = events.clone();
        let handler: PhaseChangeHandler = Arc::new(
            move |_: &Arc<PhaseDef>,
                  status: PhaseStatus,
                  limit: bool,
                  error: Option<Arc<EngineError>>| {
                sink.lock().push((status, limit, error.map(|e| e.to_string())));
            },
        );
        (handler, events)
    }

    fn statuses(events: &Events) -> Vec<PhaseStatus> {
        events.lock().iter().map(|e| e.0).collect()
    }

    fn session_pool(loops: &Arc<EventLoopGroup>, max: usize) -> (SessionPool, Arc<AtomicUsize>) {
        let depleted = Arc::new(AtomicUsize::new(0));
        let counter = depleted.clone();
        let loops = loops.clone();
        let mut next = 0;
        let pool = ElasticPool::new(
            max,
            move || {
                let executor = loops.executor(next % loops.len()).clone();
                let session = test_support::session(next, executor);
                next += 1;
                session
            },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        (Arc::new(Mutex::new(pool)), depleted)
    }

    fn sleeping(millis: u64) -> Scenario {
        Scenario::new("sleep", move |_session| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(())
        })
    }

    fn phase(
        model: PhaseModel,
        scenario: Scenario,
        pool: Option<SessionPool>,
        handler: PhaseChangeHandler,
    ) -> Arc<PhaseInstance> {
        let def = PhaseDef::builder()
            .name("test")
            .scenario(scenario)
            .model(model)
            .tick(Duration::from_millis(10))
            .build();
        PhaseInstance::new(Arc::new(def), pool, handler)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 2s");
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let loops = Arc::new(EventLoopGroup::new(1).unwrap());
        let (handler, events) = recorder();
        let phase = phase(PhaseModel::Noop, sleeping(0), None, handler);
        phase.start(&loops).unwrap();
        assert!(matches!(
            phase.start(&loops),
            Err(EngineError::InvalidTransition {
                from: PhaseStatus::Running,
                to: PhaseStatus::Running,
                ..
            })
        ));
        assert_eq!(statuses(&events), vec![PhaseStatus::Running]);
    }

    #[test]
    fn finish_needs_a_started_phase_and_is_then_idempotent() {
        let loops = Arc::new(EventLoopGroup::new(1).unwrap());
        let (handler, events) = recorder();
        let phase = phase(PhaseModel::Noop, sleeping(0), None, handler);
        assert!(phase.finish().is_err());
        phase.start(&loops).unwrap();
        phase.finish().unwrap();
        phase.finish().unwrap();
        assert!(phase.try_terminate());
        phase.finish().unwrap();
        assert_eq!(
            statuses(&events),
            vec![
                PhaseStatus::Running,
                PhaseStatus::Finished,
                PhaseStatus::Terminated
            ]
        );
    }

    #[tokio::test]
    async fn try_terminate_waits_for_sessions_in_flight() {
        let loops = Arc::new(EventLoopGroup::new(2).unwrap());
        let (pool, _) = session_pool(&loops, 2);
        let (handler, events) = recorder();
        let phase = phase(
            PhaseModel::Always { users: 2 },
            sleeping(50),
            Some(pool.clone()),
            handler,
        );
        phase.start(&loops).unwrap();
        assert_eq!(phase.active_sessions(), 2);
        assert_eq!(pool.lock().used(), 2);
        phase.finish().unwrap();
        assert!(!phase.try_terminate());
        eventually(|| phase.try_terminate()).await;
        assert_eq!(pool.lock().used(), 0);
        assert_eq!(
            statuses(&events),
            vec![
                PhaseStatus::Running,
                PhaseStatus::Finished,
                PhaseStatus::Terminated
            ]
        );
    }

    #[tokio::test]
    async fn terminate_interrupts_running_sessions() {
        let loops = Arc::new(EventLoopGroup::new(2).unwrap());
        let (pool, _) = session_pool(&loops, 3);
        let (handler, events) = recorder();
        let phase = phase(
            PhaseModel::Always { users: 3 },
            sleeping(60_000),
            Some(pool.clone()),
            handler,
        );
        phase.start(&loops).unwrap();
        phase.terminate();
        assert!(phase.status().is_terminating());
        eventually(|| phase.status() == PhaseStatus::Terminated).await;
        assert_eq!(phase.active_sessions(), 0);
        assert_eq!(pool.lock().used(), 0);
        assert_eq!(
            statuses(&events),
            vec![
                PhaseStatus::Running,
                PhaseStatus::Terminating,
                PhaseStatus::Terminated
            ]
        );
    }

    #[tokio::test]
    async fn failing_iteration_terminates_with_first_error() {
        let loops = Arc::new(EventLoopGroup::new(1).unwrap());
        let (pool, _) = session_pool(&loops, 2);
        let (handler, events) = recorder();
        let scenario = Scenario::new("broken", |session: Session| async move {
            Err(EngineError::Step(format!("boom #{}", session.unique_id())))
        });
        let phase = phase(PhaseModel::Always { users: 2 }, scenario, Some(pool), handler);
        phase.start(&loops).unwrap();
        eventually(|| phase.status() == PhaseStatus::Terminated).await;
        let error = phase.error().unwrap().to_string();
        assert!(error.starts_with("step error: boom #"));
        let last = events.lock().last().cloned().unwrap();
        assert_eq!(last.0, PhaseStatus::Terminated);
        assert_eq!(last.2, Some(error));
    }

    #[tokio::test]
    async fn at_once_starts_what_the_pool_allows_and_finishes() {
        let loops = Arc::new(EventLoopGroup::new(2).unwrap());
        let (pool, depleted) = session_pool(&loops, 2);
        let (handler, events) = recorder();
        let phase = phase(
            PhaseModel::AtOnce { users: 3 },
            sleeping(20),
            Some(pool.clone()),
            handler,
        );
        phase.start(&loops).unwrap();
        assert_eq!(depleted.load(Ordering::SeqCst), 1);
        assert_eq!(phase.status(), PhaseStatus::Finished);
        eventually(|| phase.try_terminate()).await;
        assert_eq!(pool.lock().capacity(), 2);
        assert_eq!(statuses(&events)[..2], [PhaseStatus::Running, PhaseStatus::Finished]);
    }

    #[tokio::test]
    async fn constant_rate_issues_sessions_until_finished() {
        let loops = Arc::new(EventLoopGroup::new(2).unwrap());
        let (pool, _) = session_pool(&loops, 10);
        let iterations = Arc::new(AtomicUsize::new(0));
        let counter = iterations.clone();
        let scenario = Scenario::new("count", move |_session| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let (handler, _) = recorder();
        let phase = phase(
            PhaseModel::ConstantRate {
                users_per_sec: 200.0,
                max_sessions: 10,
            },
            scenario,
            Some(pool.clone()),
            handler,
        );
        phase.start(&loops).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        phase.finish().unwrap();
        eventually(|| phase.try_terminate()).await;
        let issued = iterations.load(Ordering::SeqCst);
        // 2 per 10 ms tick; scheduling noise is tolerated
        assert!(issued >= 20, "only {issued} iterations");
        assert!(pool.lock().capacity() <= 10);
        let after = iterations.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(iterations.load(Ordering::SeqCst), after);
    }

    #[test]
    fn terminate_before_start_goes_straight_to_terminated() {
        let (handler, events) = recorder();
        let phase = phase(PhaseModel::Noop, sleeping(0), None, handler);
        phase.set_session_limit_exceeded();
        phase.terminate();
        phase.terminate();
        assert_eq!(phase.status(), PhaseStatus::Terminated);
        assert_eq!(*events.lock(), vec![(PhaseStatus::Terminated, true, None)]);
    }
}
