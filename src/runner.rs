//! The simulation runner: owns the event loops, connection pools, session pools and phase
//! instances of one agent, and exposes phase control and introspection to the controller.
use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{FutureExt, future::BoxFuture, future::join_all};
use parking_lot::{Mutex, RwLock};
use typed_builder::TypedBuilder;

use crate::{
    config::RunnerConfig,
    connection::{ClientPool, DestinationTable, HttpConfig, describe_pool},
    error::EngineError,
    executor::EventLoopGroup,
    phase::{PhaseChangeHandler, PhaseDef, PhaseInstance, PhaseStatus},
    pool::{ElasticPool, SessionPool},
    session::{Session, SharedData},
    statistics::{SessionStatistics, StatisticsSnapshot, unix_millis},
    watchdog::JitterWatchdog,
};

/// Everything the runner needs from the benchmark definition.
#[derive(Clone, Debug, TypedBuilder)]
pub struct Benchmark {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default)]
    pub config: RunnerConfig,
    #[builder(default)]
    pub http: Vec<HttpConfig>,
    #[builder(default)]
    pub phases: Vec<PhaseDef>,
}

/// Receives systemic failures: pool startup errors and scheduling anomalies.
pub type ErrorHandler = Arc<dyn Fn(Arc<EngineError>) + Send + Sync>;

/// Creates the client pool for one target. Called once per named target at construction.
pub type ClientPoolFactory =
    dyn Fn(&HttpConfig, &Arc<EventLoopGroup>) -> Result<Arc<dyn ClientPool>, EngineError>;

/// Resources reused by every phase declaring the same sharing key.
struct SharedResources {
    current_phase: Arc<Mutex<Option<Arc<PhaseInstance>>>>,
    session_pool: Option<SessionPool>,
    /// One per executor.
    statistics: Vec<SessionStatistics>,
}

impl SharedResources {
    /// Sentinel for phases without a sharing key: no pool, no statistics.
    fn none() -> Self {
        Self {
            current_phase: Arc::default(),
            session_pool: None,
            statistics: Vec::new(),
        }
    }

    fn current_phase(&self) -> Option<Arc<PhaseInstance>> {
        self.current_phase.lock().clone()
    }
}

/// Phase notifications and the queue of phases waiting for their statistics to be pruned.
struct PhaseEvents {
    handler: RwLock<Option<PhaseChangeHandler>>,
    error_handler: RwLock<Option<ErrorHandler>>,
    to_prune: Mutex<VecDeque<Arc<str>>>,
    loops: Arc<EventLoopGroup>,
}

impl PhaseEvents {
    fn notify_and_schedule_for_pruning(
        &self,
        phase: &Arc<PhaseDef>,
        status: PhaseStatus,
        session_limit_exceeded: bool,
        error: Option<Arc<EngineError>>,
    ) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(phase, status, session_limit_exceeded, error);
        }
        if status == PhaseStatus::Terminated {
            self.to_prune.lock().push_back(Arc::from(phase.name.as_str()));
        }
    }

    fn report_error(&self, error: EngineError) {
        let handler = self.error_handler.read().clone();
        match handler {
            Some(handler) => handler(Arc::new(error)),
            None => tracing::warn!("No error handler registered, dropping: {error}"),
        }
    }

    /// Applies `end` to every bucket of the terminated phase on the bucket's own executor.
    /// Resolves once all executors have done so.
    fn terminate_statistics(
        &self,
        phase: &Arc<str>,
        statistics: &[SessionStatistics],
    ) -> BoxFuture<'static, Result<(), EngineError>> {
        let now = unix_millis();
        let mut pending = Vec::with_capacity(statistics.len());
        for (executor_id, stats) in statistics.iter().enumerate() {
            let executor = self.loops.executor(executor_id);
            if executor.in_event_loop() {
                stats.apply_to_phase(phase, |s| s.end(now));
            } else {
                let stats = stats.clone();
                let phase = phase.clone();
                pending.push(
                    executor.submit(move || stats.apply_to_phase(&phase, |s| s.end(now))),
                );
            }
        }
        async move {
            join_all(pending)
                .await
                .into_iter()
                .collect::<Result<Vec<()>, _>>()
                .map(drop)
        }
        .boxed()
    }

    /// Handler installed on every phase instance. `TERMINATED` is held back until the
    /// phase's statistics are settled on every executor.
    fn phase_changed(self: &Arc<Self>, group: Weak<SharedResources>) -> PhaseChangeHandler {
        let events = self.clone();
        Arc::new(
            move |phase: &Arc<PhaseDef>,
                  status: PhaseStatus,
                  session_limit_exceeded: bool,
                  error: Option<Arc<EngineError>>| {
                let group = group.upgrade();
                let statistics = group.as_ref().map_or(&[][..], |g| &g.statistics[..]);
                if status != PhaseStatus::Terminated || statistics.is_empty() {
                    events.notify_and_schedule_for_pruning(
                        phase,
                        status,
                        session_limit_exceeded,
                        error,
                    );
                    return;
                }
                let name: Arc<str> = Arc::from(phase.name.as_str());
                let settled = events.terminate_statistics(&name, statistics);
                let executor = events.loops.executor(0).clone();
                let events = events.clone();
                let phase = phase.clone();
                executor.spawn(async move {
                    let error = match settled.await {
                        Ok(()) => error,
                        Err(e) => error.or_else(|| Some(Arc::new(e))),
                    };
                    events.notify_and_schedule_for_pruning(
                        &phase,
                        status,
                        session_limit_exceeded,
                        error,
                    );
                });
            },
        )
    }
}

/// Orchestrates one agent's part of a benchmark.
///
/// Lifecycle: [`new`](Self::new) creates the event loops and connection pools,
/// [`init`](Self::init) creates shared resources and phase instances and starts the jitter
/// watchdog, [`open_connections`](Self::open_connections) opens the pools, then the
/// controller drives phases by name until [`shutdown`](Self::shutdown).
pub struct SimulationRunner {
    benchmark: Benchmark,
    agent_id: usize,
    loops: Arc<EventLoopGroup>,
    /// Keyed by target name; the default target is not repeated.
    client_pools: BTreeMap<String, Arc<dyn ClientPool>>,
    /// One per executor.
    destinations: Vec<Arc<DestinationTable>>,
    sessions: Arc<Mutex<Vec<Session>>>,
    shared_resources: BTreeMap<String, Arc<SharedResources>>,
    none: Arc<SharedResources>,
    instances: BTreeMap<String, Arc<PhaseInstance>>,
    events: Arc<PhaseEvents>,
    watchdog: Mutex<Option<JitterWatchdog>>,
    depleted_quiet: Arc<AtomicBool>,
    shut_down: AtomicBool,
}

impl SimulationRunner {
    pub fn new(
        benchmark: Benchmark,
        agent_id: usize,
        client_factory: &ClientPoolFactory,
    ) -> Result<Self, EngineError> {
        benchmark.config.validate()?;
        let mut default = None;
        for http in &benchmark.http {
            http.validate()?;
            if http.is_default {
                if let Some(other) = default.replace(http.name.clone()) {
                    return Err(EngineError::Config(format!(
                        "both {other} and {} are marked as the default target",
                        http.name
                    )));
                }
            }
        }

        let loops = Arc::new(EventLoopGroup::new(benchmark.config.threads)?);
        let mut client_pools = BTreeMap::new();
        for http in &benchmark.http {
            let pool = client_factory(http, &loops)?;
            if client_pools.insert(http.name.clone(), pool).is_some() {
                return Err(EngineError::Config(format!(
                    "duplicate connection target {}",
                    http.name
                )));
            }
        }
        let destinations = (0..loops.len())
            .map(|executor_id| {
                let pools = client_pools
                    .iter()
                    .map(|(name, pool)| (name.clone(), pool.connection_pool(executor_id)))
                    .collect();
                Arc::new(DestinationTable::new(pools, default.clone()))
            })
            .collect();

        tracing::info!(
            "Runner for {} (agent {agent_id}) using {} executors, {} targets",
            benchmark.name,
            loops.len(),
            client_pools.len()
        );
        let events = Arc::new(PhaseEvents {
            handler: RwLock::new(None),
            error_handler: RwLock::new(None),
            to_prune: Mutex::new(VecDeque::with_capacity(benchmark.phases.len())),
            loops: loops.clone(),
        });
        Ok(Self {
            benchmark,
            agent_id,
            loops,
            client_pools,
            destinations,
            sessions: Arc::default(),
            shared_resources: BTreeMap::new(),
            none: Arc::new(SharedResources::none()),
            instances: BTreeMap::new(),
            events,
            watchdog: Mutex::new(None),
            depleted_quiet: Arc::new(AtomicBool::new(false)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn set_phase_change_handler(&self, handler: PhaseChangeHandler) {
        *self.events.handler.write() = Some(handler);
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.events.error_handler.write() = Some(handler);
    }

    /// Creates the shared resources and phase instances, then starts the jitter watchdog.
    pub fn init(&mut self) -> Result<(), EngineError> {
        if !self.instances.is_empty() {
            return Err(EngineError::Config("runner is already initialized".into()));
        }
        // Each pool is sized for the most demanding phase sharing it.
        let mut max_sessions: BTreeMap<&str, usize> = BTreeMap::new();
        for def in &self.benchmark.phases {
            if let Some(key) = &def.shared_resources {
                let max = max_sessions.entry(key.as_str()).or_default();
                *max = (*max).max(def.model.max_sessions());
            }
        }

        let mut instances = BTreeMap::new();
        for def in &self.benchmark.phases {
            let group = match &def.shared_resources {
                None => self.none.clone(),
                Some(key) => match self.shared_resources.get(key) {
                    Some(group) => group.clone(),
                    None => {
                        let group = Arc::new(self.create_shared_resources(
                            key,
                            max_sessions.get(key.as_str()).copied().unwrap_or_default(),
                        ));
                        self.shared_resources.insert(key.clone(), group.clone());
                        group
                    }
                },
            };
            let handler = if Arc::ptr_eq(&group, &self.none) {
                self.events.phase_changed(Weak::new())
            } else {
                self.events.phase_changed(Arc::downgrade(&group))
            };
            let instance = PhaseInstance::new(
                Arc::new(def.clone()),
                group.session_pool.clone(),
                handler,
            );
            if instances.insert(def.name.clone(), instance).is_some() {
                return Err(EngineError::Config(format!("duplicate phase {}", def.name)));
            }
        }
        self.instances = instances;

        let events = self.events.clone();
        let watchdog = JitterWatchdog::spawn(
            self.benchmark.config.jitter_watchdog_period(),
            self.benchmark.config.jitter_watchdog_threshold(),
            move |error| events.report_error(error),
        )?;
        *self.watchdog.lock() = Some(watchdog);
        Ok(())
    }

    fn create_shared_resources(&self, key: &str, max_sessions: usize) -> SharedResources {
        let executors = self.loops.len();
        let statistics: Vec<_> = (0..executors).map(SessionStatistics::new).collect();
        let data: Vec<_> = (0..executors).map(|_| SharedData::default()).collect();
        let current_phase: Arc<Mutex<Option<Arc<PhaseInstance>>>> = Arc::default();

        let factory = {
            let all_sessions = self.sessions.clone();
            let loops = self.loops.clone();
            let destinations = self.destinations.clone();
            let statistics = statistics.clone();
            let mut created = 0;
            move || {
                let mut all = all_sessions.lock();
                // Round-robin within the group, so sessions line up with per-executor
                // connections when concurrency equals the connection count.
                let executor_id = created % loops.len();
                created += 1;
                let session = Session::new(
                    all.len(),
                    loops.executor(executor_id).clone(),
                    statistics[executor_id].clone(),
                    data[executor_id].clone(),
                    destinations[executor_id].clone(),
                );
                all.push(session.clone());
                session
            }
        };
        let on_depleted = {
            let quiet = self.depleted_quiet.clone();
            let current_phase = Arc::downgrade(&current_phase);
            move || {
                if !quiet.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        "Pool depleted, throttling execution! Enable trace logging to see subsequent pool depletion messages."
                    );
                } else {
                    tracing::trace!("Pool depleted, throttling execution!");
                }
                let phase = current_phase.upgrade().and_then(|p| p.lock().clone());
                if let Some(phase) = phase {
                    phase.set_session_limit_exceeded();
                }
            }
        };
        tracing::debug!("Shared resources {key}: up to {max_sessions} sessions");
        SharedResources {
            current_phase,
            session_pool: Some(Arc::new(Mutex::new(ElasticPool::new(
                max_sessions,
                factory,
                on_depleted,
            )))),
            statistics,
        }
    }

    /// Starts every client pool and resolves once all are ready, or with the failure.
    pub async fn open_connections(&self) -> Result<(), EngineError> {
        let starts = self.client_pools.iter().map(|(name, pool)| {
            let name = name.clone();
            pool.start().map(move |result| result.map_err(|e| (name, e)))
        });
        let failure = join_all(starts).await.into_iter().find_map(Result::err);
        let Some((name, error)) = failure else {
            return Ok(());
        };
        tracing::error!("One of the HTTP client pools failed to start: {error}");
        let (pool, reason) = match error {
            EngineError::PoolStartup { pool, reason } => (pool, reason),
            other => (name, other.to_string()),
        };
        self.events.report_error(EngineError::PoolStartup {
            pool: pool.clone(),
            reason: reason.clone(),
        });
        Err(EngineError::PoolStartup { pool, reason })
    }

    fn instance(&self, name: &str) -> Result<&Arc<PhaseInstance>, EngineError> {
        self.instances
            .get(name)
            .ok_or_else(|| EngineError::UnknownPhase(name.to_string()))
    }

    fn group_of(&self, def: &PhaseDef) -> Option<&Arc<SharedResources>> {
        def.shared_resources
            .as_ref()
            .and_then(|key| self.shared_resources.get(key))
    }

    /// Starts the phase. Its group now reports depletion and pool usage for it, and its
    /// statistics on every executor start now.
    pub fn start_phase(&self, name: &str) -> Result<(), EngineError> {
        let instance = self.instance(name)?;
        let status = instance.status();
        if status != PhaseStatus::NotStarted {
            return Err(EngineError::InvalidTransition {
                phase: name.to_string(),
                from: status,
                to: PhaseStatus::Running,
            });
        }
        if let Some(group) = self.group_of(instance.def()) {
            *group.current_phase.lock() = Some(instance.clone());
            let now = unix_millis();
            let phase: Arc<str> = Arc::from(name);
            for (executor_id, stats) in group.statistics.iter().enumerate() {
                let stats = stats.clone();
                let phase = phase.clone();
                // Queued ahead of the phase's sessions on the same loop.
                self.loops
                    .executor(executor_id)
                    .execute(move || stats.start_phase(&phase, now));
            }
        }
        instance.start(&self.loops)
    }

    pub fn finish_phase(&self, name: &str) -> Result<(), EngineError> {
        self.instance(name)?.finish()
    }

    /// Returns whether the phase is terminated.
    pub fn try_terminate_phase(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.instance(name)?.try_terminate())
    }

    pub fn terminate_phase(&self, name: &str) -> Result<(), EngineError> {
        self.instance(name)?.terminate();
        Ok(())
    }

    pub fn phase(&self, name: &str) -> Option<&Arc<PhaseInstance>> {
        self.instances.get(name)
    }

    /// Session pool used by the phase, if it holds sessions.
    pub fn session_pool(&self, name: &str) -> Option<&SessionPool> {
        self.instances.get(name)?.pool()
    }

    pub fn executors(&self) -> &Arc<EventLoopGroup> {
        &self.loops
    }

    pub fn agent_id(&self) -> usize {
        self.agent_id
    }

    pub fn benchmark(&self) -> &Benchmark {
        &self.benchmark
    }

    pub fn visit_sessions(&self, mut consumer: impl FnMut(&Session)) {
        for session in self.sessions.lock().iter() {
            consumer(session);
        }
    }

    /// Copies out every bucket of groups that have started a phase, each on its own
    /// executor, then prunes the phases terminated since the last pass.
    pub async fn visit_statistics(
        &self,
        consumer: impl FnMut(StatisticsSnapshot),
    ) -> Result<(), EngineError> {
        self.collect(consumer, |stats| stats.snapshot(None)).await?;
        self.prune_terminated().await
    }

    /// Like [`visit_statistics`](Self::visit_statistics) but hands out the recent windows
    /// and opens new ones.
    pub async fn visit_recent_statistics(
        &self,
        consumer: impl FnMut(StatisticsSnapshot),
    ) -> Result<(), EngineError> {
        let now = unix_millis();
        self.collect(consumer, move |stats| stats.take_recent(now)).await?;
        self.prune_terminated().await
    }

    async fn collect(
        &self,
        mut consumer: impl FnMut(StatisticsSnapshot),
        read: impl Fn(&SessionStatistics) -> Vec<StatisticsSnapshot> + Clone + Send + 'static,
    ) -> Result<(), EngineError> {
        let mut pending = Vec::new();
        for group in self.shared_resources.values() {
            if group.current_phase().is_none() {
                // no phase with these resources started yet
                continue;
            }
            for (executor_id, stats) in group.statistics.iter().enumerate() {
                let stats = stats.clone();
                let read = read.clone();
                pending.push(self.loops.executor(executor_id).submit(move || read(&stats)));
            }
        }
        for snapshots in join_all(pending).await {
            snapshots?.into_iter().for_each(&mut consumer);
        }
        Ok(())
    }

    async fn prune_terminated(&self) -> Result<(), EngineError> {
        let phases: Vec<Arc<str>> = self.events.to_prune.lock().drain(..).collect();
        let mut pending = Vec::new();
        for phase in phases {
            tracing::debug!(phase = %phase, "Pruning statistics");
            for group in self.shared_resources.values() {
                for (executor_id, stats) in group.statistics.iter().enumerate() {
                    let stats = stats.clone();
                    let phase = phase.clone();
                    pending.push(
                        self.loops
                            .executor(executor_id)
                            .submit(move || stats.prune(&phase)),
                    );
                }
            }
        }
        join_all(pending)
            .await
            .into_iter()
            .collect::<Result<Vec<()>, _>>()
            .map(drop)
    }

    /// Reads the per-executor containers of the phase's group directly. Meant for phases
    /// that already terminated.
    pub fn visit_phase_statistics(
        &self,
        name: &str,
        mut consumer: impl FnMut(&SessionStatistics),
    ) -> Result<(), EngineError> {
        let instance = self.instance(name)?;
        if let Some(group) = self.group_of(instance.def()) {
            group.statistics.iter().for_each(&mut consumer);
        }
        Ok(())
    }

    /// Reports `(phase, min_used, max_used)` for every group with a current phase and
    /// resets the watermarks.
    pub fn visit_session_pool_stats(&self, mut consumer: impl FnMut(&str, usize, usize)) {
        for group in self.shared_resources.values() {
            let (Some(phase), Some(pool)) = (group.current_phase(), &group.session_pool) else {
                continue;
            };
            let (min, max) = read_and_reset(pool);
            if min <= max && max != 0 {
                consumer(phase.name(), min, max);
            }
        }
    }

    pub fn visit_phase_session_pool_stats(
        &self,
        name: &str,
        mut consumer: impl FnMut(&str, usize, usize),
    ) -> Result<(), EngineError> {
        let instance = self.instance(name)?;
        if let Some(pool) = instance.pool() {
            let (min, max) = read_and_reset(pool);
            if min <= max && max != 0 {
                consumer(name, min, max);
            }
        }
        Ok(())
    }

    /// One line per named pool and executor.
    pub fn list_connections(&self) -> Vec<String> {
        self.destinations
            .iter()
            .flat_map(|table| table.iter().map(|(name, pool)| describe_pool(name, pool.as_ref())))
            .collect()
    }

    /// Stops the watchdog, the client pools and the event loops. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down runner for {}", self.benchmark.name);
        if let Some(mut watchdog) = self.watchdog.lock().take() {
            watchdog.stop();
        }
        for pool in self.client_pools.values() {
            pool.shutdown();
        }
        self.loops
            .shutdown_gracefully(self.benchmark.config.shutdown_timeout());
        for group in self.shared_resources.values() {
            group.current_phase.lock().take();
        }
    }
}

fn read_and_reset(pool: &SessionPool) -> (usize, usize) {
    let mut pool = pool.lock();
    let watermarks = (pool.min_used(), pool.max_used());
    pool.reset_stats();
    watermarks
}

impl Drop for SimulationRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for SimulationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationRunner")
            .field("benchmark", &self.benchmark.name)
            .field("agent_id", &self.agent_id)
            .field("executors", &self.loops.len())
            .field("phases", &self.instances.keys().collect::<Vec<_>>())
            .finish()
    }
}
