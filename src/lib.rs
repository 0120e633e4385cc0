//! Volley is a phase-driven load generation engine.
//!
//! A benchmark is a set of *phases*. Each phase runs one [`Scenario`] with a load model
//! (a fixed number of users, or a constant or ramping arrival rate). Sessions that perform
//! the scenario are drawn from elastic pools whose cap is fixed up front, and are pinned to
//! one single-threaded event loop for their whole life, together with the connections and
//! statistics they use. Nothing on the request path crosses threads.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`EventLoopGroup`]: a fixed set of single-threaded tokio runtimes, one OS thread each.
//! - [`ElasticPool`]: a pool that creates objects lazily up to a hard cap, tracks min/max
//!   usage watermarks, and reports depletion instead of blocking once the cap is reached.
//! - [`Session`]: the per-user state: variables, the current phase and sequence, and the
//!   requests in flight.
//! - [`Request`]: the lifecycle of one outgoing request, with its timeout and statistics.
//! - [`PhaseInstance`]: the state machine of a running phase and the sessions it owns.
//! - [`SimulationRunner`]: glues everything together. It creates the pools, opens the
//!   connections, drives phases and collects statistics.
//! - [`Report`] and [`Reporter`]: turn statistics snapshots into output.
//!
//! # Feature flags
//! - `internals`: enable access to internal (and unstable) functions such as the rate
//!   governor
//!
//! # Where to start
//!
//! Read the docs for [`Scenario`], [`PhaseDef`] and [`SimulationRunner`], then the `steps`
//! demo.

/// Engine configuration
pub mod config;
/// Connections, connection pools and destinations
pub mod connection;
pub mod error;
/// Event loops that own sessions and connections
pub mod executor;
/// Phase definitions, instances and load models
pub mod phase;
pub mod pool;
/// Reports and Reporters
pub mod report;
pub mod request;
/// Top-level orchestration of a benchmark
pub mod runner;
pub mod scenario;
pub mod session;
pub mod statistics;
/// Built-in scenario steps
pub mod step;
pub mod watchdog;

pub use config::RunnerConfig;
pub use connection::{ClientPool, Connection, ConnectionPool, HttpConfig};
pub use error::EngineError;
pub use executor::{EventLoop, EventLoopGroup};
pub use phase::{PhaseDef, PhaseInstance, PhaseModel, PhaseStatus};
pub use pool::{ElasticPool, SessionPool};
pub use report::{Report, Reporter, StatisticsReport, StdoutReporter};
pub use request::{Request, RequestHandler};
pub use runner::{Benchmark, SimulationRunner};
pub use scenario::Scenario;
pub use session::{Session, Value};
pub use statistics::{Statistics, StatisticsSnapshot, StatisticsSummary};
pub use step::{Step, StepRegistry};
