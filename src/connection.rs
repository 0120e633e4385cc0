//! Interface boundary to the connection layer.
//!
//! The wire-level client lives outside this crate. The engine only needs to start and stop
//! client pools, hand each session the per-executor destination table, notify connections
//! of timeouts and list what is open for operators.
use std::{collections::BTreeMap, fmt, sync::Arc};

use futures::future::BoxFuture;
use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::{error::EngineError, request::Request};

/// One live connection, as seen by the engine.
pub trait Connection: Send + Sync + fmt::Debug {
    /// A request running on this connection timed out. The connection may decide to
    /// recycle itself.
    fn on_timeout(&self, request: &Request);

    /// Whether a new request could be sent right now.
    fn is_available(&self) -> bool;

    /// Requests written but not yet answered.
    fn in_flight(&self) -> usize;

    fn is_secure(&self) -> bool;

    /// Short implementation name used in connection listings (e.g. `Http1Connection`).
    fn kind(&self) -> &str;
}

/// Connections to one target, owned by one executor.
pub trait ConnectionPool: Send + Sync {
    fn connections(&self) -> Vec<Arc<dyn Connection>>;

    /// Rough number of sessions waiting for a connection.
    fn waiting_sessions(&self) -> usize;
}

/// All connections to one target across executors.
pub trait ClientPool: Send + Sync {
    /// Opens the connections. Resolves once the pool is ready, or with the failure.
    fn start(&self) -> BoxFuture<'static, Result<(), EngineError>>;

    fn shutdown(&self);

    /// The part of this pool owned by `executor_id`.
    fn connection_pool(&self, executor_id: usize) -> Arc<dyn ConnectionPool>;
}

/// Target definition handed over by the benchmark definition.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, TypedBuilder)]
pub struct HttpConfig {
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(into))]
    pub host: String,
    pub port: u16,
    #[builder(default)]
    #[serde(default)]
    pub tls: bool,
    /// Connections per executor.
    #[builder(default = 1)]
    #[serde(default = "one")]
    pub connections: usize,
    /// Sessions that don't name a target use the default one.
    #[builder(default)]
    #[serde(default)]
    pub is_default: bool,
}

fn one() -> usize {
    1
}

impl HttpConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let target = || format!("{}:{}", self.host, self.port);
        if self.name.is_empty() {
            return Err(EngineError::Config(format!(
                "connection target {} has no name",
                target()
            )));
        }
        if self.host.trim().is_empty() || self.port == 0 {
            return Err(EngineError::Config(format!(
                "invalid connection target {} for {}",
                target(),
                self.name
            )));
        }
        if self.connections == 0 {
            return Err(EngineError::Config(format!(
                "connection pool to {} needs at least one connection",
                target()
            )));
        }
        Ok(())
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-executor lookup of connection pools by target name.
#[derive(Clone, Default)]
pub struct DestinationTable {
    pools: BTreeMap<String, Arc<dyn ConnectionPool>>,
    default: Option<String>,
}

impl DestinationTable {
    pub fn new(pools: BTreeMap<String, Arc<dyn ConnectionPool>>, default: Option<String>) -> Self {
        Self { pools, default }
    }

    /// Pool for `name`, or the default pool when `name` is `None`.
    pub fn get(&self, name: Option<&str>) -> Option<&Arc<dyn ConnectionPool>> {
        let name = name.or(self.default.as_deref())?;
        self.pools.get(name)
    }

    /// Named pools only; the default alias is not repeated.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ConnectionPool>)> {
        self.pools.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl fmt::Debug for DestinationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationTable")
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .field("default", &self.default)
            .finish()
    }
}

/// Summarizes one pool for the connection inventory.
pub fn describe_pool(name: &str, pool: &dyn ConnectionPool) -> String {
    let connections = pool.connections();
    let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
    let mut available = 0;
    let mut in_flight = 0;
    for conn in &connections {
        if conn.is_available() {
            available += 1;
        }
        in_flight += conn.in_flight();
        let kind = if conn.is_secure() {
            format!("{}(SSL)", conn.kind())
        } else {
            conn.kind().to_string()
        };
        *by_type.entry(kind).or_default() += 1;
    }
    format!(
        "{name}: {available}/{} available, {in_flight} in-flight requests, {} waiting sessions (estimate), types: {by_type:?}",
        connections.len(),
        pool.waiting_sessions(),
    )
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory connection layer for tests.
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;

    #[derive(Debug, Default)]
    pub struct MockConnection {
        pub secure: bool,
        pub busy: bool,
        pub in_flight: usize,
        pub timeouts: AtomicUsize,
    }

    impl Connection for MockConnection {
        fn on_timeout(&self, _request: &Request) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }

        fn is_available(&self) -> bool {
            !self.busy
        }

        fn in_flight(&self) -> usize {
            self.in_flight
        }

        fn is_secure(&self) -> bool {
            self.secure
        }

        fn kind(&self) -> &str {
            "MockConnection"
        }
    }

    #[derive(Default)]
    pub struct MockConnectionPool {
        pub connections: Vec<Arc<dyn Connection>>,
        pub waiting: usize,
    }

    impl ConnectionPool for MockConnectionPool {
        fn connections(&self) -> Vec<Arc<dyn Connection>> {
            self.connections.clone()
        }

        fn waiting_sessions(&self) -> usize {
            self.waiting
        }
    }

    pub struct MockClientPool {
        pub name: String,
        pub fail: bool,
        pub starts: AtomicUsize,
        pub shutdowns: AtomicUsize,
        pub pools: Vec<Arc<MockConnectionPool>>,
    }

    impl MockClientPool {
        pub fn new(config: &HttpConfig, executors: usize) -> Self {
            let pools = (0..executors)
                .map(|_| {
                    Arc::new(MockConnectionPool {
                        connections: (0..config.connections)
                            .map(|i| {
                                Arc::new(MockConnection {
                                    secure: config.tls,
                                    busy: i % 2 == 1,
                                    in_flight: i % 2,
                                    ..Default::default()
                                }) as Arc<dyn Connection>
                            })
                            .collect(),
                        waiting: 0,
                    })
                })
                .collect();
            Self {
                name: config.name.clone(),
                fail: config.host == "unreachable",
                starts: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                pools,
            }
        }
    }

    impl ClientPool for MockClientPool {
        fn start(&self) -> BoxFuture<'static, Result<(), EngineError>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let result = if self.fail {
                Err(EngineError::PoolStartup {
                    pool: self.name.clone(),
                    reason: "connection refused".into(),
                })
            } else {
                Ok(())
            };
            async move { result }.boxed()
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_pool(&self, executor_id: usize) -> Arc<dyn ConnectionPool> {
            self.pools[executor_id].clone()
        }
    }
}
