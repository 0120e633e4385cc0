use std::{collections::BTreeMap, sync::Arc, time::Duration};

use volley::{
    Benchmark, ClientPool, EngineError, EventLoopGroup, HttpConfig, PhaseDef, PhaseModel,
    PhaseStatus, Reporter, RunnerConfig, Scenario, SimulationRunner, StatisticsReport,
    StdoutReporter, StepRegistry,
};

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// No HTTP targets, so this is never called
fn no_clients(
    http: &HttpConfig,
    _: &Arc<EventLoopGroup>,
) -> Result<Arc<dyn ClientPool>, EngineError> {
    Err(EngineError::Config(format!("no client for {}", http.name)))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), EngineError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Steps are usually built from a parsed benchmark file, tag + string parameters
    let registry = StepRegistry::default();
    let steps = vec![
        registry.build("set", &params(&[("var", "greeting"), ("value", "hello")]))?,
        registry.build("pause", &params(&[("duration", "50ms")]))?,
        registry.build(
            "log",
            &params(&[("message", "{} from session, visit {}"), ("vars", "greeting, visit")]),
        )?,
    ];
    let scenario = Scenario::from_steps("greet", steps);

    let benchmark = Benchmark::builder()
        .name("steps-demo")
        .config(RunnerConfig::builder().threads(2).build())
        .phases(vec![
            PhaseDef::builder()
                .name("warmup")
                .scenario(scenario.clone())
                .model(PhaseModel::AtOnce { users: 4 })
                .shared_resources("greeters")
                .build(),
            PhaseDef::builder()
                .name("steady")
                .scenario(scenario)
                .model(PhaseModel::ConstantRate {
                    users_per_sec: 20.0,
                    max_sessions: 8,
                })
                .shared_resources("greeters")
                .build(),
        ])
        .build();

    let mut runner = SimulationRunner::new(benchmark, 0, &no_clients)?;
    runner.set_phase_change_handler(Arc::new(
        |phase: &Arc<PhaseDef>,
         status: PhaseStatus,
         session_limit_exceeded: bool,
         error: Option<Arc<EngineError>>| {
            tracing::info!(
                "{} is {status} (session limit exceeded: {session_limit_exceeded}, error: {error:?})",
                phase.name
            );
        },
    ));
    runner.init()?;
    runner.open_connections().await?;

    let schedule = [
        ("warmup", Duration::from_millis(200)),
        ("steady", Duration::from_secs(1)),
    ];
    for (name, duration) in schedule {
        runner.start_phase(name)?;
        tokio::time::sleep(duration).await;
        runner.finish_phase(name)?;
        while !runner.try_terminate_phase(name)? {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    let mut snapshots = Vec::new();
    runner.visit_statistics(|s| snapshots.push(s)).await?;
    StdoutReporter
        .report(&StatisticsReport::from(snapshots))
        .await?;

    runner.visit_session_pool_stats(|phase, min, max| {
        tracing::info!("{phase}: between {min} and {max} sessions in use");
    });
    runner.shutdown();
    Ok(())
}
