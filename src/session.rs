//! Session coordination.
//!
//! The session is the top-level driver: it validates the registered
//! scenarios, applies external settings, opens every distinct connection
//! pool, runs init hooks, launches one scheduler per scenario in parallel,
//! streams periodic snapshots to reporting sinks, and tears everything down
//! again: clean hooks best-effort, pools always disposed, final snapshot
//! returned.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pipeline::{PipelineDeps, ScenarioRuntime};
use crate::pool::{ConnectionPool, PoolContext};
use crate::report::{ReportingSink, WorkerPlugin};
use crate::scenario::{parse_custom_settings, Scenario, ScenarioContext, TestStopper};
use crate::scheduler::run_scenario;
use crate::stats::{NodeStats, StatsAggregator, TestInfo};
use crate::timeline::Timeline;

/// A configured load-test session.
///
/// # Example
/// ```no_run
/// use stampede::response::Response;
/// use stampede::scenario::{Scenario, Step};
/// use stampede::session::Session;
///
/// # async fn run() -> Result<(), stampede::error::EngineError> {
/// let scenario = Scenario::new(
///     "hello",
///     vec![Step::new("greet", |_ctx| async { Response::ok() })],
/// );
///
/// let stats = Session::new("smoke")
///     .register_scenarios(vec![scenario])
///     .run()
///     .await?;
/// println!("ok: {}", stats.scenarios[0].ok_count);
/// # Ok(())
/// # }
/// ```
pub struct Session {
    name: String,
    scenarios: Vec<Scenario>,
    config: EngineConfig,
    sinks: Vec<Arc<dyn ReportingSink>>,
    plugins: Vec<Arc<dyn WorkerPlugin>>,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scenarios: Vec::new(),
            config: EngineConfig::default(),
            sinks: Vec::new(),
            plugins: Vec::new(),
            clock: Arc::new(MonotonicClock),
            token: CancellationToken::new(),
        }
    }

    pub fn register_scenarios(mut self, scenarios: Vec<Scenario>) -> Self {
        self.scenarios.extend(scenarios);
        self
    }

    /// External settings applied over programmatic scenario defaults.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reporting_sink(mut self, sink: Arc<dyn ReportingSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_worker_plugin(mut self, plugin: Arc<dyn WorkerPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Token that cancels the whole session from outside.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run the session to completion and return the final snapshot.
    pub async fn run(self) -> Result<NodeStats, EngineError> {
        // Validation happens before any side effect; all failures at once.
        validate_scenarios(&self.scenarios)?;

        let mut scenarios = self.scenarios;
        for scenario in scenarios.iter_mut() {
            if let Some(setting) = self.config.scenario_setting(scenario.name()) {
                setting.apply(scenario);
            }
        }

        // Filter down to the requested target scenarios.
        if let Some(targets) = &self.config.target_scenarios {
            let wanted: HashSet<&str> = targets.iter().map(|s| s.as_str()).collect();
            let known: HashSet<&str> = scenarios.iter().map(|s| s.name()).collect();
            for target in &wanted {
                if !known.contains(target) {
                    warn!(scenario = target, "Target scenario is not registered");
                }
            }
            scenarios.retain(|s| wanted.contains(s.name()));
        }
        if scenarios.is_empty() {
            info!(session = %self.name, "No target scenarios to run");
            let test_info = Arc::new(TestInfo::new(&self.name));
            let stats = StatsAggregator::new(test_info, &[]);
            return Ok(stats.snapshot(Duration::ZERO));
        }

        let test_info = Arc::new(TestInfo::new(&self.name));
        info!(
            session = %self.name,
            scenarios = scenarios.len(),
            "Session starting"
        );

        let stats = Arc::new(StatsAggregator::new(
            Arc::clone(&test_info),
            &scenarios
                .iter()
                .map(|s| (s.name().to_string(), s.tracked_step_names()))
                .collect::<Vec<_>>(),
        ));

        // Compile timelines first: settings overrides may have replaced the
        // validated simulations, and no resource is acquired before this.
        let timelines: Vec<Timeline> = scenarios
            .iter()
            .map(|s| Timeline::compile(s.name(), &s.load_simulations))
            .collect::<Result<_, EngineError>>()?;

        let pool_ctx = PoolContext {
            test_info: Arc::clone(&test_info),
            cancellation: self.token.clone(),
        };

        // Open every distinct pool; roll all of them back on any failure.
        let pools = open_all_pools(&scenarios, &self.config, &pool_ctx).await?;

        // Resolve scenario runtimes against the open pools.
        let runtimes: Vec<Arc<ScenarioRuntime>> = scenarios
            .iter()
            .zip(timelines)
            .map(|(scenario, timeline)| {
                let step_pools = scenario
                    .steps()
                    .iter()
                    .map(|step| {
                        step.pool_args.as_ref().map(|args| {
                            let resolved = resolved_pool_name(scenario.name(), args.name());
                            Arc::clone(&pools[&resolved])
                        })
                    })
                    .collect();
                let custom = Arc::new(parse_custom_settings(
                    scenario.name(),
                    &scenario.custom_settings,
                ));
                Arc::new(ScenarioRuntime {
                    scenario: scenario.clone(),
                    timeline,
                    step_pools,
                    custom_settings: custom,
                })
            })
            .collect();

        // Init hooks run in parallel; any failure aborts before schedulers.
        if let Err(e) = run_init_hooks(&runtimes, &test_info, &self.token).await {
            dispose_all_pools(&pools, &pool_ctx).await;
            return Err(e);
        }

        for plugin in &self.plugins {
            plugin.on_start(&self.config.worker_plugins).await;
        }

        let stopper = TestStopper::new(self.token.clone());
        let start = Instant::now();

        // One scheduler per scenario, all in parallel. Task ids are kept so
        // an aborted task can still be attributed to its scenario.
        let mut schedulers: JoinSet<(String, Result<Duration, EngineError>)> = JoinSet::new();
        let mut scheduler_names: HashMap<tokio::task::Id, String> = HashMap::new();
        for runtime in &runtimes {
            let deps = Arc::new(PipelineDeps {
                runtime: Arc::clone(runtime),
                stats: Arc::clone(&stats),
                clock: Arc::clone(&self.clock),
                stopper: stopper.clone(),
            });
            let session_token = self.token.clone();
            let name = runtime.scenario.name().to_string();
            let handle = schedulers.spawn({
                let name = name.clone();
                async move {
                    let result = run_scenario(deps, session_token).await;
                    (name, result)
                }
            });
            scheduler_names.insert(handle.id(), name);
        }

        // Periodic snapshots to sinks and plugins while schedulers run.
        let reporter_stop = CancellationToken::new();
        let reporter = spawn_reporter(
            Arc::clone(&stats),
            self.sinks.clone(),
            self.plugins.clone(),
            self.config.reporting.send_stats_interval(),
            start,
            reporter_stop.clone(),
        );

        let mut run_errors: Vec<EngineError> = Vec::new();
        while let Some(joined) = schedulers.join_next_with_id().await {
            match joined {
                Ok((_id, (name, Ok(executed)))) => {
                    info!(
                        scenario = %name,
                        executed_secs = executed.as_secs_f64(),
                        "Scheduler finished"
                    );
                }
                Ok((_id, (name, Err(e)))) => {
                    warn!(scenario = %name, error = %e, "Scheduler failed");
                    run_errors.push(e);
                }
                Err(join_err) => {
                    // A dead scheduler means a whole scenario silently ran
                    // short; that must fail the session result.
                    let scenario = scheduler_names
                        .get(&join_err.id())
                        .cloned()
                        .unwrap_or_else(|| "<unknown>".to_string());
                    error!(scenario = %scenario, error = %join_err, "Scheduler task aborted");
                    run_errors.push(EngineError::SchedulerAborted {
                        scenario,
                        cause: join_err.to_string(),
                    });
                }
            }
        }

        reporter_stop.cancel();
        let _ = reporter.await;

        // A cooperative stop terminates the run early; surface it so the
        // caller does not have to infer it from truncated durations. Sinks
        // still receive the final snapshot below.
        if let Some(reason) = stopper.reason() {
            let stop = EngineError::StopTestRequested { reason };
            info!(error = %stop, "Session stopped cooperatively");
            run_errors.push(stop);
        }

        // Clean hooks are best-effort, even for aborted scenarios.
        run_clean_hooks(&runtimes, &test_info, &self.token).await;
        dispose_all_pools(&pools, &pool_ctx).await;

        let final_stats = stats.snapshot(start.elapsed());
        for sink in &self.sinks {
            sink.on_final_stats(&final_stats).await;
        }
        for plugin in &self.plugins {
            plugin.on_stats(&final_stats).await;
            plugin.on_stop().await;
        }

        info!(
            session = %self.name,
            duration_secs = final_stats.duration.as_secs_f64(),
            "Session finished"
        );

        match EngineError::from_many(run_errors) {
            Some(e) => Err(e),
            None => Ok(final_stats),
        }
    }
}

/// The session-unique pool name: `"{scenario_name}.{pool_name}"`.
fn resolved_pool_name(scenario_name: &str, pool_name: &str) -> String {
    format!("{}.{}", scenario_name, pool_name)
}

/// Validate every registered scenario, collecting all failures.
fn validate_scenarios(scenarios: &[Scenario]) -> Result<(), EngineError> {
    let mut errors: Vec<EngineError> = Vec::new();

    // Duplicate scenario names, with the full duplicate list.
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for scenario in scenarios {
        *seen.entry(scenario.name()).or_insert(0) += 1;
    }
    let mut duplicates: Vec<String> = seen
        .iter()
        .filter(|(_, &count)| count > 1)
        .map(|(name, _)| name.to_string())
        .collect();
    if !duplicates.is_empty() {
        duplicates.sort();
        errors.push(EngineError::DuplicateScenarioName { names: duplicates });
    }

    for scenario in scenarios {
        if scenario.name().trim().is_empty() {
            errors.push(EngineError::EmptyScenarioName);
        }

        if scenario.steps().is_empty() && scenario.init.is_none() && scenario.clean.is_none() {
            errors.push(EngineError::EmptySteps {
                scenario: scenario.name().to_string(),
            });
        }

        for step in scenario.steps() {
            if step.name().trim().is_empty() {
                errors.push(EngineError::EmptyStepName {
                    scenario: scenario.name().to_string(),
                });
            }
        }

        // The same pool name must always refer to the same declared pool.
        let mut pools_by_name: HashMap<&str, &Arc<crate::pool::ConnectionPoolArgs>> =
            HashMap::new();
        for step in scenario.steps() {
            if let Some(args) = &step.pool_args {
                match pools_by_name.get(args.name()) {
                    Some(existing) if !Arc::ptr_eq(*existing, args) => {
                        errors.push(EngineError::DuplicateConnectionPoolName {
                            scenario: scenario.name().to_string(),
                            pool: args.name().to_string(),
                        });
                    }
                    _ => {
                        pools_by_name.insert(args.name(), args);
                    }
                }
            }
        }

        if let Err(e) = Timeline::compile(scenario.name(), &scenario.load_simulations) {
            errors.push(e);
        }
    }

    match EngineError::from_many(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Open every distinct pool across the target scenarios. On any failure the
/// pools that did open are disposed before the error is returned.
async fn open_all_pools(
    scenarios: &[Scenario],
    config: &EngineConfig,
    ctx: &PoolContext,
) -> Result<HashMap<String, Arc<ConnectionPool>>, EngineError> {
    let mut pools: HashMap<String, Arc<ConnectionPool>> = HashMap::new();

    for scenario in scenarios {
        for step in scenario.steps() {
            let Some(args) = &step.pool_args else {
                continue;
            };
            let resolved = resolved_pool_name(scenario.name(), args.name());
            if pools.contains_key(&resolved) {
                continue;
            }

            let count = config
                .pool_count_override(&resolved)
                .unwrap_or_else(|| args.count());

            match ConnectionPool::open(&resolved, args, count, ctx).await {
                Ok(pool) => {
                    pools.insert(resolved, Arc::new(pool));
                }
                Err(e) => {
                    error!(pool = %resolved, error = %e, "Pool open failed; rolling back");
                    dispose_all_pools(&pools, ctx).await;
                    return Err(e);
                }
            }
        }
    }

    Ok(pools)
}

async fn dispose_all_pools(pools: &HashMap<String, Arc<ConnectionPool>>, ctx: &PoolContext) {
    for pool in pools.values() {
        pool.dispose(ctx).await;
    }
}

fn hook_context(
    runtime: &ScenarioRuntime,
    test_info: &Arc<TestInfo>,
    token: &CancellationToken,
) -> ScenarioContext {
    ScenarioContext {
        scenario_name: runtime.scenario.name().to_string(),
        test_info: Arc::clone(test_info),
        custom_settings: Arc::clone(&runtime.custom_settings),
        cancellation: token.clone(),
    }
}

/// Run every scenario's init hook in parallel; the first failure aborts.
async fn run_init_hooks(
    runtimes: &[Arc<ScenarioRuntime>],
    test_info: &Arc<TestInfo>,
    token: &CancellationToken,
) -> Result<(), EngineError> {
    let mut hooks: JoinSet<(String, Result<(), String>)> = JoinSet::new();
    for runtime in runtimes {
        let Some(init) = runtime.scenario.init.clone() else {
            continue;
        };
        let ctx = hook_context(runtime, test_info, token);
        let name = runtime.scenario.name().to_string();
        hooks.spawn(async move {
            let result = init(ctx).await;
            (name, result)
        });
    }

    let mut first_failure: Option<EngineError> = None;
    while let Some(joined) = hooks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(scenario = %name, "Init hook finished"),
            Ok((name, Err(cause))) => {
                error!(scenario = %name, %cause, "Init hook failed");
                first_failure.get_or_insert(EngineError::InitFailed {
                    scenario: name,
                    cause,
                });
            }
            Err(join_err) => {
                first_failure.get_or_insert(EngineError::InitFailed {
                    scenario: "<unknown>".to_string(),
                    cause: join_err.to_string(),
                });
            }
        }
    }

    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Run every scenario's clean hook; failures are logged, never propagated.
async fn run_clean_hooks(
    runtimes: &[Arc<ScenarioRuntime>],
    test_info: &Arc<TestInfo>,
    token: &CancellationToken,
) {
    for runtime in runtimes {
        let Some(clean) = runtime.scenario.clean.clone() else {
            continue;
        };
        let ctx = hook_context(runtime, test_info, token);
        if let Err(cause) = clean(ctx).await {
            warn!(
                scenario = %runtime.scenario.name(),
                %cause,
                "Clean hook failed; ignoring"
            );
        }
    }
}

fn spawn_reporter(
    stats: Arc<StatsAggregator>,
    sinks: Vec<Arc<dyn ReportingSink>>,
    plugins: Vec<Arc<dyn WorkerPlugin>>,
    send_interval: Duration,
    start: Instant,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // interval() panics on a zero period.
        let mut ticker = interval(send_interval.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first report
        // carries real data.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = stats.snapshot(start.elapsed());
                    for sink in &sinks {
                        sink.on_stats(&snapshot).await;
                    }
                    for plugin in &plugins {
                        plugin.on_stats(&snapshot).await;
                    }
                }
                _ = stop.cancelled() => break,
            }
        }
    })
}
