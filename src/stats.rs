//! Concurrent statistics aggregation.
//!
//! One shard per scenario, one counter block per tracked step, all built
//! once at session start so the hot path is atomic increments plus a short
//! histogram lock. Snapshots fold the counters into [`NodeStats`] for
//! reporting sinks; the warm-up validator inspects the same counters before
//! they are reset for the main run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Identity of the running test session, carried on every snapshot and
/// handed to user hooks through their contexts.
#[derive(Debug, Clone, Serialize)]
pub struct TestInfo {
    pub session_id: String,
    pub machine_name: String,
    pub started_at: DateTime<Utc>,
}

impl TestInfo {
    pub fn new(session_id: impl Into<String>) -> Self {
        let machine_name =
            std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            session_id: session_id.into(),
            machine_name,
            started_at: Utc::now(),
        }
    }
}

/// One observed step outcome, reported by the pipeline.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub scenario_name: String,
    pub step_name: String,
    pub ok: bool,
    pub latency_ms: u64,
    pub size_bytes: u64,
}

/// Counter block for one `(scenario, step)` fingerprint.
struct StepCounters {
    ok_count: AtomicU64,
    fail_count: AtomicU64,
    sum_latency_ms: AtomicU64,
    min_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
    sum_bytes: AtomicU64,
    min_bytes: AtomicU64,
    max_bytes: AtomicU64,
    // Latencies from 1 ms to 1 hour with 3 significant digits.
    histogram: Mutex<Histogram<u64>>,
}

impl StepCounters {
    fn new() -> Self {
        let histogram =
            Histogram::new_with_bounds(1, 3_600_000, 3).expect("histogram bounds are static");
        Self {
            ok_count: AtomicU64::new(0),
            fail_count: AtomicU64::new(0),
            sum_latency_ms: AtomicU64::new(0),
            min_latency_ms: AtomicU64::new(u64::MAX),
            max_latency_ms: AtomicU64::new(0),
            sum_bytes: AtomicU64::new(0),
            min_bytes: AtomicU64::new(u64::MAX),
            max_bytes: AtomicU64::new(0),
            histogram: Mutex::new(histogram),
        }
    }

    fn record(&self, ok: bool, latency_ms: u64, size_bytes: u64) {
        if ok {
            self.ok_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fail_count.fetch_add(1, Ordering::Relaxed);
        }
        self.sum_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.min_latency_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);
        self.sum_bytes.fetch_add(size_bytes, Ordering::Relaxed);
        self.min_bytes.fetch_min(size_bytes, Ordering::Relaxed);
        self.max_bytes.fetch_max(size_bytes, Ordering::Relaxed);

        let mut hist = self.histogram.lock().unwrap();
        if let Err(e) = hist.record(latency_ms.clamp(1, 3_600_000)) {
            warn!(latency_ms, error = %e, "Failed to record latency in histogram");
        }
    }

    fn reset(&self) {
        self.ok_count.store(0, Ordering::Relaxed);
        self.fail_count.store(0, Ordering::Relaxed);
        self.sum_latency_ms.store(0, Ordering::Relaxed);
        self.min_latency_ms.store(u64::MAX, Ordering::Relaxed);
        self.max_latency_ms.store(0, Ordering::Relaxed);
        self.sum_bytes.store(0, Ordering::Relaxed);
        self.min_bytes.store(u64::MAX, Ordering::Relaxed);
        self.max_bytes.store(0, Ordering::Relaxed);
        self.histogram.lock().unwrap().clear();
    }

    fn to_stats(&self, step_name: &str, executed: Duration) -> StepStats {
        let ok_count = self.ok_count.load(Ordering::Relaxed);
        let fail_count = self.fail_count.load(Ordering::Relaxed);
        let total = ok_count + fail_count;

        let sum_latency = self.sum_latency_ms.load(Ordering::Relaxed);
        let mean_ms = if total > 0 {
            sum_latency as f64 / total as f64
        } else {
            0.0
        };

        let min_latency = self.min_latency_ms.load(Ordering::Relaxed);
        let min_bytes = self.min_bytes.load(Ordering::Relaxed);
        let sum_bytes = self.sum_bytes.load(Ordering::Relaxed);

        let executed_secs = executed.as_secs();
        let rps = ok_count as f64 / executed_secs.max(1) as f64;

        let hist = self.histogram.lock().unwrap();
        let (p50_ms, p75_ms, p95_ms, p99_ms) = if hist.is_empty() {
            (0, 0, 0, 0)
        } else {
            (
                hist.value_at_quantile(0.50),
                hist.value_at_quantile(0.75),
                hist.value_at_quantile(0.95),
                hist.value_at_quantile(0.99),
            )
        };

        StepStats {
            step_name: step_name.to_string(),
            ok_count,
            fail_count,
            min_ms: if min_latency == u64::MAX { 0 } else { min_latency },
            mean_ms,
            max_ms: self.max_latency_ms.load(Ordering::Relaxed),
            p50_ms,
            p75_ms,
            p95_ms,
            p99_ms,
            rps,
            data_kb_min: if min_bytes == u64::MAX {
                0.0
            } else {
                min_bytes as f64 / 1024.0
            },
            data_kb_mean: if total > 0 {
                sum_bytes as f64 / total as f64 / 1024.0
            } else {
                0.0
            },
            data_kb_max: self.max_bytes.load(Ordering::Relaxed) as f64 / 1024.0,
            all_data_mb: sum_bytes as f64 / (1024.0 * 1024.0),
        }
    }
}

/// Aggregated statistics for one step of one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct StepStats {
    pub step_name: String,
    pub ok_count: u64,
    pub fail_count: u64,
    pub min_ms: u64,
    pub mean_ms: f64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p75_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub rps: f64,
    pub data_kb_min: f64,
    pub data_kb_mean: f64,
    pub data_kb_max: f64,
    pub all_data_mb: f64,
}

/// Aggregated statistics for one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioStats {
    pub scenario_name: String,
    pub ok_count: u64,
    pub fail_count: u64,
    pub executed_duration: Duration,
    pub step_stats: Vec<StepStats>,
}

/// A point-in-time snapshot of every scenario, suitable for reporting sinks.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub test_info: TestInfo,
    pub duration: Duration,
    pub scenarios: Vec<ScenarioStats>,
}

impl NodeStats {
    /// Find a scenario's stats by name.
    pub fn scenario(&self, name: &str) -> Option<&ScenarioStats> {
        self.scenarios.iter().find(|s| s.scenario_name == name)
    }

    /// Find a step's stats by scenario and step name.
    pub fn step(&self, scenario: &str, step: &str) -> Option<&StepStats> {
        self.scenario(scenario)
            .and_then(|s| s.step_stats.iter().find(|st| st.step_name == step))
    }
}

struct ScenarioShard {
    step_order: Vec<String>,
    steps: HashMap<String, StepCounters>,
    executed_ms: AtomicU64,
}

/// Concurrent per-step counters keyed by `(scenario_name, step_name)`.
///
/// The shard map is immutable after construction; all mutation goes through
/// atomics so virtual users never contend on a map lock.
pub struct StatsAggregator {
    test_info: Arc<TestInfo>,
    scenarios: HashMap<String, ScenarioShard>,
    scenario_order: Vec<String>,
}

impl StatsAggregator {
    /// Build shards for the given scenarios and their *tracked* step names.
    ///
    /// Repeated step names within a scenario share one fingerprint, so a
    /// steps-order function that repeats an index accumulates into a single
    /// entry.
    pub fn new(test_info: Arc<TestInfo>, scenarios: &[(String, Vec<String>)]) -> Self {
        let mut shards = HashMap::new();
        let mut scenario_order = Vec::new();
        for (scenario_name, step_names) in scenarios {
            let mut step_order = Vec::new();
            let mut steps = HashMap::new();
            for step_name in step_names {
                if !steps.contains_key(step_name) {
                    step_order.push(step_name.clone());
                    steps.insert(step_name.clone(), StepCounters::new());
                }
            }
            scenario_order.push(scenario_name.clone());
            shards.insert(
                scenario_name.clone(),
                ScenarioShard {
                    step_order,
                    steps,
                    executed_ms: AtomicU64::new(0),
                },
            );
        }
        Self {
            test_info,
            scenarios: shards,
            scenario_order,
        }
    }

    /// Record one observed step outcome.
    pub fn record(&self, outcome: &StepOutcome) {
        let Some(shard) = self.scenarios.get(&outcome.scenario_name) else {
            debug!(scenario = %outcome.scenario_name, "Outcome for unknown scenario dropped");
            return;
        };
        let Some(counters) = shard.steps.get(&outcome.step_name) else {
            debug!(
                scenario = %outcome.scenario_name,
                step = %outcome.step_name,
                "Outcome for unknown step dropped"
            );
            return;
        };
        counters.record(outcome.ok, outcome.latency_ms, outcome.size_bytes);
    }

    /// Update a scenario's executed duration (driven by its scheduler).
    pub fn set_executed_duration(&self, scenario: &str, executed: Duration) {
        if let Some(shard) = self.scenarios.get(scenario) {
            shard
                .executed_ms
                .store(executed.as_millis() as u64, Ordering::Relaxed);
        }
    }

    /// Clear one scenario's counters at the warm-up → main boundary.
    pub fn reset_scenario(&self, scenario: &str) {
        if let Some(shard) = self.scenarios.get(scenario) {
            for counters in shard.steps.values() {
                counters.reset();
            }
            shard.executed_ms.store(0, Ordering::Relaxed);
            debug!(scenario, "Scenario stats reset");
        }
    }

    /// Fail when any step of the scenario saw more failures than successes
    /// during warm-up.
    pub fn validate_warm_up(&self, scenario: &str) -> Result<(), EngineError> {
        let Some(shard) = self.scenarios.get(scenario) else {
            return Ok(());
        };
        for step_name in &shard.step_order {
            let counters = &shard.steps[step_name];
            let ok = counters.ok_count.load(Ordering::Relaxed);
            let fail = counters.fail_count.load(Ordering::Relaxed);
            if fail > ok {
                return Err(EngineError::WarmUpErrorWithManyFailedSteps { ok, fail });
            }
        }
        Ok(())
    }

    /// Fold all counters into a reporting snapshot.
    pub fn snapshot(&self, session_elapsed: Duration) -> NodeStats {
        let scenarios = self
            .scenario_order
            .iter()
            .map(|scenario_name| {
                let shard = &self.scenarios[scenario_name];
                let executed =
                    Duration::from_millis(shard.executed_ms.load(Ordering::Relaxed));
                let step_stats: Vec<StepStats> = shard
                    .step_order
                    .iter()
                    .map(|step_name| shard.steps[step_name].to_stats(step_name, executed))
                    .collect();
                ScenarioStats {
                    scenario_name: scenario_name.clone(),
                    ok_count: step_stats.iter().map(|s| s.ok_count).sum(),
                    fail_count: step_stats.iter().map(|s| s.fail_count).sum(),
                    executed_duration: executed,
                    step_stats,
                }
            })
            .collect();

        NodeStats {
            test_info: (*self.test_info).clone(),
            duration: session_elapsed,
            scenarios,
        }
    }
}
