//! Step-pipeline driver.
//!
//! One invocation drives a single virtual user through one pass of its
//! scenario's steps: resolve the step order, build a per-step context,
//! execute the user body, measure latency, report the outcome, and hand the
//! payload to the next step. User code must never take the engine down:
//! panicking step futures are caught and counted as failures.

use std::sync::Arc;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::pool::ConnectionPool;
use crate::response::ExitCode;
use crate::scenario::{CorrelationId, Scenario, StepContext, TestStopper};
use crate::stats::{StatsAggregator, StepOutcome};
use crate::timeline::Timeline;

/// A scenario resolved for execution: compiled timeline, per-step pool
/// handles (index-parallel to the step list), and parsed custom settings.
pub(crate) struct ScenarioRuntime {
    pub scenario: Scenario,
    pub timeline: Timeline,
    pub step_pools: Vec<Option<Arc<ConnectionPool>>>,
    pub custom_settings: Arc<serde_json::Value>,
}

/// Shared dependencies of every pipeline invocation within one scenario.
pub(crate) struct PipelineDeps {
    pub runtime: Arc<ScenarioRuntime>,
    pub stats: Arc<StatsAggregator>,
    pub clock: Arc<dyn Clock>,
    pub stopper: TestStopper,
}

/// How a pipeline pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineExit {
    /// Every ordered step ran.
    Completed,

    /// Cancellation was observed at a step boundary.
    Cancelled,

    /// A step responded with a stop-test exit code.
    Stopped,
}

/// State owned by one copy across its pipeline passes.
pub(crate) struct CopyState {
    pub correlation_id: CorrelationId,
    pub token: CancellationToken,
    pub invocation_count: u64,
    warned_invalid_order: bool,
}

impl CopyState {
    pub fn new(scenario_name: &str, copy_number: u64, token: CancellationToken) -> Self {
        Self {
            correlation_id: CorrelationId::new(scenario_name, copy_number),
            token,
            invocation_count: 0,
            warned_invalid_order: false,
        }
    }
}

/// Run one pass of the scenario's steps for one copy.
pub(crate) async fn run_pipeline(deps: &PipelineDeps, copy: &mut CopyState) -> PipelineExit {
    let scenario = &deps.runtime.scenario;
    let steps = scenario.steps();

    // The order function is consulted once per full pass.
    let order: Vec<usize> = match &scenario.steps_order {
        Some(order_fn) => order_fn(),
        None => (0..steps.len()).collect(),
    };

    let mut previous_payload: Option<String> = None;

    for idx in order {
        if copy.token.is_cancelled() {
            return PipelineExit::Cancelled;
        }

        let Some(step) = steps.get(idx) else {
            if !copy.warned_invalid_order {
                warn!(
                    scenario = %scenario.name(),
                    copy = copy.correlation_id.copy_number,
                    index = idx,
                    "Steps-order function returned an out-of-range index; skipping"
                );
                copy.warned_invalid_order = true;
            }
            continue;
        };

        let connection = deps.runtime.step_pools[idx]
            .as_ref()
            .map(|pool| pool.get(copy.correlation_id.copy_number));
        let feed_item = step.feed.as_ref().and_then(|feed| feed.pull_erased());

        let ctx = StepContext {
            correlation_id: copy.correlation_id.clone(),
            cancellation: copy.token.clone(),
            connection,
            feed_item,
            previous_payload: previous_payload.take(),
            // 1-based number of the pass currently running.
            invocation_count: copy.invocation_count + 1,
            custom_settings: Arc::clone(&deps.runtime.custom_settings),
            stopper: deps.stopper.clone(),
        };

        let started = deps.clock.now();
        let response = match AssertUnwindSafe((step.execute)(ctx)).catch_unwind().await {
            Ok(response) => response,
            Err(_) => {
                error!(
                    scenario = %scenario.name(),
                    step = %step.name(),
                    copy = copy.correlation_id.copy_number,
                    "Step body panicked; counting as failure"
                );
                crate::response::Response::fail()
            }
        };
        let measured_ms = deps.clock.now().duration_since(started).as_millis() as u64;
        let latency_ms = response.latency_ms.unwrap_or(measured_ms);

        if step.is_tracked() {
            deps.stats.record(&StepOutcome {
                scenario_name: scenario.name().to_string(),
                step_name: step.name().to_string(),
                ok: response.ok,
                latency_ms,
                size_bytes: response.size_bytes,
            });
        }

        debug!(
            scenario = %scenario.name(),
            step = %step.name(),
            copy = copy.correlation_id.copy_number,
            ok = response.ok,
            latency_ms,
            "Step completed"
        );

        previous_payload = response.payload;

        if response.exit_code == ExitCode::StopTest {
            deps.stopper.stop(&format!(
                "step '{}' of scenario '{}' returned a stop-test response",
                step.name(),
                scenario.name()
            ));
            return PipelineExit::Stopped;
        }
    }

    copy.invocation_count += 1;
    PipelineExit::Completed
}
