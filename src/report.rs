//! Reporting interfaces.
//!
//! The engine core owns no file or network I/O for results. External
//! collaborators implement [`ReportingSink`] (periodic and final snapshot
//! consumers) or [`WorkerPlugin`] (lifecycle-aware workers); the session
//! coordinator pushes [`NodeStats`] to both on a fixed cadence. The built-in
//! [`LogSink`] traces a compact summary so a bare engine run is observable.

use async_trait::async_trait;
use tracing::info;

use crate::stats::NodeStats;

/// Consumer of periodic and final statistics snapshots.
#[async_trait]
pub trait ReportingSink: Send + Sync {
    fn name(&self) -> &str;

    /// Called with the current snapshot every reporting interval.
    async fn on_stats(&self, stats: &NodeStats);

    /// Called once with the final snapshot after the session completes.
    async fn on_final_stats(&self, stats: &NodeStats);
}

/// An external worker driven by the session lifecycle.
#[async_trait]
pub trait WorkerPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before schedulers start, with the opaque plugin configs
    /// from the engine config.
    async fn on_start(&self, plugin_configs: &[serde_json::Value]);

    /// Called with the current snapshot every reporting interval.
    async fn on_stats(&self, stats: &NodeStats);

    /// Called once after all schedulers finish.
    async fn on_stop(&self);
}

/// Sink that traces per-step summaries through the logging pipeline.
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    fn log(stats: &NodeStats, last: bool) {
        for scenario in &stats.scenarios {
            for step in &scenario.step_stats {
                info!(
                    scenario = %scenario.scenario_name,
                    step = %step.step_name,
                    ok = step.ok_count,
                    fail = step.fail_count,
                    min_ms = step.min_ms,
                    mean_ms = step.mean_ms,
                    max_ms = step.max_ms,
                    p95_ms = step.p95_ms,
                    rps = step.rps,
                    final_report = last,
                    "Step stats"
                );
            }
        }
    }
}

#[async_trait]
impl ReportingSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_stats(&self, stats: &NodeStats) {
        Self::log(stats, false);
    }

    async fn on_final_stats(&self, stats: &NodeStats) {
        Self::log(stats, true);
    }
}
