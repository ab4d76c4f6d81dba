//! Per-scenario scheduler.
//!
//! Runs one scenario through its warm-up and main phases, materializing the
//! compiled timeline into live virtual users. Closed-model intervals are
//! reconciled once per second: spawn up to the target, cancel down LIFO.
//! Open-model intervals inject copies every tick at the instantaneous rate,
//! carrying the fractional remainder so the long-run spawn count matches the
//! integrated rate. All copies are tokio tasks in one `JoinSet`; shutdown is
//! cooperative with a fixed grace period after which stragglers are aborted.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::pipeline::{run_pipeline, CopyState, PipelineDeps, PipelineExit};
use crate::timeline::{LoadMode, LoadSimulation, Timeline};

/// Tick cadence of the scheduling loop; open-model injection error is
/// bounded by this granularity.
pub const OPEN_TICK: Duration = Duration::from_millis(100);

/// Closed-model targets are reconciled every this many ticks (one second).
const TICKS_PER_CLOSED_ADJUST: u64 = 10;

/// How long cancelled copies get to finish their current step before they
/// are abandoned.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A live closed-model copy the scheduler can still retire.
struct LiveCopy {
    copy_number: u64,
    token: CancellationToken,
}

/// Run one scenario: warm-up (if configured), warm-up validation, stats
/// reset, then the main phase. Returns the main phase's executed duration.
pub(crate) async fn run_scenario(
    deps: Arc<PipelineDeps>,
    session_token: CancellationToken,
) -> Result<Duration, EngineError> {
    let scenario_name = deps.runtime.scenario.name().to_string();
    let warm_up = deps.runtime.scenario.warm_up_duration;

    // Hook-only scenarios have nothing to schedule.
    if deps.runtime.scenario.steps().is_empty() {
        debug!(scenario = %scenario_name, "Scenario has no steps; skipping load phases");
        return Ok(Duration::ZERO);
    }

    if !warm_up.is_zero() {
        info!(scenario = %scenario_name, duration_secs = warm_up.as_secs(), "Warm-up starting");

        // Warm-up always runs a single copy, whatever the real load profile.
        let warm_up_timeline = Timeline::compile(
            &scenario_name,
            &[LoadSimulation::KeepConstant {
                copies: 1,
                during: warm_up,
            }],
        )?;
        run_phase(&deps, &session_token, &warm_up_timeline, Phase::WarmUp).await;

        if session_token.is_cancelled() {
            return Ok(Duration::ZERO);
        }

        if let Err(e) = deps.stats.validate_warm_up(&scenario_name) {
            warn!(scenario = %scenario_name, error = %e, "Warm-up failed; scenario aborted");
            return Err(e);
        }

        // Warm-up numbers are sanity-check material only.
        deps.stats.reset_scenario(&scenario_name);
        info!(scenario = %scenario_name, "Warm-up passed");
    }

    let executed = run_phase(
        &deps,
        &session_token,
        &deps.runtime.timeline,
        Phase::Main,
    )
    .await;
    deps.stats.set_executed_duration(&scenario_name, executed);

    info!(
        scenario = %scenario_name,
        executed_secs = executed.as_secs_f64(),
        "Scenario finished"
    );
    Ok(executed)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    WarmUp,
    Main,
}

/// Drive one phase of the scenario against `timeline` until the planned
/// duration elapses or the session is cancelled. Returns
/// `min(elapsed, planned_duration)`.
async fn run_phase(
    deps: &Arc<PipelineDeps>,
    session_token: &CancellationToken,
    timeline: &Timeline,
    phase: Phase,
) -> Duration {
    let scenario_name = deps.runtime.scenario.name().to_string();
    let planned = timeline.planned_duration();
    let phase_token = session_token.child_token();
    let start = Instant::now();

    let mut copies: JoinSet<()> = JoinSet::new();
    let mut live: Vec<LiveCopy> = Vec::new();
    let mut next_copy_number: u64 = 0;
    let mut spawn_carry = 0.0_f64;
    let mut last_elapsed = Duration::ZERO;
    let mut tick_index: u64 = 0;

    let mut ticker = interval(OPEN_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = session_token.cancelled() => break,
        }

        let elapsed = start.elapsed();
        if elapsed >= planned {
            break;
        }

        let target = timeline.target_at(elapsed);
        match target.mode {
            LoadMode::Closed => {
                if tick_index % TICKS_PER_CLOSED_ADJUST == 0 {
                    reconcile_closed(
                        deps,
                        &phase_token,
                        &mut copies,
                        &mut live,
                        &mut next_copy_number,
                        target.copies as usize,
                    );
                }
            }
            LoadMode::Open => {
                // Leftover closed-model copies do not belong in an open
                // interval; retire them LIFO.
                while let Some(copy) = live.pop() {
                    copy.token.cancel();
                }

                // Integrate the instantaneous rate over the real tick width
                // and carry the fraction so skipped ticks lose nothing.
                let dt = (elapsed - last_elapsed).as_secs_f64();
                spawn_carry += target.inject_rate * dt;
                let to_spawn = spawn_carry.floor() as u64;
                spawn_carry -= to_spawn as f64;

                for _ in 0..to_spawn {
                    spawn_one_shot_copy(deps, &phase_token, &mut copies, next_copy_number);
                    next_copy_number += 1;
                }
            }
        }

        if phase == Phase::Main {
            deps.stats
                .set_executed_duration(&scenario_name, elapsed.min(planned));
        }

        // Reap finished one-shot copies so the join set stays bounded.
        while copies.try_join_next().is_some() {}

        last_elapsed = elapsed;
        tick_index += 1;
    }

    // Cooperative shutdown: trip every copy token, then wait out the grace
    // period before abandoning non-cooperating copies.
    phase_token.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while copies.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            scenario = %scenario_name,
            abandoned = copies.len(),
            "Copies did not finish within the grace period; aborting"
        );
        copies.shutdown().await;
    }

    start.elapsed().min(planned)
}

/// Bring the live-copy count to `target`: spawn the shortfall with fresh
/// copy numbers, or cancel the excess newest-first.
fn reconcile_closed(
    deps: &Arc<PipelineDeps>,
    phase_token: &CancellationToken,
    copies: &mut JoinSet<()>,
    live: &mut Vec<LiveCopy>,
    next_copy_number: &mut u64,
    target: usize,
) {
    let scenario_name = deps.runtime.scenario.name();

    while live.len() < target {
        let copy_number = *next_copy_number;
        *next_copy_number += 1;

        let token = phase_token.child_token();
        let deps = Arc::clone(deps);
        let copy_token = token.clone();
        copies.spawn(async move {
            let mut copy = CopyState::new(
                deps.runtime.scenario.name(),
                copy_number,
                copy_token,
            );
            loop {
                if copy.token.is_cancelled() {
                    break;
                }
                match run_pipeline(&deps, &mut copy).await {
                    PipelineExit::Completed => {}
                    PipelineExit::Cancelled | PipelineExit::Stopped => break,
                }
            }
        });

        debug!(scenario = %scenario_name, copy = copy_number, "Copy spawned");
        live.push(LiveCopy { copy_number, token });
    }

    while live.len() > target {
        // LIFO retirement keeps the longest-running copies alive.
        if let Some(copy) = live.pop() {
            debug!(scenario = %scenario_name, copy = copy.copy_number, "Copy retired");
            copy.token.cancel();
        }
    }
}

/// Spawn one open-model copy: a single pipeline pass, then exit.
fn spawn_one_shot_copy(
    deps: &Arc<PipelineDeps>,
    phase_token: &CancellationToken,
    copies: &mut JoinSet<()>,
    copy_number: u64,
) {
    let deps = Arc::clone(deps);
    let token = phase_token.child_token();
    copies.spawn(async move {
        let mut copy = CopyState::new(deps.runtime.scenario.name(), copy_number, token);
        let _ = run_pipeline(&deps, &mut copy).await;
    });
}
