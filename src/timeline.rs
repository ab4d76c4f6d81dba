//! Load simulations and the compiled load timeline.
//!
//! A scenario declares its load as an ordered list of [`LoadSimulation`]
//! phases. The scheduler never interprets those directly; they are compiled
//! into a [`Timeline`]: a gap-free sequence of intervals starting at t=0,
//! each carrying the load mode and the value at the interval's start and
//! end. Queries interpolate linearly inside ramp intervals.
//!
//! Closed-model phases (`KeepConstant`, `RampConstant`) target a number of
//! concurrently live copies. Open-model phases (`InjectPerSec`,
//! `RampPerSec`) target an injection rate in copies per second, each
//! injected copy running the pipeline once.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;
use crate::utils::duration_from_str;

/// One declarative load phase.
///
/// Deserializes from settings JSON as
/// `{"kind": "keep_constant", "copies": 10, "during": "30s"}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadSimulation {
    /// Linearly ramp the live-copy target from the current value to
    /// `copies` over `during`.
    RampConstant {
        copies: u32,
        #[serde(deserialize_with = "duration_from_str")]
        during: Duration,
    },

    /// Hold exactly `copies` live copies for `during`.
    KeepConstant {
        copies: u32,
        #[serde(deserialize_with = "duration_from_str")]
        during: Duration,
    },

    /// Linearly ramp the injection rate from the current value to `rate`
    /// copies per second over `during`.
    RampPerSec {
        rate: f64,
        #[serde(deserialize_with = "duration_from_str")]
        during: Duration,
    },

    /// Inject `rate` copies per second for `during`.
    InjectPerSec {
        rate: f64,
        #[serde(deserialize_with = "duration_from_str")]
        during: Duration,
    },
}

impl LoadSimulation {
    pub fn during(&self) -> Duration {
        match self {
            LoadSimulation::RampConstant { during, .. }
            | LoadSimulation::KeepConstant { during, .. }
            | LoadSimulation::RampPerSec { during, .. }
            | LoadSimulation::InjectPerSec { during, .. } => *during,
        }
    }

    fn mode(&self) -> LoadMode {
        match self {
            LoadSimulation::RampConstant { .. } | LoadSimulation::KeepConstant { .. } => {
                LoadMode::Closed
            }
            LoadSimulation::RampPerSec { .. } | LoadSimulation::InjectPerSec { .. } => {
                LoadMode::Open
            }
        }
    }
}

impl fmt::Display for LoadSimulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadSimulation::RampConstant { copies, during } => {
                write!(f, "ramp_constant(copies={}, during={:?})", copies, during)
            }
            LoadSimulation::KeepConstant { copies, during } => {
                write!(f, "keep_constant(copies={}, during={:?})", copies, during)
            }
            LoadSimulation::RampPerSec { rate, during } => {
                write!(f, "ramp_per_sec(rate={}, during={:?})", rate, during)
            }
            LoadSimulation::InjectPerSec { rate, during } => {
                write!(f, "inject_per_sec(rate={}, during={:?})", rate, during)
            }
        }
    }
}

/// Whether an interval levels live copies or injects at a rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Closed,
    Open,
}

/// One compiled interval `[start, end)` of the timeline.
#[derive(Debug, Clone, PartialEq)]
struct Interval {
    start: Duration,
    end: Duration,
    mode: LoadMode,
    /// Copies target (closed) or injection rate (open) at `start`.
    from: f64,
    /// Copies target (closed) or injection rate (open) at `end`.
    to: f64,
}

impl Interval {
    fn value_at(&self, t: Duration) -> f64 {
        let span = (self.end - self.start).as_secs_f64();
        if span <= 0.0 {
            return self.to;
        }
        let offset = (t - self.start).as_secs_f64();
        self.from + (self.to - self.from) * (offset / span)
    }
}

/// Instantaneous load target at one point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetLoad {
    pub mode: LoadMode,

    /// Target number of live copies; 0 in open mode.
    pub copies: u32,

    /// Injection rate in copies per second; 0.0 in closed mode.
    pub inject_rate: f64,
}

/// A compiled, total-ordered, gap-free load schedule starting at t=0.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    intervals: Vec<Interval>,
    planned_duration: Duration,
}

impl Timeline {
    /// Compile a list of load simulations into a timeline.
    ///
    /// Ramps continue from the previous phase's end value of the same kind
    /// (copies for closed phases, rate for open phases); the first ramp
    /// starts from zero.
    pub fn compile(scenario: &str, sims: &[LoadSimulation]) -> Result<Timeline, EngineError> {
        if sims.is_empty() {
            return Err(EngineError::EmptyLoadSimulations {
                scenario: scenario.to_string(),
            });
        }

        let mut intervals = Vec::with_capacity(sims.len());
        let mut cursor = Duration::ZERO;
        let mut prev_copies = 0.0_f64;
        let mut prev_rate = 0.0_f64;

        for sim in sims {
            if sim.during().is_zero() {
                return Err(EngineError::InvalidDuration {
                    scenario: scenario.to_string(),
                    simulation: sim.to_string(),
                });
            }

            let (from, to) = match *sim {
                LoadSimulation::RampConstant { copies, .. } => (prev_copies, copies as f64),
                LoadSimulation::KeepConstant { copies, .. } => (copies as f64, copies as f64),
                LoadSimulation::RampPerSec { rate, .. } => (prev_rate, rate),
                LoadSimulation::InjectPerSec { rate, .. } => (rate, rate),
            };

            match sim.mode() {
                LoadMode::Closed => prev_copies = to,
                LoadMode::Open => prev_rate = to,
            }

            let end = cursor + sim.during();
            intervals.push(Interval {
                start: cursor,
                end,
                mode: sim.mode(),
                from,
                to,
            });
            cursor = end;
        }

        Ok(Timeline {
            intervals,
            planned_duration: cursor,
        })
    }

    /// Total scheduled run time: the sum of every phase's duration.
    pub fn planned_duration(&self) -> Duration {
        self.planned_duration
    }

    /// The instantaneous `(copies_target, inject_rate)` at time `t`.
    ///
    /// Times at or past the planned duration return the last interval's end
    /// value, so a scheduler that overshoots by a tick sees a stable target.
    pub fn target_at(&self, t: Duration) -> TargetLoad {
        let interval = self
            .intervals
            .iter()
            .find(|iv| t >= iv.start && t < iv.end)
            .unwrap_or_else(|| self.intervals.last().expect("timeline has intervals"));

        let value = if t >= interval.end {
            interval.to
        } else {
            interval.value_at(t)
        };

        match interval.mode {
            LoadMode::Closed => TargetLoad {
                mode: LoadMode::Closed,
                copies: value.round() as u32,
                inject_rate: 0.0,
            },
            LoadMode::Open => TargetLoad {
                mode: LoadMode::Open,
                copies: 0,
                inject_rate: value,
            },
        }
    }
}
