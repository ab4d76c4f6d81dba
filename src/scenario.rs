//! Scenario and step model.
//!
//! A scenario is a named pipeline of steps executed by virtual users
//! ("copies"). Steps carry user-supplied async bodies plus optional
//! declarative attachments: a connection pool, a data feed, and a
//! do-not-track flag that keeps a step out of the statistics. Scenarios are
//! built with chained `with_*` methods and stay inert until a session runs
//! them.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::feed::{ErasedFeed, Feed};
use crate::pool::{Connection, ConnectionPoolArgs};
use crate::response::Response;
use crate::stats::TestInfo;
use crate::timeline::LoadSimulation;

pub(crate) type ExecuteFn =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, Response> + Send + Sync>;
pub(crate) type HookFn =
    Arc<dyn Fn(ScenarioContext) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;
pub(crate) type StepsOrderFn = Arc<dyn Fn() -> Vec<usize> + Send + Sync>;

/// Identifies one virtual user within its scenario for the copy's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrelationId {
    /// `"{scenario_name}_{copy_number}"`.
    pub id: String,
    pub scenario_name: String,
    pub copy_number: u64,
}

impl CorrelationId {
    pub fn new(scenario_name: &str, copy_number: u64) -> Self {
        Self {
            id: format!("{}_{}", scenario_name, copy_number),
            scenario_name: scenario_name.to_string(),
            copy_number,
        }
    }
}

/// Cooperative session terminator, reachable from inside steps.
///
/// The first caller records the stop reason; every call trips the session
/// cancellation token, and running copies finish their current step before
/// exiting.
#[derive(Clone)]
pub struct TestStopper {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl TestStopper {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Request cooperative termination of the whole session.
    pub fn stop(&self, reason: &str) {
        {
            let mut slot = self.reason.lock().unwrap();
            if slot.is_none() {
                *slot = Some(reason.to_string());
                info!(reason, "Stop test requested");
            }
        }
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Per-step execution context owned by exactly one virtual user.
pub struct StepContext {
    pub(crate) correlation_id: CorrelationId,
    pub(crate) cancellation: CancellationToken,
    pub(crate) connection: Option<Connection>,
    pub(crate) feed_item: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) previous_payload: Option<String>,
    pub(crate) invocation_count: u64,
    pub(crate) custom_settings: Arc<serde_json::Value>,
    pub(crate) stopper: TestStopper,
}

impl StepContext {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn copy_number(&self) -> u64 {
        self.correlation_id.copy_number
    }

    /// The 1-based number of the pass this copy is currently running.
    /// The underlying counter is reset at the warm-up → main boundary.
    pub fn invocation_count(&self) -> u64 {
        self.invocation_count
    }

    /// Token user code can select on to cooperate with cancellation
    /// mid-step.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The pool slot assigned to this copy, typed.
    ///
    /// `None` when the step has no pool or the requested type does not
    /// match what the pool's `open` produced.
    pub fn connection<C: Send + Sync + 'static>(&self) -> Option<Arc<C>> {
        self.connection
            .as_ref()
            .and_then(|conn| Arc::clone(conn).downcast::<C>().ok())
    }

    /// The feed item pulled for this step invocation, typed.
    pub fn feed_item<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.feed_item
            .as_ref()
            .and_then(|item| Arc::clone(item).downcast::<T>().ok())
    }

    /// Raw payload returned by the previous step of this pass, if any.
    pub fn previous_step_payload(&self) -> Option<&str> {
        self.previous_payload.as_deref()
    }

    /// Typed read of the previous step's payload, parsed as JSON.
    ///
    /// A missing or unparsable payload yields `None`; deciding whether that
    /// is a step failure is up to the caller.
    pub fn previous_step_response<T: DeserializeOwned>(&self) -> Option<T> {
        self.previous_payload
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Custom scenario settings, parsed best-effort at session start.
    pub fn custom_settings(&self) -> &serde_json::Value {
        &self.custom_settings
    }

    /// Terminate the whole session cooperatively.
    ///
    /// The current step's response is still processed; no further steps
    /// start once the signal is observed.
    pub fn stop_current_test(&self, reason: &str) {
        self.stopper.stop(reason);
    }
}

/// Context handed to scenario `init` and `clean` hooks.
pub struct ScenarioContext {
    pub(crate) scenario_name: String,
    pub(crate) test_info: Arc<TestInfo>,
    pub(crate) custom_settings: Arc<serde_json::Value>,
    pub(crate) cancellation: CancellationToken,
}

impl ScenarioContext {
    pub fn scenario_name(&self) -> &str {
        &self.scenario_name
    }

    pub fn test_info(&self) -> &TestInfo {
        &self.test_info
    }

    pub fn custom_settings(&self) -> &serde_json::Value {
        &self.custom_settings
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// One operation of a scenario's pipeline.
pub struct Step {
    pub(crate) name: String,
    pub(crate) pool_args: Option<Arc<ConnectionPoolArgs>>,
    pub(crate) feed: Option<Arc<dyn ErasedFeed>>,
    pub(crate) execute: ExecuteFn,
    pub(crate) do_not_track: bool,
}

impl Clone for Step {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            pool_args: self.pool_args.clone(),
            feed: self.feed.clone(),
            execute: Arc::clone(&self.execute),
            do_not_track: self.do_not_track,
        }
    }
}

impl Step {
    /// A step executing the given async body.
    ///
    /// # Example
    /// ```
    /// use stampede::response::Response;
    /// use stampede::scenario::Step;
    ///
    /// let step = Step::new("login", |_ctx| async move {
    ///     Response::ok_payload("{\"token\":\"abc\"}")
    /// });
    /// assert_eq!(step.name(), "login");
    /// ```
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Self {
            name: name.into(),
            pool_args: None,
            feed: None,
            execute: Arc::new(move |ctx| -> BoxFuture<'static, Response> {
                Box::pin(execute(ctx))
            }),
            do_not_track: false,
        }
    }

    /// A built-in step that sleeps for `duration` and succeeds.
    ///
    /// Pause steps are never tracked, so they shape pacing without
    /// polluting statistics.
    pub fn pause(duration: Duration) -> Self {
        Self::new("pause", move |_ctx| async move {
            tokio::time::sleep(duration).await;
            Response::ok()
        })
        .with_do_not_track(true)
    }

    /// Attach a declarative connection pool; resolved once per session.
    pub fn with_pool(mut self, pool_args: Arc<ConnectionPoolArgs>) -> Self {
        self.pool_args = Some(pool_args);
        self
    }

    /// Attach a data feed; every invocation pulls the next item.
    pub fn with_feed<T: Send + Sync + 'static>(mut self, feed: Arc<Feed<T>>) -> Self {
        self.feed = Some(feed as Arc<dyn ErasedFeed>);
        self
    }

    /// Exclude this step from statistics and the reported step list.
    pub fn with_do_not_track(mut self, do_not_track: bool) -> Self {
        self.do_not_track = do_not_track;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_tracked(&self) -> bool {
        !self.do_not_track
    }
}

/// A named pipeline of steps plus its load profile and lifecycle hooks.
pub struct Scenario {
    pub(crate) name: String,
    pub(crate) steps: Vec<Step>,
    pub(crate) init: Option<HookFn>,
    pub(crate) clean: Option<HookFn>,
    pub(crate) warm_up_duration: Duration,
    pub(crate) load_simulations: Vec<LoadSimulation>,
    pub(crate) custom_settings: String,
    pub(crate) steps_order: Option<StepsOrderFn>,
}

impl Clone for Scenario {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            steps: self.steps.clone(),
            init: self.init.clone(),
            clean: self.clean.clone(),
            warm_up_duration: self.warm_up_duration,
            load_simulations: self.load_simulations.clone(),
            custom_settings: self.custom_settings.clone(),
            steps_order: self.steps_order.clone(),
        }
    }
}

impl Scenario {
    /// A scenario running `steps` in order with no warm-up and a default
    /// load of one copy for one minute.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
            init: None,
            clean: None,
            warm_up_duration: Duration::ZERO,
            load_simulations: vec![LoadSimulation::KeepConstant {
                copies: 1,
                during: Duration::from_secs(60),
            }],
            custom_settings: String::new(),
            steps_order: None,
        }
    }

    /// Run a single copy for `duration` before the main phase and sanity
    /// check the failure ratio.
    pub fn with_warm_up(mut self, duration: Duration) -> Self {
        self.warm_up_duration = duration;
        self
    }

    pub fn with_load_simulations(mut self, simulations: Vec<LoadSimulation>) -> Self {
        self.load_simulations = simulations;
        self
    }

    /// Hook executed once before the scenario's scheduler starts. A failure
    /// aborts the whole session.
    pub fn with_init<F, Fut>(mut self, init: F) -> Self
    where
        F: Fn(ScenarioContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.init = Some(Arc::new(move |ctx| -> BoxFuture<'static, Result<(), String>> {
            Box::pin(init(ctx))
        }));
        self
    }

    /// Hook executed once after the scenario finishes. Failures are logged
    /// and ignored.
    pub fn with_clean<F, Fut>(mut self, clean: F) -> Self
    where
        F: Fn(ScenarioContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.clean = Some(Arc::new(move |ctx| -> BoxFuture<'static, Result<(), String>> {
            Box::pin(clean(ctx))
        }));
        self
    }

    /// Free-form settings string (typically JSON) surfaced to hooks and
    /// steps; parsed best-effort, never fatal.
    pub fn with_custom_settings(mut self, settings: impl Into<String>) -> Self {
        self.custom_settings = settings.into();
        self
    }

    /// Custom step ordering: called once per pipeline pass, returns indices
    /// into the step list. Out-of-range indices are skipped with a warning.
    pub fn with_steps_order<F>(mut self, order: F) -> Self
    where
        F: Fn() -> Vec<usize> + Send + Sync + 'static,
    {
        self.steps_order = Some(Arc::new(order));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Tracked step names, in declaration order.
    pub fn tracked_step_names(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.is_tracked())
            .map(|s| s.name.clone())
            .collect()
    }
}

/// Parse a custom-settings string, falling back to an empty object.
///
/// An unparsable settings payload never aborts a scenario.
pub(crate) fn parse_custom_settings(scenario: &str, raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                scenario,
                error = %e,
                "Failed to parse custom settings; using empty settings"
            );
            serde_json::Value::Object(serde_json::Map::new())
        }
    }
}
