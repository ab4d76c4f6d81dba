//! End-to-end session runs under tokio's virtual clock.
//!
//! Every test drives a full session: validation, scheduling, pipelines,
//! stats aggregation, and teardown. `start_paused` keeps multi-second load
//! profiles deterministic and instant.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stampede::config::{EngineConfig, ReportingConfig, ScenarioSetting};
use stampede::error::EngineError;
use stampede::report::ReportingSink;
use stampede::response::Response;
use stampede::scenario::{Scenario, Step};
use stampede::session::Session;
use stampede::stats::NodeStats;
use stampede::timeline::LoadSimulation;

fn keep_constant(copies: u32, secs: u64) -> Vec<LoadSimulation> {
    vec![LoadSimulation::KeepConstant {
        copies,
        during: Duration::from_secs(secs),
    }]
}

fn delayed_ok_step(name: &str, delay_ms: u64) -> Step {
    Step::new(name, move |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Response::ok()
    })
}

fn delayed_fail_step(name: &str, delay_ms: u64) -> Step {
    Step::new(name, move |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Response::fail()
    })
}

#[tokio::test(start_paused = true)]
async fn ok_and_fail_steps_are_counted_separately() {
    let scenario = Scenario::new(
        "mixed",
        vec![
            delayed_ok_step("ok step", 100),
            delayed_fail_step("fail step", 100),
        ],
    )
    .with_load_simulations(keep_constant(1, 2));

    let stats = Session::new("s1")
        .register_scenarios(vec![scenario])
        .run()
        .await
        .unwrap();

    let ok_step = stats.step("mixed", "ok step").unwrap();
    let fail_step = stats.step("mixed", "fail step").unwrap();

    assert!((5..=12).contains(&ok_step.ok_count), "got {}", ok_step.ok_count);
    assert_eq!(ok_step.fail_count, 0);
    assert_eq!(fail_step.ok_count, 0);
    assert!(
        (5..=12).contains(&fail_step.fail_count),
        "got {}",
        fail_step.fail_count
    );
}

#[tokio::test(start_paused = true)]
async fn latency_throughput_and_data_counters_line_up() {
    let scenario = Scenario::new(
        "pull-scenario",
        vec![Step::new("pull", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Response::ok().with_size_bytes(100)
        })],
    )
    .with_warm_up(Duration::from_secs(1))
    .with_load_simulations(keep_constant(1, 3));

    let stats = Session::new("s2")
        .register_scenarios(vec![scenario])
        .run()
        .await
        .unwrap();

    let step = stats.step("pull-scenario", "pull").unwrap();
    assert!(step.rps >= 5.0 && step.rps <= 11.0, "rps {}", step.rps);
    assert!(step.min_ms >= 100 && step.min_ms <= 110, "min {}", step.min_ms);
    assert!(step.mean_ms <= 120.0, "mean {}", step.mean_ms);
    assert!(step.max_ms <= 150, "max {}", step.max_ms);
    assert!(
        (0.09..=0.11).contains(&step.data_kb_min),
        "data_kb_min {}",
        step.data_kb_min
    );
    assert!(step.all_data_mb >= 0.0015, "all_data_mb {}", step.all_data_mb);
}

#[tokio::test(start_paused = true)]
async fn untracked_steps_never_reach_the_report() {
    let scenario = Scenario::new(
        "partially-tracked",
        vec![
            delayed_ok_step("s1", 100),
            delayed_ok_step("s2", 100).with_do_not_track(true),
        ],
    )
    .with_load_simulations(keep_constant(1, 3));

    let stats = Session::new("s3")
        .register_scenarios(vec![scenario])
        .run()
        .await
        .unwrap();

    assert_eq!(stats.scenarios.len(), 1);
    let scenario_stats = stats.scenario("partially-tracked").unwrap();
    assert!(scenario_stats.step_stats.iter().any(|s| s.step_name == "s1"));
    assert!(!scenario_stats.step_stats.iter().any(|s| s.step_name == "s2"));
    assert!(scenario_stats.ok_count > 0);
}

#[tokio::test(start_paused = true)]
async fn long_pause_swallows_the_whole_run() {
    let s1_runs = Arc::new(AtomicU64::new(0));
    let s1_runs_in = Arc::clone(&s1_runs);

    let scenario = Scenario::new(
        "pausing",
        vec![
            Step::pause(Duration::from_secs(4)),
            Step::new("s1", move |_ctx| {
                let runs = Arc::clone(&s1_runs_in);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Response::ok()
                }
            }),
        ],
    )
    .with_load_simulations(keep_constant(1, 3));

    let stats = Session::new("s4")
        .register_scenarios(vec![scenario])
        .run()
        .await
        .unwrap();

    // The pause outlives the 3 s profile, so the follow-up step never ran.
    assert_eq!(s1_runs.load(Ordering::SeqCst), 0);

    let scenario_stats = stats.scenario("pausing").unwrap();
    assert!(scenario_stats.executed_duration <= Duration::from_millis(3200));
    assert!(!scenario_stats
        .step_stats
        .iter()
        .any(|s| s.step_name == "pause"));
    assert_eq!(stats.step("pausing", "s1").unwrap().ok_count, 0);
}

#[tokio::test(start_paused = true)]
async fn failing_warm_up_aborts_the_session() {
    let scenario = Scenario::new(
        "doomed",
        vec![delayed_fail_step("always-fails", 100)],
    )
    .with_warm_up(Duration::from_secs(5))
    .with_load_simulations(keep_constant(1, 10));

    let result = Session::new("s5")
        .register_scenarios(vec![scenario])
        .run()
        .await;

    match result {
        Err(EngineError::WarmUpErrorWithManyFailedSteps { ok, fail }) => {
            assert_eq!(ok, 0);
            assert!(fail > 0);
        }
        other => panic!("unexpected: {:?}", other.map(|s| s.scenarios.len())),
    }
}

#[tokio::test(start_paused = true)]
async fn custom_latency_overrides_measured_time() {
    let scenario = Scenario::new(
        "declared-latency",
        vec![Step::new("slow-on-paper", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Response::ok().with_latency_ms(2000)
        })],
    )
    .with_load_simulations(keep_constant(1, 3));

    let stats = Session::new("s6")
        .register_scenarios(vec![scenario])
        .run()
        .await
        .unwrap();

    let step = stats.step("declared-latency", "slow-on-paper").unwrap();
    assert!(step.ok_count > 5, "got {}", step.ok_count);
    assert_eq!(step.min_ms, 2000);
    assert_eq!(step.max_ms, 2000);
}

/// Sink keeping the final snapshot so tests can inspect a run that ends in
/// a stop-test error.
struct FinalCapture {
    stats: Mutex<Option<NodeStats>>,
}

#[async_trait]
impl ReportingSink for FinalCapture {
    fn name(&self) -> &str {
        "final-capture"
    }

    async fn on_stats(&self, _stats: &NodeStats) {}

    async fn on_final_stats(&self, stats: &NodeStats) {
        *self.stats.lock().unwrap() = Some(stats.clone());
    }
}

#[tokio::test(start_paused = true)]
async fn stop_current_test_halts_every_scenario() {
    let calls = Arc::new(AtomicU64::new(0));

    let make_scenario = |name: &str| {
        let calls = Arc::clone(&calls);
        Scenario::new(
            name,
            vec![Step::new("counted", move |ctx| {
                let calls = Arc::clone(&calls);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if calls.fetch_add(1, Ordering::SeqCst) + 1 >= 30 {
                        ctx.stop_current_test("the counter is done");
                    }
                    Response::ok()
                }
            })],
        )
        .with_load_simulations(keep_constant(10, 42))
    };

    let capture = Arc::new(FinalCapture {
        stats: Mutex::new(None),
    });

    let result = Session::new("s7")
        .register_scenarios(vec![make_scenario("alpha"), make_scenario("beta")])
        .with_reporting_sink(Arc::clone(&capture) as Arc<dyn ReportingSink>)
        .run()
        .await;

    // The cooperative stop is surfaced in the session result.
    match result {
        Err(EngineError::StopTestRequested { reason }) => {
            assert_eq!(reason, "the counter is done");
        }
        other => panic!("unexpected: {:?}", other.map(|s| s.scenarios.len())),
    }

    // Sinks still saw the final snapshot of the truncated run.
    let stats = capture.stats.lock().unwrap().take().unwrap();
    for scenario in &stats.scenarios {
        assert!(
            scenario.executed_duration < Duration::from_secs(42),
            "{} ran {:?}",
            scenario.scenario_name,
            scenario.executed_duration
        );
        assert!(scenario.ok_count > 0);
    }
    assert!(calls.load(Ordering::SeqCst) >= 30);
}

#[tokio::test(start_paused = true)]
async fn invocation_counter_restarts_after_warm_up() {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let recorded_in = Arc::clone(&recorded);

    let scenario = Scenario::new(
        "counted",
        vec![Step::new("observe", move |ctx| {
            let recorded = Arc::clone(&recorded_in);
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                recorded.lock().unwrap().push(ctx.invocation_count());
                Response::ok()
            }
        })],
    )
    .with_warm_up(Duration::from_secs(5))
    .with_load_simulations(keep_constant(1, 5));

    Session::new("s8")
        .register_scenarios(vec![scenario])
        .run()
        .await
        .unwrap();

    let counts = recorded.lock().unwrap().clone();
    assert!(!counts.is_empty());
    assert!(
        counts.iter().all(|&c| c > 0 && c <= 6),
        "counter leaked across the boundary: {counts:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn invocation_counters_are_per_copy() {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let recorded_in = Arc::clone(&recorded);

    let scenario = Scenario::new(
        "many-copies",
        vec![Step::new("observe", move |ctx| {
            let recorded = Arc::clone(&recorded_in);
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                recorded.lock().unwrap().push(ctx.invocation_count());
                Response::ok()
            }
        })],
    )
    .with_load_simulations(keep_constant(10, 5));

    Session::new("s9")
        .register_scenarios(vec![scenario])
        .run()
        .await
        .unwrap();

    let counts = recorded.lock().unwrap().clone();
    assert!(counts.len() >= 40, "got {}", counts.len());
    // Ten copies sharing one counter would run far past 6.
    assert!(
        counts.iter().all(|&c| c > 0 && c <= 6),
        "copies shared a counter: {counts:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_scenario_names_fail_validation() {
    let result = Session::new("dups")
        .register_scenarios(vec![
            Scenario::new("same", vec![delayed_ok_step("a", 10)])
                .with_load_simulations(keep_constant(1, 1)),
            Scenario::new("same", vec![delayed_ok_step("b", 10)])
                .with_load_simulations(keep_constant(1, 1)),
        ])
        .run()
        .await;

    match result {
        Err(EngineError::DuplicateScenarioName { names }) => {
            assert_eq!(names, vec!["same".to_string()]);
        }
        other => panic!("unexpected: {:?}", other.map(|s| s.scenarios.len())),
    }
}

#[tokio::test(start_paused = true)]
async fn settings_override_reshapes_the_run_without_renaming() {
    let scenario = Scenario::new("tuned", vec![delayed_ok_step("work", 100)])
        .with_load_simulations(keep_constant(1, 600));

    // The override cuts the 10-minute profile down to two seconds.
    let config = EngineConfig {
        scenarios_settings: vec![ScenarioSetting {
            scenario_name: "tuned".to_string(),
            warm_up_duration: None,
            load_simulations_settings: keep_constant(1, 2),
            custom_settings: None,
        }],
        ..EngineConfig::default()
    };

    let stats = Session::new("override")
        .register_scenarios(vec![scenario])
        .with_config(config)
        .run()
        .await
        .unwrap();

    let scenario_stats = stats.scenario("tuned").unwrap();
    assert_eq!(scenario_stats.scenario_name, "tuned");
    assert!(scenario_stats.executed_duration <= Duration::from_millis(2200));
    assert_eq!(scenario_stats.step_stats[0].step_name, "work");
}

#[tokio::test(start_paused = true)]
async fn target_scenarios_filter_runs_only_the_requested_ones() {
    let ran_a = Arc::new(AtomicU64::new(0));
    let ran_b = Arc::new(AtomicU64::new(0));
    let ran_a_in = Arc::clone(&ran_a);
    let ran_b_in = Arc::clone(&ran_b);

    let make = |name: &str, counter: Arc<AtomicU64>| {
        Scenario::new(
            name,
            vec![Step::new("work", move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Response::ok()
                }
            })],
        )
        .with_load_simulations(keep_constant(1, 1))
    };

    let config = EngineConfig {
        target_scenarios: Some(vec!["a".to_string()]),
        ..EngineConfig::default()
    };

    let stats = Session::new("filtered")
        .register_scenarios(vec![make("a", ran_a_in), make("b", ran_b_in)])
        .with_config(config)
        .run()
        .await
        .unwrap();

    assert_eq!(stats.scenarios.len(), 1);
    assert_eq!(stats.scenarios[0].scenario_name, "a");
    assert!(ran_a.load(Ordering::SeqCst) > 0);
    assert_eq!(ran_b.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn init_failure_aborts_the_session() {
    let bad = Scenario::new("bad-init", vec![delayed_ok_step("work", 100)])
        .with_load_simulations(keep_constant(1, 5))
        .with_init(|_ctx| async { Err("credentials expired".to_string()) });

    let result = Session::new("init-fail")
        .register_scenarios(vec![bad])
        .run()
        .await;

    match result {
        Err(EngineError::InitFailed { scenario, cause }) => {
            assert_eq!(scenario, "bad-init");
            assert!(cause.contains("credentials expired"));
        }
        other => panic!("unexpected: {:?}", other.map(|s| s.scenarios.len())),
    }
}

#[tokio::test(start_paused = true)]
async fn init_and_clean_hooks_observe_custom_settings() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_init = Arc::clone(&seen);
    let seen_clean = Arc::clone(&seen);
    let seen_step = Arc::clone(&seen);

    let scenario = Scenario::new(
        "configured",
        vec![Step::new("read-settings", move |ctx| {
            let seen = Arc::clone(&seen_step);
            let region = ctx.custom_settings()["region"]
                .as_str()
                .unwrap_or("missing")
                .to_string();
            seen.lock().unwrap().push(format!("step:{region}"));
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Response::ok()
            }
        })],
    )
    .with_custom_settings(r#"{"region": "eu-west"}"#)
    .with_load_simulations(keep_constant(1, 1))
    .with_init(move |ctx| {
        let seen = Arc::clone(&seen_init);
        let region = ctx.custom_settings()["region"]
            .as_str()
            .unwrap_or("missing")
            .to_string();
        async move {
            seen.lock().unwrap().push(format!("init:{region}"));
            Ok(())
        }
    })
    .with_clean(move |_ctx| {
        let seen = Arc::clone(&seen_clean);
        async move {
            seen.lock().unwrap().push("clean".to_string());
            Ok(())
        }
    });

    Session::new("settings")
        .register_scenarios(vec![scenario])
        .run()
        .await
        .unwrap();

    let events = seen.lock().unwrap().clone();
    assert_eq!(events.first().unwrap(), "init:eu-west");
    assert_eq!(events.last().unwrap(), "clean");
    assert!(events.iter().any(|e| e == "step:eu-west"));
}

struct CountingSink {
    periodic: AtomicU64,
    finals: AtomicU64,
    last_ok: Mutex<u64>,
}

#[async_trait]
impl ReportingSink for CountingSink {
    fn name(&self) -> &str {
        "counting"
    }

    async fn on_stats(&self, _stats: &NodeStats) {
        self.periodic.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_final_stats(&self, stats: &NodeStats) {
        self.finals.fetch_add(1, Ordering::SeqCst);
        *self.last_ok.lock().unwrap() = stats.scenarios[0].ok_count;
    }
}

#[tokio::test(start_paused = true)]
async fn sinks_receive_periodic_and_final_snapshots() {
    let sink = Arc::new(CountingSink {
        periodic: AtomicU64::new(0),
        finals: AtomicU64::new(0),
        last_ok: Mutex::new(0),
    });

    let scenario = Scenario::new("observed", vec![delayed_ok_step("work", 100)])
        .with_load_simulations(keep_constant(1, 5));

    let config = EngineConfig {
        reporting: ReportingConfig {
            send_stats_interval: Some(Duration::from_secs(1)),
        },
        ..EngineConfig::default()
    };

    Session::new("sinks")
        .register_scenarios(vec![scenario])
        .with_config(config)
        .with_reporting_sink(Arc::clone(&sink) as Arc<dyn ReportingSink>)
        .run()
        .await
        .unwrap();

    assert!(sink.periodic.load(Ordering::SeqCst) >= 3);
    assert_eq!(sink.finals.load(Ordering::SeqCst), 1);
    assert!(*sink.last_ok.lock().unwrap() > 0);
}

#[tokio::test(start_paused = true)]
async fn external_cancellation_truncates_executed_duration() {
    let scenario = Scenario::new("endless", vec![delayed_ok_step("work", 100)])
        .with_load_simulations(keep_constant(2, 300));

    let session = Session::new("cancelled").register_scenarios(vec![scenario]);
    let token = session.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        token.cancel();
    });

    let stats = session.run().await.unwrap();
    let scenario_stats = stats.scenario("endless").unwrap();
    assert!(scenario_stats.executed_duration <= Duration::from_secs(300));
    assert!(scenario_stats.executed_duration >= Duration::from_secs(2));
    assert!(scenario_stats.ok_count > 0);
}
