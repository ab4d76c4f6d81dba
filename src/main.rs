use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stampede::config::EngineConfig;
use stampede::error::EngineError;
use stampede::report::LogSink;
use stampede::response::Response;
use stampede::scenario::{Scenario, Step};
use stampede::session::Session;
use stampede::timeline::LoadSimulation;

/// Scenario-based load-testing engine.
#[derive(Parser, Debug)]
#[command(name = "stampede", version, about)]
struct Cli {
    /// Path to the session config (JSON).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Path to the infra config: logging and reporting setup (JSON).
    #[arg(short = 'i', long = "infra")]
    infra: Option<PathBuf>,
}

/// Infrastructure configuration: how the process logs.
#[derive(Debug, Default, Deserialize)]
struct InfraConfig {
    /// Tracing filter directive, e.g. "info" or "stampede=debug".
    #[serde(default)]
    log_filter: Option<String>,

    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    json_logs: bool,
}

impl InfraConfig {
    fn from_file(path: &PathBuf) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| EngineError::ConfigParseFailed {
            path: path.display().to_string(),
            cause: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| EngineError::ConfigParseFailed {
            path: path.display().to_string(),
            cause: e.to_string(),
        })
    }
}

fn init_logging(infra: &InfraConfig) {
    let filter = infra
        .log_filter
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::from_default_env().add_directive("info".parse().unwrap()));

    if infra.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Built-in demo scenario so a config-only invocation has something to
/// drive. Real workloads embed the engine as a library and register their
/// own scenarios; the config can still reshape this one by name.
fn demo_scenario() -> Scenario {
    Scenario::new(
        "demo",
        vec![Step::new("tick", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Response::ok_payload("tick")
        })],
    )
    .with_load_simulations(vec![LoadSimulation::KeepConstant {
        copies: 1,
        during: Duration::from_secs(10),
    }])
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let infra = match &cli.infra {
        Some(path) => match InfraConfig::from_file(path) {
            Ok(infra) => infra,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        },
        None => InfraConfig::default(),
    };
    init_logging(&infra);

    let config = match &cli.config {
        Some(path) => match EngineConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Failed to load session config");
                std::process::exit(1);
            }
        },
        None => EngineConfig::default(),
    };

    let session = Session::new("stampede")
        .register_scenarios(vec![demo_scenario()])
        .with_config(config)
        .with_reporting_sink(Arc::new(LogSink));

    match session.run().await {
        Ok(stats) => {
            for scenario in &stats.scenarios {
                info!(
                    scenario = %scenario.scenario_name,
                    ok = scenario.ok_count,
                    fail = scenario.fail_count,
                    executed_secs = scenario.executed_duration.as_secs_f64(),
                    "Scenario result"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Session failed");
            std::process::exit(1);
        }
    }
}
