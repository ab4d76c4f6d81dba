//! stampede: a scenario-based load-testing engine.
//!
//! Scenarios are named pipelines of user-supplied async steps, driven by
//! virtual users ("copies") under declarative load simulations: hold or
//! ramp a concurrency level (closed model), or inject copies at a rate
//! (open model). The engine compiles simulations into a load timeline,
//! schedules copies against it, shares externally-opened connection pools
//! across steps, streams per-step data through feeds, and aggregates
//! latency and throughput statistics for reporting sinks.
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//! use stampede::response::Response;
//! use stampede::scenario::{Scenario, Step};
//! use stampede::session::Session;
//! use stampede::timeline::LoadSimulation;
//!
//! # async fn run() -> Result<(), stampede::error::EngineError> {
//! let scenario = Scenario::new(
//!     "ping",
//!     vec![Step::new("ping", |_ctx| async {
//!         // Call the system under test here.
//!         Response::ok_payload("pong")
//!     })],
//! )
//! .with_warm_up(Duration::from_secs(5))
//! .with_load_simulations(vec![LoadSimulation::KeepConstant {
//!     copies: 50,
//!     during: Duration::from_secs(60),
//! }]);
//!
//! let stats = Session::new("ping-session")
//!     .register_scenarios(vec![scenario])
//!     .run()
//!     .await?;
//! println!("{} ok", stats.scenarios[0].ok_count);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
mod pipeline;
pub mod pool;
pub mod report;
pub mod response;
pub mod scenario;
mod scheduler;
pub mod session;
pub mod stats;
pub mod timeline;
pub mod utils;

pub use error::EngineError;
pub use response::Response;
pub use scenario::{Scenario, Step};
pub use session::Session;
pub use timeline::LoadSimulation;
