//! Beban: a small load-generation core for HTTP applications.
//!
//! Beban drives an existing web application's endpoints with concurrent
//! virtual users (VUs), ramps them up and down along a stage schedule, records
//! every request and check, and judges the run against thresholds such as
//! `p(95)<1000` or `rate>0.95`.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: a named iteration function plus its thresholds. The action
//!   receives a [`Vu`] and performs one iteration of user behaviour.
//! - [`Executor`]: responsible for actually running the scenario. Executors
//!   control concurrency and scheduling. We provide a [`RampingVuExecutor`]
//!   that follows a [`Schedule`] of stages, but executors are replaceable.
//! - [`Vu`]: one virtual user's view of the world: its own HTTP session and
//!   cookie jar, its seeded random stream, its local state and its metrics
//!   shard.
//! - [`Aggregate`]: a compact, mergeable summary of a metric's samples.
//!   Every VU records into its own shard; shards are merged on read.
//! - [`Threshold`]: a pass/fail expression over an aggregated metric.
//! - [`Runner`]: ties a run together, from preflight to the final [`Outcome`].
//! - [`Reporter`]: sends the end-of-run [`Summary`] somewhere (console, JSON).
//!
//! Scenarios can also be written declaratively as YAML files
//! ([`ScenarioFile`]), which compile to a [`Plan`] of HTTP steps with checks.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use beban::{
//!     RampingVuExecutor, Runner, Scenario, Schedule, Stage, Threshold, Vu,
//!     executor::RampPolicy,
//!     http::Request,
//!     report::{ConsoleReporter, Reporter, Summary},
//! };
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scenario = Scenario::builder()
//!         .name("login stress")
//!         .action(|vu: Vu| async move {
//!             let login = Request::post(vu.url("/login")?)
//!                 .name("login")
//!                 .form([("username", "superadmin"), ("password", "admin123")]);
//!             let res = vu.request(login).await?;
//!             vu.check_that("Status is 200/302", matches!(res.status, 200 | 302));
//!             vu.check_that("No error message", !res.body.contains("salah"));
//!             vu.sleep(Duration::from_secs(if vu.id() % 2 == 0 { 2 } else { 3 })).await
//!         })
//!         .thresholds(
//!             [
//!                 Threshold::parse("http_req_duration", "p(95)<1000")?,
//!                 Threshold::parse("checks", "rate>0.95")?,
//!             ]
//!             .into_iter()
//!             .collect(),
//!         )
//!         .build();
//!
//!     let schedule = Schedule::new(
//!         0,
//!         vec![
//!             Stage::new(Duration::from_secs(30), 10),
//!             Stage::new(Duration::from_secs(90), 10),
//!             Stage::new(Duration::from_secs(20), 0),
//!         ],
//!         RampPolicy::Linear,
//!     )?;
//!
//!     let result = Runner::builder()
//!         .executor(RampingVuExecutor::builder().schedule(schedule).build())
//!         .base_url(Some(Url::parse("http://localhost:8080")?))
//!         .build()
//!         .run(&scenario)
//!         .await?;
//!
//!     ConsoleReporter::default().report(&Summary::from(&result)).await?;
//!     std::process::exit(result.outcome.exit_code());
//! }
//! ```
//!
//! # Feature flags
//!
//! - `internals`: exposes the ramping executor's controller and VU loop, for
//!   building custom executors and for white-box tests.

/// Metric aggregators
pub mod aggregate;
/// Named assertions over responses
pub mod check;
/// YAML scenario files
pub mod config;
/// Human-friendly durations for config files
pub mod duration;
/// Error types
pub mod error;
/// Orchestrators that define how VUs actually run
pub mod executor;
/// HTTP client adapter
pub mod http;
/// Metric kinds, samples and built-in names
pub mod metric;
/// Think time and seeded randomness
pub mod pacing;
/// Declarative steps compiled from scenario files
pub mod plan;
/// Sharded metric storage
pub mod registry;
/// End-of-run summaries and reporters
pub mod report;
/// Running a scenario end to end
pub mod run;
/// Main building block that glues an action to its thresholds
pub mod scenario;
/// Pass/fail criteria
pub mod threshold;
/// Virtual users
pub mod vu;

pub use aggregate::Aggregate;
pub use config::{Overrides, ScenarioFile};
pub use error::{ConfigError, IterationError, IterationResult, RequestError, RunError};
pub use executor::{Executor, RampingVuExecutor, Schedule, Stage};
pub use plan::Plan;
pub use registry::{Recorder, Registry, Snapshot};
pub use report::{Reporter, Summary};
pub use run::{Outcome, RunResult, Runner};
pub use scenario::Scenario;
pub use threshold::{Threshold, Thresholds};
pub use vu::Vu;
