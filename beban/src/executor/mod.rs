//! Executor: orchestration of virtual users over time
//!
//! The `Executor` trait is the runtime hook that executes a `Scenario`. An
//! executor decides how many VUs run at each instant and drives their
//! iterations; everything a run shares (metrics registry, cancellation,
//! HTTP client settings) comes in through a [`RunContext`].
//!
//! The [`RampingVuExecutor`] below follows a [`Schedule`] of [`Stage`]s. A
//! controller task wakes every `tick`, computes the interpolated VU target
//! and spawns or retires VU tasks to match it. Each VU task loops over the
//! scenario's action until it is told to stop.
//!
//! This design separates **concurrency control** (controller) from **work
//! execution** (VU tasks) and keeps the hot path in VUs focused on calling
//! the user's `action` and recording into an uncontended metrics shard.
//!
//! # High-level flow
//! 1. The controller brings the number of active VUs to `round(target(t))`.
//!    New VUs get fresh ids (never reused); surplus VUs are retired
//!    newest-first and allowed to finish their current iteration.
//! 2. Every VU repeatedly:
//!    - builds a [`Vu`](crate::vu::Vu) handle for the iteration,
//!    - awaits `action(vu)`, recording `iterations` / `iteration_errors`,
//!    - pauses for the configured think time, waking early on stop.
//! 3. When the schedule ends, or the run is cancelled, every VU is signalled
//!    and given `graceful_stop` to finish; stragglers are aborted.
//!
//! # Tuning knobs
//! - `tick` (Duration): granularity of controller updates. Smaller ticks
//!   follow the ramp more closely at the cost of more wakeups. Typical
//!   values: 50–500ms.
//! - `graceful_stop` / `graceful_ramp_down` (Duration): how long a stopping
//!   VU may keep running its in-flight iteration before it is aborted.
//!
//! # Notes about correctness & robustness
//! - A panicking iteration is caught and counted in `iteration_errors`; the
//!   VU carries on with its next iteration.
//! - Cancellation is cooperative. VUs notice it between iterations and while
//!   sleeping, never in the middle of a request.
pub mod ramping;
pub mod stage;

pub use ramping::RampingVuExecutor;
pub use stage::{RampPolicy, Schedule, Stage};

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    error::{IterationResult, RunError},
    http::ClientConfig,
    registry::Registry,
    scenario::Scenario,
    vu::Vu,
};

pub trait Executor<F, Fut>
where
    Self: Send + Sync + Sized,
    F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = IterationResult> + Send + 'static,
{
    /// Execute the scenario until its schedule ends or `ctx.cancel` fires.
    fn exec(
        &self,
        scenario: &Scenario<F, Fut>,
        ctx: &RunContext,
    ) -> impl Future<Output = Result<ExecutionStats, RunError>> + Send;
}

/// Everything one run shares between the executor and its VUs.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub registry: Arc<Registry>,
    pub cancel: CancellationToken,
    pub status: Arc<RunStatus>,
    pub client: ClientConfig,
    pub base_url: Option<Arc<Url>>,
    pub seed: u64,
}

impl RunContext {
    pub fn new(client: ClientConfig, base_url: Option<Url>, seed: u64) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            cancel: CancellationToken::new(),
            status: Arc::new(RunStatus::default()),
            client,
            base_url: base_url.map(Arc::new),
            seed,
        }
    }
}

/// Live counters the controller publishes while it runs.
#[derive(Debug, Default)]
pub struct RunStatus {
    active: AtomicUsize,
    peak: AtomicUsize,
    spawned: AtomicUsize,
    aborted: AtomicUsize,
}

impl RunStatus {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::Relaxed)
    }

    pub(crate) fn set_active(&self, n: usize) {
        self.active.store(n, Ordering::Relaxed);
        self.peak.fetch_max(n, Ordering::Relaxed);
    }

    pub(crate) fn vu_spawned(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn vu_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }
}

/// What the executor reports once every VU has stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub vus_spawned: usize,
    pub vus_peak: usize,
    /// VUs that overran their grace period and were aborted.
    pub vus_aborted: usize,
    /// The run was cancelled before its schedule ended.
    pub interrupted: bool,
    pub duration: Duration,
}

impl ExecutionStats {
    pub(crate) fn from_status(status: &RunStatus, interrupted: bool, duration: Duration) -> Self {
        Self {
            vus_spawned: status.spawned(),
            vus_peak: status.peak(),
            vus_aborted: status.aborted(),
            interrupted,
            duration,
        }
    }
}
