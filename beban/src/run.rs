//! Running a scenario end to end: preflight, execution, fail-fast threshold
//! monitoring, and the final verdict.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;
use url::Url;

use crate::{
    error::{IterationResult, RunError},
    executor::{ExecutionStats, Executor, RunContext},
    http::ClientConfig,
    registry::{Registry, Snapshot},
    scenario::Scenario,
    threshold::{Evaluation, ThresholdResult, Thresholds},
    vu::Vu,
};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    ThresholdsFailed,
    /// A fail-fast threshold cancelled the run.
    AbortedByThreshold,
    /// The run was cancelled from outside, e.g. Ctrl-C.
    Cancelled,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::ThresholdsFailed | Self::AbortedByThreshold => 99,
            Self::Cancelled => 105,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub scenario: String,
    pub started_at: SystemTime,
    pub seed: u64,
    pub stats: ExecutionStats,
    pub snapshot: Snapshot,
    pub evaluation: Evaluation,
    /// The fail-fast threshold that cancelled the run, if any.
    pub aborted_by: Option<ThresholdResult>,
    pub outcome: Outcome,
}

/// Owns one run: builds its context, checks the target is reachable, runs
/// the executor and judges the result.
#[derive(Debug, TypedBuilder)]
pub struct Runner<E> {
    pub executor: E,
    #[builder(default)]
    pub client: ClientConfig,
    #[builder(default)]
    pub base_url: Option<Url>,
    /// Random when unset; the chosen seed is logged so a run can be replayed.
    #[builder(default)]
    pub seed: Option<u64>,
    /// How often fail-fast thresholds are checked. Raised to 1ms if lower.
    #[builder(default = Duration::from_secs(2))]
    pub abort_eval_interval: Duration,
    /// Cancelling this token stops the run gracefully.
    #[builder(default)]
    pub cancel: CancellationToken,
}

impl<E> Runner<E> {
    pub async fn run<F, Fut>(&self, scenario: &Scenario<F, Fut>) -> Result<RunResult, RunError>
    where
        E: Executor<F, Fut>,
        F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = IterationResult> + Send + 'static,
    {
        self.preflight().await?;

        let seed = self.seed.unwrap_or_else(rand::random);
        tracing::info!("Starting `{}` with seed {seed}", scenario.name);

        let mut ctx = RunContext::new(self.client.clone(), self.base_url.clone(), seed);
        ctx.cancel = self.cancel.child_token();
        let started_at = SystemTime::now();

        let monitor_done = CancellationToken::new();
        let monitor = scenario.thresholds.has_abort_on_fail().then(|| {
            tokio::spawn(monitor_thresholds(
                ctx.registry.clone(),
                scenario.thresholds.clone(),
                self.abort_eval_interval,
                ctx.cancel.clone(),
                monitor_done.clone(),
            ))
        });

        let stats = self.executor.exec(scenario, &ctx).await;
        monitor_done.cancel();
        let aborted_by = match monitor {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                tracing::error!("Threshold monitor failed: {e}");
                None
            }),
            None => None,
        };
        let stats = stats?;

        let snapshot = ctx.registry.snapshot();
        let evaluation = scenario.thresholds.evaluate(&snapshot);
        for failure in evaluation.failures() {
            tracing::warn!(
                "Threshold `{}` on `{}` failed (observed {:?})",
                failure.expression,
                failure.metric,
                failure.observed
            );
        }

        let outcome = if aborted_by.is_some() {
            Outcome::AbortedByThreshold
        } else if self.cancel.is_cancelled() {
            Outcome::Cancelled
        } else if evaluation.passed() {
            Outcome::Passed
        } else {
            Outcome::ThresholdsFailed
        };
        tracing::info!("Run `{}` finished: {outcome:?}", scenario.name);

        Ok(RunResult {
            scenario: scenario.name.clone(),
            started_at,
            seed,
            stats,
            snapshot,
            evaluation,
            aborted_by,
            outcome,
        })
    }

    /// Fails fast when the HTTP client cannot be built or the base url's
    /// host does not resolve.
    async fn preflight(&self) -> Result<(), RunError> {
        self.client
            .build()
            .map_err(|e| RunError::Setup(format!("failed to build HTTP client: {e}")))?;

        let Some(url) = &self.base_url else {
            return Ok(());
        };
        let host = url
            .host_str()
            .ok_or_else(|| RunError::Setup(format!("base url `{url}` has no host")))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let mut addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
            tracing::error!("Cannot resolve `{host}`: {e}");
            RunError::Setup(format!("cannot resolve `{host}`: {e}"))
        })?;
        if addrs.next().is_none() {
            return Err(RunError::Setup(format!("`{host}` resolved to no addresses")));
        }
        Ok(())
    }
}

const MIN_EVAL_INTERVAL: Duration = Duration::from_millis(1);

/// Re-evaluates fail-fast thresholds every `interval` and cancels the run
/// on the first failure.
async fn monitor_thresholds(
    registry: Arc<Registry>,
    thresholds: Thresholds,
    interval: Duration,
    cancel: CancellationToken,
    done: CancellationToken,
) -> Option<ThresholdResult> {
    let mut ticker = tokio::time::interval(interval.max(MIN_EVAL_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(failure) = thresholds.first_abort_failure(&registry.snapshot()) {
                    tracing::warn!(
                        "Threshold `{}` on `{}` failed, aborting the run",
                        failure.expression,
                        failure.metric
                    );
                    cancel.cancel();
                    return Some(failure);
                }
            }
            _ = done.cancelled() => return None,
        }
    }
}
