//! Virtual users.
//!
//! A [`VuSlot`] is what survives between iterations of one VU: its id, its
//! HTTP session, its metrics shard and its local state. Each iteration gets a
//! fresh [`Vu`] handle built from the slot, carrying the iteration number and
//! a random stream seeded from `(run seed, VU id, iteration)`.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::{Rng, rngs::StdRng};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    check::Check,
    error::{IterationError, IterationResult, RequestError},
    http::{HttpClient, Request, RequestOutcome},
    metric::{builtin, tagged},
    pacing::{THINK_SALT, iteration_rng},
    registry::Recorder,
};

type LocalState = Arc<Mutex<HashMap<String, Value>>>;

/// Lifecycle of a VU task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuState {
    Spawned,
    Running,
    Sleeping,
    Terminated,
}

impl fmt::Display for VuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawned => write!(f, "spawned"),
            Self::Running => write!(f, "running"),
            Self::Sleeping => write!(f, "sleeping"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Per-VU state that outlives a single iteration.
#[derive(Debug)]
pub struct VuSlot {
    id: u64,
    iteration: u64,
    state: VuState,
    seed: u64,
    client: HttpClient,
    recorder: Recorder,
    base_url: Option<Arc<Url>>,
    local: LocalState,
    token: CancellationToken,
}

impl VuSlot {
    pub fn new(
        id: u64,
        seed: u64,
        client: HttpClient,
        recorder: Recorder,
        base_url: Option<Arc<Url>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            iteration: 0,
            state: VuState::Spawned,
            seed,
            client,
            recorder,
            base_url,
            local: LocalState::default(),
            token,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn state(&self) -> VuState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: VuState) {
        tracing::trace!("VU {} is {state}", self.id);
        self.state = state;
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// The handle for the current iteration.
    pub fn vu(&self) -> Vu {
        Vu {
            id: self.id,
            iteration: self.iteration,
            client: self.client.clone(),
            recorder: self.recorder.clone(),
            rng: iteration_rng(self.seed, self.id, self.iteration),
            base_url: self.base_url.clone(),
            local: self.local.clone(),
            token: self.token.clone(),
        }
    }

    /// Random stream for the pause after the current iteration, independent
    /// of the one the iteration itself draws from.
    pub fn think_rng(&self) -> StdRng {
        iteration_rng(self.seed ^ THINK_SALT, self.id, self.iteration)
    }

    pub(crate) fn advance(&mut self) {
        self.iteration += 1;
    }
}

/// What a scenario's action receives for one iteration.
///
/// Every request issued through a `Vu` goes through that VU's own HTTP
/// session (cookies included) and is recorded into its metrics shard.
#[derive(Debug)]
pub struct Vu {
    id: u64,
    iteration: u64,
    client: HttpClient,
    recorder: Recorder,
    rng: StdRng,
    base_url: Option<Arc<Url>>,
    local: LocalState,
    token: CancellationToken,
}

impl Vu {
    /// 1-based, never reused within a run.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 0-based count of this VU's previous iterations.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// True once this VU has been asked to stop.
    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_deref()
    }

    /// Resolves `path` against the run's base url. Absolute urls pass through.
    pub fn url(&self, path: &str) -> Result<Url, RequestError> {
        match &self.base_url {
            Some(base) => base
                .join(path)
                .map_err(|e| RequestError::Invalid(format!("cannot join `{path}`: {e}"))),
            None => Url::parse(path)
                .map_err(|e| RequestError::Invalid(format!("`{path}` is not a url: {e}"))),
        }
    }

    /// Issues `request` and records the built-in HTTP metrics for it.
    pub async fn request(&self, request: Request) -> Result<RequestOutcome, RequestError> {
        let result = self.client.request(&request).await;
        self.recorder.add(builtin::HTTP_REQS, 1.0);

        match &result {
            Ok(outcome) => {
                self.recorder.duration(builtin::HTTP_REQ_DURATION, outcome.duration);
                self.recorder.duration(
                    &tagged(builtin::HTTP_REQ_DURATION, "name", &outcome.name),
                    outcome.duration,
                );
                self.recorder.add(builtin::DATA_RECEIVED, outcome.bytes as f64);
                self.recorder.rate(builtin::HTTP_REQ_FAILED, !outcome.is_success());
                if !outcome.is_success() {
                    tracing::debug!(
                        "VU {} {} {} returned {}",
                        self.id,
                        outcome.method,
                        outcome.url,
                        outcome.status
                    );
                }
            }
            Err(e) => {
                self.recorder.rate(builtin::HTTP_REQ_FAILED, true);
                self.recorder.add(builtin::HTTP_REQ_ERRORS, 1.0);
                tracing::debug!("VU {} request `{}` failed: {e}", self.id, request.tag());
            }
        }
        result
    }

    pub async fn get(&self, path: &str) -> Result<RequestOutcome, RequestError> {
        self.request(Request::get(self.url(path)?)).await
    }

    /// Evaluates and records every check. True when all of them pass.
    pub fn check(&self, outcome: &RequestOutcome, checks: &[Check]) -> bool {
        checks
            .iter()
            .fold(true, |all, c| self.check_that(&c.name, c.evaluate(outcome)) && all)
    }

    /// Records an arbitrary boolean as a named check.
    pub fn check_that(&self, name: &str, passed: bool) -> bool {
        self.recorder.rate(builtin::CHECKS, passed);
        self.recorder.rate(&tagged(builtin::CHECKS, "check", name), passed);
        passed
    }

    /// Marks every check as failed, for when the request they judge never
    /// produced a response.
    pub fn fail_checks(&self, checks: &[Check]) {
        for check in checks {
            self.check_that(&check.name, false);
        }
    }

    /// Sleeps, waking early with [`IterationError::Interrupted`] if the VU is
    /// asked to stop.
    pub async fn sleep(&self, duration: Duration) -> IterationResult {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.token.cancelled() => Err(IterationError::Interrupted),
        }
    }

    /// Sleeps for a random duration in `[min, max]`.
    pub async fn think(&mut self, min: Duration, max: Duration) -> IterationResult {
        let pause = if min >= max {
            min
        } else {
            self.rng.random_range(min..=max)
        };
        self.sleep(pause).await
    }

    /// Value this VU stored under `key` in an earlier (or this) iteration.
    pub fn local(&self, key: &str) -> Option<Value> {
        lock(&self.local).get(key).cloned()
    }

    pub fn set_local(&self, key: impl Into<String>, value: impl Into<Value>) {
        lock(&self.local).insert(key.into(), value.into());
    }

    pub fn remove_local(&self, key: &str) -> Option<Value> {
        lock(&self.local).remove(key)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
