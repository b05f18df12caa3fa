//! Sharded metric storage.
//!
//! Every VU records into its own [`Shard`] through a [`Recorder`]. The shard
//! mutex is only ever contended by [`Registry::snapshot`], so the request path
//! never waits on other VUs. Shards are merged when the registry is read, and
//! a retired VU's shard is folded into a shared base shard so the shard list
//! only grows with the number of live VUs.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    aggregate::{Aggregation, MetricAggregate},
    error::MetricError,
    metric::Sample,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One VU's private slice of the metric stream.
#[derive(Debug, Default)]
pub struct Shard {
    metrics: HashMap<String, MetricAggregate>,
}

impl Shard {
    pub fn record(&mut self, name: &str, sample: Sample) -> Result<(), MetricError> {
        if !sample.is_finite() {
            return Err(MetricError::NonFinite {
                name: name.to_owned(),
            });
        }
        if let Some(existing) = self.metrics.get_mut(name) {
            return existing.consume(name, sample);
        }
        let mut agg = MetricAggregate::new(sample.kind());
        agg.consume(name, sample)?;
        self.metrics.insert(name.to_owned(), agg);
        Ok(())
    }

    /// Merges `other` into this shard. Conflicting kinds keep this shard's data.
    fn absorb(&mut self, other: Shard) {
        for (name, agg) in other.metrics {
            match self.metrics.get_mut(&name) {
                Some(existing) => {
                    if let Err(e) = existing.merge(&name, agg) {
                        tracing::warn!("Skipping retired shard data: {e}");
                    }
                }
                None => {
                    self.metrics.insert(name, agg);
                }
            }
        }
    }
}

/// Cheap, cloneable handle onto a single shard.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    shard: Arc<Mutex<Shard>>,
}

impl Recorder {
    pub fn record(&self, name: &str, sample: Sample) -> Result<(), MetricError> {
        lock(&self.shard).record(name, sample)
    }

    pub fn add(&self, name: &str, value: f64) {
        self.record_or_warn(name, Sample::Counter(value));
    }

    pub fn gauge(&self, name: &str, value: f64) {
        self.record_or_warn(name, Sample::Gauge(value));
    }

    pub fn rate(&self, name: &str, passed: bool) {
        self.record_or_warn(name, Sample::Rate(passed));
    }

    pub fn trend(&self, name: &str, value: f64) {
        self.record_or_warn(name, Sample::Trend(value));
    }

    /// Convenience for the built-in duration trends, which are in milliseconds.
    pub fn duration(&self, name: &str, duration: Duration) {
        self.trend(name, duration.as_secs_f64() * 1000.0);
    }

    fn record_or_warn(&self, name: &str, sample: Sample) {
        if let Err(e) = self.record(name, sample) {
            tracing::warn!("Dropping sample: {e}");
        }
    }
}

/// All shards of one run.
///
/// Created when the run starts and dropped when it ends; it is never a
/// process-wide static.
#[derive(Debug)]
pub struct Registry {
    started: Instant,
    shards: Mutex<Vec<Arc<Mutex<Shard>>>>,
    retired: Arc<Mutex<Shard>>,
    main: Recorder,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let main = Recorder::default();
        let retired = Arc::<Mutex<Shard>>::default();
        Self {
            started: Instant::now(),
            shards: Mutex::new(vec![main.shard.clone(), retired.clone()]),
            retired,
            main,
        }
    }

    /// Hands out a fresh shard. Called once per VU, not per sample.
    pub fn recorder(&self) -> Recorder {
        let recorder = Recorder::default();
        lock(&self.shards).push(recorder.shard.clone());
        recorder
    }

    /// Folds a VU's shard into the base shard once the VU is gone.
    ///
    /// Anything recorded through `recorder` afterwards is lost, so only call
    /// this after the VU task has finished. Retiring the main recorder, or the
    /// same recorder twice, does nothing.
    pub fn retire(&self, recorder: &Recorder) {
        if Arc::ptr_eq(&recorder.shard, &self.main.shard) {
            return;
        }
        // Held across the fold so a concurrent snapshot sees the data once.
        let mut shards = lock(&self.shards);
        let before = shards.len();
        shards.retain(|shard| !Arc::ptr_eq(shard, &recorder.shard));
        if shards.len() == before {
            return;
        }
        let folded = std::mem::take(&mut *lock(&recorder.shard));
        lock(&self.retired).absorb(folded);
    }

    /// Shards currently merged by [`Registry::snapshot`], base shards included.
    pub fn shard_count(&self) -> usize {
        lock(&self.shards).len()
    }

    /// Records into the registry's own shard, used by the executor for
    /// run-level gauges.
    pub fn record(&self, name: &str, sample: Sample) -> Result<(), MetricError> {
        self.main.record(name, sample)
    }

    pub fn main(&self) -> &Recorder {
        &self.main
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Merges every shard into a point-in-time view.
    ///
    /// A metric recorded with different kinds by different VUs keeps the first
    /// kind seen; the conflicting shard's data is dropped with a warning.
    pub fn snapshot(&self) -> Snapshot {
        let shards = lock(&self.shards);
        let mut metrics: BTreeMap<String, MetricAggregate> = BTreeMap::new();

        for shard in shards.iter() {
            let shard = lock(shard);
            for (name, agg) in &shard.metrics {
                match metrics.get_mut(name) {
                    Some(existing) => {
                        if let Err(e) = existing.merge(name, agg.clone()) {
                            tracing::warn!("Skipping shard data during merge: {e}");
                        }
                    }
                    None => {
                        metrics.insert(name.clone(), agg.clone());
                    }
                }
            }
        }
        drop(shards);

        for agg in metrics.values_mut() {
            if let MetricAggregate::Trend(trend) = agg {
                trend.sort();
            }
        }

        Snapshot {
            elapsed: self.elapsed(),
            metrics,
        }
    }
}

/// Immutable, merged view of all metrics at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub elapsed: Duration,
    pub metrics: BTreeMap<String, MetricAggregate>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&MetricAggregate> {
        self.metrics.get(name)
    }

    pub fn value(&self, name: &str, aggregation: Aggregation) -> Option<f64> {
        self.get(name)?.value(aggregation, self.elapsed)
    }

    /// Every sub-metric of `base`, e.g. each `checks{check:...}`, with its tag value.
    pub fn sub_metrics<'a>(
        &'a self,
        base: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a MetricAggregate)> + 'a {
        self.metrics.iter().filter_map(move |(name, agg)| {
            let selector = name.strip_prefix(base)?.strip_prefix('{')?.strip_suffix('}')?;
            let value = selector.split_once(':').map_or(selector, |(_, v)| v);
            Some((value, agg))
        })
    }
}
