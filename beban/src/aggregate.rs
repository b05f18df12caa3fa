use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{fmt, fmt::Debug, str::FromStr, time::Duration, time::SystemTime};

use crate::{
    error::MetricError,
    metric::{MetricKind, Sample},
};

/// The `Aggregate` trait defines how raw samples are folded into a compact,
/// mergeable representation.
///
/// Aggregates store what is needed to derive statistics later (sums, counts,
/// the raw trend values) and nothing more. Deriving the final numbers
/// (percentiles, ratios) happens when a snapshot is read.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: per-VU shards are
///   merged in arbitrary order when the registry is read.
/// - `consume` sits on the request hot path and must be amortised O(1).
///
/// # Example
/// ```rust
/// use beban::aggregate::{Aggregate, Rate};
///
/// let mut checks = Rate::default();
/// checks.aggregate(&[true, true, false]);
///
/// let mut other = Rate::default();
/// other.consume(&true);
/// checks.merge(other);
///
/// assert_eq!(checks.rate(), Some(0.75));
/// ```
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone + Default,
{
    /// The sample type this aggregate summarizes.
    type Sample;

    /// Incorporate multiple samples.
    fn aggregate(&mut self, samples: &[Self::Sample]) {
        samples.iter().for_each(|s| self.consume(s));
    }

    /// Incorporate a single sample.
    fn consume(&mut self, sample: &Self::Sample);

    /// Combine two aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Cumulative sum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub sum: f64,
    pub updates: u64,
}

impl Aggregate for Counter {
    type Sample = f64;

    fn consume(&mut self, sample: &f64) {
        self.sum += sample;
        self.updates += 1;
    }

    fn merge(&mut self, other: Self) {
        self.sum += other.sum;
        self.updates += other.updates;
    }
}

/// Last value wins; min and max are kept across the whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gauge {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub updates: u64,
    pub updated_at: Option<SystemTime>,
}

impl Aggregate for Gauge {
    type Sample = f64;

    fn consume(&mut self, sample: &f64) {
        if self.updates == 0 {
            self.min = *sample;
            self.max = *sample;
        } else {
            self.min = self.min.min(*sample);
            self.max = self.max.max(*sample);
        }
        self.value = *sample;
        self.updates += 1;
        self.updated_at = Some(SystemTime::now());
    }

    fn merge(&mut self, other: Self) {
        if other.updates == 0 {
            return;
        }
        if self.updates == 0 {
            *self = other;
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        if other.updated_at >= self.updated_at {
            self.value = other.value;
            self.updated_at = other.updated_at;
        }
        self.updates += other.updates;
    }
}

/// Ratio of `true` samples over all samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub passes: u64,
    pub total: u64,
}

impl Rate {
    /// `passes / total`, or `None` before the first sample.
    pub fn rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.passes as f64 / self.total as f64)
    }

    pub fn fails(&self) -> u64 {
        self.total - self.passes
    }
}

impl Aggregate for Rate {
    type Sample = bool;

    fn consume(&mut self, sample: &bool) {
        self.passes += u64::from(*sample);
        self.total += 1;
    }

    fn merge(&mut self, other: Self) {
        self.passes += other.passes;
        self.total += other.total;
    }
}

/// Every recorded value, so percentiles are exact rather than estimated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub samples: Vec<f64>,
    pub sum: f64,
}

impl Trend {
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn avg(&self) -> Option<f64> {
        (!self.samples.is_empty()).then(|| self.sum / self.samples.len() as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.samples.iter().copied().min_by(f64::total_cmp)
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.iter().copied().max_by(f64::total_cmp)
    }

    pub fn med(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// Percentile by linear interpolation between closest ranks.
    ///
    /// Sorts a copy of the samples unless they are already sorted (snapshots
    /// sort them once).
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.is_sorted_by(|a, b| a <= b) {
            return percentile(&self.samples, p);
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);
        percentile(&sorted, p)
    }

    pub(crate) fn sort(&mut self) {
        self.samples.sort_by(f64::total_cmp);
    }
}

impl Aggregate for Trend {
    type Sample = f64;

    fn consume(&mut self, sample: &f64) {
        self.samples.push(*sample);
        self.sum += sample;
    }

    fn merge(&mut self, other: Self) {
        self.samples.extend(other.samples);
        self.sum += other.sum;
    }
}

/// Percentile `p` (0..=100) of an ascending slice.
///
/// ```text
/// rank  = p / 100 * (n - 1)
/// value = x[floor(rank)] + (x[ceil(rank)] - x[floor(rank)]) * (rank - floor(rank))
/// ```
///
/// Returns `None` for an empty slice or a `p` outside `0..=100`.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=100.0).contains(&p) {
        return None;
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

/// How a threshold reduces a metric to one number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
    Count,
    Rate,
    Value,
}

impl Aggregation {
    pub fn supported_by(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => matches!(self, Self::Count | Self::Rate),
            MetricKind::Gauge => matches!(self, Self::Value | Self::Min | Self::Max),
            MetricKind::Rate => matches!(self, Self::Rate),
            MetricKind::Trend => matches!(
                self,
                Self::Avg | Self::Min | Self::Max | Self::Med | Self::Percentile(_) | Self::Count
            ),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => write!(f, "avg"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
            Self::Med => write!(f, "med"),
            Self::Percentile(p) => write!(f, "p({p})"),
            Self::Count => write!(f, "count"),
            Self::Rate => write!(f, "rate"),
            Self::Value => write!(f, "value"),
        }
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "med" => Ok(Self::Med),
            "count" => Ok(Self::Count),
            "rate" => Ok(Self::Rate),
            "value" => Ok(Self::Value),
            other => {
                let inner = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregation `{other}`"))?;
                let p: f64 = inner
                    .parse()
                    .map_err(|_| format!("invalid percentile `{inner}`"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {p} is outside 0..=100"));
                }
                Ok(Self::Percentile(p))
            }
        }
    }
}

/// Type-erased aggregate, one per metric name inside a shard or snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricAggregate {
    Counter(Counter),
    Gauge(Gauge),
    Rate(Rate),
    Trend(Trend),
}

impl MetricAggregate {
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(Counter::default()),
            MetricKind::Gauge => Self::Gauge(Gauge::default()),
            MetricKind::Rate => Self::Rate(Rate::default()),
            MetricKind::Trend => Self::Trend(Trend::default()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Rate(_) => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    pub(crate) fn consume(&mut self, name: &str, sample: Sample) -> Result<(), MetricError> {
        match (self, sample) {
            (Self::Counter(agg), Sample::Counter(v)) => agg.consume(&v),
            (Self::Gauge(agg), Sample::Gauge(v)) => agg.consume(&v),
            (Self::Rate(agg), Sample::Rate(v)) => agg.consume(&v),
            (Self::Trend(agg), Sample::Trend(v)) => agg.consume(&v),
            (agg, sample) => {
                return Err(MetricError::KindMismatch {
                    name: name.to_owned(),
                    expected: agg.kind(),
                    found: sample.kind(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn merge(&mut self, name: &str, other: Self) -> Result<(), MetricError> {
        match (self, other) {
            (Self::Counter(agg), Self::Counter(o)) => agg.merge(o),
            (Self::Gauge(agg), Self::Gauge(o)) => agg.merge(o),
            (Self::Rate(agg), Self::Rate(o)) => agg.merge(o),
            (Self::Trend(agg), Self::Trend(o)) => agg.merge(o),
            (agg, other) => {
                return Err(MetricError::KindMismatch {
                    name: name.to_owned(),
                    expected: agg.kind(),
                    found: other.kind(),
                });
            }
        }
        Ok(())
    }

    /// Reduce to a single value. `None` when the metric has no samples or
    /// the aggregation does not apply to this kind.
    pub fn value(&self, aggregation: Aggregation, elapsed: Duration) -> Option<f64> {
        match (self, aggregation) {
            (Self::Counter(c), Aggregation::Count) => (c.updates > 0).then_some(c.sum),
            (Self::Counter(c), Aggregation::Rate) => {
                let secs = elapsed.as_secs_f64();
                (c.updates > 0 && secs > 0.0).then(|| c.sum / secs)
            }
            (Self::Gauge(g), Aggregation::Value) => (g.updates > 0).then_some(g.value),
            (Self::Gauge(g), Aggregation::Min) => (g.updates > 0).then_some(g.min),
            (Self::Gauge(g), Aggregation::Max) => (g.updates > 0).then_some(g.max),
            (Self::Rate(r), Aggregation::Rate) => r.rate(),
            (Self::Trend(t), Aggregation::Avg) => t.avg(),
            (Self::Trend(t), Aggregation::Min) => t.min(),
            (Self::Trend(t), Aggregation::Max) => t.max(),
            (Self::Trend(t), Aggregation::Med) => t.med(),
            (Self::Trend(t), Aggregation::Percentile(p)) => t.percentile(p),
            (Self::Trend(t), Aggregation::Count) => (t.count() > 0).then(|| t.count() as f64),
            _ => None,
        }
    }

    /// True when nothing was recorded yet.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Counter(c) => c.updates == 0,
            Self::Gauge(g) => g.updates == 0,
            Self::Rate(r) => r.total == 0,
            Self::Trend(t) => t.samples.is_empty(),
        }
    }
}
