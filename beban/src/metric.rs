use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of a metric decides how its samples are aggregated and which
/// threshold aggregations it supports.
///
/// - [`MetricKind::Counter`]: cumulative sum (`http_reqs`, `data_received`).
/// - [`MetricKind::Gauge`]: last observed value, plus min/max (`vus`).
/// - [`MetricKind::Rate`]: ratio of `true` samples (`checks`, `http_req_failed`).
/// - [`MetricKind::Trend`]: every value kept for percentiles (`http_req_duration`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter => write!(f, "counter"),
            Self::Gauge => write!(f, "gauge"),
            Self::Rate => write!(f, "rate"),
            Self::Trend => write!(f, "trend"),
        }
    }
}

/// A single observation, the smallest unit the engine records.
///
/// Samples are immutable once recorded; the registry only ever aggregates them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sample {
    Counter(f64),
    Gauge(f64),
    Rate(bool),
    Trend(f64),
}

impl Sample {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Rate(_) => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    pub(crate) fn is_finite(&self) -> bool {
        match self {
            Self::Counter(v) | Self::Gauge(v) | Self::Trend(v) => v.is_finite(),
            Self::Rate(_) => true,
        }
    }
}

/// Names of the metrics every run records.
pub mod builtin {
    use super::MetricKind;

    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const HTTP_REQ_ERRORS: &str = "http_req_errors";
    pub const DATA_RECEIVED: &str = "data_received";
    pub const CHECKS: &str = "checks";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_ERRORS: &str = "iteration_errors";
    pub const VUS: &str = "vus";
    pub const VUS_MAX: &str = "vus_max";

    /// Kind of a built-in metric, sub-metrics included (`checks{check:x}` is a rate).
    pub fn kind_of(name: &str) -> Option<MetricKind> {
        match super::base_name(name) {
            HTTP_REQS | HTTP_REQ_ERRORS | DATA_RECEIVED | ITERATIONS | ITERATION_ERRORS => {
                Some(MetricKind::Counter)
            }
            HTTP_REQ_DURATION | ITERATION_DURATION => Some(MetricKind::Trend),
            HTTP_REQ_FAILED | CHECKS => Some(MetricKind::Rate),
            VUS | VUS_MAX => Some(MetricKind::Gauge),
            _ => None,
        }
    }
}

/// Name of a sub-metric selected by one tag, e.g. `checks{check:Login ok}`.
pub fn tagged(name: &str, tag: &str, value: &str) -> String {
    format!("{name}{{{tag}:{value}}}")
}

/// Strips the tag selector from a sub-metric name.
pub fn base_name(name: &str) -> &str {
    name.split_once('{').map_or(name, |(base, _)| base)
}
