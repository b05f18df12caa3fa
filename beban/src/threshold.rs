//! Pass/fail criteria over aggregated metrics.
//!
//! A threshold is a metric name plus an expression such as `p(95)<1500` or
//! `rate>0.9`. Expressions are parsed once, at startup; evaluation is a pure
//! function of a [`Snapshot`], so evaluating the same snapshot twice always
//! gives the same answer.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::Aggregation,
    error::ConfigError,
    metric::builtin,
    registry::Snapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparison {
    pub fn holds(&self, observed: f64, target: f64) -> bool {
        match self {
            Self::Lt => observed < target,
            Self::Le => observed <= target,
            Self::Gt => observed > target,
            Self::Ge => observed >= target,
            Self::Eq => observed == target,
            Self::Ne => observed != target,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        };
        f.write_str(op)
    }
}

// Longest operators first so `<=` is not read as `<`.
const OPERATORS: [(&str, Comparison); 7] = [
    ("<=", Comparison::Le),
    (">=", Comparison::Ge),
    ("===", Comparison::Eq),
    ("==", Comparison::Eq),
    ("!=", Comparison::Ne),
    ("<", Comparison::Lt),
    (">", Comparison::Gt),
];

/// `<aggregation> <op> <number>`, e.g. `p(95) < 1500`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub aggregation: Aggregation,
    pub op: Comparison,
    pub target: f64,
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let split = compact
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| "missing comparison operator".to_owned())?;
        let (aggregation, rest) = compact.split_at(split);

        let (op, target) = OPERATORS
            .iter()
            .find_map(|(token, op)| rest.strip_prefix(token).map(|t| (*op, t)))
            .ok_or_else(|| format!("unknown operator in `{rest}`"))?;

        let aggregation = aggregation.parse()?;
        let target: f64 = target
            .parse()
            .map_err(|_| format!("`{target}` is not a number"))?;
        if !target.is_finite() {
            return Err(format!("`{target}` is not a finite number"));
        }

        Ok(Self {
            aggregation,
            op,
            target,
        })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.op, self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub metric: String,
    /// Expression as written by the user, kept for reports.
    pub source: String,
    pub condition: Condition,
    /// Cancel the run as soon as this threshold fails.
    pub abort_on_fail: bool,
    /// Do not evaluate `abort_on_fail` before this much of the run has elapsed.
    pub delay_abort_eval: Duration,
}

impl Threshold {
    /// Parses an expression for `metric`.
    ///
    /// For built-in metrics the aggregation is checked against the metric's
    /// kind here; custom metrics are only known once they are recorded.
    pub fn parse(metric: impl Into<String>, expression: &str) -> Result<Self, ConfigError> {
        let metric = metric.into();
        let invalid = |reason: String| ConfigError::Threshold {
            metric: metric.clone(),
            expression: expression.to_owned(),
            reason,
        };

        let condition: Condition = expression.parse().map_err(invalid)?;
        if let Some(kind) = builtin::kind_of(&metric) {
            if !condition.aggregation.supported_by(kind) {
                return Err(invalid(format!(
                    "`{}` is not available on {kind} metrics",
                    condition.aggregation
                )));
            }
        }

        Ok(Self {
            metric,
            source: expression.trim().to_owned(),
            condition,
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
        })
    }

    pub fn abort_on_fail(mut self, delay: Duration) -> Self {
        self.abort_on_fail = true;
        self.delay_abort_eval = delay;
        self
    }

    pub fn evaluate(&self, snapshot: &Snapshot) -> ThresholdResult {
        let Condition {
            aggregation,
            op,
            target,
        } = self.condition;

        let (observed, passed) = match snapshot.get(&self.metric) {
            None => (None, true),
            Some(agg) if agg.is_empty() => (None, true),
            Some(agg) if !aggregation.supported_by(agg.kind()) => {
                tracing::warn!(
                    "Threshold `{}` on `{}` uses `{aggregation}`, which a {} metric does not support",
                    self.source,
                    self.metric,
                    agg.kind()
                );
                (None, false)
            }
            Some(agg) => match agg.value(aggregation, snapshot.elapsed) {
                Some(value) => (Some(value), op.holds(value, target)),
                None => (None, true),
            },
        };

        ThresholdResult {
            metric: self.metric.clone(),
            expression: self.source.clone(),
            observed,
            target,
            passed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    /// `None` when the metric recorded nothing.
    pub observed: Option<f64>,
    pub target: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub results: Vec<ThresholdResult>,
}

impl Evaluation {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Thresholds(pub Vec<Threshold>);

impl Thresholds {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.0.iter()
    }

    pub fn push(&mut self, threshold: Threshold) {
        self.0.push(threshold);
    }

    pub fn evaluate(&self, snapshot: &Snapshot) -> Evaluation {
        Evaluation {
            results: self.0.iter().map(|t| t.evaluate(snapshot)).collect(),
        }
    }

    pub fn has_abort_on_fail(&self) -> bool {
        self.0.iter().any(|t| t.abort_on_fail)
    }

    /// The first fail-fast threshold that is past its delay and failing.
    pub fn first_abort_failure(&self, snapshot: &Snapshot) -> Option<ThresholdResult> {
        self.0
            .iter()
            .filter(|t| t.abort_on_fail && snapshot.elapsed >= t.delay_abort_eval)
            .map(|t| t.evaluate(snapshot))
            .find(|r| !r.passed)
    }
}

impl FromIterator<Threshold> for Thresholds {
    fn from_iter<I: IntoIterator<Item = Threshold>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
