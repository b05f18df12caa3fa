use std::{collections::BTreeMap, fmt::Write as _, path::PathBuf};

use console::{Term, style};
use serde::{Deserialize, Serialize};

use crate::{
    aggregate::MetricAggregate,
    error::ReportError,
    executor::ExecutionStats,
    metric::{base_name, builtin},
    run::{Outcome, RunResult},
    threshold::ThresholdResult,
};

/// Machine-readable end-of-run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub scenario: String,
    /// RFC 3339.
    pub started_at: String,
    pub duration_secs: f64,
    pub seed: u64,
    pub outcome: Outcome,
    pub stats: ExecutionStats,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Vec<ThresholdResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricSummary {
    Counter {
        count: f64,
        /// Per second over the whole run.
        rate: f64,
    },
    Gauge {
        value: f64,
        min: f64,
        max: f64,
    },
    Rate {
        rate: f64,
        passes: u64,
        fails: u64,
    },
    Trend {
        count: usize,
        min: f64,
        avg: f64,
        med: f64,
        max: f64,
        p90: f64,
        p95: f64,
        p99: f64,
    },
}

impl MetricSummary {
    fn from_aggregate(agg: &MetricAggregate, secs: f64) -> Option<Self> {
        if agg.is_empty() {
            return None;
        }
        Some(match agg {
            MetricAggregate::Counter(c) => Self::Counter {
                count: c.sum,
                rate: if secs > 0.0 { c.sum / secs } else { 0.0 },
            },
            MetricAggregate::Gauge(g) => Self::Gauge {
                value: g.value,
                min: g.min,
                max: g.max,
            },
            MetricAggregate::Rate(r) => Self::Rate {
                rate: r.rate()?,
                passes: r.passes,
                fails: r.fails(),
            },
            MetricAggregate::Trend(t) => Self::Trend {
                count: t.count(),
                min: t.min()?,
                avg: t.avg()?,
                med: t.med()?,
                max: t.max()?,
                p90: t.percentile(90.0)?,
                p95: t.percentile(95.0)?,
                p99: t.percentile(99.0)?,
            },
        })
    }
}

impl From<&RunResult> for Summary {
    fn from(result: &RunResult) -> Self {
        let secs = result.snapshot.elapsed.as_secs_f64();
        let metrics = result
            .snapshot
            .metrics
            .iter()
            .filter_map(|(name, agg)| {
                MetricSummary::from_aggregate(agg, secs).map(|m| (name.clone(), m))
            })
            .collect();

        Self {
            scenario: result.scenario.clone(),
            started_at: humantime::format_rfc3339_millis(result.started_at).to_string(),
            duration_secs: result.stats.duration.as_secs_f64(),
            seed: result.seed,
            outcome: result.outcome,
            stats: result.stats.clone(),
            metrics,
            thresholds: result.evaluation.results.clone(),
        }
    }
}

/// Sends a [`Summary`] somewhere.
pub trait Reporter {
    fn report(&self, summary: &Summary) -> impl Future<Output = Result<(), ReportError>> + Send;
}

/// Human-readable summary on stdout.
#[derive(Debug, Clone)]
pub struct ConsoleReporter {
    pub use_color: bool,
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self {
            use_color: Term::stdout().features().colors_supported(),
        }
    }
}

impl Reporter for ConsoleReporter {
    async fn report(&self, summary: &Summary) -> Result<(), ReportError> {
        let rendered = render_console(summary, self.use_color);
        Term::stdout().write_str(&rendered)?;
        Ok(())
    }
}

/// Pretty-printed JSON summary written to `path`.
#[derive(Debug, Clone)]
pub struct JsonReporter {
    pub path: PathBuf,
}

impl Reporter for JsonReporter {
    async fn report(&self, summary: &Summary) -> Result<(), ReportError> {
        let json = serde_json::to_vec_pretty(summary)?;
        tokio::fs::write(&self.path, json).await?;
        tracing::info!("Summary written to {}", self.path.display());
        Ok(())
    }
}

fn mark(passed: bool, use_color: bool) -> String {
    match (passed, use_color) {
        (true, true) => style("✓").green().bold().to_string(),
        (false, true) => style("✗").red().bold().to_string(),
        (true, false) => "✓".to_owned(),
        (false, false) => "✗".to_owned(),
    }
}

fn dotted(name: &str) -> String {
    const WIDTH: usize = 34;
    let dots = WIDTH.saturating_sub(name.chars().count()).max(2);
    format!("{name}{}:", ".".repeat(dots))
}

fn fmt_value(metric: &str, value: f64) -> String {
    match base_name(metric) {
        builtin::HTTP_REQ_DURATION | builtin::ITERATION_DURATION => {
            if value >= 1000.0 {
                format!("{:.2}s", value / 1000.0)
            } else {
                format!("{value:.2}ms")
            }
        }
        builtin::DATA_RECEIVED => format!("{:.1} kB", value / 1000.0),
        _ => format!("{value}"),
    }
}

/// The console summary as text. Styling is only applied when `use_color`.
pub fn render_console(summary: &Summary, use_color: bool) -> String {
    let mut out = String::new();
    let title = |s: &str| {
        if use_color {
            style(s).bold().to_string()
        } else {
            s.to_owned()
        }
    };

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "  {} {}   seed: {}   duration: {:.1}s   outcome: {:?}",
        title("scenario:"),
        summary.scenario,
        summary.seed,
        summary.duration_secs,
        summary.outcome
    );
    let _ = writeln!(
        out,
        "  VUs: {} spawned, {} peak, {} aborted",
        summary.stats.vus_spawned, summary.stats.vus_peak, summary.stats.vus_aborted
    );

    let checks_prefix = format!("{}{{", builtin::CHECKS);
    let checks: Vec<_> = summary
        .metrics
        .iter()
        .filter_map(|(name, m)| {
            let check = name.strip_prefix(&checks_prefix)?.strip_suffix('}')?;
            let check = check.strip_prefix("check:").unwrap_or(check);
            match m {
                MetricSummary::Rate { rate, passes, fails } => Some((check, *rate, *passes, *fails)),
                _ => None,
            }
        })
        .collect();
    if !checks.is_empty() {
        let _ = writeln!(out, "\n  {}", title("checks"));
        for (name, rate, passes, fails) in checks {
            let _ = writeln!(
                out,
                "  {} {name}: {:.2}% ({passes} / {})",
                mark(fails == 0, use_color),
                rate * 100.0,
                passes + fails
            );
        }
    }

    let _ = writeln!(out, "\n  {}", title("metrics"));
    for (name, metric) in &summary.metrics {
        if name.starts_with(&checks_prefix) {
            continue;
        }
        let line = match metric {
            MetricSummary::Counter { count, rate } => {
                format!("{}  {:.2}/s", fmt_value(name, *count), rate)
            }
            MetricSummary::Gauge { value, min, max } => format!("{value}  min={min} max={max}"),
            MetricSummary::Rate {
                rate,
                passes,
                fails,
            } => format!("{:.2}%  {passes} / {}", rate * 100.0, passes + fails),
            MetricSummary::Trend {
                min,
                avg,
                med,
                max,
                p90,
                p95,
                p99,
                ..
            } => format!(
                "avg={} min={} med={} max={} p(90)={} p(95)={} p(99)={}",
                fmt_value(name, *avg),
                fmt_value(name, *min),
                fmt_value(name, *med),
                fmt_value(name, *max),
                fmt_value(name, *p90),
                fmt_value(name, *p95),
                fmt_value(name, *p99),
            ),
        };
        let _ = writeln!(out, "  {} {line}", dotted(name));
    }

    if !summary.thresholds.is_empty() {
        let _ = writeln!(out, "\n  {}", title("thresholds"));
        for t in &summary.thresholds {
            let observed = t
                .observed
                .map_or_else(|| "no data".to_owned(), |v| fmt_value(&t.metric, v));
            let _ = writeln!(
                out,
                "  {} {} {}  observed {observed}, target {}",
                mark(t.passed, use_color),
                t.metric,
                t.expression,
                fmt_value(&t.metric, t.target)
            );
        }
    }
    let _ = writeln!(out);
    out
}
