use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metric::MetricKind;

/// Invalid configuration. Always fatal, and always raised before any VU starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read scenario file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scenario file: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("invalid stage schedule: {0}")]
    Schedule(String),

    #[error("invalid threshold `{expression}` on `{metric}`: {reason}")]
    Threshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("invalid base url `{url}`: {reason}")]
    BaseUrl { url: String, reason: String },

    #[error("invalid header `{name}`: {reason}")]
    Header { name: String, reason: String },

    #[error("invalid think time: {0}")]
    ThinkTime(String),

    #[error("invalid template `{template}`: {reason}")]
    Template { template: String, reason: String },

    #[error("invalid step `{step}`: {reason}")]
    Step { step: String, reason: String },
}

/// Transport-level failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    Timeout,
    Connect,
    Dns,
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Connect => write!(f, "connect"),
            Self::Dns => write!(f, "dns"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A single HTTP call failed. Recorded as a failed outcome, never fatal to the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("network error ({kind}) for {url}: {message}")]
    Network {
        url: String,
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("protocol error for {url}: {message}")]
    Protocol { url: String, message: String },

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl RequestError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

/// Why one iteration of a scenario did not complete.
///
/// Iteration errors are recorded and logged; the VU carries on with its next
/// iteration.
#[derive(Debug, Error)]
pub enum IterationError {
    /// The VU was asked to stop while sleeping.
    #[error("iteration interrupted by stop signal")]
    Interrupted,

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("checks failed for step `{step}`")]
    ChecksFailed { step: String },

    #[error("{0}")]
    Failed(String),
}

/// What a scenario action returns for one iteration.
pub type IterationResult = Result<(), IterationError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetricError {
    #[error("metric `{name}` is a {expected}, cannot record a {found} sample")]
    KindMismatch {
        name: String,
        expected: MetricKind,
        found: MetricKind,
    },

    #[error("metric `{name}` rejected a non-finite sample")]
    NonFinite { name: String },
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A catastrophic setup failure, e.g. the base url does not resolve.
    #[error("setup failed: {0}")]
    Setup(String),
}
