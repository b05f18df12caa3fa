use serde::{Deserialize, Serialize};

use crate::http::RequestOutcome;

/// Assertion over a [`RequestOutcome`].
///
/// Deserializes from single-key maps, e.g. `{ status_in: [200, 302] }` or
/// `{ header_contains: { name: location, value: /dashboard } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Status(u16),
    StatusIn(Vec<u16>),
    BodyContains(String),
    BodyNotContains(String),
    BodyContainsAny(Vec<String>),
    HeaderContains { name: String, value: String },
    UrlContains(String),
    UrlNotContains(String),
    /// `true`: the body must parse as JSON. `false`: it must not.
    JsonBody(bool),
    AllOf(Vec<Predicate>),
    AnyOf(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn holds(&self, outcome: &RequestOutcome) -> bool {
        match self {
            Self::Status(status) => outcome.status == *status,
            Self::StatusIn(statuses) => statuses.contains(&outcome.status),
            Self::BodyContains(needle) => outcome.body.contains(needle.as_str()),
            Self::BodyNotContains(needle) => !outcome.body.contains(needle.as_str()),
            Self::BodyContainsAny(needles) => {
                needles.iter().any(|n| outcome.body.contains(n.as_str()))
            }
            Self::HeaderContains { name, value } => outcome
                .header(name)
                .is_some_and(|h| h.contains(value.as_str())),
            Self::UrlContains(needle) => outcome.url.as_str().contains(needle.as_str()),
            Self::UrlNotContains(needle) => !outcome.url.as_str().contains(needle.as_str()),
            Self::JsonBody(expected) => {
                serde_json::from_str::<serde::de::IgnoredAny>(&outcome.body).is_ok() == *expected
            }
            Self::AllOf(all) => all.iter().all(|p| p.holds(outcome)),
            Self::AnyOf(any) => any.iter().any(|p| p.holds(outcome)),
            Self::Not(inner) => !inner.holds(outcome),
        }
    }
}

/// A named predicate. Its results feed the `checks` rate and the
/// `checks{check:<name>}` sub-metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    #[serde(flatten)]
    pub predicate: Predicate,
}

impl Check {
    pub fn new(name: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }

    pub fn evaluate(&self, outcome: &RequestOutcome) -> bool {
        self.predicate.holds(outcome)
    }
}
