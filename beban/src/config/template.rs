//! `${...}` placeholders in scenario-file strings.
//!
//! | placeholder       | value                                        |
//! |-------------------|----------------------------------------------|
//! | `${vu}`           | VU id                                        |
//! | `${iter}`         | the VU's iteration number                    |
//! | `${now_ms}`       | wall-clock milliseconds since the Unix epoch |
//! | `${rand:LO..HI}`  | uniform integer in `[LO, HI)`                |

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde_json::{Map, Number, Value};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Vu,
    Iter,
    NowMs,
    Rand { lo: i64, hi: i64 },
}

/// Values a template is rendered with.
pub struct Bindings<'a, R: Rng> {
    pub vu: u64,
    pub iter: u64,
    pub rng: &'a mut R,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Template {
            template: source.to_owned(),
            reason,
        };

        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_owned()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| invalid("unclosed `${`".into()))?;
            segments.push(placeholder(after[..end].trim()).map_err(invalid)?);
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_owned()));
        }

        Ok(Self {
            source: source.to_owned(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when rendering always yields the source text.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn render<R: Rng>(&self, bindings: &mut Bindings<'_, R>) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                other => {
                    if let Some(n) = value_of(other, bindings) {
                        out.push_str(&n.to_string());
                    }
                }
            }
        }
        out
    }

    /// Renders a template that is exactly one placeholder as a number.
    fn render_number<R: Rng>(&self, bindings: &mut Bindings<'_, R>) -> Option<i128> {
        match self.segments.as_slice() {
            [single] => value_of(single, bindings),
            _ => None,
        }
    }
}

fn placeholder(name: &str) -> Result<Segment, String> {
    match name {
        "vu" => Ok(Segment::Vu),
        "iter" => Ok(Segment::Iter),
        "now_ms" => Ok(Segment::NowMs),
        _ => {
            let range = name
                .strip_prefix("rand:")
                .ok_or_else(|| format!("unknown placeholder `{name}`"))?;
            let (lo, hi) = range
                .split_once("..")
                .ok_or_else(|| format!("`{range}` is not a LO..HI range"))?;
            let lo: i64 = lo
                .trim()
                .parse()
                .map_err(|_| format!("`{lo}` is not an integer"))?;
            let hi: i64 = hi
                .trim()
                .parse()
                .map_err(|_| format!("`{hi}` is not an integer"))?;
            if lo >= hi {
                return Err(format!("empty range {lo}..{hi}"));
            }
            Ok(Segment::Rand { lo, hi })
        }
    }
}

fn value_of<R: Rng>(segment: &Segment, bindings: &mut Bindings<'_, R>) -> Option<i128> {
    match segment {
        Segment::Literal(_) => None,
        Segment::Vu => Some(i128::from(bindings.vu)),
        Segment::Iter => Some(i128::from(bindings.iter)),
        Segment::NowMs => Some(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_millis() as i128),
        ),
        Segment::Rand { lo, hi } => Some(i128::from(bindings.rng.random_range(*lo..*hi))),
    }
}

/// A JSON body whose string leaves are templates.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonTemplate {
    Literal(Value),
    Text(Template),
    Array(Vec<JsonTemplate>),
    Object(Vec<(String, JsonTemplate)>),
}

impl JsonTemplate {
    pub fn parse(value: &Value) -> Result<Self, ConfigError> {
        Ok(match value {
            Value::String(s) => {
                let template = Template::parse(s)?;
                if template.is_static() {
                    Self::Literal(value.clone())
                } else {
                    Self::Text(template)
                }
            }
            Value::Array(items) => {
                Self::Array(items.iter().map(Self::parse).collect::<Result<_, _>>()?)
            }
            Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::parse(v)?)))
                    .collect::<Result<_, ConfigError>>()?,
            ),
            other => Self::Literal(other.clone()),
        })
    }

    pub fn render<R: Rng>(&self, bindings: &mut Bindings<'_, R>) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Text(template) => match template.render_number(bindings) {
                Some(n) => i64::try_from(n)
                    .map(|n| Value::Number(Number::from(n)))
                    .unwrap_or_else(|_| Value::String(n.to_string())),
                None => Value::String(template.render(bindings)),
            },
            Self::Array(items) => Value::Array(items.iter().map(|t| t.render(bindings)).collect()),
            Self::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, t)| (k.clone(), t.render(bindings)))
                    .collect::<Map<_, _>>(),
            ),
        }
    }
}
