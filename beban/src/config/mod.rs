//! YAML scenario files.
//!
//! A [`ScenarioFile`] is the raw, deserialized document. [`ScenarioFile::compile`]
//! validates everything up front (schedule, think time, thresholds, base url,
//! headers, templates) and produces a [`CompiledScenario`] ready to run, so a
//! bad file is rejected before any VU starts.

pub mod template;

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    check::Check,
    duration::HumanDuration,
    error::ConfigError,
    executor::{RampPolicy, RampingVuExecutor, Schedule, Stage},
    http::{ClientConfig, Method},
    pacing::ThinkTime,
    plan::Plan,
    threshold::{Threshold, Thresholds},
};

fn default_grace() -> HumanDuration {
    HumanDuration(Duration::from_secs(30))
}

fn default_timeout() -> HumanDuration {
    HumanDuration(Duration::from_secs(60))
}

fn default_redirects() -> usize {
    10
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioFile {
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub start_vus: u32,
    #[serde(default)]
    pub ramp: RampPolicy,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub think_time: ThinkTime,
    #[serde(default = "default_grace")]
    pub graceful_stop: HumanDuration,
    #[serde(default = "default_grace")]
    pub graceful_ramp_down: HumanDuration,
    /// Default per-request timeout.
    #[serde(default = "default_timeout")]
    pub timeout: HumanDuration,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "yes")]
    pub cookies: bool,
    #[serde(default = "default_redirects")]
    pub max_redirects: usize,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdSpec>>,
    pub steps: Vec<StepSpec>,
}

/// `"p(95)<1000"`, or the long form with fail-fast settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
        #[serde(default)]
        delay_abort_eval: HumanDuration,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    /// Metric tag and log name. Defaults to the path.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub method: Method,
    pub path: String,
    /// Only run on the VU's first iteration.
    #[serde(default)]
    pub once: bool,
    /// End the iteration when any check of this step fails.
    #[serde(default)]
    pub require_checks: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub form: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub json: Option<serde_json::Value>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub timeout: Option<HumanDuration>,
    #[serde(default)]
    pub checks: Vec<Check>,
    /// Pause after the step.
    #[serde(default)]
    pub sleep: Option<ThinkTime>,
}

impl StepSpec {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.path)
    }
}

/// Command-line overrides applied on top of a file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub vus: Option<u32>,
    pub duration: Option<Duration>,
    pub base_url: Option<String>,
    pub seed: Option<u64>,
}

/// A validated scenario file, ready to hand to a runner.
#[derive(Debug)]
pub struct CompiledScenario {
    pub name: String,
    pub executor: RampingVuExecutor,
    pub thresholds: Thresholds,
    pub client: ClientConfig,
    pub base_url: Option<Url>,
    pub seed: Option<u64>,
    pub plan: Plan,
}

impl ScenarioFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml_ng::from_str(raw)?)
    }

    /// Checks the file without building anything that would run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compile(&Overrides::default()).map(|_| ())
    }

    pub fn compile(&self, overrides: &Overrides) -> Result<CompiledScenario, ConfigError> {
        let schedule = self.schedule(overrides)?;
        self.think_time.validate()?;

        let base_url = overrides
            .base_url
            .as_deref()
            .or(self.base_url.as_deref())
            .map(parse_base_url)
            .transpose()?;

        let mut client = ClientConfig {
            timeout: self.timeout.0,
            cookies: self.cookies,
            max_redirects: self.max_redirects,
            ..ClientConfig::default()
        };
        for (name, value) in &self.headers {
            client = client.with_header(name, value)?;
        }

        let mut thresholds = Thresholds::default();
        for (metric, specs) in &self.thresholds {
            for spec in specs {
                thresholds.push(match spec {
                    ThresholdSpec::Expression(expr) => Threshold::parse(metric.as_str(), expr)?,
                    ThresholdSpec::Detailed {
                        threshold,
                        abort_on_fail,
                        delay_abort_eval,
                    } => {
                        let t = Threshold::parse(metric.as_str(), threshold)?;
                        if *abort_on_fail {
                            t.abort_on_fail(delay_abort_eval.0)
                        } else {
                            t
                        }
                    }
                });
            }
        }

        let plan = Plan::compile(&self.steps, base_url.is_some())?;

        let executor = RampingVuExecutor::builder()
            .schedule(schedule)
            .think_time(self.think_time.clone())
            .graceful_stop(self.graceful_stop.0)
            .graceful_ramp_down(self.graceful_ramp_down.0)
            .build();

        Ok(CompiledScenario {
            name: self.name.clone(),
            executor,
            thresholds,
            client,
            base_url,
            seed: overrides.seed.or(self.seed),
            plan,
        })
    }

    fn schedule(&self, overrides: &Overrides) -> Result<Schedule, ConfigError> {
        match (overrides.vus, overrides.duration) {
            (Some(vus), Some(duration)) => Schedule::constant(vus, duration),
            (None, None) => Schedule::new(self.start_vus, self.stages.clone(), self.ramp),
            _ => Err(ConfigError::Schedule(
                "--vus and --duration must be given together".into(),
            )),
        }
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::BaseUrl {
        url: raw.to_owned(),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".into()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aggregate::Aggregation, metric::builtin};

    const LOGIN_STRESS: &str = r#"
name: warehouse-login-stress
base_url: http://localhost:8080
stages:
  - { duration: 30s, target: 10 }
  - { duration: 1m30s, target: 10 }
  - { duration: 20s, target: 0 }
think_time: { cycle: [2s, 3s] }
thresholds:
  http_req_duration: ["p(95)<1000"]
  checks:
    - rate>0.95
    - { threshold: "rate>0.5", abort_on_fail: true, delay_abort_eval: 10s }
steps:
  - name: login
    method: POST
    path: /login
    form: { username: superadmin, password: admin123 }
    checks:
      - { name: "Status is 200/302", status_in: [200, 302] }
      - { name: "No error message", body_not_contains: salah }
"#;

    #[test]
    fn compiles_a_k6_port() {
        let file = ScenarioFile::from_yaml(LOGIN_STRESS).unwrap();
        let compiled = file.compile(&Overrides::default()).unwrap();

        assert_eq!(compiled.name, "warehouse-login-stress");
        assert_eq!(compiled.executor.schedule.total_duration(), Duration::from_secs(140));
        assert_eq!(compiled.executor.schedule.max_vus(), 10);
        assert_eq!(compiled.thresholds.iter().count(), 3);
        assert!(compiled.thresholds.has_abort_on_fail());
        assert_eq!(
            compiled.thresholds.iter().next().map(|t| t.condition.aggregation),
            Some(Aggregation::Rate)
        );
        assert_eq!(compiled.base_url.unwrap().as_str(), "http://localhost:8080/");
        assert_eq!(compiled.plan.len(), 1);
        assert_eq!(compiled.client.timeout, Duration::from_secs(60));
    }

    #[test]
    fn overrides_replace_stages_and_base_url() {
        let file = ScenarioFile::from_yaml(LOGIN_STRESS).unwrap();
        let compiled = file
            .compile(&Overrides {
                vus: Some(3),
                duration: Some(Duration::from_secs(5)),
                base_url: Some("http://127.0.0.1:9000".into()),
                seed: Some(42),
            })
            .unwrap();

        let schedule = &compiled.executor.schedule;
        assert_eq!(schedule.vus_at(Duration::ZERO), 3);
        assert_eq!(schedule.total_duration(), Duration::from_secs(5));
        assert_eq!(compiled.base_url.unwrap().port(), Some(9000));
        assert_eq!(compiled.seed, Some(42));

        let half = Overrides {
            vus: Some(3),
            ..Overrides::default()
        };
        assert!(matches!(file.compile(&half), Err(ConfigError::Schedule(_))));
    }

    #[test]
    fn rejects_invalid_files() {
        let cases = [
            (
                "no stages",
                LOGIN_STRESS.replace(
                    "stages:\n  - { duration: 30s, target: 10 }\n  - { duration: 1m30s, target: 10 }\n  - { duration: 20s, target: 0 }\n",
                    "stages: []\n",
                ),
            ),
            (
                "bad threshold",
                LOGIN_STRESS.replace("p(95)<1000", "p(95)<<1000"),
            ),
            (
                "rate on a trend",
                LOGIN_STRESS.replace("p(95)<1000", "rate<1000"),
            ),
            (
                "bad base url",
                LOGIN_STRESS.replace("http://localhost:8080", "ftp://localhost"),
            ),
            ("bad template", LOGIN_STRESS.replace("/login", "/login/${user}")),
            ("unknown field", LOGIN_STRESS.to_owned() + "colour: red\n"),
        ];
        for (what, yaml) in cases {
            let result = ScenarioFile::from_yaml(&yaml).and_then(|f| f.validate());
            assert!(result.is_err(), "{what} should be rejected");
        }
    }

    #[test]
    fn zero_length_schedule_is_rejected() {
        let yaml = LOGIN_STRESS
            .replace("1m30s", "0s")
            .replace("30s", "0s")
            .replace("20s", "0s");
        let err = ScenarioFile::from_yaml(&yaml).unwrap().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Schedule(_)));
    }

    #[test]
    fn relative_paths_need_a_base_url() {
        let yaml = LOGIN_STRESS.replace("base_url: http://localhost:8080\n", "");
        let err = ScenarioFile::from_yaml(&yaml).unwrap().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Step { .. }));
    }

    #[test]
    fn threshold_keys_may_name_sub_metrics() {
        let yaml = LOGIN_STRESS.replace(
            "  http_req_duration: [\"p(95)<1000\"]",
            "  \"http_req_duration{name:login}\": [\"p(95)<1000\"]",
        );
        let compiled = ScenarioFile::from_yaml(&yaml)
            .unwrap()
            .compile(&Overrides::default())
            .unwrap();
        assert!(
            compiled
                .thresholds
                .iter()
                .any(|t| t.metric == "http_req_duration{name:login}")
        );
        assert!(compiled.thresholds.iter().all(|t| t.metric != builtin::HTTP_REQ_DURATION));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ScenarioFile::load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
