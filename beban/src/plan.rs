//! Declarative iterations: the ordered steps of a scenario file, compiled
//! into something a VU can run.

use std::{sync::Arc, time::Duration};

use futures::{FutureExt, future::BoxFuture};

use crate::{
    check::Check,
    config::{
        StepSpec,
        template::{Bindings, JsonTemplate, Template},
    },
    error::{ConfigError, IterationError, IterationResult, RequestError},
    http::{Body, Method, Request},
    pacing::ThinkTime,
    vu::Vu,
};

#[derive(Debug, Clone, PartialEq)]
enum BodyTemplate {
    Empty,
    Text(Template),
    Form(Vec<(String, Template)>),
    Json(JsonTemplate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    name: String,
    method: Method,
    path: Template,
    headers: Vec<(String, Template)>,
    body: BodyTemplate,
    timeout: Option<Duration>,
    checks: Vec<Check>,
    once: bool,
    require_checks: bool,
    sleep: Option<ThinkTime>,
}

impl Step {
    pub fn compile(spec: &StepSpec, has_base_url: bool) -> Result<Self, ConfigError> {
        let name = spec.display_name().to_owned();
        let invalid = |reason: &str| ConfigError::Step {
            step: name.clone(),
            reason: reason.to_owned(),
        };

        let path = Template::parse(&spec.path)?;
        if !has_base_url && !(spec.path.starts_with("http://") || spec.path.starts_with("https://"))
        {
            return Err(invalid("relative path without a base_url"));
        }

        let bodies = [spec.form.is_some(), spec.json.is_some(), spec.text.is_some()];
        let body = match (&spec.form, &spec.json, &spec.text) {
            _ if bodies.iter().filter(|b| **b).count() > 1 => {
                return Err(invalid("only one of form, json and text may be set"));
            }
            (Some(form), _, _) => BodyTemplate::Form(
                form.iter()
                    .map(|(k, v)| Ok((k.clone(), Template::parse(v)?)))
                    .collect::<Result<_, ConfigError>>()?,
            ),
            (_, Some(json), _) => BodyTemplate::Json(JsonTemplate::parse(json)?),
            (_, _, Some(text)) => BodyTemplate::Text(Template::parse(text)?),
            _ => BodyTemplate::Empty,
        };

        let headers = spec
            .headers
            .iter()
            .map(|(k, v)| Ok((k.clone(), Template::parse(v)?)))
            .collect::<Result<_, ConfigError>>()?;

        if let Some(sleep) = &spec.sleep {
            sleep.validate()?;
        }

        Ok(Self {
            name,
            method: spec.method,
            path,
            headers,
            body,
            timeout: spec.timeout.map(Duration::from),
            checks: spec.checks.clone(),
            once: spec.once,
            require_checks: spec.require_checks,
            sleep: spec.sleep.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renders the templates for this VU iteration.
    fn request(&self, vu: &mut Vu) -> Result<Request, RequestError> {
        let (id, iter) = (vu.id(), vu.iteration());
        let mut bindings = Bindings {
            vu: id,
            iter,
            rng: vu.rng(),
        };

        let path = self.path.render(&mut bindings);
        let headers: Vec<_> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.render(&mut bindings)))
            .collect();
        let body = match &self.body {
            BodyTemplate::Empty => Body::Empty,
            BodyTemplate::Text(t) => Body::Text(t.render(&mut bindings)),
            BodyTemplate::Form(pairs) => Body::Form(
                pairs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.render(&mut bindings)))
                    .collect(),
            ),
            BodyTemplate::Json(t) => Body::Json(t.render(&mut bindings)),
        };

        let mut request = Request::new(self.method, vu.url(&path)?).name(self.name.as_str());
        request.headers = headers;
        request.body = body;
        request.timeout = self.timeout;
        Ok(request)
    }
}

/// Ordered steps run once per iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn compile(specs: &[StepSpec], has_base_url: bool) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::Step {
                step: "<none>".into(),
                reason: "a scenario needs at least one step".into(),
            });
        }
        let steps = specs
            .iter()
            .map(|s| Step::compile(s, has_base_url))
            .collect::<Result<_, _>>()?;
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Runs every step once, in order.
    ///
    /// A failed request marks its step's checks as failed. With
    /// `require_checks`, a failed request or check ends the iteration early.
    pub async fn run_iteration(&self, vu: &mut Vu) -> IterationResult {
        for step in &self.steps {
            if step.once && vu.iteration() > 0 {
                continue;
            }

            let request = step.request(vu)?;
            match vu.request(request).await {
                Ok(outcome) => {
                    let passed = vu.check(&outcome, &step.checks);
                    if !passed && step.require_checks {
                        return Err(IterationError::ChecksFailed {
                            step: step.name.clone(),
                        });
                    }
                }
                Err(e) => {
                    vu.fail_checks(&step.checks);
                    if step.require_checks {
                        return Err(e.into());
                    }
                }
            }

            if let Some(sleep) = &step.sleep {
                let id = vu.id();
                let pause = sleep.pause(id, vu.rng());
                vu.sleep(pause).await?;
            }
        }
        Ok(())
    }

    /// The plan as a scenario action.
    pub fn action(
        self: Arc<Self>,
    ) -> impl Fn(Vu) -> BoxFuture<'static, IterationResult> + Clone + Send + Sync + 'static {
        move |mut vu: Vu| {
            let plan = self.clone();
            async move { plan.run_iteration(&mut vu).await }.boxed()
        }
    }
}
