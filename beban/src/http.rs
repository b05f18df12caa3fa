//! HTTP client adapter.
//!
//! A thin layer over `reqwest` that turns every call into an immutable
//! [`RequestOutcome`] (status, headers, body, timing) or a classified
//! [`RequestError`]. Each VU builds its own [`HttpClient`] from a shared
//! [`ClientConfig`], so cookie jars are never shared between VUs.

use std::{
    collections::BTreeMap,
    error::Error as _,
    fmt,
    time::{Duration, SystemTime},
};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT},
    redirect,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use url::Url;

use crate::error::{ConfigError, NetworkErrorKind, RequestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl From<Method> for reqwest::Method {
    fn from(value: Method) -> Self {
        match value {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(reqwest::Method::from(*self).as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    /// Sent as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
    Json(Value),
}

/// A request as a scenario describes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    /// Tag used for the `http_req_duration{name:...}` sub-metric. Defaults to the path.
    pub name: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Body,
    /// Overrides the client's default timeout.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            name: None,
            headers: Vec::new(),
            body: Body::Empty,
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn form<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = Body::Form(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn json(mut self, value: Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body = Body::Text(text.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The request's metric tag.
    pub fn tag(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.url.path())
    }
}

/// Everything a check may look at. Produced once per HTTP call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub name: String,
    pub method: Method,
    /// Final URL, after redirects.
    pub url: Url,
    pub status: u16,
    pub duration: Duration,
    pub timestamp: SystemTime,
    /// Lower-cased names; repeated headers joined with `", "`.
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Body size on the wire, before any lossy UTF-8 decoding.
    pub bytes: usize,
}

impl RequestOutcome {
    /// 2xx and 3xx count as success; anything else is a failed request.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/// Settings every VU client is built from.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub cookies: bool,
    /// `0` disables following redirects.
    pub max_redirects: usize,
    pub headers: HeaderMap,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            cookies: true,
            max_redirects: 10,
            headers: HeaderMap::new(),
            user_agent: concat!("beban/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl ClientConfig {
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Header {
            name: name.to_owned(),
            reason,
        };
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        self.headers.append(header, value);
        Ok(self)
    }

    /// Builds a fresh client with its own connection pool and cookie jar.
    pub fn build(&self) -> Result<HttpClient, reqwest::Error> {
        let policy = match self.max_redirects {
            0 => redirect::Policy::none(),
            n => redirect::Policy::limited(n),
        };
        let mut headers = self.headers.clone();
        if !headers.contains_key(USER_AGENT) {
            if let Ok(ua) = HeaderValue::from_str(&self.user_agent) {
                headers.insert(USER_AGENT, ua);
            }
        }
        let inner = reqwest::Client::builder()
            .cookie_store(self.cookies)
            .redirect(policy)
            .timeout(self.timeout)
            .default_headers(headers)
            .build()?;
        Ok(HttpClient { inner })
    }
}

/// One VU's HTTP session.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    /// Issues `request` and reads the whole body.
    ///
    /// Non-2xx statuses are not errors here; they come back as outcomes and
    /// are judged by checks and `http_req_failed`.
    pub async fn request(&self, request: &Request) -> Result<RequestOutcome, RequestError> {
        let url = request.url.as_str();
        let mut builder = self
            .inner
            .request(request.method.into(), request.url.clone());

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RequestError::Invalid(format!("header `{name}`: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RequestError::Invalid(format!("header `{name}`: {e}")))?;
            builder = builder.header(name, value);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder = match &request.body {
            Body::Empty => builder,
            Body::Text(text) => builder.body(text.clone()),
            Body::Form(pairs) => builder.form(pairs),
            Body::Json(value) => builder.json(value),
        };

        let timestamp = SystemTime::now();
        let started = Instant::now();
        let response = builder.send().await.map_err(|e| classify(url, &e))?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let headers = collect_headers(response.headers());
        let bytes = response.bytes().await.map_err(|e| classify(url, &e))?;
        let duration = started.elapsed();

        Ok(RequestOutcome {
            name: request.tag().to_owned(),
            method: request.method,
            url: final_url,
            status,
            duration,
            timestamp,
            headers,
            bytes: bytes.len(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

fn collect_headers(map: &HeaderMap) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes());
        headers
            .entry(name.as_str().to_owned())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    headers
}

/// Maps a `reqwest` failure onto the engine's error taxonomy.
pub(crate) fn classify(url: &str, err: &reqwest::Error) -> RequestError {
    let message = error_chain(err);
    let network = |kind| RequestError::Network {
        url: url.to_owned(),
        kind,
        message: message.clone(),
    };

    if err.is_timeout() {
        network(NetworkErrorKind::Timeout)
    } else if err.is_connect() {
        if message.contains("dns error") || message.contains("failed to lookup address") {
            network(NetworkErrorKind::Dns)
        } else {
            network(NetworkErrorKind::Connect)
        }
    } else if err.is_builder() {
        RequestError::Invalid(message)
    } else if err.is_redirect() || err.is_decode() || err.is_body() {
        RequestError::Protocol {
            url: url.to_owned(),
            message,
        }
    } else if message.contains("invalid HTTP") || message.contains("message head") {
        RequestError::Protocol {
            url: url.to_owned(),
            message,
        }
    } else {
        network(NetworkErrorKind::Other)
    }
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
