//! Graphite render API: query model, response model, and HTTP client.
//!
//! A [`RenderQuery`] is an immutable value; every `with_*` call returns a
//! new query. [`RenderQuery::url`] produces
//!
//! ```text
//! <root>/render?target=<t1>&target=<t2>&format=json[&from=..][&until=..][&noNullPoints=True|False]
//! ```
//!
//! The JSON response is an array of series objects:
//!
//! ```json
//! [{"target": "servers.web1.load", "tags": {"name": "servers.web1.load"},
//!   "datapoints": [[0.5, 1700000000], [null, 1700000060]]}]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, QueryError};

/// A `from`/`until` bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeBound {
    /// Absolute epoch seconds.
    Epoch(i64),
    /// Anything Graphite accepts verbatim, such as `-10min` or `now`.
    Relative(String),
}

impl fmt::Display for TimeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Epoch(secs) => write!(f, "{secs}"),
            Self::Relative(expr) => f.write_str(expr),
        }
    }
}

impl From<i64> for TimeBound {
    fn from(secs: i64) -> Self {
        Self::Epoch(secs)
    }
}

impl From<&str> for TimeBound {
    fn from(expr: &str) -> Self {
        Self::Relative(expr.to_string())
    }
}

/// One render request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderQuery {
    root: String,
    targets: Vec<String>,
    from: Option<TimeBound>,
    until: Option<TimeBound>,
    no_null_points: Option<bool>,
}

impl RenderQuery {
    /// Creates a query against the Graphite web root `root`.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            targets: Vec::new(),
            from: None,
            until: None,
            no_null_points: None,
        }
    }

    /// Adds a target expression.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// Adds several target expressions.
    #[must_use]
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets.extend(targets.into_iter().map(Into::into));
        self
    }

    /// Sets the lower bound.
    #[must_use]
    pub fn with_from(mut self, from: impl Into<TimeBound>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Sets the upper bound.
    #[must_use]
    pub fn with_until(mut self, until: impl Into<TimeBound>) -> Self {
        self.until = Some(until.into());
        self
    }

    /// Sets `noNullPoints`.
    #[must_use]
    pub fn with_no_null_points(mut self, enabled: bool) -> Self {
        self.no_null_points = Some(enabled);
        self
    }

    /// Target expressions, in order.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Lower bound, if set.
    pub fn from(&self) -> Option<&TimeBound> {
        self.from.as_ref()
    }

    /// Upper bound, if set.
    pub fn until(&self) -> Option<&TimeBound> {
        self.until.as_ref()
    }

    /// Builds the request URL.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidUrl`] if the root is not an absolute
    /// URL.
    pub fn url(&self) -> Result<Url, QueryError> {
        let base = format!("{}/render", self.root.trim_end_matches('/'));
        let mut url = Url::parse(&base).map_err(|e| QueryError::InvalidUrl {
            url: self.root.clone(),
            reason: e.to_string(),
        })?;

        {
            let mut query = url.query_pairs_mut();
            for target in &self.targets {
                query.append_pair("target", target);
            }
            query.append_pair("format", "json");
            if let Some(from) = &self.from {
                query.append_pair("from", &from.to_string());
            }
            if let Some(until) = &self.until {
                query.append_pair("until", &until.to_string());
            }
            if let Some(enabled) = self.no_null_points {
                query.append_pair("noNullPoints", if enabled { "True" } else { "False" });
            }
        }

        Ok(url)
    }
}

/// One series of a render response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSeries {
    /// Target expression the series answers.
    pub target: String,
    /// Series tags; absent in older Graphite versions.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// `[value, timestamp]` pairs, either of which may be null.
    #[serde(default)]
    pub datapoints: Vec<(Option<f64>, Option<i64>)>,
}

impl RenderSeries {
    /// `(timestamp, value)` of every datapoint where both are present.
    pub fn points(&self) -> impl Iterator<Item = (i64, f64)> + '_ {
        self.datapoints
            .iter()
            .filter_map(|&(value, ts)| Some((ts?, value?)))
    }
}

/// Anything that can answer a render query.
pub trait RenderSource: Send + Sync + 'static {
    /// Executes `query`.
    fn render(
        &self,
        query: &RenderQuery,
    ) -> impl Future<Output = Result<Vec<RenderSeries>, QueryError>> + Send;
}

/// Connection settings for a Graphite web endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Graphite web root, e.g. `http://graphite.local:8080`.
    pub url: String,
    /// Basic auth user name.
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// Whole-request timeout.
    pub timeout: Duration,
}

impl RenderConfig {
    /// Creates a config without credentials and a 10s timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            timeout: Duration::from_secs(10),
        }
    }

    /// Sets basic auth credentials.
    #[must_use]
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the URL is empty, a password is given
    /// without a user name, or the timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Missing { field: "render.url" });
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::Missing {
                field: "render.username",
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "render.timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// reqwest-backed [`RenderSource`].
#[derive(Debug, Clone)]
pub struct HttpRenderClient {
    client: reqwest::Client,
    config: RenderConfig,
}

impl HttpRenderClient {
    /// Builds a client for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ClientCreate`] if the HTTP client cannot be
    /// built.
    pub fn new(config: RenderConfig) -> Result<Self, QueryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| QueryError::ClientCreate { source: e })?;
        Ok(Self { client, config })
    }

    /// Root URL queries are issued against.
    pub fn root(&self) -> &str {
        &self.config.url
    }

    /// Starts a query against this client's root.
    pub fn query(&self) -> RenderQuery {
        RenderQuery::new(self.config.url.clone())
    }
}

impl RenderSource for HttpRenderClient {
    async fn render(&self, query: &RenderQuery) -> Result<Vec<RenderSeries>, QueryError> {
        let url = query.url()?;
        let started = Instant::now();

        let mut request = self.client.get(url);
        if let Some(user) = &self.config.username {
            request = request.basic_auth(user, self.config.password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| QueryError::Request { source: e })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| QueryError::Request { source: e })?;
        let series: Vec<RenderSeries> =
            serde_json::from_slice(&body).map_err(|e| QueryError::Decode { source: e })?;

        tracing::debug!(
            series = series.len(),
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "render query complete"
        );
        Ok(series)
    }
}
