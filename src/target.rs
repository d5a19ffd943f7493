//! Watch target descriptor.
//!
//! A [`Target`] names the Consul agent to talk to, the service to watch and the
//! filters applied to every blocking query. It can be built in code or parsed
//! from a URL of the form
//!
//! ```text
//! consul://[user[:password]@]host[:port]/service?param=value&...
//! ```
//!
//! Supported parameters: `wait`, `timeout`, `max-backoff` (durations such as
//! `14s` or `500ms`), `tag`, `near`, `dc`, `token`, `limit`, `healthy`,
//! `insecure`, `tls`, `allow-stale`, `require-consistent` and `order`
//! (`same-node` or `address`). `type` is accepted only as `service`;
//! prepared queries (and their `poll-interval`) are rejected.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use reqwest::Url;

use crate::error::{Error, Result};
use crate::order::OrderPolicy;

/// URL scheme accepted by [`Target::parse`].
pub const SCHEME: &str = "consul";

/// Default Consul HTTP API address.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";

/// `near` value asking Consul to sort relative to the queried agent.
pub const NEAR_AGENT: &str = "_agent";

const DEFAULT_PORT: u16 = 8500;
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Describes what to watch and how to reach Consul.
///
/// A target is immutable once a watch has started; the watch takes it by value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// Consul HTTP API address as `host:port`.
    pub address: String,

    /// Basic auth user name.
    pub user: Option<String>,

    /// Basic auth password.
    pub password: Option<String>,

    /// The Consul service name to watch.
    pub service: String,

    /// Only return instances carrying this tag.
    pub tag: Option<String>,

    /// Only return instances whose health checks are passing.
    pub healthy: bool,

    /// Maximum time a blocking query may wait for a change. Zero leaves the
    /// choice to the Consul agent.
    pub wait: Duration,

    /// HTTP request timeout. Zero disables it.
    pub timeout: Duration,

    /// Upper bound of the retry backoff after failed queries.
    pub max_backoff: Duration,

    /// Node name used by Consul to sort results by round trip time.
    pub near: String,

    /// Datacenter to query instead of the agent's own.
    pub datacenter: Option<String>,

    /// ACL token sent with every request.
    pub token: Option<String>,

    /// Maximum number of addresses published per snapshot. Zero means unlimited.
    pub limit: usize,

    /// Allow any Consul server to answer, not only the leader.
    pub allow_stale: bool,

    /// Force a consistent read through the leader.
    pub require_consistent: bool,

    /// Talk to Consul over HTTPS.
    pub tls: bool,

    /// Skip verification of the Consul server certificate.
    pub tls_insecure: bool,

    /// How published addresses are ordered.
    pub order: OrderPolicy,
}

impl Target {
    /// Creates a target for the given service on the local Consul agent.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            user: None,
            password: None,
            service: service.into(),
            tag: None,
            healthy: false,
            wait: Duration::ZERO,
            timeout: Duration::ZERO,
            max_backoff: DEFAULT_MAX_BACKOFF,
            near: NEAR_AGENT.to_string(),
            datacenter: None,
            token: None,
            limit: 0,
            allow_stale: false,
            require_consistent: false,
            tls: false,
            tls_insecure: false,
            order: OrderPolicy::default(),
        }
    }

    /// Parses a `consul://` URL into a validated target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTarget`] for a malformed URL, a foreign scheme or
    /// a missing host or service name, and [`Error::InvalidParameter`] for
    /// query parameters whose value cannot be parsed.
    pub fn parse(target: &str) -> Result<Self> {
        let url = Url::parse(target).map_err(|e| invalid_target(target, e.to_string()))?;

        if url.scheme() != SCHEME {
            return Err(invalid_target(
                target,
                format!(
                    "scheme must be '{SCHEME}', \
                     expected '{SCHEME}://[user:passwd]@host/service?param=value'"
                ),
            ));
        }

        let Some(host) = url.host_str().filter(|h| !h.is_empty()) else {
            return Err(invalid_target(target, "missing Consul host"));
        };

        let service = url.path().trim_start_matches('/');
        if service.is_empty() {
            return Err(invalid_target(target, "missing service name"));
        }

        let mut tgt = Self::new(service);
        tgt.address = format!("{host}:{}", url.port().unwrap_or(DEFAULT_PORT));

        if !url.username().is_empty() {
            tgt.user = Some(decode_userinfo(target, url.username())?);
        }

        tgt.password = url
            .password()
            .map(|password| decode_userinfo(target, password))
            .transpose()?;

        for (name, value) in url.query_pairs() {
            tgt.apply_param(&name, &value)?;
        }

        if tgt.near.is_empty() {
            tgt.near = NEAR_AGENT.to_string();
        }

        if tgt.max_backoff.is_zero() {
            tgt.max_backoff = DEFAULT_MAX_BACKOFF;
        }

        tgt.validate()?;
        Ok(tgt)
    }

    fn apply_param(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "wait" => self.wait = parse_duration(name, value)?,
            "timeout" => self.timeout = parse_duration(name, value)?,
            "max-backoff" => self.max_backoff = parse_duration(name, value)?,
            "tag" => self.tag = non_empty(value),
            "near" => self.near = value.to_string(),
            "dc" => self.datacenter = non_empty(value),
            "token" => self.token = non_empty(value),
            "limit" => {
                self.limit = value
                    .parse()
                    .map_err(|e: std::num::ParseIntError| invalid_param(name, value, e))?;
            }
            "healthy" => self.healthy = parse_bool(name, value)?,
            "insecure" => self.tls_insecure = parse_bool(name, value)?,
            "tls" => self.tls = parse_bool(name, value)?,
            "allow-stale" => self.allow_stale = parse_bool(name, value)?,
            "require-consistent" => self.require_consistent = parse_bool(name, value)?,
            "order" => {
                self.order = value.parse().map_err(|e: String| invalid_param(name, value, e))?;
            }
            "type" if value == "service" => {}
            "type" => return Err(invalid_param(name, value, "only 'service' is supported")),
            "poll-interval" => {
                return Err(invalid_param(name, value, "prepared queries are not supported"));
            }
            _ => tracing::warn!("ignoring unknown target parameter '{name}'"),
        }

        Ok(())
    }

    /// Checks that the target can be watched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTarget`] if the service name or Consul address is
    /// empty, or if both stale and consistent reads are requested.
    pub fn validate(&self) -> Result<()> {
        if self.service.is_empty() {
            return Err(invalid_target(&self.to_string(), "missing service name"));
        }

        if self.address.is_empty() {
            return Err(invalid_target(&self.to_string(), "missing Consul address"));
        }

        if self.allow_stale && self.require_consistent {
            return Err(invalid_target(
                &self.to_string(),
                "'allow-stale' and 'require-consistent' are mutually exclusive",
            ));
        }

        Ok(())
    }

    /// Sets the Consul HTTP API address (`host:port`).
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Sets basic auth credentials.
    #[must_use]
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Restricts results to instances carrying `tag`.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Restricts results to instances with passing health checks.
    #[must_use]
    pub fn healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// Sets the blocking query wait time.
    #[must_use]
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Sets the HTTP request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the maximum retry backoff.
    #[must_use]
    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Sets the `near` sorting hint.
    #[must_use]
    pub fn near(mut self, near: impl Into<String>) -> Self {
        self.near = near.into();
        self
    }

    /// Queries another datacenter.
    #[must_use]
    pub fn datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    /// Sets the ACL token.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Caps the number of published addresses. Zero means unlimited.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Allows stale reads.
    #[must_use]
    pub fn allow_stale(mut self, allow_stale: bool) -> Self {
        self.allow_stale = allow_stale;
        self
    }

    /// Requires consistent reads.
    #[must_use]
    pub fn require_consistent(mut self, require_consistent: bool) -> Self {
        self.require_consistent = require_consistent;
        self
    }

    /// Uses HTTPS, optionally without certificate verification.
    #[must_use]
    pub fn tls(mut self, insecure: bool) -> Self {
        self.tls = true;
        self.tls_insecure = insecure;
        self
    }

    /// Sets the address ordering policy.
    #[must_use]
    pub fn order(mut self, order: OrderPolicy) -> Self {
        self.order = order;
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service='{}' healthy='{}' tag='{}'",
            self.service,
            self.healthy,
            self.tag.as_deref().unwrap_or_default()
        )
    }
}

fn invalid_target(target: &str, reason: impl Into<String>) -> Error {
    Error::InvalidTarget {
        target: target.to_string(),
        reason: reason.into(),
    }
}

fn invalid_param(name: &str, value: &str, reason: impl fmt::Display) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn decode_userinfo(target: &str, value: &str) -> Result<String> {
    percent_decode_str(value)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|e| invalid_target(target, format!("invalid credentials: {e}")))
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| invalid_param(name, value, e))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(invalid_param(name, value, "expected a boolean")),
    }
}
