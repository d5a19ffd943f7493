//! Consul health API access.
//!
//! The watch loop only needs two calls from Consul, captured by the [`Health`]
//! trait: a blocking query over the healthy instances of a service and the name
//! of the node the queried agent runs on. [`ConsulClient`] implements both over
//! the HTTP API; tests and embedders can supply their own implementation.

use std::future::Future;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use reqwest::{Client, RequestBuilder};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::target::Target;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

// Blocking query wait applied by Consul when none is given, and its cap.
const DEFAULT_WAIT: Duration = Duration::from_secs(5 * 60);
const MAX_WAIT: Duration = Duration::from_secs(10 * 60);
const TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// One instance of a service as reported by the health endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceEntry {
    /// The node the instance is registered on.
    pub node: Node,
    /// The service registration.
    pub service: AgentService,
}

/// A Consul node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Node {
    /// Node name.
    pub node: String,
    /// Node address, used when the service registers without one.
    pub address: String,
}

/// A service registration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentService {
    /// Service address. May be empty, meaning the node address.
    pub address: String,
    /// Service port.
    pub port: u16,
    /// Raft index at which the registration was created.
    pub create_index: u64,
    /// Raft index at which the registration was last modified.
    pub modify_index: u64,
}

impl ServiceEntry {
    /// Returns the `host:port` address of this instance.
    ///
    /// Falls back to the node address when the service has none, and brackets
    /// IPv6 literals so the result can be used in a URI authority.
    #[must_use]
    pub fn address(&self) -> String {
        let host = if self.service.address.is_empty() {
            self.node.address.as_str()
        } else {
            self.service.address.as_str()
        };

        if host.parse::<Ipv6Addr>().is_ok() {
            format!("[{host}]:{}", self.service.port)
        } else {
            format!("{host}:{}", self.service.port)
        }
    }
}

/// Options of a blocking query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Index to block on. Zero returns immediately.
    pub wait_index: u64,
    /// Maximum blocking time. Zero leaves it to the agent.
    pub wait_time: Duration,
    /// Sort results by round trip time from this node.
    pub near: String,
    /// Datacenter to query.
    pub datacenter: Option<String>,
    /// Allow stale reads.
    pub allow_stale: bool,
    /// Require consistent reads.
    pub require_consistent: bool,
}

impl QueryOptions {
    /// Builds the options for one blocking query on `target` at `wait_index`.
    #[must_use]
    pub fn for_target(target: &Target, wait_index: u64) -> Self {
        Self {
            wait_index,
            wait_time: target.wait,
            near: target.near.clone(),
            datacenter: target.datacenter.clone(),
            allow_stale: target.allow_stale,
            require_consistent: target.require_consistent,
        }
    }
}

/// Metadata of a query response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryMeta {
    /// Index reported by Consul for the returned data.
    pub last_index: u64,
    /// Time the request took, blocking included.
    pub request_time: Duration,
}

/// The part of the Consul API the watch depends on.
pub trait Health: Send + Sync + 'static {
    /// Lists the instances of `service`, optionally only those tagged `tag` and
    /// only those with passing checks, blocking according to `options`.
    fn service(
        &self,
        service: &str,
        tag: Option<&str>,
        passing_only: bool,
        options: &QueryOptions,
    ) -> impl Future<Output = Result<(Vec<ServiceEntry>, QueryMeta)>> + Send;

    /// Returns the node name of the agent answering queries.
    fn agent_node_name(&self) -> impl Future<Output = Result<String>> + Send;
}

/// HTTP client for the Consul agent API.
#[derive(Clone, Debug)]
pub struct ConsulClient {
    http: Client,
    base: String,
    user: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

impl ConsulClient {
    /// Creates a client for the agent addressed by `target`.
    ///
    /// Without an explicit timeout, requests time out a little after the
    /// longest time Consul may hold a blocking query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn new(target: &Target) -> Result<Self> {
        let builder = Client::builder()
            .danger_accept_invalid_certs(target.tls_insecure)
            .timeout(request_timeout(target));

        let scheme = if target.tls { "https" } else { "http" };

        Ok(Self {
            http: builder.build()?,
            base: format!("{scheme}://{}", target.address),
            user: target.user.clone(),
            password: target.password.clone(),
            token: target.token.clone(),
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let mut request = self.http.get(format!("{}{path}", self.base));

        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }

        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        request
    }
}

impl Health for ConsulClient {
    async fn service(
        &self,
        service: &str,
        tag: Option<&str>,
        passing_only: bool,
        options: &QueryOptions,
    ) -> Result<(Vec<ServiceEntry>, QueryMeta)> {
        let started = Instant::now();
        let response = self
            .get(&format!("/v1/health/service/{service}"))
            .query(&health_query(tag, passing_only, options))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status { status, body });
        }

        let last_index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(Error::MissingIndex)?;

        let body = response.bytes().await?;
        let entries: Option<Vec<ServiceEntry>> = serde_json::from_slice(&body)?;

        Ok((
            entries.unwrap_or_default(),
            QueryMeta {
                last_index,
                request_time: started.elapsed(),
            },
        ))
    }

    async fn agent_node_name(&self) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct AgentSelf {
            config: AgentConfig,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct AgentConfig {
            node_name: String,
        }

        let response = self.get("/v1/agent/self").send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status { status, body });
        }

        let body = response.bytes().await?;
        let agent: AgentSelf = serde_json::from_slice(&body)?;
        Ok(agent.config.node_name)
    }
}

fn request_timeout(target: &Target) -> Duration {
    if !target.timeout.is_zero() {
        return target.timeout;
    }

    let wait = if target.wait.is_zero() {
        DEFAULT_WAIT
    } else {
        target.wait.min(MAX_WAIT)
    };

    // Consul adds up to wait / 16 of jitter to a blocking query.
    wait + wait / 16 + TIMEOUT_MARGIN
}

/// Query string of a health service request.
fn health_query(
    tag: Option<&str>,
    passing_only: bool,
    options: &QueryOptions,
) -> Vec<(&'static str, String)> {
    let mut query = vec![("index", options.wait_index.to_string())];

    if !options.wait_time.is_zero() {
        query.push(("wait", format!("{}ms", options.wait_time.as_millis())));
    }

    if !options.near.is_empty() {
        query.push(("near", options.near.clone()));
    }

    if let Some(dc) = &options.datacenter {
        query.push(("dc", dc.clone()));
    }

    if let Some(tag) = tag {
        query.push(("tag", tag.to_string()));
    }

    if passing_only {
        query.push(("passing", "true".to_string()));
    }

    if options.allow_stale {
        query.push(("stale", String::new()));
    }

    if options.require_consistent {
        query.push(("consistent", String::new()));
    }

    query
}
