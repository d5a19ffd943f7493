#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Consul endpoint discovery for [Tonic](https://docs.rs/tonic) gRPC load balancing.
//!
//! HTTP/2 multiplexes all requests over a single long-lived connection, so a
//! gRPC client needs to know every backend to spread load across them. This
//! crate watches a Consul service with blocking queries and feeds the healthy
//! instances to a user-provided Tonic balance channel, or to any other
//! [`AddressSink`].
//!
//! # Features
//!
//! - **Blocking queries**: updates arrive as soon as Consul sees them, without busy polling
//! - **Stable snapshots**: instances are ordered and deduplicated the same way every time,
//!   instances on the agent's own node first
//! - **Resilient**: failed queries are retried with exponential backoff and jitter
//! - **Explicit lifecycle**: a [`Watch`] handle stops both loops on demand
//!
//! # Usage
//!
//! ```ignore
//! use std::time::Duration;
//! use tonic::transport::{Channel, Endpoint};
//! use tonic_lb_consul::{Target, discover};
//!
//! // Create your own balance channel
//! let (channel, tx) = Channel::balance_channel::<String>(1024);
//!
//! // Start discovery - build function returns Endpoint for each address
//! let target = Target::parse("consul://127.0.0.1:8500/my-grpc-service?healthy=true")?;
//! let watch = discover(target, tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}"))
//!         .unwrap()
//!         .connect_timeout(Duration::from_secs(5))
//! })?;
//!
//! // Use with your generated gRPC client
//! // let client = MyServiceClient::new(channel);
//! ```

mod backoff;
mod consul;
mod error;
mod order;
mod sink;
mod target;
mod watch;

pub use consul::{AgentService, ConsulClient, Health, Node, QueryMeta, QueryOptions, ServiceEntry};
pub use error::{Error, Result};
pub use order::OrderPolicy;
pub use sink::{Address, AddressSink, BalanceChannel};
pub use target::{DEFAULT_ADDRESS, NEAR_AGENT, SCHEME, Target};
pub use watch::{Watch, discover};
