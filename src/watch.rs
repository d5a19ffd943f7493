//! Consul endpoint watch using blocking queries.
//!
//! A watch runs two tasks connected by a single-slot channel:
//!
//! 1. The poller issues blocking health queries, tracking the `X-Consul-Index`
//!    cursor and retrying failed queries with exponential backoff
//! 2. The publisher orders each result batch, drops duplicate addresses and
//!    hands the snapshot to an [`AddressSink`]
//!
//! Responses that report an unchanged index are long-poll timeouts and are not
//! published. If the index goes backwards (a Consul restart or snapshot
//! restore) the cursor is reset to zero and the response is still published.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tonic::transport::{Channel, Endpoint};
//! use tonic_lb_consul::{Target, discover};
//!
//! let (channel, tx) = Channel::balance_channel::<String>(1024);
//!
//! let target = Target::parse("consul://127.0.0.1:8500/my-grpc-service?healthy=true&wait=30s")?;
//! let watch = discover(target, tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}"))
//!         .unwrap()
//!         .connect_timeout(Duration::from_secs(5))
//! })?;
//!
//! let client = MyServiceClient::new(channel);
//! // ...
//! watch.stop().await;
//! ```

use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::backoff::{Backoff, MIN_DELAY};
use crate::consul::{ConsulClient, Health, QueryOptions, ServiceEntry};
use crate::error::Result;
use crate::order::{Order, OrderPolicy};
use crate::sink::{Address, AddressSink, BalanceChannel};
use crate::target::Target;

/// Starts watching a Consul service and feeds a Tonic balance channel.
///
/// The target is validated and the HTTP client built before anything is
/// spawned, so configuration problems are reported here. Afterwards query
/// failures are logged and retried; they never end the watch.
///
/// # Arguments
///
/// * `target` - The service to watch and how to reach Consul
/// * `tx` - Sender for endpoint changes (from `Channel::balance_channel()`)
/// * `build` - Function to build an `Endpoint` from a `host:port` address
///
/// # Errors
///
/// Returns an error if the target is invalid or the HTTP client cannot be
/// built.
///
/// # Panics
///
/// Panics if called outside a Tokio runtime.
pub fn discover<F>(target: Target, tx: Sender<Change<String, Endpoint>>, build: F) -> Result<Watch>
where
    F: Fn(&str) -> Endpoint + Send + 'static,
{
    target.validate()?;
    let client = ConsulClient::new(&target)?;
    Watch::start(target, client, BalanceChannel::new(tx, build))
}

/// Handle to a running watch.
///
/// Dropping the handle cancels the watch without waiting for it.
#[must_use = "dropping a Watch stops it"]
#[derive(Debug)]
pub struct Watch {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Watch {
    /// Starts watching `target` through `health`, publishing snapshots to `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target is invalid; nothing is spawned then.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start<H, S>(target: Target, health: H, sink: S) -> Result<Self>
    where
        H: Health,
        S: AddressSink,
    {
        target.validate()?;

        let token = CancellationToken::new();
        let task = tokio::spawn(supervise(target, health, sink, token.clone()));

        Ok(Self {
            token,
            task: Some(task),
        })
    }

    /// Returns `true` once both loops have exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancels the watch and waits until both loops have exited.
    ///
    /// No snapshot reaches the sink after this returns.
    pub async fn stop(mut self) {
        self.token.cancel();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Consul watch task failed: {e}");
            }
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Resolves the agent node, then runs the poller and publisher until cancelled.
async fn supervise<H, S>(target: Target, health: H, sink: S, token: CancellationToken)
where
    H: Health,
    S: AddressSink,
{
    let agent_node = tokio::select! {
        biased;
        () = token.cancelled() => return,
        name = resolve_agent_node(&health, target.order) => name,
    };

    tracing::debug!(
        "Starting Consul watch for {target} on {} (agent node '{agent_node}')",
        target.address
    );

    let order = Order::new(target.order, agent_node);
    let (tx, rx) = mpsc::channel(1);

    let poller = tokio::spawn(poll(health, target, order.clone(), tx, token.clone()));
    let publisher = tokio::spawn(publish(sink, rx, order, token.clone()));

    let (polled, published) = tokio::join!(poller, publisher);
    for result in [polled, published] {
        if let Err(e) = result {
            tracing::error!("Consul watch task failed: {e}");
            token.cancel();
        }
    }
}

/// Looks up the node of the queried agent when the order policy needs it.
async fn resolve_agent_node<H: Health>(health: &H, policy: OrderPolicy) -> String {
    if policy != OrderPolicy::SameNodeFirst {
        return String::new();
    }

    match health.agent_node_name().await {
        Ok(name) => name,
        Err(e) => {
            tracing::warn!("couldn't resolve Consul agent node, ordering by address only: {e}");
            String::new()
        }
    }
}

/// Returns the cursor to use after a response reporting `reported`, or `None`
/// if the index did not change.
fn advance(cursor: u64, reported: u64) -> Option<u64> {
    if reported == cursor {
        None
    } else if reported < cursor {
        Some(0)
    } else {
        Some(reported)
    }
}

/// Issues blocking queries until cancelled, sending each changed result batch.
async fn poll<H: Health>(
    health: H,
    target: Target,
    order: Order,
    tx: Sender<Vec<ServiceEntry>>,
    token: CancellationToken,
) {
    let mut backoff = Backoff::new(MIN_DELAY, target.max_backoff);
    let mut last_index = 0;

    loop {
        let options = QueryOptions::for_target(&target, last_index);
        let query = health.service(
            &target.service,
            target.tag.as_deref(),
            target.healthy,
            &options,
        );

        let result = tokio::select! {
            biased;
            () = token.cancelled() => break,
            result = query => result,
        };

        let (mut entries, meta) = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("couldn't fetch endpoints for {target}: {e}");

                let delay = backoff.next_delay();
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }

                continue;
            }
        };

        backoff.reset();

        let Some(next) = advance(last_index, meta.last_index) else {
            tracing::debug!("no change for {target} at index {last_index}");
            continue;
        };

        if next == 0 {
            tracing::debug!(
                "Consul index went backwards ({} < {last_index}) for {target}, resetting",
                meta.last_index
            );
        }

        last_index = next;

        tracing::debug!(
            "{} endpoints fetched in(+wait) {:?} for {target}",
            entries.len(),
            meta.request_time
        );

        if target.limit != 0 && entries.len() > target.limit {
            entries = order.apply(entries);
            entries.truncate(target.limit);
        }

        tokio::select! {
            biased;
            () = token.cancelled() => break,
            sent = tx.send(entries) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("Consul poller for {target} stopped");
}

/// Publishes ordered snapshots of each batch until cancelled.
async fn publish<S: AddressSink>(
    mut sink: S,
    mut rx: Receiver<Vec<ServiceEntry>>,
    order: Order,
    token: CancellationToken,
) {
    loop {
        let entries = tokio::select! {
            biased;
            () = token.cancelled() => break,
            entries = rx.recv() => match entries {
                Some(entries) => entries,
                None => break,
            },
        };

        let addresses: Vec<Address> = order.apply(entries).iter().map(Address::from).collect();

        let result = tokio::select! {
            biased;
            () = token.cancelled() => break,
            result = sink.update(addresses) => result,
        };

        if let Err(e) = result {
            tracing::warn!("address sink failed, stopping Consul watch: {e}");
            token.cancel();
            break;
        }
    }

    tracing::debug!("Consul watch has been finished");
}
