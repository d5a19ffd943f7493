//! Consumers of address snapshots.
//!
//! Every update hands the sink the complete, ordered address list; it replaces
//! whatever the sink held before. [`BalanceChannel`] adapts that model to a
//! Tonic balance channel, which expects incremental `Change` events.

use std::collections::HashSet;
use std::future::Future;

use tokio::sync::{mpsc, watch};
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::consul::ServiceEntry;
use crate::error::{Error, Result};

/// A resolved endpoint address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    /// `host:port` of the endpoint.
    pub addr: String,
    /// Raft index at which the service registration was created.
    pub create_index: u64,
    /// Raft index at which the service registration was last modified.
    pub modify_index: u64,
}

impl From<&ServiceEntry> for Address {
    fn from(entry: &ServiceEntry) -> Self {
        Self {
            addr: entry.address(),
            create_index: entry.service.create_index,
            modify_index: entry.service.modify_index,
        }
    }
}

/// Receives address snapshots from a watch.
pub trait AddressSink: Send + 'static {
    /// Replaces the current address set with `addresses`.
    ///
    /// Returning an error stops the watch; use [`Error::SinkClosed`] when the
    /// consumer has gone away.
    ///
    /// Stopping the watch drops an update that is still pending, so a snapshot
    /// should only become visible to the consumer once it has been applied in
    /// full.
    fn update(&mut self, addresses: Vec<Address>) -> impl Future<Output = Result<()>> + Send;
}

impl AddressSink for mpsc::Sender<Vec<Address>> {
    async fn update(&mut self, addresses: Vec<Address>) -> Result<()> {
        self.send(addresses).await.map_err(|_| Error::SinkClosed)
    }
}

impl AddressSink for watch::Sender<Vec<Address>> {
    async fn update(&mut self, addresses: Vec<Address>) -> Result<()> {
        self.send(addresses).map_err(|_| Error::SinkClosed)
    }
}

/// Feeds snapshots into a Tonic balance channel.
///
/// Addresses that appear in a snapshot are inserted with an [`Endpoint`] from
/// the build function; addresses missing from it are removed.
///
/// An update waits until the channel has room for all of its changes and then
/// sends them at once, so dropping the update future leaves the channel on the
/// previous snapshot. A diff larger than the channel capacity is sent in
/// capacity-sized batches instead.
pub struct BalanceChannel<F> {
    tx: mpsc::Sender<Change<String, Endpoint>>,
    build: F,
    known: HashSet<String>,
}

impl<F> BalanceChannel<F>
where
    F: Fn(&str) -> Endpoint + Send + 'static,
{
    /// Wraps the sender returned by `Channel::balance_channel()`.
    pub fn new(tx: mpsc::Sender<Change<String, Endpoint>>, build: F) -> Self {
        Self {
            tx,
            build,
            known: HashSet::new(),
        }
    }
}

impl<F> AddressSink for BalanceChannel<F>
where
    F: Fn(&str) -> Endpoint + Send + 'static,
{
    async fn update(&mut self, addresses: Vec<Address>) -> Result<()> {
        let actions = diff(&self.known, &addresses);

        for batch in actions.chunks(self.tx.max_capacity().max(1)) {
            let Ok(permits) = self.tx.reserve_many(batch.len()).await else {
                tracing::warn!("balance channel closed");
                return Err(Error::SinkClosed);
            };

            for (permit, action) in permits.zip(batch) {
                permit.send(self.change(action));
                action.commit(&mut self.known);
            }
        }

        tracing::debug!("Consul discovery: {} endpoints", self.known.len());
        Ok(())
    }
}

impl<F> BalanceChannel<F>
where
    F: Fn(&str) -> Endpoint + Send + 'static,
{
    fn change(&self, action: &EndpointAction) -> Change<String, Endpoint> {
        match action {
            EndpointAction::Insert(addr) => Change::Insert(addr.clone(), (self.build)(addr)),
            EndpointAction::Remove(addr) => Change::Remove(addr.clone()),
        }
    }
}

/// Represents an endpoint change action.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EndpointAction {
    Insert(String),
    Remove(String),
}

impl EndpointAction {
    /// Records a sent change in the set of known endpoints.
    fn commit(&self, known: &mut HashSet<String>) {
        match self {
            Self::Insert(addr) => {
                tracing::debug!("added endpoint: {addr}");
                known.insert(addr.clone());
            }
            Self::Remove(addr) => {
                tracing::debug!("removed endpoint: {addr}");
                known.remove(addr);
            }
        }
    }
}

/// Turns a snapshot into the changes needed to move from `known` to it.
///
/// Inserts come first, in snapshot order, so the channel never drops to zero
/// endpoints while one set replaces another.
fn diff(known: &HashSet<String>, addresses: &[Address]) -> Vec<EndpointAction> {
    let mut actions = Vec::new();
    let mut current = HashSet::with_capacity(addresses.len());

    for address in addresses {
        let addr = address.addr.as_str();
        if current.insert(addr) && !known.contains(addr) {
            actions.push(EndpointAction::Insert(addr.to_string()));
        }
    }

    let mut removed: Vec<&String> = known
        .iter()
        .filter(|addr| !current.contains(addr.as_str()))
        .collect();
    removed.sort();

    actions.extend(removed.into_iter().cloned().map(EndpointAction::Remove));
    actions
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::consul::{AgentService, Node};

    use super::*;

    fn address(addr: &str) -> Address {
        Address {
            addr: addr.to_string(),
            create_index: 0,
            modify_index: 0,
        }
    }

    fn endpoint(addr: &str) -> Endpoint {
        Endpoint::from_shared(format!("http://{addr}")).unwrap()
    }

    #[test]
    fn address_from_entry_keeps_indexes() {
        let entry = ServiceEntry {
            node: Node::default(),
            service: AgentService {
                address: "10.0.0.1".to_string(),
                port: 50051,
                create_index: 100,
                modify_index: 101,
            },
        };

        assert_eq!(
            Address::from(&entry),
            Address {
                addr: "10.0.0.1:50051".to_string(),
                create_index: 100,
                modify_index: 101,
            }
        );
    }

    // diff tests

    #[test]
    fn diff_inserts_new_endpoints() {
        let known = HashSet::new();
        let actions = diff(&known, &[address("10.0.0.1:80"), address("10.0.0.2:80")]);

        assert_eq!(
            actions,
            vec![
                EndpointAction::Insert("10.0.0.1:80".to_string()),
                EndpointAction::Insert("10.0.0.2:80".to_string()),
            ]
        );
    }

    #[test]
    fn diff_skips_known_endpoints() {
        let known = HashSet::from(["10.0.0.1:80".to_string()]);
        let actions = diff(&known, &[address("10.0.0.1:80"), address("10.0.0.2:80")]);

        assert_eq!(actions, vec![EndpointAction::Insert("10.0.0.2:80".to_string())]);
    }

    #[test]
    fn diff_inserts_repeated_address_once() {
        let known = HashSet::new();
        let actions = diff(&known, &[address("10.0.0.1:80"), address("10.0.0.1:80")]);

        assert_eq!(actions, vec![EndpointAction::Insert("10.0.0.1:80".to_string())]);
    }

    #[test]
    fn diff_removes_vanished_endpoints_after_inserts() {
        let known = HashSet::from(["10.0.0.1:80".to_string(), "10.0.0.2:80".to_string()]);
        let actions = diff(&known, &[address("10.0.0.3:80")]);

        assert_eq!(
            actions,
            vec![
                EndpointAction::Insert("10.0.0.3:80".to_string()),
                EndpointAction::Remove("10.0.0.1:80".to_string()),
                EndpointAction::Remove("10.0.0.2:80".to_string()),
            ]
        );
    }

    #[test]
    fn diff_empty_snapshot_removes_everything() {
        let known = HashSet::from(["10.0.0.1:80".to_string()]);
        let actions = diff(&known, &[]);

        assert_eq!(actions, vec![EndpointAction::Remove("10.0.0.1:80".to_string())]);
    }

    #[test]
    fn diff_unchanged_snapshot_is_silent() {
        let known = HashSet::from(["10.0.0.1:80".to_string()]);
        let actions = diff(&known, &[address("10.0.0.1:80")]);

        assert!(actions.is_empty());
    }

    #[test]
    fn commit_tracks_known_endpoints() {
        let mut known = HashSet::from(["10.0.0.1:80".to_string()]);

        EndpointAction::Insert("10.0.0.2:80".to_string()).commit(&mut known);
        EndpointAction::Remove("10.0.0.1:80".to_string()).commit(&mut known);

        assert_eq!(known, HashSet::from(["10.0.0.2:80".to_string()]));
    }

    // BalanceChannel tests

    #[tokio::test]
    async fn balance_channel_sends_changes() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut sink = BalanceChannel::new(tx, endpoint);

        sink.update(vec![address("10.0.0.1:80"), address("10.0.0.2:80")])
            .await
            .unwrap();
        sink.update(vec![address("10.0.0.2:80")]).await.unwrap();

        let mut inserted = Vec::new();
        let mut removed = Vec::new();
        while let Ok(change) = rx.try_recv() {
            match change {
                Change::Insert(addr, _) => inserted.push(addr),
                Change::Remove(addr) => removed.push(addr),
            }
        }

        assert_eq!(inserted, vec!["10.0.0.1:80", "10.0.0.2:80"]);
        assert_eq!(removed, vec!["10.0.0.1:80"]);
    }

    fn drain(rx: &mut mpsc::Receiver<Change<String, Endpoint>>) -> Vec<String> {
        let mut changes = Vec::new();
        while let Ok(change) = rx.try_recv() {
            changes.push(match change {
                Change::Insert(addr, _) => format!("+{addr}"),
                Change::Remove(addr) => format!("-{addr}"),
            });
        }
        changes
    }

    #[tokio::test]
    async fn cancelled_update_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(3);
        let mut sink = BalanceChannel::new(tx, endpoint);

        sink.update(vec![address("10.0.0.1:80"), address("10.0.0.2:80")])
            .await
            .unwrap();

        // Three changes with one free slot: the update waits for room.
        let next = vec![address("10.0.0.3:80")];
        let pending = tokio::time::timeout(Duration::from_millis(10), sink.update(next.clone()));
        assert!(pending.await.is_err());

        assert_eq!(drain(&mut rx), vec!["+10.0.0.1:80", "+10.0.0.2:80"]);
        assert_eq!(sink.known.len(), 2);

        // Retrying after the consumer caught up sends the whole diff.
        sink.update(next).await.unwrap();
        assert_eq!(drain(&mut rx), vec!["+10.0.0.3:80", "-10.0.0.1:80", "-10.0.0.2:80"]);
        assert_eq!(sink.known, HashSet::from(["10.0.0.3:80".to_string()]));
    }

    #[tokio::test]
    async fn diff_larger_than_capacity_is_sent_in_batches() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = BalanceChannel::new(tx, endpoint);

        let consumer = tokio::spawn(async move {
            let mut inserted = Vec::new();
            while let Some(change) = rx.recv().await {
                if let Change::Insert(addr, _) = change {
                    inserted.push(addr);
                }
            }
            inserted
        });

        sink.update(vec![
            address("10.0.0.1:80"),
            address("10.0.0.2:80"),
            address("10.0.0.3:80"),
        ])
        .await
        .unwrap();
        drop(sink);

        assert_eq!(consumer.await.unwrap(), vec!["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
    }

    #[tokio::test]
    async fn balance_channel_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let mut sink = BalanceChannel::new(tx, endpoint);
        let result = sink.update(vec![address("10.0.0.1:80")]).await;

        assert!(matches!(result, Err(Error::SinkClosed)));
    }

    #[tokio::test]
    async fn mpsc_sender_sink_forwards_snapshots() {
        let (mut tx, mut rx) = mpsc::channel::<Vec<Address>>(1);

        tx.update(vec![address("10.0.0.1:80")]).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), vec![address("10.0.0.1:80")]);
    }

    #[tokio::test]
    async fn watch_sender_sink_replaces_value() {
        let (mut tx, rx) = watch::channel::<Vec<Address>>(Vec::new());

        tx.update(vec![address("10.0.0.1:80")]).await.unwrap();
        tx.update(vec![address("10.0.0.2:80")]).await.unwrap();

        assert_eq!(*rx.borrow(), vec![address("10.0.0.2:80")]);
    }

    #[tokio::test]
    async fn watch_sender_sink_without_receivers_is_closed() {
        let (mut tx, rx) = watch::channel::<Vec<Address>>(Vec::new());
        drop(rx);

        assert!(matches!(tx.update(Vec::new()).await, Err(Error::SinkClosed)));
    }
}
