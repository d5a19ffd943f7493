//! Stable ordering and deduplication of service entries.
//!
//! The same set of instances must always produce the same address list, or the
//! consumer would see churn where nothing changed. Both policies below define a
//! total order over entries and drop repeated addresses, keeping the first one.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::consul::ServiceEntry;

/// How published addresses are ordered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OrderPolicy {
    /// Instances on the same node as the Consul agent first, then all others;
    /// each group sorted by address.
    #[default]
    SameNodeFirst,
    /// All instances sorted by address.
    Address,
}

impl FromStr for OrderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "same-node" => Ok(Self::SameNodeFirst),
            "address" => Ok(Self::Address),
            _ => Err("expected 'same-node' or 'address'".to_string()),
        }
    }
}

impl fmt::Display for OrderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SameNodeFirst => f.write_str("same-node"),
            Self::Address => f.write_str("address"),
        }
    }
}

/// The ordering applied throughout one watch session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Order {
    policy: OrderPolicy,
    agent_node: String,
}

impl Order {
    pub(crate) fn new(policy: OrderPolicy, agent_node: impl Into<String>) -> Self {
        Self {
            policy,
            agent_node: agent_node.into(),
        }
    }

    pub(crate) fn apply(&self, entries: Vec<ServiceEntry>) -> Vec<ServiceEntry> {
        normalize(entries, self.policy, &self.agent_node)
    }
}

/// Sorts `entries` according to `policy` and removes duplicate addresses.
///
/// `agent_node` is the node name of the Consul agent; an empty name means it is
/// unknown and no entry is considered local.
pub(crate) fn normalize(
    entries: Vec<ServiceEntry>,
    policy: OrderPolicy,
    agent_node: &str,
) -> Vec<ServiceEntry> {
    let mut keyed: Vec<(String, ServiceEntry)> =
        entries.into_iter().map(|e| (e.address(), e)).collect();

    match policy {
        OrderPolicy::Address => {
            keyed.sort_by(|(a, x), (b, y)| a.cmp(b).then_with(|| tie_break(x, y)));
        }

        OrderPolicy::SameNodeFirst => keyed.sort_by(|(a, x), (b, y)| {
            let x_local = is_local(x, agent_node);
            let y_local = is_local(y, agent_node);

            y_local
                .cmp(&x_local)
                .then_with(|| a.cmp(b))
                .then_with(|| tie_break(x, y))
        }),
    }

    let mut seen = HashSet::with_capacity(keyed.len());
    keyed
        .into_iter()
        .filter(|(addr, _)| seen.insert(addr.clone()))
        .map(|(_, entry)| entry)
        .collect()
}

fn is_local(entry: &ServiceEntry, agent_node: &str) -> bool {
    !agent_node.is_empty() && entry.node.node == agent_node
}

fn tie_break(x: &ServiceEntry, y: &ServiceEntry) -> Ordering {
    x.service
        .create_index
        .cmp(&y.service.create_index)
        .then_with(|| x.service.modify_index.cmp(&y.service.modify_index))
        .then_with(|| x.node.node.cmp(&y.node.node))
}

#[cfg(test)]
mod tests {
    use crate::consul::{AgentService, Node};

    use super::*;

    fn entry(node: &str, address: &str, port: u16) -> ServiceEntry {
        ServiceEntry {
            node: Node {
                node: node.to_string(),
                ..Default::default()
            },
            service: AgentService {
                address: address.to_string(),
                port,
                ..Default::default()
            },
        }
    }

    fn addresses(entries: &[ServiceEntry]) -> Vec<String> {
        entries.iter().map(ServiceEntry::address).collect()
    }

    #[test]
    fn policy_from_str() {
        assert_eq!("same-node".parse::<OrderPolicy>(), Ok(OrderPolicy::SameNodeFirst));
        assert_eq!("address".parse::<OrderPolicy>(), Ok(OrderPolicy::Address));
        assert!("random".parse::<OrderPolicy>().is_err());
    }

    #[test]
    fn policy_display_round_trips() {
        for policy in [OrderPolicy::SameNodeFirst, OrderPolicy::Address] {
            assert_eq!(policy.to_string().parse::<OrderPolicy>(), Ok(policy));
        }
    }

    // Address policy

    #[test]
    fn address_policy_sorts_ascending() {
        let input = vec![
            entry("node-2", "10.0.0.3", 80),
            entry("node-1", "10.0.0.1", 80),
            entry("node-3", "10.0.0.2", 80),
        ];

        let out = normalize(input, OrderPolicy::Address, "node-3");

        assert_eq!(addresses(&out), vec!["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
    }

    #[test]
    fn address_policy_removes_duplicates() {
        let input = vec![
            entry("node-1", "10.0.0.1", 80),
            entry("node-2", "10.0.0.1", 80),
            entry("node-1", "10.0.0.1", 81),
        ];

        let out = normalize(input, OrderPolicy::Address, "");

        assert_eq!(addresses(&out), vec!["10.0.0.1:80", "10.0.0.1:81"]);
    }

    #[test]
    fn address_policy_ignores_input_order() {
        let base = vec![
            entry("a", "192.168.1.10", 50051),
            entry("b", "192.168.1.2", 50051),
            entry("c", "10.0.0.1", 9000),
            entry("d", "10.0.0.1", 50051),
        ];

        let expected = normalize(base.clone(), OrderPolicy::Address, "");

        let mut rotated = base.clone();
        for _ in 0..base.len() {
            rotated.rotate_left(1);
            assert_eq!(normalize(rotated.clone(), OrderPolicy::Address, ""), expected);
        }

        let mut reversed = base;
        reversed.reverse();
        assert_eq!(normalize(reversed, OrderPolicy::Address, ""), expected);
    }

    #[test]
    fn duplicates_resolve_deterministically() {
        let mut older = entry("node-1", "10.0.0.1", 80);
        older.service.create_index = 5;
        let mut newer = entry("node-2", "10.0.0.1", 80);
        newer.service.create_index = 9;

        let a = normalize(vec![older.clone(), newer.clone()], OrderPolicy::Address, "");
        let b = normalize(vec![newer, older.clone()], OrderPolicy::Address, "");

        assert_eq!(a, vec![older]);
        assert_eq!(a, b);
    }

    #[test]
    fn normalize_is_idempotent() {
        let input = vec![
            entry("node-2", "10.0.0.9", 1),
            entry("node-1", "10.0.0.5", 1),
            entry("node-1", "10.0.0.5", 1),
        ];

        let once = normalize(input, OrderPolicy::SameNodeFirst, "node-1");
        let twice = normalize(once.clone(), OrderPolicy::SameNodeFirst, "node-1");

        assert_eq!(once, twice);
    }

    // Same-node-first policy

    #[test]
    fn same_node_one_service_on_agent_node() {
        let input = vec![entry("node-1", "127.0.0.1", 50051)];
        let out = normalize(input.clone(), OrderPolicy::SameNodeFirst, "node-1");
        assert_eq!(out, input);
    }

    #[test]
    fn same_node_one_service_on_different_node() {
        let input = vec![entry("node-2", "127.0.0.1", 50051)];
        let out = normalize(input.clone(), OrderPolicy::SameNodeFirst, "node-1");
        assert_eq!(out, input);
    }

    #[test]
    fn same_node_two_services_on_agent_node() {
        let input = vec![
            entry("node-1", "227.0.0.1", 50051),
            entry("node-1", "127.0.0.1", 50051),
        ];

        let out = normalize(input, OrderPolicy::SameNodeFirst, "node-1");

        assert_eq!(
            out,
            vec![
                entry("node-1", "127.0.0.1", 50051),
                entry("node-1", "227.0.0.1", 50051),
            ]
        );
    }

    #[test]
    fn same_node_two_services_on_different_nodes() {
        let input = vec![
            entry("node-1", "227.0.0.1", 50051),
            entry("node-2", "127.0.0.1", 50051),
        ];

        let out = normalize(input.clone(), OrderPolicy::SameNodeFirst, "node-1");

        assert_eq!(out, input);
    }

    #[test]
    fn same_node_prefers_agent_node_over_lower_address() {
        let input = vec![
            entry("node-1", "127.0.0.1", 50051),
            entry("node-2", "227.0.0.1", 50051),
        ];

        let out = normalize(input, OrderPolicy::SameNodeFirst, "node-2");

        assert_eq!(addresses(&out), vec!["227.0.0.1:50051", "127.0.0.1:50051"]);
    }

    #[test]
    fn same_node_three_services_on_different_nodes() {
        let input = vec![
            entry("node-1", "192.168.235.110", 50051),
            entry("node-2", "192.168.235.116", 50051),
            entry("node-3", "192.168.235.115", 50051),
        ];

        let out = normalize(input, OrderPolicy::SameNodeFirst, "node-1");

        assert_eq!(
            addresses(&out),
            vec![
                "192.168.235.110:50051",
                "192.168.235.115:50051",
                "192.168.235.116:50051",
            ]
        );
    }

    #[test]
    fn same_node_partitions_before_sorting() {
        let input = vec![
            entry("node-2", "10.0.0.1", 80),
            entry("node-1", "10.0.0.9", 80),
            entry("node-3", "10.0.0.0", 80),
            entry("node-1", "10.0.0.5", 80),
        ];

        let out = normalize(input, OrderPolicy::SameNodeFirst, "node-1");

        assert_eq!(
            addresses(&out),
            vec!["10.0.0.5:80", "10.0.0.9:80", "10.0.0.0:80", "10.0.0.1:80"]
        );
    }

    #[test]
    fn same_node_unknown_agent_sorts_by_address() {
        let input = vec![
            entry("", "10.0.0.2", 80),
            entry("node-1", "10.0.0.1", 80),
        ];

        let out = normalize(input, OrderPolicy::SameNodeFirst, "");

        assert_eq!(addresses(&out), vec!["10.0.0.1:80", "10.0.0.2:80"]);
    }

    #[test]
    fn empty_input() {
        assert!(normalize(Vec::new(), OrderPolicy::SameNodeFirst, "node-1").is_empty());
        assert!(normalize(Vec::new(), OrderPolicy::Address, "").is_empty());
    }
}
