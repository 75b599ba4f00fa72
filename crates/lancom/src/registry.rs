//! Master-side registry of live nodes and the topic, service and
//! subscriber indices derived from their descriptors.
//!
//! Every index entry is owned by exactly one node in `nodes`. Registering a
//! node first withdraws whatever it contributed before, and removing it
//! withdraws everything, so the indices never point at a node the master
//! no longer knows.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{LanComError, Result};
use crate::identity::{ComponentInfo, NodeId, NodeInfo};

/// Topic name to every publisher of it, in registration order.
pub type TopicIndex = HashMap<String, Vec<ComponentInfo>>;

/// A subscriber that must be told about a publisher it has not seen yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberNotice {
    pub subscriber: ComponentInfo,
    pub publisher: ComponentInfo,
}

/// Ping bookkeeping for one registered node.
#[derive(Debug, Clone)]
pub struct Liveness {
    pub last_seen: DateTime<Utc>,
    pub missed_pings: u32,
}

impl Liveness {
    fn fresh() -> Self {
        Self {
            last_seen: Utc::now(),
            missed_pings: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    nodes: HashMap<NodeId, NodeInfo>,
    topics: TopicIndex,
    services: HashMap<String, ComponentInfo>,
    subscribers: HashMap<String, Vec<ComponentInfo>>,
    liveness: HashMap<NodeId, Liveness>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a node descriptor, replacing any earlier registration of the
    /// same node. Returns the subscribers of other nodes that should be
    /// pointed at the publishers this node brings.
    pub fn register(&mut self, info: NodeInfo) -> Vec<SubscriberNotice> {
        let id = info.node_id.clone();
        if self.nodes.contains_key(&id) {
            info!("Node {} ({id}) re-registered", info.name);
            self.withdraw(&id);
        } else {
            info!("Node {} ({id}) registered from {}", info.name, info.ip);
        }

        let mut notices = Vec::new();
        for topic in &info.topic_list {
            if let Some(subs) = self.subscribers.get(&topic.name) {
                notices.extend(subs.iter().filter(|s| s.node_id != id).map(|s| SubscriberNotice {
                    subscriber: s.clone(),
                    publisher: topic.clone(),
                }));
            }
            self.topics
                .entry(topic.name.clone())
                .or_default()
                .push(topic.clone());
        }

        for service in &info.service_list {
            if let Some(previous) = self.services.insert(service.name.clone(), service.clone()) {
                if previous.node_id != id {
                    warn!(
                        "Service {} moved from node {} to node {id}",
                        service.name, previous.node_id
                    );
                }
            }
        }

        for subscriber in &info.subscriber_list {
            self.subscribers
                .entry(subscriber.name.clone())
                .or_default()
                .push(subscriber.clone());
        }

        self.liveness.insert(id.clone(), Liveness::fresh());
        self.nodes.insert(id, info);
        notices
    }

    /// Forget a node and everything it contributed.
    pub fn remove(&mut self, id: &NodeId) -> Result<NodeInfo> {
        let Some(info) = self.nodes.remove(id) else {
            warn!("Cannot remove unknown node {id}");
            return Err(LanComError::NodeNotFound(id.to_string()));
        };
        self.withdraw(id);
        self.liveness.remove(id);
        info!("Node {} ({id}) removed", info.name);
        Ok(info)
    }

    /// Strip a node's entries from every index. Services count as the
    /// node's only while it is still their registered owner.
    fn withdraw(&mut self, id: &NodeId) {
        fn strip(index: &mut HashMap<String, Vec<ComponentInfo>>, id: &NodeId) {
            index.retain(|_, entries| {
                entries.retain(|c| &c.node_id != id);
                !entries.is_empty()
            });
        }
        strip(&mut self.topics, id);
        strip(&mut self.subscribers, id);
        self.services.retain(|_, c| &c.node_id != id);
        debug!("Withdrew index entries of node {id}");
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.get(id)
    }

    /// Descriptor of the node currently offering `name`.
    pub fn lookup_service(&self, name: &str) -> Option<NodeInfo> {
        self.services
            .get(name)
            .and_then(|c| self.nodes.get(&c.node_id))
            .cloned()
    }

    /// Descriptor of the first node that registered a publisher of `name`.
    pub fn lookup_topic(&self, name: &str) -> Option<NodeInfo> {
        self.topics
            .get(name)
            .and_then(|publishers| publishers.first())
            .and_then(|c| self.nodes.get(&c.node_id))
            .cloned()
    }

    pub fn snapshot_topics(&self) -> TopicIndex {
        self.topics.clone()
    }

    pub fn all_nodes(&self) -> HashMap<NodeId, NodeInfo> {
        self.nodes.clone()
    }

    pub fn all_services(&self) -> HashMap<String, ComponentInfo> {
        self.services.clone()
    }

    pub fn all_subscribers(&self) -> HashMap<String, Vec<ComponentInfo>> {
        self.subscribers.clone()
    }

    // -- Liveness -----------------------------------------------------------

    /// Control endpoints of every registered node.
    pub fn ping_targets(&self) -> Vec<(NodeId, SocketAddr)> {
        self.nodes
            .iter()
            .map(|(id, info)| (id.clone(), info.control_addr()))
            .collect()
    }

    /// Record the outcome of one ping. Returns the node's consecutive miss
    /// count, or `None` if the node is no longer registered.
    pub fn record_ping(&mut self, id: &NodeId, answered: bool) -> Option<u32> {
        let entry = self.liveness.get_mut(id)?;
        if answered {
            entry.last_seen = Utc::now();
            entry.missed_pings = 0;
        } else {
            entry.missed_pings += 1;
        }
        Some(entry.missed_pings)
    }

    pub fn liveness(&self, id: &NodeId) -> Option<&Liveness> {
        self.liveness.get(id)
    }

    /// Nodes that missed at least `max_missed` pings in a row. Empty when
    /// `max_missed` is `0`.
    pub fn stale_nodes(&self, max_missed: u32) -> Vec<NodeId> {
        if max_missed == 0 {
            return Vec::new();
        }
        self.liveness
            .iter()
            .filter(|(_, l)| l.missed_pings >= max_missed)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ComponentKind;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    fn node(name: &str, last_octet: u8) -> NodeInfo {
        let mut info = NodeInfo::new(name, Ipv4Addr::new(192, 168, 1, last_octet));
        info.control_port = 50000 + u16::from(last_octet);
        info.topic_port = 51000 + u16::from(last_octet);
        info.service_port = 52000 + u16::from(last_octet);
        info
    }

    fn declare(info: &mut NodeInfo, kind: ComponentKind, name: &str) {
        let component = info.component(kind, name);
        match kind {
            ComponentKind::Publisher => info.topic_list.push(component),
            ComponentKind::Service => info.service_list.push(component),
            ComponentKind::Subscriber => info.subscriber_list.push(component),
        }
    }

    /// No index entry may name a node the registry does not hold, and no
    /// index key may map to an empty list.
    fn assert_consistent(registry: &Registry) {
        for entries in registry.topics.values().chain(registry.subscribers.values()) {
            assert!(!entries.is_empty());
            for c in entries {
                let owner = registry.nodes.get(&c.node_id).expect("dangling index entry");
                assert!(owner.declares(c.kind, &c.name));
            }
        }
        for c in registry.services.values() {
            assert!(registry.nodes.contains_key(&c.node_id));
        }
        let tracked: HashSet<&NodeId> = registry.liveness.keys().collect();
        let live: HashSet<&NodeId> = registry.nodes.keys().collect();
        assert_eq!(tracked, live);
    }

    #[test]
    fn test_register_indexes_everything() {
        let mut registry = Registry::new();
        let mut a = node("a", 2);
        declare(&mut a, ComponentKind::Publisher, "temp");
        declare(&mut a, ComponentKind::Service, "echo");
        declare(&mut a, ComponentKind::Subscriber, "cmd");
        let id = a.node_id.clone();

        assert!(registry.register(a).is_empty());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup_topic("temp").unwrap().node_id, id);
        assert_eq!(registry.lookup_service("echo").unwrap().node_id, id);
        assert_eq!(registry.all_subscribers()["cmd"].len(), 1);
        assert_consistent(&registry);
    }

    #[test]
    fn test_remove_withdraws_every_contribution() {
        let mut registry = Registry::new();
        let mut a = node("a", 2);
        declare(&mut a, ComponentKind::Publisher, "temp");
        declare(&mut a, ComponentKind::Service, "echo");
        let mut b = node("b", 3);
        declare(&mut b, ComponentKind::Publisher, "temp");
        declare(&mut b, ComponentKind::Subscriber, "temp");
        let (a_id, b_id) = (a.node_id.clone(), b.node_id.clone());
        registry.register(a);
        registry.register(b);

        let removed = registry.remove(&a_id).unwrap();
        assert_eq!(removed.name, "a");
        assert!(registry.lookup_service("echo").is_none());
        assert_eq!(registry.snapshot_topics()["temp"].len(), 1);
        assert_eq!(registry.lookup_topic("temp").unwrap().node_id, b_id);
        assert_consistent(&registry);

        registry.remove(&b_id).unwrap();
        assert!(registry.is_empty());
        assert!(registry.snapshot_topics().is_empty());
        assert!(registry.all_subscribers().is_empty());
    }

    #[test]
    fn test_remove_unknown_node() {
        let mut registry = Registry::new();
        let result = registry.remove(&NodeId::from_string("ghost"));
        assert!(matches!(result, Err(LanComError::NodeNotFound(id)) if id == "ghost"));
    }

    #[test]
    fn test_reregistration_is_idempotent() {
        let mut registry = Registry::new();
        let mut a = node("a", 2);
        declare(&mut a, ComponentKind::Publisher, "temp");
        declare(&mut a, ComponentKind::Subscriber, "cmd");
        registry.register(a.clone());
        let topics = registry.snapshot_topics();
        let subscribers = registry.all_subscribers();

        registry.register(a.clone());
        registry.register(a);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot_topics(), topics);
        assert_eq!(registry.all_subscribers(), subscribers);
        assert_consistent(&registry);
    }

    #[test]
    fn test_reregistration_drops_undeclared_entries() {
        let mut registry = Registry::new();
        let mut a = node("a", 2);
        declare(&mut a, ComponentKind::Publisher, "temp");
        registry.register(a.clone());

        a.topic_list.clear();
        declare(&mut a, ComponentKind::Publisher, "humidity");
        registry.register(a);
        assert!(registry.lookup_topic("temp").is_none());
        assert!(registry.lookup_topic("humidity").is_some());
        assert_consistent(&registry);
    }

    #[test]
    fn test_service_last_registration_wins() {
        let mut registry = Registry::new();
        let mut a = node("a", 2);
        declare(&mut a, ComponentKind::Service, "echo");
        let mut b = node("b", 3);
        declare(&mut b, ComponentKind::Service, "echo");
        let (a_id, b_id) = (a.node_id.clone(), b.node_id.clone());

        registry.register(a);
        registry.register(b);
        assert_eq!(registry.all_services().len(), 1);
        assert_eq!(registry.lookup_service("echo").unwrap().node_id, b_id);

        // The earlier owner leaving does not take the service with it.
        registry.remove(&a_id).unwrap();
        assert_eq!(registry.lookup_service("echo").unwrap().node_id, b_id);
        assert_consistent(&registry);
    }

    #[test]
    fn test_new_publisher_notifies_other_subscribers() {
        let mut registry = Registry::new();
        let mut listener = node("listener", 2);
        declare(&mut listener, ComponentKind::Subscriber, "temp");
        registry.register(listener.clone());

        let mut sensor = node("sensor", 3);
        declare(&mut sensor, ComponentKind::Publisher, "temp");
        declare(&mut sensor, ComponentKind::Subscriber, "temp");
        let notices = registry.register(sensor.clone());

        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].subscriber.node_id, listener.node_id);
        assert_eq!(notices[0].subscriber.addr(), listener.control_addr());
        assert_eq!(notices[0].publisher.addr(), sensor.topic_addr());
    }

    #[test]
    fn test_liveness_tracking() {
        let mut registry = Registry::new();
        let a = node("a", 2);
        let id = a.node_id.clone();
        registry.register(a);
        assert_eq!(registry.ping_targets().len(), 1);

        assert_eq!(registry.record_ping(&id, false), Some(1));
        assert_eq!(registry.record_ping(&id, false), Some(2));
        assert!(registry.stale_nodes(3).is_empty());
        assert_eq!(registry.record_ping(&id, false), Some(3));
        assert_eq!(registry.stale_nodes(3), vec![id.clone()]);
        assert!(registry.stale_nodes(0).is_empty());

        assert_eq!(registry.record_ping(&id, true), Some(0));
        assert!(registry.stale_nodes(3).is_empty());

        registry.remove(&id).unwrap();
        assert_eq!(registry.record_ping(&id, true), None);
    }

    #[test]
    fn test_random_operation_sequences_stay_consistent() {
        let topics = ["temp", "humidity", "cmd"];
        let mut seed: u64 = 0x5eed;
        let mut next = move |bound: usize| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((seed >> 33) as usize) % bound
        };

        let mut pool: Vec<NodeInfo> = (0..5).map(|i| node(&format!("n{i}"), 10 + i)).collect();
        let mut registry = Registry::new();
        for _ in 0..300 {
            let i = next(pool.len());
            match next(4) {
                0 => {
                    let _ = registry.remove(&pool[i].node_id);
                }
                op => {
                    let kind = match op {
                        1 => ComponentKind::Publisher,
                        2 => ComponentKind::Subscriber,
                        _ => ComponentKind::Service,
                    };
                    let name = topics[next(topics.len())];
                    if !pool[i].declares(kind, name) {
                        declare(&mut pool[i], kind, name);
                    }
                    registry.register(pool[i].clone());
                }
            }
            assert_consistent(&registry);
        }
    }
}
