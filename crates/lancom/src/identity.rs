//! Node identity and the self-describing records exchanged with the master.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};

/// A unique identifier for one node instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generate a new random node ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a NodeId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a [`ComponentInfo`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentKind {
    /// A topic published by the owning node.
    Publisher,
    /// A subscription interest of the owning node.
    Subscriber,
    /// A request/reply service hosted by the owning node.
    Service,
}

/// One published topic, offered service or subscription of a node.
///
/// `ip`/`port` point at the endpoint that matters for the kind: the topic
/// port for publishers, the service port for services and the control port
/// for subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub name: String,
    #[serde(rename = "componentID")]
    pub component_id: String,
    #[serde(rename = "nodeID")]
    pub node_id: NodeId,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl ComponentInfo {
    /// Socket address of the endpoint this component lives on.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

/// Full self-description of a node, sent to the master on registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub name: String,
    #[serde(rename = "nodeID")]
    pub node_id: NodeId,
    pub ip: Ipv4Addr,
    #[serde(rename = "type")]
    pub node_type: String,
    pub control_port: u16,
    pub topic_port: u16,
    pub topic_list: Vec<ComponentInfo>,
    pub service_port: u16,
    pub service_list: Vec<ComponentInfo>,
    pub subscriber_list: Vec<ComponentInfo>,
}

impl NodeInfo {
    /// A descriptor with a fresh id, no bound ports and empty lists.
    pub fn new(name: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            node_id: NodeId::generate(),
            ip,
            node_type: "LanComNode".to_string(),
            control_port: 0,
            topic_port: 0,
            topic_list: Vec::new(),
            service_port: 0,
            service_list: Vec::new(),
            subscriber_list: Vec::new(),
        }
    }

    /// Build a component descriptor owned by this node. The port is chosen
    /// from the endpoint matching `kind`.
    pub fn component(&self, kind: ComponentKind, name: impl Into<String>) -> ComponentInfo {
        let port = match kind {
            ComponentKind::Publisher => self.topic_port,
            ComponentKind::Service => self.service_port,
            ComponentKind::Subscriber => self.control_port,
        };
        ComponentInfo {
            name: name.into(),
            component_id: uuid::Uuid::new_v4().to_string(),
            node_id: self.node_id.clone(),
            kind,
            ip: self.ip,
            port,
        }
    }

    /// The component list holding entries of `kind`.
    pub fn components(&self, kind: ComponentKind) -> &[ComponentInfo] {
        match kind {
            ComponentKind::Publisher => &self.topic_list,
            ComponentKind::Service => &self.service_list,
            ComponentKind::Subscriber => &self.subscriber_list,
        }
    }

    /// Whether a component of `kind` named `name` is already declared.
    pub fn declares(&self, kind: ComponentKind, name: &str) -> bool {
        self.components(kind).iter().any(|c| c.name == name)
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.control_port))
    }

    pub fn service_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.service_port))
    }

    pub fn topic_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.topic_port))
    }
}
