//! LanCom: broker-less publish/subscribe and RPC for nodes on one LAN.
//!
//! A single [`MasterNode`] keeps the registry of which node publishes which
//! topic and offers which service. Peer nodes ([`LanComNode`]) find it
//! through a UDP beacon, register, and then talk to each other directly:
//! topic data and service calls never pass through the master.
//!
//! # Architecture
//!
//! - **Transport**: four WebSocket socket roles (request, reply, publish,
//!   subscribe) carrying multipart byte messages.
//! - **Discovery**: the master broadcasts `LancomMaster|version|id|ip` on the
//!   discovery port; peers listen once at startup.
//! - **Dispatch**: every reply endpoint (master protocol, peer control,
//!   user services) is served by the same name → callback [`Dispatcher`].
//! - **Runtime**: each node runs one single-threaded event loop; blocking
//!   callers hand work to it through [`EventLoop`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::net::Ipv4Addr;
//! use lancom::{LanComConfig, LanComNode, blocking_service_fn};
//!
//! # fn example() -> lancom::Result<()> {
//! let node = LanComNode::new("sensor", Ipv4Addr::new(192, 168, 1, 20), LanComConfig::default())?;
//! let temp = node.create_publisher("temp")?;
//! node.create_service("echo", blocking_service_fn(Ok))?;
//! temp.publish_str("21.5")?;
//! node.spin();
//! # Ok(())
//! # }
//! ```

pub mod component;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod logging;
pub mod master;
pub mod message;
pub mod node;
pub mod registry;
pub mod runtime;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use component::{Publisher, Service, Streamer, Subscriber};
pub use config::LanComConfig;
pub use dispatcher::{
    Dispatcher, ServiceCallback, blocking_service_fn, json_service_fn, service_fn, str_service_fn,
};
pub use error::{LanComError, Result};
pub use identity::{ComponentInfo, ComponentKind, NodeId, NodeInfo};
pub use master::MasterNode;
pub use node::{LanComNode, NodeSlot, NodeState};
pub use registry::Registry;
pub use runtime::{EventLoop, TaskHandle};
