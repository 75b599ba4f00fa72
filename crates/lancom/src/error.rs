//! Error types shared by master and peer nodes.

use std::time::Duration;

/// Errors that can occur in the lancom crate.
#[derive(Debug, thiserror::Error)]
pub enum LanComError {
    /// No master beacon arrived within the discovery window.
    #[error("Master node not found after {0:?}")]
    MasterNotFound(Duration),

    /// Work was submitted to an event loop that is not (or no longer) running.
    #[error("Event loop is not running")]
    LoopNotRunning,

    /// A blocking submission was made from the loop's own thread.
    #[error("Cannot block on the event loop from inside it")]
    BlockingOnLoop,

    /// A second peer node was constructed while the slot was still held.
    #[error("A LanCom node already exists in this process")]
    DuplicateNode,

    /// The dispatcher received a request for a name with no callback.
    #[error("Service not registered: {0}")]
    ServiceNotRegistered(String),

    /// A service callback gave up waiting on something it depends on.
    #[error("Callback timed out: {0}")]
    CallbackTimeout(String),

    /// A service callback failed.
    #[error("Callback failed: {0}")]
    Callback(String),

    /// The registry has no node with this id.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// A topic or service name is empty or contains the envelope separator.
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// A name was declared twice on the same node.
    #[error("{0} is already declared on this node")]
    AlreadyDeclared(String),

    /// A streamer was asked for a rate of zero messages per second.
    #[error("Stream rate must be at least 1 fps")]
    InvalidRate,

    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote side broke the request/reply or framing protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote service answered with a typed `ERROR` reply.
    #[error("Remote service {0} replied with ERROR")]
    RemoteError(String),

    /// The remote service answered with a typed `TIMEOUT` reply.
    #[error("Remote service {0} replied with TIMEOUT")]
    RemoteTimeout(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LanComError>;
