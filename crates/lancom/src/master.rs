//! The master node: registry owner, beacon broadcaster and answer desk for
//! the registration protocol.
//!
//! [`MasterNode`] runs on its own [`EventLoop`] and drives four tasks:
//! - the protocol dispatcher on the master service port
//! - the UDP discovery beacon
//! - the liveness publisher (its id on the master topic port)
//! - the eviction sweep that pings registered nodes

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};

use crate::config::{BEACON_TAG, LanComConfig};
use crate::discovery::{self, Beacon};
use crate::dispatcher::{Dispatcher, ServiceCallback, ServiceTable, service_fn};
use crate::error::{LanComError, Result};
use crate::identity::{NodeId, NodeInfo};
use crate::message::{MasterRequest, NodeRequest, Request, ResponseCode};
use crate::registry::{Registry, SubscriberNotice};
use crate::runtime::EventLoop;
use crate::transport::{self, PublishSocket, ReplySocket};

/// State shared by the master's handlers and background tasks.
struct MasterShared {
    id: NodeId,
    config: LanComConfig,
    registry: RwLock<Registry>,
}

/// A running master node.
pub struct MasterNode {
    shared: Arc<MasterShared>,
    ip: Ipv4Addr,
    event_loop: EventLoop,
    service_addr: SocketAddr,
    topic_addr: SocketAddr,
}

impl MasterNode {
    /// Bind the master endpoints on `ip` and start broadcasting.
    pub fn start(ip: Ipv4Addr, config: LanComConfig) -> Result<Self> {
        let shared = Arc::new(MasterShared {
            id: NodeId::generate(),
            config,
            registry: RwLock::new(Registry::new()),
        });
        let event_loop = EventLoop::start("master")?;

        let startup = {
            let shared = Arc::clone(&shared);
            let handle = event_loop.clone();
            event_loop.submit_and_wait(async move { Self::launch(shared, ip, handle).await })
        };
        let (service_addr, topic_addr) = match startup.and_then(|bound| bound) {
            Ok(addrs) => addrs,
            Err(e) => {
                error!("Master failed to start: {e}");
                event_loop.stop();
                return Err(e);
            }
        };

        info!(
            "Master {} serving on {service_addr}, liveness on {topic_addr}",
            shared.id
        );
        Ok(Self {
            shared,
            ip,
            event_loop,
            service_addr,
            topic_addr,
        })
    }

    /// Runs on the loop: bind sockets and spawn the background tasks.
    async fn launch(
        shared: Arc<MasterShared>,
        ip: Ipv4Addr,
        event_loop: EventLoop,
    ) -> Result<(SocketAddr, SocketAddr)> {
        let config = &shared.config;
        let shutdown = event_loop.shutdown_signal();
        let service_socket =
            ReplySocket::bind(SocketAddr::V4(SocketAddrV4::new(ip, config.master_service_port)))
                .await?;
        let publisher =
            PublishSocket::bind(SocketAddr::V4(SocketAddrV4::new(ip, config.master_topic_port)))
                .await?;
        let addrs = (service_socket.local_addr(), publisher.local_addr());

        let dispatcher = Dispatcher::new(
            "master",
            Arc::new(SyncRwLock::new(protocol_table(&shared))),
        );
        tokio::spawn(dispatcher.serve(service_socket, shutdown.clone()));

        let beacon = Beacon::new(shared.id.clone(), ip);
        let (port, interval) = (config.discovery_port, config.broadcast_interval);
        let beacon_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = discovery::run_beacon(beacon, port, interval, beacon_shutdown).await {
                error!("Beacon stopped: {e}");
                event_loop.request_stop();
            }
        });

        tokio::spawn(publish_liveness(
            Arc::clone(&shared),
            publisher,
            shutdown.clone(),
        ));

        if config.eviction_enabled() {
            tokio::spawn(eviction_sweep(Arc::clone(&shared), shutdown));
        }
        Ok(addrs)
    }

    pub fn id(&self) -> &NodeId {
        &self.shared.id
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn config(&self) -> &LanComConfig {
        &self.shared.config
    }

    /// Address of the protocol endpoint.
    pub fn service_addr(&self) -> SocketAddr {
        self.service_addr
    }

    /// Address the master publishes its id on.
    pub fn topic_addr(&self) -> SocketAddr {
        self.topic_addr
    }

    pub fn is_running(&self) -> bool {
        self.event_loop.is_running()
    }

    /// Copy of every registered node descriptor.
    pub fn nodes_snapshot(&self) -> Result<Vec<NodeInfo>> {
        let shared = Arc::clone(&self.shared);
        self.event_loop.submit_and_wait(async move {
            shared.registry.read().await.all_nodes().into_values().collect()
        })
    }

    /// Block until the master stops. Ctrl-C stops it.
    pub fn spin(&self) {
        let stopper = self.event_loop.clone();
        let ctrl_c = self.event_loop.submit_detached(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping master");
                stopper.request_stop();
            }
        });
        if let Err(e) = ctrl_c {
            debug!("Master already stopped: {e}");
        }
        self.event_loop.wait();
    }

    /// Stop every master task and wait for the loop to exit.
    pub fn stop(&self) {
        if self.event_loop.is_running() {
            info!("Stopping master {}", self.shared.id);
        }
        self.event_loop.stop();
    }
}

impl Drop for MasterNode {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Protocol handlers
// ---------------------------------------------------------------------------

fn protocol_table(shared: &Arc<MasterShared>) -> ServiceTable {
    let mut table = ServiceTable::new();
    table.register(MasterRequest::Ping.tag(), ping_handler());
    table.register(MasterRequest::RegisterNode.tag(), register_handler(Arc::clone(shared)));
    table.register(MasterRequest::NodeOffline.tag(), offline_handler(Arc::clone(shared)));
    table.register(MasterRequest::GetNodesInfo.tag(), nodes_info_handler(Arc::clone(shared)));
    table.register(
        MasterRequest::LookupService.tag(),
        lookup_handler(Arc::clone(shared), Registry::lookup_service),
    );
    table.register(
        MasterRequest::LookupTopic.tag(),
        lookup_handler(Arc::clone(shared), Registry::lookup_topic),
    );
    table
}

/// Replies with the master's clock.
pub(crate) fn ping_handler() -> ServiceCallback {
    service_fn(|_| async { Ok(Utc::now().to_rfc3339().into_bytes()) })
}

fn register_handler(shared: Arc<MasterShared>) -> ServiceCallback {
    service_fn(move |payload| {
        let shared = Arc::clone(&shared);
        async move {
            let info: NodeInfo = serde_json::from_slice(&payload)?;
            let (notices, topics) = {
                let mut registry = shared.registry.write().await;
                let notices = registry.register(info);
                (notices, registry.snapshot_topics())
            };
            for notice in notices {
                tokio::spawn(push_subscriber_update(notice, shared.config.request_timeout));
            }
            Ok(serde_json::to_vec(&topics)?)
        }
    })
}

fn offline_handler(shared: Arc<MasterShared>) -> ServiceCallback {
    service_fn(move |payload| {
        let shared = Arc::clone(&shared);
        async move {
            let id = NodeId::from_string(String::from_utf8_lossy(&payload).into_owned());
            // Unknown ids were already logged by the registry.
            let _ = shared.registry.write().await.remove(&id);
            Ok(ResponseCode::Success.to_bytes())
        }
    })
}

fn nodes_info_handler(shared: Arc<MasterShared>) -> ServiceCallback {
    service_fn(move |_| {
        let shared = Arc::clone(&shared);
        async move {
            let nodes = shared.registry.read().await.all_nodes();
            Ok(serde_json::to_vec(&nodes)?)
        }
    })
}

fn lookup_handler(
    shared: Arc<MasterShared>,
    lookup: fn(&Registry, &str) -> Option<NodeInfo>,
) -> ServiceCallback {
    service_fn(move |payload| {
        let shared = Arc::clone(&shared);
        async move {
            let name = String::from_utf8(payload)
                .map_err(|e| LanComError::Protocol(format!("lookup name is not UTF-8: {e}")))?;
            let found = lookup(&*shared.registry.read().await, &name);
            Ok(serde_json::to_vec(&found)?)
        }
    })
}

/// Tell a subscriber's node about a publisher it has not connected to.
async fn push_subscriber_update(notice: SubscriberNotice, timeout: Duration) {
    let SubscriberNotice {
        subscriber,
        publisher,
    } = notice;
    let payload = match serde_json::to_vec(&publisher) {
        Ok(payload) => payload,
        Err(e) => {
            error!("Cannot encode publisher {}: {e}", publisher.name);
            return;
        }
    };
    let request = Request::node(NodeRequest::UpdateSubscriber, payload);
    match transport::request(subscriber.addr(), &request.encode(), timeout).await {
        Ok(_) => debug!(
            "Pointed subscriber {} on node {} at {}",
            subscriber.name,
            subscriber.node_id,
            publisher.addr()
        ),
        Err(e) => warn!(
            "UPDATE_SUBSCRIBER to node {} failed: {e}",
            subscriber.node_id
        ),
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Publish `[tag, master id]` every broadcast interval.
async fn publish_liveness(
    shared: Arc<MasterShared>,
    publisher: PublishSocket,
    mut shutdown: watch::Receiver<bool>,
) {
    let frames = vec![
        BEACON_TAG.as_bytes().to_vec(),
        shared.id.as_str().as_bytes().to_vec(),
    ];
    while !*shutdown.borrow() {
        publisher.publish(&frames).await;
        tokio::select! {
            _ = tokio::time::sleep(shared.config.broadcast_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Liveness publisher stopped");
}

/// Ping every registered node's control endpoint each liveness interval
/// and evict nodes that stay silent for `max_missed_pings` rounds.
async fn eviction_sweep(shared: Arc<MasterShared>, mut shutdown: watch::Receiver<bool>) {
    let config = &shared.config;
    let ping_timeout = config.request_timeout.min(config.liveness_interval);
    while !*shutdown.borrow() {
        tokio::select! {
            _ = tokio::time::sleep(config.liveness_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        let targets = shared.registry.read().await.ping_targets();
        let pings = targets.into_iter().map(|(id, addr)| async move {
            let request = Request::node(NodeRequest::Ping, Vec::new()).encode();
            let answered = match transport::request(addr, &request, ping_timeout).await {
                Ok(reply) => reply
                    .first()
                    .is_some_and(|r| ResponseCode::from_reply(r) != Some(ResponseCode::Error)),
                Err(e) => {
                    debug!("Ping to node {id} at {addr} failed: {e}");
                    false
                }
            };
            (id, answered)
        });
        let outcomes = futures::future::join_all(pings).await;

        let mut registry = shared.registry.write().await;
        for (id, answered) in outcomes {
            registry.record_ping(&id, answered);
        }
        for id in registry.stale_nodes(config.max_missed_pings) {
            warn!(
                "Node {id} missed {} pings, evicting",
                config.max_missed_pings
            );
            let _ = registry.remove(&id);
        }
    }
    debug!("Eviction sweep stopped");
}
