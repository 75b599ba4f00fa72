//! The peer node an application embeds.
//!
//! A [`LanComNode`] finds the master through its beacon, binds its own
//! control, service and publish endpoints, registers, and keeps its
//! subscriptions wired to every publisher the master tells it about. All
//! network work happens on the node's [`EventLoop`]; the public methods are
//! blocking calls that hand work to it.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::component::{
    Publisher, Service, Streamer, Subscriber, TopicCallback, json_callback, str_callback,
};
use crate::config::LanComConfig;
use crate::discovery::{self, Beacon};
use crate::dispatcher::{Dispatcher, ServiceCallback, ServiceTable, SharedServiceTable, service_fn};
use crate::error::{LanComError, Result};
use crate::identity::{ComponentInfo, ComponentKind, NodeId, NodeInfo};
use crate::master::ping_handler;
use crate::message::{Frames, MasterRequest, NodeRequest, Request, ResponseCode, validate_name};
use crate::registry::TopicIndex;
use crate::runtime::EventLoop;
use crate::transport::{self, PublishSocket, ReplySocket, SubscribeSocket};

// ---------------------------------------------------------------------------
// Single-instance guard
// ---------------------------------------------------------------------------

/// Allows at most one live peer node per slot.
///
/// Nodes created with [`LanComNode::new`] share the process-wide slot, so a
/// process hosts a single peer. Tests that need several peers in one
/// process give each its own `static` slot.
pub struct NodeSlot {
    taken: AtomicBool,
}

impl NodeSlot {
    pub const fn new() -> Self {
        Self {
            taken: AtomicBool::new(false),
        }
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }

    fn claim(&'static self) -> Result<SlotGuard> {
        self.taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| SlotGuard { slot: self })
            .map_err(|_| LanComError::DuplicateNode)
    }
}

impl Default for NodeSlot {
    fn default() -> Self {
        Self::new()
    }
}

struct SlotGuard {
    slot: &'static NodeSlot,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slot.taken.store(false, Ordering::Release);
    }
}

static PROCESS_SLOT: NodeSlot = NodeSlot::new();

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Lifecycle of a peer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Bootstrapping,
    AwaitingMaster,
    Registering,
    Registered,
    ShuttingDown,
    Offline,
}

impl NodeState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Offline)
    }
}

/// A peer node. Stopped on drop.
pub struct LanComNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: LanComConfig,
    event_loop: EventLoop,
    state: RwLock<NodeState>,
    info: RwLock<NodeInfo>,
    master: RwLock<Beacon>,
    services: SharedServiceTable,
    publish_socket: Arc<PublishSocket>,
    subscriptions: Mutex<HashMap<String, Vec<SubscribeSocket>>>,
    /// Set while the master may hold a stale or no copy of `info`.
    needs_registration: AtomicBool,
    last_master_ping: Mutex<Instant>,
    slot: Mutex<Option<SlotGuard>>,
}

/// Endpoints bound during startup.
struct Endpoints {
    control: ReplySocket,
    service: ReplySocket,
    publish: PublishSocket,
}

impl LanComNode {
    /// Start a node reachable at `ip`. Fails with
    /// [`LanComError::MasterNotFound`] when no master answers in time and
    /// with [`LanComError::DuplicateNode`] when this process already runs a
    /// node.
    pub fn new(name: impl Into<String>, ip: Ipv4Addr, config: LanComConfig) -> Result<Self> {
        Self::with_slot(name, ip, config, &PROCESS_SLOT)
    }

    /// Like [`new`](Self::new) with an explicit single-instance slot.
    pub fn with_slot(
        name: impl Into<String>,
        ip: Ipv4Addr,
        config: LanComConfig,
        slot: &'static NodeSlot,
    ) -> Result<Self> {
        let guard = slot.claim()?;
        let name = name.into();
        let mut info = NodeInfo::new(name.clone(), ip);
        debug!("Bootstrapping node {name} ({})", info.node_id);

        let event_loop = EventLoop::start(name.clone())?;
        let (beacon, endpoints) = match Self::bootstrap(&event_loop, ip, &config) {
            Ok(started) => started,
            Err(e) => {
                error!("Node {name} failed to start: {e}");
                event_loop.stop();
                return Err(e);
            }
        };

        info.control_port = endpoints.control.local_addr().port();
        info.service_port = endpoints.service.local_addr().port();
        info.topic_port = endpoints.publish.local_addr().port();

        let inner = Arc::new(NodeInner {
            config,
            event_loop,
            state: RwLock::new(NodeState::AwaitingMaster),
            info: RwLock::new(info),
            master: RwLock::new(beacon),
            services: Arc::new(RwLock::new(ServiceTable::new())),
            publish_socket: Arc::new(endpoints.publish),
            subscriptions: Mutex::new(HashMap::new()),
            needs_registration: AtomicBool::new(true),
            last_master_ping: Mutex::new(Instant::now()),
            slot: Mutex::new(Some(guard)),
        });

        let launched = {
            let inner = Arc::clone(&inner);
            let (control, service) = (endpoints.control, endpoints.service);
            inner
                .event_loop
                .clone()
                .submit_and_wait(async move { inner.launch(control, service).await })
        };
        let node = Self { inner };
        if let Err(e) = launched.and_then(|started| started) {
            error!("Node {name} failed to start: {e}");
            node.stop();
            return Err(e);
        }

        info!("Node {name} started at {ip}");
        Ok(node)
    }

    /// Discover the master and bind the node's endpoints on the loop.
    fn bootstrap(
        event_loop: &EventLoop,
        ip: Ipv4Addr,
        config: &LanComConfig,
    ) -> Result<(Beacon, Endpoints)> {
        let (port, timeout) = (config.discovery_port, config.discovery_timeout);
        event_loop.submit_and_wait(async move {
            let beacon = discovery::search_for_master(port, timeout).await?;
            let any_port = SocketAddr::V4(SocketAddrV4::new(ip, 0));
            let endpoints = Endpoints {
                control: ReplySocket::bind(any_port).await?,
                service: ReplySocket::bind(any_port).await?,
                publish: PublishSocket::bind(any_port).await?,
            };
            Ok::<_, LanComError>((beacon, endpoints))
        })?
    }

    pub fn id(&self) -> NodeId {
        self.inner.info.read().node_id.clone()
    }

    pub fn name(&self) -> String {
        self.inner.info.read().name.clone()
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.read()
    }

    /// Snapshot of the descriptor this node registers with.
    pub fn info(&self) -> NodeInfo {
        self.inner.info.read().clone()
    }

    pub fn config(&self) -> &LanComConfig {
        &self.inner.config
    }

    /// Id of the master this node last discovered.
    pub fn master_id(&self) -> NodeId {
        self.inner.master.read().master_id.clone()
    }

    // -- Components ---------------------------------------------------------

    /// Declare a publisher of `topic`.
    pub fn create_publisher(&self, topic: impl Into<String>) -> Result<Publisher> {
        let topic = topic.into();
        self.inner.declare(ComponentKind::Publisher, &topic)?;
        self.inner.refresh_registration();
        Ok(Publisher::new(
            topic,
            Arc::clone(&self.inner.publish_socket),
            self.inner.event_loop.clone(),
        ))
    }

    /// Declare `topic` and publish whatever `update` returns, `fps` times
    /// per second, until the returned [`Streamer`] is stopped or dropped.
    pub fn create_streamer<F, M>(&self, topic: impl Into<String>, fps: u32, update: F) -> Result<Streamer>
    where
        F: FnMut() -> Option<M> + Send + 'static,
        M: Into<Vec<u8>> + 'static,
    {
        if fps == 0 {
            return Err(LanComError::InvalidRate);
        }
        self.create_publisher(topic)?.into_streamer(fps, update)
    }

    /// Subscribe to `topic`. `callback` runs on the node's event loop for
    /// every message, so it should return quickly.
    pub fn create_subscriber<F>(&self, topic: impl Into<String>, callback: F) -> Result<Subscriber>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let topic = topic.into();
        validate_name(&topic)?;
        let callback: TopicCallback = Arc::new(callback);
        let subscriber =
            Subscriber::spawn(topic.clone(), callback, self.inner.event_loop.clone())?;
        self.inner
            .subscriptions
            .lock()
            .entry(topic.clone())
            .or_default()
            .push(subscriber.connector());
        self.inner.declare(ComponentKind::Subscriber, &topic)?;
        self.inner.refresh_registration();
        Ok(subscriber)
    }

    /// Subscribe to a text topic. Messages that are not UTF-8 are dropped.
    pub fn create_str_subscriber<F>(&self, topic: impl Into<String>, callback: F) -> Result<Subscriber>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let callback = str_callback(topic.clone(), callback);
        self.create_subscriber(topic, callback)
    }

    /// Subscribe to a JSON topic. Messages that do not decode as `T` are
    /// dropped.
    pub fn create_json_subscriber<T, F>(&self, topic: impl Into<String>, callback: F) -> Result<Subscriber>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let callback = json_callback(topic.clone(), callback);
        self.create_subscriber(topic, callback)
    }

    /// Offer a service. Names must be unique within the node.
    pub fn create_service(&self, name: impl Into<String>, callback: ServiceCallback) -> Result<Service> {
        let name = name.into();
        validate_name(&name)?;
        {
            let mut table = self.inner.services.write();
            if table.contains(&name) {
                return Err(LanComError::AlreadyDeclared(name));
            }
            table.register(name.clone(), callback);
        }
        if let Err(e) = self.inner.declare(ComponentKind::Service, &name) {
            self.inner.services.write().remove(&name);
            return Err(e);
        }
        self.inner.refresh_registration();
        Ok(Service::new(name))
    }

    // -- Requests -----------------------------------------------------------

    /// Call a service on whichever node offers it, blocking until the reply
    /// arrives. Use [`call_service_async`](Self::call_service_async) from
    /// inside callbacks.
    pub fn call_service(&self, name: &str, payload: impl Into<Vec<u8>>) -> Result<Vec<u8>> {
        let call = self.call_service_async(name, payload);
        self.inner.event_loop.submit_and_wait(call)?
    }

    pub fn call_service_async(
        &self,
        name: &str,
        payload: impl Into<Vec<u8>>,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let (name, payload) = (name.to_string(), payload.into());
        async move { inner.call_service(name, payload).await }
    }

    /// [`call_service`](Self::call_service) with a text request and reply.
    pub fn call_service_str(&self, name: &str, request: &str) -> Result<String> {
        let reply = self.call_service(name, request.as_bytes())?;
        String::from_utf8(reply)
            .map_err(|e| LanComError::Protocol(format!("reply from {name} is not UTF-8: {e}")))
    }

    /// [`call_service`](Self::call_service) with JSON request and reply.
    pub fn call_service_json<Req, Resp>(&self, name: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let reply = self.call_service(name, serde_json::to_vec(request)?)?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// The master's full view of the network.
    pub fn nodes_info(&self) -> Result<HashMap<NodeId, NodeInfo>> {
        let inner = Arc::clone(&self.inner);
        self.inner.event_loop.submit_and_wait(async move {
            let reply = inner.ask_master(MasterRequest::GetNodesInfo, Vec::new()).await?;
            Ok::<_, LanComError>(serde_json::from_slice(&reply)?)
        })?
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Block until the node stops. Ctrl-C stops it.
    pub fn spin(&self) {
        let inner = Arc::clone(&self.inner);
        let ctrl_c = self.inner.event_loop.submit_detached(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping node");
                inner.begin_shutdown();
            }
        });
        if let Err(e) = ctrl_c {
            debug!("Node already stopped: {e}");
        }
        self.inner.event_loop.wait();
        self.inner.finish();
    }

    /// Deregister from the master (best effort) and stop the event loop.
    /// From inside a callback this only schedules the shutdown.
    pub fn stop(&self) {
        self.inner.begin_shutdown();
        if !self.inner.event_loop.on_loop_thread() {
            self.inner.event_loop.wait();
            self.inner.finish();
        }
    }
}

impl Drop for LanComNode {
    fn drop(&mut self) {
        self.stop();
    }
}

impl NodeInner {
    /// Runs on the loop once the node is assembled.
    async fn launch(self: Arc<Self>, control: ReplySocket, service: ReplySocket) -> Result<()> {
        let shutdown = self.event_loop.shutdown_signal();

        let control_table = Arc::new(RwLock::new(self.control_table()));
        tokio::spawn(Dispatcher::new("control", control_table).serve(control, shutdown.clone()));
        tokio::spawn(
            Dispatcher::new("services", Arc::clone(&self.services)).serve(service, shutdown.clone()),
        );

        let registered = match self.register().await {
            Ok(()) => Some(self.master.read().master_id.clone()),
            Err(e) => {
                warn!("Initial registration failed, retrying on next master heartbeat: {e}");
                None
            }
        };
        tokio::spawn(Arc::clone(&self).watch_master(registered, shutdown));
        Ok(())
    }

    fn control_table(self: &Arc<Self>) -> ServiceTable {
        let mut table = ServiceTable::new();
        let pinged = Arc::downgrade(self);
        let ping = ping_handler();
        table.register(
            NodeRequest::Ping.tag(),
            service_fn(move |payload| {
                if let Some(inner) = pinged.upgrade() {
                    *inner.last_master_ping.lock() = Instant::now();
                }
                ping(payload)
            }),
        );
        let inner = Arc::downgrade(self);
        table.register(
            NodeRequest::UpdateSubscriber.tag(),
            service_fn(move |payload| {
                let inner = inner.clone();
                async move {
                    let publisher: ComponentInfo = serde_json::from_slice(&payload)?;
                    if let Some(inner) = inner.upgrade() {
                        inner.connect_publisher(&publisher).await;
                    }
                    Ok(ResponseCode::Success.to_bytes())
                }
            }),
        );
        table
    }

    fn set_state(&self, next: NodeState) {
        let mut state = self.state.write();
        if state.is_terminal() && !next.is_terminal() {
            return;
        }
        if *state != next {
            debug!("Node state {:?} -> {next:?}", *state);
            *state = next;
        }
    }

    /// Add a component to the local descriptor.
    fn declare(&self, kind: ComponentKind, name: &str) -> Result<()> {
        validate_name(name)?;
        let mut info = self.info.write();
        if kind != ComponentKind::Subscriber && info.declares(kind, name) {
            return Err(LanComError::AlreadyDeclared(name.to_string()));
        }
        let component = info.component(kind, name);
        match kind {
            ComponentKind::Publisher => info.topic_list.push(component),
            ComponentKind::Service => info.service_list.push(component),
            ComponentKind::Subscriber => info.subscriber_list.push(component),
        }
        Ok(())
    }

    /// Re-send the descriptor after it changed. A failed attempt is retried
    /// by the master watcher.
    fn refresh_registration(self: &Arc<Self>) {
        self.needs_registration.store(true, Ordering::Release);
        let state = *self.state.read();
        if state.is_terminal() || state == NodeState::Bootstrapping {
            return;
        }
        let inner = Arc::clone(self);
        let register = async move {
            if let Err(e) = inner.register().await {
                warn!("Re-registration failed: {e}");
            }
        };
        let outcome = if self.event_loop.on_loop_thread() {
            self.event_loop.submit_detached(register).map(|_| ())
        } else {
            self.event_loop.submit_and_wait(register)
        };
        if let Err(e) = outcome {
            debug!("Skipped re-registration: {e}");
        }
    }

    fn master_addr(&self, port: u16) -> SocketAddr {
        self.master.read().master_addr(port)
    }

    async fn ask_master(&self, kind: MasterRequest, payload: Vec<u8>) -> Result<Vec<u8>> {
        let addr = self.master_addr(self.config.master_service_port);
        let reply = transport::request(
            addr,
            &Request::master(kind, payload).encode(),
            self.config.request_timeout,
        )
        .await?;
        let body = first_frame(reply)?;
        match ResponseCode::from_reply(&body) {
            Some(ResponseCode::Error) => Err(LanComError::RemoteError(kind.tag().to_string())),
            Some(ResponseCode::Timeout) => Err(LanComError::RemoteTimeout(kind.tag().to_string())),
            _ => Ok(body),
        }
    }

    /// Send the full descriptor and wire subscriptions to the returned
    /// topic index.
    async fn register(&self) -> Result<()> {
        self.set_state(NodeState::Registering);
        self.needs_registration.store(false, Ordering::Release);
        let payload = serde_json::to_vec(&*self.info.read())?;
        let outcome = async {
            let reply = self.ask_master(MasterRequest::RegisterNode, payload).await?;
            let topics: TopicIndex = serde_json::from_slice(&reply)?;
            Ok::<_, LanComError>(topics)
        }
        .await;
        match outcome {
            Ok(topics) => {
                *self.last_master_ping.lock() = Instant::now();
                self.connect_subscriptions(&topics).await;
                self.set_state(NodeState::Registered);
                info!("Registered with master {}", self.master.read().master_id);
                Ok(())
            }
            Err(e) => {
                self.needs_registration.store(true, Ordering::Release);
                self.set_state(NodeState::AwaitingMaster);
                Err(e)
            }
        }
    }

    fn connectors(&self, topic: &str) -> Vec<SubscribeSocket> {
        self.subscriptions
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    async fn connect_subscriptions(&self, topics: &TopicIndex) {
        let wanted: Vec<(String, Vec<SubscribeSocket>)> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(topic, connectors)| (topic.clone(), connectors.clone()))
            .collect();
        for (topic, connectors) in wanted {
            for publisher in topics.get(&topic).into_iter().flatten() {
                for connector in &connectors {
                    connect_logged(connector, publisher).await;
                }
            }
        }
    }

    async fn connect_publisher(&self, publisher: &ComponentInfo) {
        for connector in self.connectors(&publisher.name) {
            connect_logged(&connector, publisher).await;
        }
    }

    /// Follow the master's liveness topic. A master id other than the one
    /// registered with means the master restarted: register again. Losing
    /// the master entirely sends the node back to beacon discovery. A
    /// registration that is still owed is retried on every heartbeat.
    async fn watch_master(
        self: Arc<Self>,
        mut registered_with: Option<NodeId>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (socket, mut inbox) = SubscribeSocket::new();
        while !*shutdown.borrow() {
            if socket.connected().await.is_empty() {
                let addr = self.master_addr(self.config.master_topic_port);
                if let Err(e) = socket.connect(addr).await {
                    debug!("Master liveness feed unreachable: {e}");
                    self.set_state(NodeState::AwaitingMaster);
                    let search = discovery::search_for_master(
                        self.config.discovery_port,
                        self.config.discovery_timeout,
                    );
                    tokio::select! {
                        found = search => match found {
                            Ok(beacon) => *self.master.write() = beacon,
                            Err(e) => debug!("Still looking for a master: {e}"),
                        },
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            }

            tokio::select! {
                frames = inbox.recv() => {
                    let Some(master_id) = frames.and_then(|f| parse_master_id(&f)) else {
                        continue;
                    };
                    if registered_with.as_ref() != Some(&master_id) {
                        info!("Master {master_id} is new to this node, registering");
                        self.master.write().master_id = master_id;
                        self.needs_registration.store(true, Ordering::Release);
                    }
                }
                _ = tokio::time::sleep(self.config.liveness_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            if self.master_stopped_pinging() {
                warn!("Master has not pinged this node in a while, registering again");
                self.needs_registration.store(true, Ordering::Release);
            }
            if self.registration_due() {
                let master_id = self.master.read().master_id.clone();
                match self.register().await {
                    Ok(()) => registered_with = Some(master_id),
                    Err(e) => warn!("Registration with master {master_id} failed, will retry: {e}"),
                }
            }
        }
        debug!("Master watcher stopped");
    }

    fn registration_due(&self) -> bool {
        let state = *self.state.read();
        !state.is_terminal()
            && (state != NodeState::Registered || self.needs_registration.load(Ordering::Acquire))
    }

    /// True when the master's pings stopped for longer than it waits
    /// before evicting, so it has most likely forgotten this node.
    fn master_stopped_pinging(&self) -> bool {
        if !self.config.eviction_enabled() || *self.state.read() != NodeState::Registered {
            return false;
        }
        let grace = self.config.liveness_interval * (self.config.max_missed_pings + 1);
        self.last_master_ping.lock().elapsed() > grace
    }

    async fn call_service(&self, name: String, payload: Vec<u8>) -> Result<Vec<u8>> {
        let reply = self
            .ask_master(MasterRequest::LookupService, name.clone().into_bytes())
            .await?;
        let owner: Option<NodeInfo> = serde_json::from_slice(&reply)?;
        let owner = owner.ok_or_else(|| LanComError::ServiceNotRegistered(name.clone()))?;

        let request = Request::new(name.clone(), payload).encode();
        let reply = transport::request(owner.service_addr(), &request, self.config.request_timeout)
            .await?;
        let body = first_frame(reply)?;
        match ResponseCode::from_reply(&body) {
            Some(ResponseCode::Error) => Err(LanComError::RemoteError(name)),
            Some(ResponseCode::Timeout) => Err(LanComError::RemoteTimeout(name)),
            _ => Ok(body),
        }
    }

    /// Tell the master this node is leaving. Failures are only logged.
    async fn announce_offline(&self) {
        let id = self.info.read().node_id.clone();
        match self
            .ask_master(MasterRequest::NodeOffline, id.as_str().as_bytes().to_vec())
            .await
        {
            Ok(_) => info!("Node {id} deregistered"),
            Err(e) => warn!("NODE_OFFLINE for {id} failed: {e}"),
        }
    }

    /// Enter `ShuttingDown` and arrange for the loop to halt after the
    /// offline notice. Only the first call has an effect.
    fn begin_shutdown(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if state.is_terminal() {
                return;
            }
            *state = NodeState::ShuttingDown;
        }
        info!("Node {} shutting down", self.info.read().name);

        let inner = Arc::clone(self);
        let farewell = async move {
            inner.announce_offline().await;
            inner.event_loop.request_stop();
        };
        let scheduled = if self.event_loop.on_loop_thread() {
            self.event_loop.submit_detached(farewell).map(|_| ())
        } else {
            self.event_loop.submit_and_wait(farewell)
        };
        if let Err(e) = scheduled {
            debug!("Offline notice skipped: {e}");
            self.event_loop.request_stop();
        }
    }

    /// Mark the node offline and free its slot. Call once the loop exited.
    fn finish(&self) {
        self.set_state(NodeState::Offline);
        if self.slot.lock().take().is_some() {
            info!("Node {} offline", self.info.read().name);
        }
    }
}

async fn connect_logged(connector: &SubscribeSocket, publisher: &ComponentInfo) {
    match connector.connect(publisher.addr()).await {
        Ok(true) => debug!("Connected to publisher of {} at {}", publisher.name, publisher.addr()),
        Ok(false) => {}
        Err(e) => warn!("Cannot reach publisher of {} at {}: {e}", publisher.name, publisher.addr()),
    }
}

fn first_frame(mut frames: Frames) -> Result<Vec<u8>> {
    if frames.is_empty() {
        return Err(LanComError::Protocol("empty reply".to_string()));
    }
    Ok(frames.swap_remove(0))
}

/// `[tag, master id]` as published by the master.
fn parse_master_id(frames: &[Vec<u8>]) -> Option<NodeId> {
    let id = std::str::from_utf8(frames.get(1)?).ok()?;
    (!id.is_empty()).then(|| NodeId::from_string(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    static SLOT: NodeSlot = NodeSlot::new();

    #[test]
    fn test_slot_admits_one_holder() {
        let first = SLOT.claim().unwrap();
        assert!(SLOT.is_taken());
        assert!(matches!(SLOT.claim(), Err(LanComError::DuplicateNode)));
        drop(first);
        assert!(!SLOT.is_taken());
        let _again = SLOT.claim().unwrap();
    }

    #[test]
    fn test_node_without_master_fails_and_frees_slot() {
        static LONELY: NodeSlot = NodeSlot::new();
        let config = LanComConfig {
            discovery_port: 27910,
            discovery_timeout: Duration::from_millis(200),
            ..LanComConfig::default()
        };
        let result = LanComNode::with_slot("lonely", Ipv4Addr::LOCALHOST, config, &LONELY);
        assert!(matches!(result, Err(LanComError::MasterNotFound(_))));
        assert!(!LONELY.is_taken());
    }

    #[test]
    fn test_parse_master_id() {
        let frames = vec![b"LancomMaster".to_vec(), b"abc".to_vec()];
        assert_eq!(parse_master_id(&frames), Some(NodeId::from_string("abc")));
        assert_eq!(parse_master_id(&frames[..1]), None);
        assert_eq!(parse_master_id(&[b"x".to_vec(), Vec::new()]), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(NodeState::ShuttingDown.is_terminal());
        assert!(NodeState::Offline.is_terminal());
        assert!(!NodeState::Registered.is_terminal());
    }
}
