//! Handles an application holds for the topics and services it declared on
//! its [`LanComNode`](crate::node::LanComNode).

use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::dispatcher::panic_message;
use crate::error::{LanComError, Result};
use crate::runtime::{EventLoop, TaskHandle};
use crate::transport::{PublishSocket, SubscribeInbox, SubscribeSocket};

/// Callback run on the node's event loop for every message of a topic.
pub type TopicCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Publishes messages of one topic on the node's publish endpoint.
pub struct Publisher {
    topic: String,
    socket: Arc<PublishSocket>,
    event_loop: EventLoop,
}

impl Publisher {
    pub(crate) fn new(topic: String, socket: Arc<PublishSocket>, event_loop: EventLoop) -> Self {
        Self {
            topic,
            socket,
            event_loop,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Hand `payload` to the event loop for sending and return at once.
    /// Subscribers that are not connected yet miss the message.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let frames = vec![self.topic.as_bytes().to_vec(), payload.into()];
        let socket = Arc::clone(&self.socket);
        let topic = self.topic.clone();
        self.event_loop.submit_detached(async move {
            let delivered = socket.publish(&frames).await;
            trace!("Published on {topic} to {delivered} subscribers");
        })?;
        Ok(())
    }

    pub fn publish_str(&self, text: &str) -> Result<()> {
        self.publish(text.as_bytes())
    }

    pub fn publish_json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.publish(serde_json::to_vec(value)?)
    }

    /// Turn this publisher into a [`Streamer`] that publishes whatever
    /// `update` returns, `fps` times per second. Ticks where `update`
    /// returns `None` publish nothing.
    pub fn into_streamer<F, M>(self, fps: u32, update: F) -> Result<Streamer>
    where
        F: FnMut() -> Option<M> + Send + 'static,
        M: Into<Vec<u8>> + 'static,
    {
        Streamer::start(self, fps, update)
    }
}

// ---------------------------------------------------------------------------
// Streamer
// ---------------------------------------------------------------------------

/// A publisher driven by the event loop at a fixed rate. Stops on drop.
pub struct Streamer {
    topic: String,
    fps: u32,
    stop_tx: watch::Sender<bool>,
    task: TaskHandle<()>,
}

impl Streamer {
    fn start<F, M>(publisher: Publisher, fps: u32, update: F) -> Result<Self>
    where
        F: FnMut() -> Option<M> + Send + 'static,
        M: Into<Vec<u8>> + 'static,
    {
        if fps == 0 {
            return Err(LanComError::InvalidRate);
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let Publisher {
            topic,
            socket,
            event_loop,
        } = publisher;
        let task = event_loop.submit_detached(stream_loop(
            topic.clone(),
            socket,
            Duration::from_secs(1) / fps,
            update,
            event_loop.shutdown_signal(),
            stop_rx,
        ))?;
        Ok(Self {
            topic,
            fps,
            stop_tx,
            task,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn is_streaming(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop publishing. The topic stays declared on the node.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn stream_loop<F, M>(
    topic: String,
    socket: Arc<PublishSocket>,
    period: Duration,
    mut update: F,
    mut shutdown: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
) where
    F: FnMut() -> Option<M> + Send + 'static,
    M: Into<Vec<u8>> + 'static,
{
    info!("Topic {topic} streaming every {period:?}");
    let topic_frame = topic.as_bytes().to_vec();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(payload) = next_message(&topic, &mut update) {
                    socket.publish(&[topic_frame.clone(), payload]).await;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    info!("Streamer for topic {topic} stopped");
}

/// Run one update; a panic skips the tick.
fn next_message<F, M>(topic: &str, update: &mut F) -> Option<Vec<u8>>
where
    F: FnMut() -> Option<M>,
    M: Into<Vec<u8>>,
{
    match catch_unwind(AssertUnwindSafe(|| update().map(Into::into))) {
        Ok(message) => message,
        Err(panic) => {
            error!("Error when streaming {topic}: {}", panic_message(&*panic));
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Receives one topic from every publisher the node has been pointed at.
pub struct Subscriber {
    topic: String,
    connector: SubscribeSocket,
    event_loop: EventLoop,
}

impl Subscriber {
    /// Start the receive loop on `event_loop`.
    pub(crate) fn spawn(
        topic: String,
        callback: TopicCallback,
        event_loop: EventLoop,
    ) -> Result<Self> {
        let (connector, inbox) = SubscribeSocket::new();
        event_loop.submit_detached(receive_loop(
            topic.clone(),
            inbox,
            callback,
            event_loop.shutdown_signal(),
        ))?;
        Ok(Self {
            topic,
            connector,
            event_loop,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn connector(&self) -> SubscribeSocket {
        self.connector.clone()
    }

    /// Publishers this subscriber is currently connected to.
    pub fn connected_publishers(&self) -> Result<Vec<SocketAddr>> {
        let connector = self.connector.clone();
        self.event_loop
            .submit_and_wait(async move { connector.connected().await })
    }
}

/// Hand each message to `f` as text. Messages that are not UTF-8 are
/// dropped.
pub(crate) fn str_callback<F>(topic: String, f: F) -> impl Fn(Vec<u8>) + Send + Sync + 'static
where
    F: Fn(String) + Send + Sync + 'static,
{
    move |payload| match String::from_utf8(payload) {
        Ok(text) => f(text),
        Err(e) => warn!("Dropping non-UTF-8 message on {topic}: {e}"),
    }
}

/// Hand each message to `f` decoded from JSON. Undecodable messages are
/// dropped.
pub(crate) fn json_callback<T, F>(topic: String, f: F) -> impl Fn(Vec<u8>) + Send + Sync + 'static
where
    T: DeserializeOwned + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    move |payload| match serde_json::from_slice::<T>(&payload) {
        Ok(value) => f(value),
        Err(e) => warn!("Dropping undecodable message on {topic}: {e}"),
    }
}

async fn receive_loop(
    topic: String,
    mut inbox: SubscribeInbox,
    callback: TopicCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Subscriber for {topic} listening");
    loop {
        tokio::select! {
            frames = inbox.recv() => {
                let Some(mut frames) = frames else { break };
                if frames.len() != 2 {
                    warn!("Dropping {}-frame message on subscriber {topic}", frames.len());
                    continue;
                }
                if frames[0] != topic.as_bytes() {
                    trace!("Subscriber {topic} skipping foreign topic");
                    continue;
                }
                let payload = frames.swap_remove(1);
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                    error!("Subscriber callback for {topic} panicked: {}", panic_message(&*panic));
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Subscriber for {topic} stopped");
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// A service offered by the node. The callback lives in the node's service
/// table; this handle only names it.
#[derive(Debug, Clone)]
pub struct Service {
    name: String,
}

impl Service {
    pub(crate) fn new(name: String) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
