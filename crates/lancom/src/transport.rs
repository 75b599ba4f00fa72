//! WebSocket transport for the four socket roles nodes talk through.
//!
//! Every multipart message travels as one binary WebSocket message packed by
//! [`encode_frames`](crate::message::encode_frames).
//!
//! - [`ReplySocket`] binds and hands out inbound requests one at a time.
//! - [`request`] connects, sends one request and waits for one reply.
//! - [`PublishSocket`] binds and fans every message out to its subscribers.
//! - [`SubscribeSocket`] connects to any number of publishers and funnels
//!   what they publish into one [`SubscribeInbox`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, info, trace, warn};

use crate::error::{LanComError, Result};
use crate::message::{Frames, decode_frames, encode_frames};

/// Write half of a server-side WebSocket.
type ServerWsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{addr}")
}

async fn bind_listener(addr: SocketAddr) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// A request received on a [`ReplySocket`], waiting for its answer.
pub struct InboundRequest {
    pub frames: Frames,
    pub from_addr: SocketAddr,
    reply_tx: oneshot::Sender<Frames>,
}

impl InboundRequest {
    /// Send the answer back to the requester.
    pub fn respond(self, frames: Frames) {
        if self.reply_tx.send(frames).is_err() {
            debug!("Requester {} went away before the reply", self.from_addr);
        }
    }
}

/// A bound request/reply endpoint.
///
/// Requests from all connections are queued into one channel and must be
/// answered before the next one is taken, so the endpoint is strictly
/// serial no matter how many clients are connected.
pub struct ReplySocket {
    local_addr: SocketAddr,
    requests: mpsc::Receiver<InboundRequest>,
    accept_task: JoinHandle<()>,
}

impl ReplySocket {
    /// Bind to `addr`. Port `0` picks an ephemeral port.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let (listener, local_addr) = bind_listener(addr).await?;
        let (request_tx, requests) = mpsc::channel(64);
        let accept_task = tokio::spawn(Self::accept_loop(listener, request_tx));
        debug!("Reply socket bound on {local_addr}");
        Ok(Self {
            local_addr,
            requests,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next request. `None` once the socket can no longer
    /// receive.
    pub async fn recv(&mut self) -> Option<InboundRequest> {
        self.requests.recv().await
    }

    async fn accept_loop(listener: TcpListener, request_tx: mpsc::Sender<InboundRequest>) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tokio::spawn(Self::serve_connection(stream, peer_addr, request_tx.clone()));
                }
                Err(e) => {
                    warn!("TCP accept failed: {e}");
                }
            }
        }
    }

    async fn serve_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        request_tx: mpsc::Sender<InboundRequest>,
    ) {
        let mut ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("WebSocket accept failed for {peer_addr}: {e}");
                return;
            }
        };

        while let Some(msg) = ws.next().await {
            let data = match msg {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Read error from {peer_addr}: {e}");
                    break;
                }
            };
            let frames = match decode_frames(&data) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!("Bad request frames from {peer_addr}: {e}");
                    break;
                }
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            let inbound = InboundRequest {
                frames,
                from_addr: peer_addr,
                reply_tx,
            };
            if request_tx.send(inbound).await.is_err() {
                break;
            }
            let Ok(reply) = reply_rx.await else {
                break;
            };
            if let Err(e) = ws.send(Message::binary(encode_frames(&reply))).await {
                debug!("Reply to {peer_addr} failed: {e}");
                break;
            }
        }
        trace!("Request connection from {peer_addr} closed");
    }
}

impl Drop for ReplySocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Send one request to the reply endpoint at `addr` and wait for its reply.
pub async fn request(addr: SocketAddr, frames: &[Vec<u8>], timeout: Duration) -> Result<Frames> {
    tokio::time::timeout(timeout, request_inner(addr, frames))
        .await
        .map_err(|_| LanComError::Timeout(timeout))?
}

async fn request_inner(addr: SocketAddr, frames: &[Vec<u8>]) -> Result<Frames> {
    let (mut ws, _) = connect_async(ws_url(addr))
        .await
        .map_err(|e| LanComError::Transport(format!("Connect to {addr} failed: {e}")))?;

    ws.send(Message::binary(encode_frames(frames)))
        .await
        .map_err(|e| LanComError::Transport(format!("Send to {addr} failed: {e}")))?;

    let reply = loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => break decode_frames(&data)?,
            Some(Ok(Message::Close(_))) | None => {
                return Err(LanComError::Transport(format!(
                    "{addr} closed the connection before replying"
                )));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(LanComError::Transport(format!("Read from {addr} failed: {e}")));
            }
        }
    };

    let _ = ws.close(None).await;
    Ok(reply)
}

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

/// A bound publish endpoint. Every published message goes to every
/// currently connected subscriber; nothing is buffered for late joiners.
pub struct PublishSocket {
    local_addr: SocketAddr,
    subscribers: Arc<Mutex<Vec<(SocketAddr, ServerWsSink)>>>,
    accept_task: JoinHandle<()>,
}

impl PublishSocket {
    /// Bind to `addr`. Port `0` picks an ephemeral port.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let (listener, local_addr) = bind_listener(addr).await?;
        let subscribers = Arc::new(Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(Self::accept_loop(listener, Arc::clone(&subscribers)));
        info!("Publish socket bound on {local_addr}");
        Ok(Self {
            local_addr,
            subscribers,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Send `frames` to every connected subscriber. Subscribers whose send
    /// fails are dropped. Returns how many received the message.
    pub async fn publish(&self, frames: &[Vec<u8>]) -> usize {
        let msg = Message::binary(encode_frames(frames));
        let mut subscribers = self.subscribers.lock().await;
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (idx, (addr, sink)) in subscribers.iter_mut().enumerate() {
            match sink.send(msg.clone()).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    debug!("Publish to {addr} failed: {e}");
                    failed.push(idx);
                }
            }
        }
        for idx in failed.into_iter().rev() {
            subscribers.swap_remove(idx);
        }
        delivered
    }

    async fn accept_loop(
        listener: TcpListener,
        subscribers: Arc<Mutex<Vec<(SocketAddr, ServerWsSink)>>>,
    ) {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("TCP accept failed: {e}");
                    continue;
                }
            };
            let subscribers = Arc::clone(&subscribers);
            tokio::spawn(async move {
                match accept_async(stream).await {
                    Ok(ws) => {
                        let (sink, mut stream) = ws.split();
                        subscribers.lock().await.push((peer_addr, sink));
                        debug!("Subscriber {peer_addr} connected");
                        // Drain control frames until the subscriber leaves.
                        while let Some(Ok(msg)) = stream.next().await {
                            if msg.is_close() {
                                break;
                            }
                        }
                        subscribers.lock().await.retain(|(addr, _)| *addr != peer_addr);
                        debug!("Subscriber {peer_addr} disconnected");
                    }
                    Err(e) => {
                        debug!("WebSocket accept failed for {peer_addr}: {e}");
                    }
                }
            });
        }
    }
}

impl Drop for PublishSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ---------------------------------------------------------------------------
// Subscribe
// ---------------------------------------------------------------------------

/// Connecting half of a subscription. Cheap to clone; every clone feeds the
/// same [`SubscribeInbox`].
#[derive(Clone)]
pub struct SubscribeSocket {
    inbox_tx: mpsc::Sender<Frames>,
    connections: Arc<Mutex<HashMap<SocketAddr, JoinHandle<()>>>>,
}

/// Receiving half of a subscription.
pub struct SubscribeInbox {
    inbox_rx: mpsc::Receiver<Frames>,
}

impl SubscribeInbox {
    /// Next message from any connected publisher.
    pub async fn recv(&mut self) -> Option<Frames> {
        self.inbox_rx.recv().await
    }
}

impl SubscribeSocket {
    pub fn new() -> (Self, SubscribeInbox) {
        let (inbox_tx, inbox_rx) = mpsc::channel(256);
        let socket = Self {
            inbox_tx,
            connections: Arc::new(Mutex::new(HashMap::new())),
        };
        (socket, SubscribeInbox { inbox_rx })
    }

    /// Connect to the publisher at `addr`. Returns `false` when already
    /// connected to it.
    pub async fn connect(&self, addr: SocketAddr) -> Result<bool> {
        let mut connections = self.connections.lock().await;
        if connections.contains_key(&addr) {
            return Ok(false);
        }

        let (ws, _) = connect_async(ws_url(addr))
            .await
            .map_err(|e| LanComError::Transport(format!("Subscribe to {addr} failed: {e}")))?;

        let inbox_tx = self.inbox_tx.clone();
        let registry = Arc::clone(&self.connections);
        let reader = tokio::spawn(async move {
            let (_sink, mut stream) = ws.split();
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match decode_frames(&data) {
                        Ok(frames) => {
                            if inbox_tx.send(frames).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Bad publication from {addr}: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Read error from publisher {addr}: {e}");
                        break;
                    }
                }
            }
            registry.lock().await.remove(&addr);
            debug!("Publisher {addr} disconnected");
        });

        connections.insert(addr, reader);
        debug!("Subscribed to publisher {addr}");
        Ok(true)
    }

    /// Addresses of the publishers currently connected.
    pub async fn connected(&self) -> Vec<SocketAddr> {
        self.connections.lock().await.keys().copied().collect()
    }

    /// Drop every publisher connection.
    pub async fn close(&self) {
        for (_, reader) in self.connections.lock().await.drain() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_request_reply_roundtrip() {
        let mut reply = ReplySocket::bind(loopback()).await.unwrap();
        let addr = reply.local_addr();
        assert_ne!(addr.port(), 0);

        let server = tokio::spawn(async move {
            let inbound = reply.recv().await.unwrap();
            let mut answer = inbound.frames.clone();
            answer.reverse();
            inbound.respond(answer);
        });

        let frames = vec![b"a".to_vec(), b"b".to_vec()];
        let answer = request(addr, &frames, Duration::from_secs(2)).await.unwrap();
        assert_eq!(answer, vec![b"b".to_vec(), b"a".to_vec()]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_times_out_without_reply() {
        let mut reply = ReplySocket::bind(loopback()).await.unwrap();
        let addr = reply.local_addr();
        let server = tokio::spawn(async move {
            // Hold the request without answering.
            let inbound = reply.recv().await;
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(inbound);
        });

        let result = request(addr, &[b"x".to_vec()], Duration::from_millis(100)).await;
        assert!(matches!(result, Err(LanComError::Timeout(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_to_closed_port_fails() {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = request(addr, &[b"x".to_vec()], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(LanComError::Transport(_))));
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let publisher = PublishSocket::bind(loopback()).await.unwrap();
        let (subscriber, mut inbox) = SubscribeSocket::new();

        assert!(subscriber.connect(publisher.local_addr()).await.unwrap());
        assert!(!subscriber.connect(publisher.local_addr()).await.unwrap());

        // Wait until the publisher has registered the subscriber.
        for _ in 0..50 {
            if publisher.subscriber_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let delivered = publisher.publish(&[b"temp".to_vec(), b"21.5".to_vec()]).await;
        assert_eq!(delivered, 1);

        let frames = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frames, vec![b"temp".to_vec(), b"21.5".to_vec()]);

        subscriber.close().await;
        assert!(subscriber.connected().await.is_empty());
    }
}
