//! Service dispatcher: serves one reply endpoint from a table of named
//! callbacks.
//!
//! The same dispatcher runs the master's protocol endpoint, every peer's
//! control endpoint, and every peer's user service endpoint. Only the
//! table differs.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{LanComError, Result};
use crate::message::{Request, ResponseCode};
use crate::transport::ReplySocket;

/// Future returned by a [`ServiceCallback`].
pub type ServiceFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>>;

/// A handler that turns a request payload into a reply payload.
pub type ServiceCallback = Arc<dyn Fn(Vec<u8>) -> ServiceFuture + Send + Sync>;

/// Wrap an async closure as a [`ServiceCallback`].
pub fn service_fn<F, Fut>(f: F) -> ServiceCallback
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// Wrap a plain function as a [`ServiceCallback`]. It runs inline on the
/// event loop, so it should return quickly.
pub fn blocking_service_fn<F>(f: F) -> ServiceCallback
where
    F: Fn(Vec<u8>) -> Result<Vec<u8>> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |payload| {
        let f = Arc::clone(&f);
        Box::pin(async move { f(payload) })
    })
}

/// Like [`blocking_service_fn`] for text requests and replies. A request
/// that is not UTF-8 gets an `ERROR` reply.
pub fn str_service_fn<F>(f: F) -> ServiceCallback
where
    F: Fn(String) -> Result<String> + Send + Sync + 'static,
{
    blocking_service_fn(move |payload| {
        let request = String::from_utf8(payload)
            .map_err(|e| LanComError::Protocol(format!("request is not UTF-8: {e}")))?;
        f(request).map(String::into_bytes)
    })
}

/// Like [`blocking_service_fn`] with JSON-encoded requests and replies.
pub fn json_service_fn<Req, Resp, F>(f: F) -> ServiceCallback
where
    Req: DeserializeOwned + 'static,
    Resp: Serialize + 'static,
    F: Fn(Req) -> Result<Resp> + Send + Sync + 'static,
{
    blocking_service_fn(move |payload| {
        let request: Req = serde_json::from_slice(&payload)?;
        Ok(serde_json::to_vec(&f(request)?)?)
    })
}

/// Name → callback table consulted by a [`Dispatcher`].
#[derive(Default)]
pub struct ServiceTable {
    handlers: HashMap<String, ServiceCallback>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, callback: ServiceCallback) {
        let name = name.into();
        debug!("Registering service callback: {name}");
        if self.handlers.insert(name.clone(), callback).is_some() {
            warn!("Service callback {name} replaced");
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<ServiceCallback> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// A table shared between the dispatcher and whoever adds services.
pub type SharedServiceTable = Arc<RwLock<ServiceTable>>;

/// Serves requests against a [`ServiceTable`].
#[derive(Clone)]
pub struct Dispatcher {
    label: String,
    table: SharedServiceTable,
}

impl Dispatcher {
    /// `label` only shows up in logs.
    pub fn new(label: impl Into<String>, table: SharedServiceTable) -> Self {
        Self {
            label: label.into(),
            table,
        }
    }

    pub fn table(&self) -> &SharedServiceTable {
        &self.table
    }

    /// Answer one request. Always yields a reply: the callback's payload on
    /// success, otherwise a typed `ERROR` or `TIMEOUT`.
    pub async fn dispatch(&self, frames: &[Vec<u8>]) -> Vec<u8> {
        let request = match Request::decode(frames) {
            Ok(request) => request,
            Err(e) => {
                error!("[{}] Undecodable request: {e}", self.label);
                return ResponseCode::Error.to_bytes();
            }
        };

        // Clone the callback out so the table is not locked while it runs.
        let callback = self.table.read().get(&request.name);
        let Some(callback) = callback else {
            let e = LanComError::ServiceNotRegistered(request.name);
            error!("[{}] {e}", self.label);
            return ResponseCode::Error.to_bytes();
        };

        let Request { name, payload } = request;
        debug!("[{}] Dispatching {name}", self.label);
        // A panicking callback must not take the endpoint down with it.
        let outcome = AssertUnwindSafe(async move { callback(payload).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e @ (LanComError::CallbackTimeout(_) | LanComError::Timeout(_)))) => {
                error!("[{}] Service \"{name}\" timed out: {e}", self.label);
                ResponseCode::Timeout.to_bytes()
            }
            Ok(Err(e)) => {
                error!("[{}] Error while processing service \"{name}\": {e}", self.label);
                ResponseCode::Error.to_bytes()
            }
            Err(panic) => {
                error!(
                    "[{}] Service \"{name}\" panicked: {}",
                    self.label,
                    panic_message(&*panic)
                );
                ResponseCode::Error.to_bytes()
            }
        }
    }

    /// Serve `socket` until `shutdown` flips to `true` or the socket closes.
    /// Each request is fully answered before the next is taken.
    pub async fn serve(self, mut socket: ReplySocket, mut shutdown: watch::Receiver<bool>) {
        info!("[{}] Service loop running on {}", self.label, socket.local_addr());
        while !*shutdown.borrow() {
            tokio::select! {
                inbound = socket.recv() => {
                    let Some(inbound) = inbound else { break };
                    let reply = self.dispatch(&inbound.frames).await;
                    inbound.respond(vec![reply]);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("[{}] Service loop stopped", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::transport;

    fn dispatcher_with(name: &str, callback: ServiceCallback) -> Dispatcher {
        let mut table = ServiceTable::new();
        table.register(name, callback);
        Dispatcher::new("test", Arc::new(RwLock::new(table)))
    }

    fn echo() -> ServiceCallback {
        blocking_service_fn(Ok)
    }

    #[tokio::test]
    async fn test_success_reply_is_verbatim() {
        let dispatcher = dispatcher_with("echo", echo());
        let reply = dispatcher
            .dispatch(&Request::new("echo", b"ERRORS".to_vec()).encode())
            .await;
        assert_eq!(reply, b"ERRORS");
    }

    #[tokio::test]
    async fn test_unregistered_service_replies_error() {
        let dispatcher = dispatcher_with("echo", echo());
        let reply = dispatcher
            .dispatch(&Request::new("missing", b"x".to_vec()).encode())
            .await;
        assert_eq!(ResponseCode::from_reply(&reply), Some(ResponseCode::Error));
    }

    #[tokio::test]
    async fn test_callback_failures_map_to_typed_replies() {
        let dispatcher = dispatcher_with(
            "slow",
            blocking_service_fn(|_| Err(LanComError::CallbackTimeout("upstream".to_string()))),
        );
        let reply = dispatcher.dispatch(&Request::new("slow", Vec::new()).encode()).await;
        assert_eq!(ResponseCode::from_reply(&reply), Some(ResponseCode::Timeout));

        let dispatcher = dispatcher_with(
            "broken",
            blocking_service_fn(|_| Err(LanComError::Callback("bad input".to_string()))),
        );
        let reply = dispatcher.dispatch(&Request::new("broken", Vec::new()).encode()).await;
        assert_eq!(ResponseCode::from_reply(&reply), Some(ResponseCode::Error));
    }

    #[tokio::test]
    async fn test_undecodable_request_replies_error() {
        let dispatcher = dispatcher_with("echo", echo());
        let reply = dispatcher.dispatch(&[]).await;
        assert_eq!(ResponseCode::from_reply(&reply), Some(ResponseCode::Error));
    }

    #[tokio::test]
    async fn test_serve_answers_over_socket_one_at_a_time() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (flight, seen) = (Arc::clone(&in_flight), Arc::clone(&max_seen));
        let callback = service_fn(move |payload| {
            let (flight, seen) = (Arc::clone(&flight), Arc::clone(&seen));
            async move {
                let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
                seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                flight.fetch_sub(1, Ordering::SeqCst);
                Ok(payload)
            }
        });

        let dispatcher = dispatcher_with("work", callback);
        let socket = ReplySocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = socket.local_addr();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(dispatcher.serve(socket, stop_rx));

        let mut clients = Vec::new();
        for i in 0..4u8 {
            clients.push(tokio::spawn(async move {
                let frames = Request::new("work", vec![i]).encode();
                transport::request(addr, &frames, Duration::from_secs(5)).await
            }));
        }
        for (i, client) in clients.into_iter().enumerate() {
            let reply = client.await.unwrap().unwrap();
            assert_eq!(reply, vec![vec![i as u8]]);
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);

        stop_tx.send_replace(true);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_callback_replies_error_and_endpoint_survives() {
        let mut table = ServiceTable::new();
        table.register("echo", echo());
        table.register("boom", blocking_service_fn(|_| panic!("callback bug")));
        table.register(
            "boom_async",
            service_fn(|payload| async move {
                assert!(payload.is_empty(), "async callback bug");
                Ok(payload)
            }),
        );
        let dispatcher = Dispatcher::new("test", Arc::new(RwLock::new(table)));

        let socket = ReplySocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = socket.local_addr();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(dispatcher.serve(socket, stop_rx));

        let call = |name: &'static str| async move {
            let frames = Request::new(name, b"hi".to_vec()).encode();
            transport::request(addr, &frames, Duration::from_secs(5)).await
        };
        assert_eq!(call("echo").await.unwrap(), vec![b"hi".to_vec()]);
        assert_eq!(call("boom").await.unwrap(), vec![b"ERROR".to_vec()]);
        assert_eq!(call("boom_async").await.unwrap(), vec![b"ERROR".to_vec()]);
        assert_eq!(call("echo").await.unwrap(), vec![b"hi".to_vec()]);

        stop_tx.send_replace(true);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_typed_wrappers_decode_and_encode() {
        let mut table = ServiceTable::new();
        table.register("shout", str_service_fn(|text| Ok(text.to_uppercase())));
        table.register(
            "sum",
            json_service_fn(|numbers: Vec<i64>| Ok(serde_json::json!({ "sum": numbers.iter().sum::<i64>() }))),
        );
        let dispatcher = Dispatcher::new("test", Arc::new(RwLock::new(table)));

        let reply = dispatcher.dispatch(&Request::new("shout", b"lan".to_vec()).encode()).await;
        assert_eq!(reply, b"LAN");
        let reply = dispatcher.dispatch(&Request::new("shout", vec![0xff, 0xfe]).encode()).await;
        assert_eq!(ResponseCode::from_reply(&reply), Some(ResponseCode::Error));

        let reply = dispatcher.dispatch(&Request::new("sum", b"[1,2,3]".to_vec()).encode()).await;
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value["sum"], 6);
        let reply = dispatcher.dispatch(&Request::new("sum", b"{}".to_vec()).encode()).await;
        assert_eq!(ResponseCode::from_reply(&reply), Some(ResponseCode::Error));
    }

    #[test]
    fn test_panic_message_reads_common_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }

    #[test]
    fn test_table_bookkeeping() {
        let mut table = ServiceTable::new();
        assert!(table.is_empty());
        table.register("a", echo());
        table.register("a", echo());
        assert_eq!(table.len(), 1);
        assert!(table.contains("a"));
        assert!(table.remove("a"));
        assert!(!table.remove("a"));
    }
}
