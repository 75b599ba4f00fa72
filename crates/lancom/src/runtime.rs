//! Per-node event loop and the bridge from blocking callers into it.
//!
//! Each node owns exactly one [`EventLoop`]: a single-threaded tokio runtime
//! driven by a dedicated OS thread. Application threads (and signal
//! handlers) hand work to it through [`EventLoop::submit_and_wait`] or
//! [`EventLoop::submit_detached`]; nothing else crosses the thread boundary.
//!
//! Stopping is cooperative. [`EventLoop::stop`] clears the running flag and
//! wakes the loop, which then drops every task at its next suspension
//! point. A stopped loop cannot be restarted.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

use crate::error::{LanComError, Result};

/// Handle to a node's event loop. Clones share the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    name: String,
    handle: Handle,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    thread_id: ThreadId,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventLoop {
    /// Spawn the loop thread and wait until its runtime is up.
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let thread_name = format!("lancom-{name}");
        let thread = thread::Builder::new().name(thread_name).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = handle_tx.send(Err(e));
                    return;
                }
            };
            let _ = handle_tx.send(Ok(runtime.handle().clone()));
            runtime.block_on(async move {
                // Also returns when every sender is gone.
                let _ = stop_rx.wait_for(|stopped| *stopped).await;
            });
            // Dropping the runtime cancels whatever is still scheduled.
            drop(runtime);
        })?;

        let thread_id = thread.thread().id();
        let handle = handle_rx
            .recv()
            .map_err(|_| LanComError::LoopNotRunning)??;

        info!("Event loop '{name}' started");
        Ok(Self {
            inner: Arc::new(LoopInner {
                name,
                handle,
                running: AtomicBool::new(true),
                stop_tx,
                thread_id,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the loop still accepts work.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Whether the caller is running on the loop's own thread.
    pub fn on_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// A receiver that flips to `true` when the loop is asked to stop.
    /// Long-running loop tasks select on it next to their I/O.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.stop_tx.subscribe()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(LanComError::LoopNotRunning)
        }
    }

    /// Run `task` on the loop and block the calling thread until it
    /// finishes. A panic inside the task, or the loop stopping underneath
    /// it, comes back as an error.
    pub fn submit_and_wait<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_running()?;
        if self.on_loop_thread() {
            return Err(LanComError::BlockingOnLoop);
        }
        let join = self.inner.handle.spawn(task);
        futures::executor::block_on(join).map_err(join_error)
    }

    /// Schedule `task` on the loop and return immediately. Its outcome is
    /// only observable through the returned handle.
    pub fn submit_detached<F, T>(&self, task: F) -> Result<TaskHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_running()?;
        Ok(TaskHandle {
            join: self.inner.handle.spawn(task),
            loop_ref: self.clone(),
        })
    }

    /// Ask the loop to halt without waiting for it. Safe to call from any
    /// thread, including the loop itself; repeated calls are no-ops.
    pub fn request_stop(&self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            debug!("Stop requested for event loop '{}'", self.inner.name);
        }
        self.inner.stop_tx.send_replace(true);
    }

    /// Block until the loop thread has exited. Returns immediately when
    /// called from the loop thread itself or when already joined.
    pub fn wait(&self) {
        if self.on_loop_thread() {
            return;
        }
        let thread = self.inner.thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("Event loop '{}' thread panicked", self.inner.name);
            }
            info!("Event loop '{}' stopped", self.inner.name);
        }
    }

    /// Request a stop and wait for the loop thread to exit.
    pub fn stop(&self) {
        self.request_stop();
        self.wait();
    }
}

fn join_error(e: JoinError) -> LanComError {
    if e.is_cancelled() {
        LanComError::LoopNotRunning
    } else {
        LanComError::Callback(format!("task panicked: {e}"))
    }
}

/// Outcome of a task started with [`EventLoop::submit_detached`].
pub struct TaskHandle<T> {
    join: JoinHandle<T>,
    loop_ref: EventLoop,
}

impl<T> TaskHandle<T> {
    /// Whether the task has completed (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Block the calling thread until the task completes.
    pub fn wait(self) -> Result<T> {
        if self.loop_ref.on_loop_thread() {
            return Err(LanComError::BlockingOnLoop);
        }
        futures::executor::block_on(self.join).map_err(join_error)
    }

    /// Await the task from async code.
    pub async fn join(self) -> Result<T> {
        self.join.await.map_err(join_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_submit_and_wait_returns_value() {
        let event_loop = EventLoop::start("wait").unwrap();
        let value = event_loop.submit_and_wait(async { 21 * 2 }).unwrap();
        assert_eq!(value, 42);
        event_loop.stop();
    }

    #[test]
    fn test_task_runs_on_loop_thread() {
        let event_loop = EventLoop::start("thread").unwrap();
        let probe = event_loop.clone();
        let on_loop = event_loop
            .submit_and_wait(async move { probe.on_loop_thread() })
            .unwrap();
        assert!(on_loop);
        assert!(!event_loop.on_loop_thread());
        event_loop.stop();
    }

    #[test]
    fn test_panic_surfaces_as_error() {
        let event_loop = EventLoop::start("panic").unwrap();
        let result = event_loop.submit_and_wait(async {
            panic!("boom");
        });
        assert!(matches!(result, Err(LanComError::Callback(_))));
        // The loop survives a failed task.
        assert_eq!(event_loop.submit_and_wait(async { 1 }).unwrap(), 1);
        event_loop.stop();
    }

    #[test]
    fn test_detached_task_is_polled_through_handle() {
        let event_loop = EventLoop::start("detached").unwrap();
        let handle = event_loop
            .submit_detached(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                "done"
            })
            .unwrap();
        assert_eq!(handle.wait().unwrap(), "done");
        event_loop.stop();
    }

    #[test]
    fn test_submit_after_stop_is_rejected() {
        let event_loop = EventLoop::start("stopped").unwrap();
        event_loop.stop();
        assert!(!event_loop.is_running());
        assert!(matches!(
            event_loop.submit_and_wait(async {}),
            Err(LanComError::LoopNotRunning)
        ));
        assert!(matches!(
            event_loop.submit_detached(async {}),
            Err(LanComError::LoopNotRunning)
        ));
    }

    #[test]
    fn test_stop_cancels_pending_tasks() {
        let event_loop = EventLoop::start("cancel").unwrap();
        let handle = event_loop
            .submit_detached(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .unwrap();
        event_loop.stop();
        assert!(matches!(handle.wait(), Err(LanComError::LoopNotRunning)));
    }

    #[test]
    fn test_blocking_from_loop_thread_is_refused() {
        let event_loop = EventLoop::start("reentrant").unwrap();
        let inner = event_loop.clone();
        let result = event_loop
            .submit_and_wait(async move { inner.submit_and_wait(async { 1 }).err() })
            .unwrap();
        assert!(matches!(result, Some(LanComError::BlockingOnLoop)));
        event_loop.stop();
    }

    #[test]
    fn test_stop_from_inside_loop() {
        let event_loop = EventLoop::start("self-stop").unwrap();
        let inner = event_loop.clone();
        event_loop
            .submit_detached(async move { inner.request_stop() })
            .unwrap();
        event_loop.wait();
        assert!(!event_loop.is_running());
    }
}
