//! Dedicated single-threaded execution context
//!
//! Each pub/sub connection owns one [`DispatchContext`]: an OS thread running
//! a current-thread tokio runtime. Every listener of the connection runs as
//! a task on that runtime, so callbacks for one connection never run
//! concurrently, while different connections dispatch in parallel.

use std::future::Future;
use std::thread::{self, JoinHandle, ThreadId};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ClusterError;

type Task = BoxFuture<'static, ()>;

/// Single-threaded executor for one connection's event handlers
#[derive(Debug)]
pub struct DispatchContext {
    name: String,
    thread_id: ThreadId,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchContext {
    /// Spawn the dispatch thread
    pub fn start(name: impl Into<String>) -> Result<Self, ClusterError> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ClusterError::failed)?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(task) = receiver.recv().await {
                        tokio::spawn(task);
                    }
                });
                // Tasks still pending once the sender is gone are dropped
                // together with the runtime.
            })
            .map_err(ClusterError::failed)?;

        debug!(context = %name, "Dispatch context started");
        Ok(Self {
            name,
            thread_id: thread.thread().id(),
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the caller is running on this context's thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run `task` on the dispatch thread
    ///
    /// Fails with [`ClusterError::ShutDown`] once the context is shut down.
    pub fn spawn<F>(&self, task: F) -> Result<(), ClusterError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.sender.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| ClusterError::ShutDown { name: self.name.clone() })?;
        sender
            .send(task.boxed())
            .map_err(|_| ClusterError::ShutDown { name: self.name.clone() })
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting tasks, cancel running ones and wait for the thread
    ///
    /// Called from the dispatch thread itself, the thread is left to exit on
    /// its own instead of being joined. Repeated calls are no-ops.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());

        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if self.is_current() {
            debug!(context = %self.name, "Dispatch context shut down from its own thread");
            return;
        }
        if thread.join().is_err() {
            warn!(context = %self.name, "Dispatch thread panicked");
        }
        debug!(context = %self.name, "Dispatch context shut down");
    }
}

impl Drop for DispatchContext {
    fn drop(&mut self) {
        // The thread exits once every task has finished and the channel is
        // closed. A task holding an `Arc` back to this context keeps it alive,
        // so owners must call `shutdown` explicitly.
        drop(self.sender.get_mut().take());
    }
}
