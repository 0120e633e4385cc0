//! Event loops: the run-loop substrate everything else is pinned to.
//!
//! An [`EventLoop`] is one OS thread driving a `current_thread` tokio runtime. Anything
//! spawned on it (session iterations, request timeouts, statistics updates) runs on that
//! thread only, so state owned by a loop is never mutated by two threads at once.
//!
//! Cross-loop coordination never shares mutable state directly: a caller either fires a
//! task at the owning loop ([`EventLoop::execute`]) or submits one and awaits its result
//! ([`EventLoop::submit`]).
use std::{
    future::Future,
    sync::Arc,
    thread::{JoinHandle, ThreadId},
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::{
    runtime::{Builder, Handle},
    sync::oneshot,
    task::AbortHandle,
};

use crate::error::EngineError;

/// A single-threaded executor with timer support.
pub struct EventLoop {
    id: usize,
    handle: Handle,
    thread_id: ThreadId,
    stop: Mutex<Option<oneshot::Sender<Duration>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    fn start(id: usize) -> Result<Arc<Self>, EngineError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<Duration>();
        let thread = std::thread::Builder::new()
            .name(format!("volley-loop-{id}"))
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                // Spawned tasks are driven while we block here.
                let grace = runtime.block_on(async { stop_rx.await.unwrap_or(Duration::ZERO) });
                tracing::debug!("Event loop {id} stopping, grace {grace:?}");
                runtime.block_on(drain(grace));
                runtime.shutdown_timeout(Duration::ZERO);
            })?;
        let handle = ready_rx.recv().map_err(|_| EngineError::TaskDropped)??;
        Ok(Arc::new(Self {
            id,
            handle,
            thread_id: thread.thread().id(),
            stop: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Tokio handle of this loop, for callers that need to spawn with custom options.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Whether the calling thread is this loop's thread.
    pub fn in_event_loop(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Runs `task` on this loop, fire-and-forget.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { task() });
    }

    /// Runs `task` on this loop and resolves with its result.
    ///
    /// Resolves to [`EngineError::TaskDropped`] if the loop stops (or the task panics)
    /// before the result is produced.
    pub fn submit<R, F>(&self, task: F) -> BoxFuture<'static, Result<R, EngineError>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(task());
        });
        async move { rx.await.map_err(|_| EngineError::TaskDropped) }.boxed()
    }

    pub fn spawn<Fut>(&self, future: Fut) -> tokio::task::JoinHandle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs `task` on this loop after `delay`. Aborting the returned handle before the
    /// delay elapses cancels it.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> AbortHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle
            .spawn(async move {
                tokio::time::sleep(delay).await;
                task();
            })
            .abort_handle()
    }

    fn signal_stop(&self, grace: Duration) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(grace);
        }
    }

    fn join(&self) {
        if self.in_event_loop() {
            // Joining ourselves would deadlock; the thread exits once this task returns.
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!("Event loop {} panicked", self.id);
            }
        }
    }
}

/// Keeps driving the loop's tasks until none is left or `grace` runs out.
async fn drain(grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    let metrics = Handle::current().metrics();
    while metrics.num_alive_tasks() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Fixed-size set of event loops.
pub struct EventLoopGroup {
    loops: Vec<Arc<EventLoop>>,
}

impl EventLoopGroup {
    pub fn new(threads: usize) -> Result<Self, EngineError> {
        if threads == 0 {
            return Err(EngineError::Config(
                "event loop group needs at least one thread".into(),
            ));
        }
        let loops = (0..threads)
            .map(EventLoop::start)
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!("Started {threads} event loops");
        Ok(Self { loops })
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Loop with the given index.
    ///
    /// # Panics
    /// When `id >= len()`; ids come from the group itself so this is a logic error.
    pub fn executor(&self, id: usize) -> &Arc<EventLoop> {
        &self.loops[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EventLoop>> {
        self.loops.iter()
    }

    /// Stops all loops, then waits for the loop threads to exit. Each loop keeps running
    /// its tasks for at most `grace`; whatever is still pending after that is dropped.
    pub fn shutdown_gracefully(&self, grace: Duration) {
        for event_loop in &self.loops {
            event_loop.signal_stop(grace);
        }
        for event_loop in &self.loops {
            event_loop.join();
        }
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        for event_loop in &self.loops {
            event_loop.signal_stop(Duration::ZERO);
        }
    }
}
