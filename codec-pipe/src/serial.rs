//! Leader-follower serializer: runs enqueued async operations one at a
//! time in admission order, so device callbacks never overlap.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

/// Timeout applied by [`SerialQueue::new`], in milliseconds.
pub const DEFAULT_TIMEOUT_MILLIS: u64 = 5_000;

/// Completions past this depth break the synchronous unwind onto a
/// fresh task, keeping chains of immediately-resolving operations from
/// growing the call stack without bound.
const MAX_SYNC_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SerialError {
    /// The operation exceeded the queue's timeout. The queue has moved
    /// on, but the underlying work was not cancelled.
    #[error("serialized operation timed out after {0} ms")]
    TimedOut(u64),
    /// The operation was dropped before it produced a result, either
    /// by [`SerialQueue::discard_queued`] or because it panicked.
    #[error("serialized operation was dropped before completing")]
    Discarded,
}

type RawOp = Box<dyn FnOnce(Completion) + Send>;

struct Waiting {
    id: u64,
    run: RawOp,
}

#[derive(Default)]
struct SerialState {
    next_id: u64,
    /// Admission id of the operation currently holding the queue.
    running: Option<u64>,
    waiting: VecDeque<Waiting>,
}

/// Admission-ordered serializer. Clones share the same queue.
#[derive(Clone)]
pub struct SerialQueue {
    timeout_millis: u64,
    inner: Arc<SerialInner>,
}

#[derive(Default)]
struct SerialInner {
    state: Mutex<SerialState>,
}

impl SerialQueue {
    pub fn new() -> Self {
        Self::with_timeout_millis(DEFAULT_TIMEOUT_MILLIS)
    }

    /// A queue whose operations fail with [`SerialError::TimedOut`]
    /// after `timeout_millis`. 0 disables the timeout.
    pub fn with_timeout_millis(timeout_millis: u64) -> Self {
        Self {
            timeout_millis,
            inner: Arc::default(),
        }
    }

    pub fn timeout_millis(&self) -> u64 {
        self.timeout_millis
    }

    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().unwrap().running.is_none()
    }

    /// Number of admitted operations that have not started yet.
    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().unwrap().waiting.len()
    }

    /// Admits `op` and resolves with its output once every operation
    /// admitted before it has settled and `op` itself completes.
    ///
    /// Admission happens during this call, not when the returned
    /// future is first polled, so call order fixes execution order.
    /// The operation runs on its own task; dropping the returned
    /// future abandons the result but not the work.
    pub fn enqueue<F>(&self, op: F) -> impl Future<Output = Result<F::Output, SerialError>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.enqueue_with_timeout(op, self.timeout_millis)
    }

    /// [`SerialQueue::enqueue`] with a one-off timeout in place of the
    /// queue's own. 0 disables the timeout for this operation.
    pub fn enqueue_with_timeout<F>(
        &self,
        op: F,
        timeout_millis: u64,
    ) -> impl Future<Output = Result<F::Output, SerialError>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.enqueue_fn(move |done| {
            tokio::spawn(run_serialized(op, done, timeout_millis, result_tx));
        });
        async move { result_rx.await.map_err(|_| SerialError::Discarded)? }
    }

    /// Raw admission: `run` is invoked when its turn comes and must
    /// arrange for the [`Completion`] it receives to be finished (or
    /// dropped) once the operation's work is done. Until then no later
    /// operation starts.
    pub fn enqueue_fn(&self, run: impl FnOnce(Completion) + Send + 'static) {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        if state.running.is_none() {
            state.running = Some(id);
            drop(state);
            self.inner.run_op(id, Box::new(run), 0);
        } else {
            state.waiting.push_back(Waiting {
                id,
                run: Box::new(run),
            });
        }
    }

    /// Drops every admitted-but-not-started operation. Their callers
    /// settle with [`SerialError::Discarded`]. The running operation
    /// is unaffected. Returns how many operations were dropped.
    pub fn discard_queued(&self) -> usize {
        let discarded: Vec<Waiting> = {
            let mut state = self.inner.state.lock().unwrap();
            state.waiting.drain(..).collect()
        };
        discarded.len()
    }
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialInner {
    fn run_op(self: &Arc<Self>, id: u64, run: RawOp, depth: usize) {
        run(Completion {
            inner: self.clone(),
            id,
            depth,
            signalled: AtomicBool::new(false),
        });
    }

    /// Called when the operation started at `depth` settles.
    fn advance(self: &Arc<Self>, depth: usize) {
        if depth > MAX_SYNC_DEPTH {
            let inner = self.clone();
            tokio::spawn(async move { inner.run_next(0) });
        } else {
            self.run_next(depth + 1);
        }
    }

    fn run_next(self: &Arc<Self>, depth: usize) {
        let mut state = self.state.lock().unwrap();
        match state.waiting.pop_front() {
            Some(next) => {
                state.running = Some(next.id);
                drop(state);
                self.run_op(next.id, next.run, depth);
            }
            None => state.running = None,
        }
    }
}

/// Completion handle for one serialized operation. Finishing it (or
/// dropping it unfinished) lets the next admitted operation start.
pub struct Completion {
    inner: Arc<SerialInner>,
    id: u64,
    depth: usize,
    signalled: AtomicBool,
}

impl Completion {
    /// Signals that the operation has settled. A second call is a
    /// programming error: it is ignored apart from a warning, so a
    /// late completion after a timeout cannot advance the queue twice.
    pub fn finish(&self) {
        if self.signalled.swap(true, Ordering::SeqCst) {
            log::warn!("serial op {} signalled completion more than once", self.id);
            return;
        }
        self.inner.advance(self.depth);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.signalled.load(Ordering::SeqCst) {
            self.inner.advance(self.depth);
        }
    }
}

async fn run_serialized<F: Future>(
    op: F,
    done: Completion,
    timeout_millis: u64,
    result_tx: oneshot::Sender<Result<F::Output, SerialError>>,
) {
    if timeout_millis == 0 {
        let output = op.await;
        done.finish();
        let _ = result_tx.send(Ok(output));
        return;
    }

    tokio::pin!(op);
    match tokio::time::timeout(Duration::from_millis(timeout_millis), &mut op).await {
        Ok(output) => {
            done.finish();
            let _ = result_tx.send(Ok(output));
        }
        Err(_) => {
            done.finish();
            let _ = result_tx.send(Err(SerialError::TimedOut(timeout_millis)));
            // The queue has moved on but the work is not cancelled;
            // keep driving it so its completion is still observed.
            op.await;
            done.finish();
        }
    }
}

#[cfg(test)]
#[path = "serial_test.rs"]
mod serial_test;
