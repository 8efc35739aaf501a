//! Bounded FIFO bridging push-style producers (device callbacks) and
//! pull-style consumers.
//!
//! One producer and one consumer at a time. A push beyond capacity is
//! accepted into the buffer but suspends the pusher until a pull makes
//! room, so the buffer holds at most `capacity + 1` items transiently.
//! `close` is the half-close signal: buffered values still drain, then
//! pulls observe the end marker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::oneshot;

/// Error returned when pushing into a closed queue. Producing after the
/// half-close is a protocol violation by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue closed")]
pub struct QueueClosed;

type SpareCapacityHook = Arc<dyn Fn(usize) + Send + Sync>;

struct QueueState<T> {
    buffered: VecDeque<T>,
    closed: bool,
    /// Consumer suspended on an empty open queue; resolved with the next
    /// value or the end marker.
    blocked_pull: Option<oneshot::Sender<Option<T>>>,
    /// Producer suspended after overfilling the buffer.
    blocked_push: Option<oneshot::Sender<()>>,
}

pub struct BlockingQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    on_spare_capacity: Mutex<Option<SpareCapacityHook>>,
}

impl<T> BlockingQueue<T> {
    /// Capacity must be at least 1.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least 1");
        Self {
            capacity,
            state: Mutex::new(QueueState {
                buffered: VecDeque::new(),
                closed: false,
                blocked_pull: None,
                blocked_push: None,
            }),
            on_spare_capacity: Mutex::new(None),
        }
    }

    /// Registers the hook invoked (outside the queue lock) with the new
    /// spare count whenever a pull drops the buffer below capacity.
    pub fn set_spare_capacity_hook(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_spare_capacity.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Remaining room before pushes start suspending. Zero while the
    /// buffer sits at or beyond capacity.
    pub fn spare_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Accepts `value`, completing once the queue has room for more.
    ///
    /// A waiting pull receives the value directly, bypassing the buffer.
    /// Otherwise the value is buffered, and once the buffer exceeds
    /// capacity the push suspends until a pull (or `close`) releases it.
    pub async fn push(&self, value: T) -> Result<(), QueueClosed> {
        let wait = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(QueueClosed);
            }
            let mut value = value;
            if let Some(puller) = state.blocked_pull.take() {
                match puller.send(Some(value)) {
                    Ok(()) => return Ok(()),
                    // The pull future was dropped; keep the value and
                    // buffer it instead.
                    Err(rejected) => value = rejected.expect("handoff carries a value"),
                }
            }
            state.buffered.push_back(value);
            if state.buffered.len() <= self.capacity {
                None
            } else {
                if let Some(existing) = &state.blocked_push {
                    assert!(
                        existing.is_closed(),
                        "a second push suspended while one is outstanding"
                    );
                }
                let (tx, rx) = oneshot::channel();
                state.blocked_push = Some(tx);
                Some(rx)
            }
        };
        if let Some(rx) = wait {
            // An Err means the queue was dropped wholesale; the value was
            // accepted either way.
            let _ = rx.await;
        }
        Ok(())
    }

    /// Yields the next value, or `None` once the queue is closed and
    /// drained. Suspends while the queue is empty but open.
    pub async fn pull(&self) -> Option<T> {
        let wait = {
            let mut state = self.state.lock().unwrap();
            if let Some(value) = state.buffered.pop_front() {
                if let Some(pusher) = state.blocked_push.take() {
                    let _ = pusher.send(());
                }
                let spare = if state.buffered.len() < self.capacity {
                    Some(self.capacity - state.buffered.len())
                } else {
                    None
                };
                drop(state);
                if let Some(spare) = spare {
                    self.notify_spare_capacity(spare);
                }
                return Some(value);
            }
            if state.closed {
                return None;
            }
            if let Some(existing) = &state.blocked_pull {
                assert!(
                    existing.is_closed(),
                    "a second pull suspended while one is outstanding"
                );
            }
            let (tx, rx) = oneshot::channel();
            state.blocked_pull = Some(tx);
            rx
        };
        match wait.await {
            Ok(value) => value,
            // Queue dropped while suspended: treat as end of stream.
            Err(_) => None,
        }
    }

    /// Adapts the pull side into a [`Stream`] that finishes at the end
    /// marker. The queue handle moves into the stream; pushers keep
    /// their own clones.
    pub fn into_stream(self: Arc<Self>) -> impl Stream<Item = T> {
        futures::stream::unfold(self, |queue| async move {
            queue.pull().await.map(|value| (value, queue))
        })
    }

    /// Half-closes the queue. Idempotent. A suspended pull wakes with the
    /// end marker; a suspended push releases (its value was already
    /// accepted); buffered values remain pullable.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        if let Some(puller) = state.blocked_pull.take() {
            let _ = puller.send(None);
        }
        if let Some(pusher) = state.blocked_push.take() {
            let _ = pusher.send(());
        }
    }

    fn notify_spare_capacity(&self, spare: usize) {
        let hook = self.on_spare_capacity.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(spare);
        }
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
