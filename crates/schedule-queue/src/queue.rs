//! Schedule Queue Implementation

use alert_model::SharedClock;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A queued value with its due time
struct Scheduled<T> {
    value: T,
    /// When the value becomes eligible
    next: DateTime<Utc>,
    /// Insertion order, breaks ties between equal due times
    seq: u64,
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.next == other.next && self.seq == other.seq
    }
}

impl<T> Ord for Scheduled<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior (earliest time first)
        // Then by insertion order (first pushed first)
        other
            .next
            .cmp(&self.next)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State<T> {
    heap: BinaryHeap<Scheduled<T>>,
    closed: bool,
    seq: u64,
}

/// What the consumer should do after looking at the head of the heap
enum Head<T> {
    Ready(T),
    Wait(Option<Duration>),
    Exhausted,
}

/// Concurrent queue of values ordered by due time.
///
/// `pop_wait` hands out values once their due time has passed, earliest first.
/// Closing stops new pushes but everything already queued is still delivered
/// at its scheduled time.
pub struct ScheduleQueue<T> {
    state: Mutex<State<T>>,
    /// Single-slot wake signal; many pushes coalesce into one wake-up
    woken: Notify,
    clock: SharedClock,
}

impl<T> ScheduleQueue<T> {
    /// Create an empty queue
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                closed: false,
                seq: 0,
            }),
            woken: Notify::new(),
            clock,
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `value` to become due at `next`.
    ///
    /// Returns `false` (and drops the value) once the queue is closed.
    pub fn push(&self, value: T, next: DateTime<Utc>) -> bool {
        {
            let mut state = self.state();
            if state.closed {
                debug!("Push ignored: queue closed");
                return false;
            }
            let seq = state.seq;
            state.seq += 1;
            state.heap.push(Scheduled { value, next, seq });
        }
        // The new item may be due earlier than whatever the consumer waits on
        self.woken.notify_one();
        true
    }

    fn poll_head(&self) -> Head<T> {
        let mut state = self.state();
        let next = match state.heap.peek() {
            Some(head) => head.next,
            None if state.closed => return Head::Exhausted,
            None => return Head::Wait(None),
        };

        let now = self.clock.now();
        if next <= now {
            match state.heap.pop() {
                Some(item) => Head::Ready(item.value),
                None => Head::Wait(None),
            }
        } else {
            Head::Wait(Some((next - now).to_std().unwrap_or(Duration::ZERO)))
        }
    }

    /// Wait for the next due value.
    ///
    /// Returns `None` when the queue is closed and empty, or when `cancel`
    /// fires. Cancellation leaves queued values in place.
    pub async fn pop_wait(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            // Registered before looking at the heap so a close racing with the
            // look is not missed.
            let woken = self.woken.notified();

            let wait = match self.poll_head() {
                Head::Ready(value) => return Some(value),
                Head::Exhausted => return None,
                Head::Wait(wait) => wait,
            };

            match wait {
                Some(delay) => {
                    trace!("Waiting {:?} for head of queue", delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                        _ = woken => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = woken => {}
                    }
                }
            }
        }
    }

    /// Remove the earliest-due queued value matching `pred`
    pub fn remove_first_func<F>(&self, mut pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut state = self.state();
        let mut items = std::mem::take(&mut state.heap).into_vec();

        let position = items
            .iter()
            .enumerate()
            .filter(|(_, item)| pred(&item.value))
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(index, _)| index);

        let removed = position.map(|index| items.swap_remove(index).value);
        state.heap = BinaryHeap::from(items);
        removed
    }

    /// Stop accepting pushes. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            debug!("Queue closed with {} pending items", state.heap.len());
        }
        self.woken.notify_waiters();
        self.woken.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Number of queued values
    pub fn len(&self) -> usize {
        self.state().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Due time of the head, if any
    pub fn peek_next(&self) -> Option<DateTime<Utc>> {
        self.state().heap.peek().map(|item| item.next)
    }
}

impl<T: Send + 'static> ScheduleQueue<T> {
    /// Lazily yield due values until the queue is exhausted or `cancel` fires.
    ///
    /// Each call starts a fresh stream over the same queue.
    pub fn stream(self: Arc<Self>, cancel: CancellationToken) -> impl Stream<Item = T> + Send {
        stream::unfold((self, cancel), |(queue, cancel)| async move {
            let value = queue.pop_wait(&cancel).await?;
            Some((value, (queue, cancel)))
        })
    }
}
