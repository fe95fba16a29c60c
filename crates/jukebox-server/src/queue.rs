//! Per-session FIFO queue with blocking dequeue.
//!
//! External callers append through [`SessionQueue::enqueue`]; only the owning
//! player task removes items.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::JukeboxError;
use crate::track::QueueItem;

/// Outcome of [`SessionQueue::dequeue_or_timeout`].
#[derive(Debug, PartialEq)]
pub enum Dequeued {
    Item(QueueItem),
    TimedOut,
    Cancelled,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    closed: bool,
}

pub struct SessionQueue {
    session_id: String,
    state: Mutex<QueueState>,
    notify: Notify,
    cancel: CancellationToken,
}

impl SessionQueue {
    pub fn new(session_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            session_id: session_id.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            cancel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Append an item and return its 1-based position among pending items.
    pub fn enqueue(&self, item: QueueItem) -> Result<usize, JukeboxError> {
        let position = {
            let mut state = self.lock();
            if state.closed {
                return Err(JukeboxError::SessionClosed(self.session_id.clone()));
            }
            state.items.push_back(item);
            state.items.len()
        };
        self.notify.notify_one();
        Ok(position)
    }

    /// Append several items in order. Used by restore.
    pub fn extend(&self, items: impl IntoIterator<Item = QueueItem>) -> Result<usize, JukeboxError> {
        let len = {
            let mut state = self.lock();
            if state.closed {
                return Err(JukeboxError::SessionClosed(self.session_id.clone()));
            }
            state.items.extend(items);
            state.items.len()
        };
        self.notify.notify_one();
        Ok(len)
    }

    /// Wait until an item is available, `timeout` elapses, or the session is cancelled.
    pub async fn dequeue_or_timeout(&self, timeout: Duration) -> Dequeued {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent enqueue is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cancel.is_cancelled() {
                return Dequeued::Cancelled;
            }
            if let Some(item) = self.lock().items.pop_front() {
                return Dequeued::Item(item);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Dequeued::Cancelled,
                _ = &mut notified => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    return match self.lock().items.pop_front() {
                        Some(item) => Dequeued::Item(item),
                        None => Dequeued::TimedOut,
                    };
                }
            }
        }
    }

    /// Ordered copy of pending items.
    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.lock().items.iter().cloned().collect()
    }

    /// Front item without removing it.
    pub fn peek_front(&self) -> Option<QueueItem> {
        self.lock().items.front().cloned()
    }

    pub fn clear(&self) {
        self.lock().items.clear();
    }

    /// Refuse further enqueues and wake any waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.cancel.cancel();
    }

    /// Close the queue only if nothing is pending. Returns `true` when closed.
    pub fn close_if_empty(&self) -> bool {
        let mut state = self.lock();
        if !state.items.is_empty() {
            return false;
        }
        state.closed = true;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
