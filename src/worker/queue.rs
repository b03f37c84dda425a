//! FIFO admission queue guaranteeing one-at-a-time execution per bucket.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// An async queue admitting callers strictly in arrival order, one at a
/// time.
///
/// `wait` resolves when it is the caller's turn; the caller must call
/// `shift` when done to admit the next waiter. This is the mechanism that
/// keeps bursts on one bucket from overlapping even under high local
/// concurrency.
#[derive(Debug, Default)]
pub struct AsyncQueue {
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Whether a caller currently holds the queue.
    running: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until it is the caller's turn.
    pub async fn wait(&self) {
        let rx = {
            let mut state = self.state.lock();
            if !state.running && state.waiters.is_empty() {
                state.running = true;
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        // The sender is only dropped if the queue itself is dropped.
        let _ = rx.await;
    }

    /// Release the queue and admit the next waiter, if any.
    pub fn shift(&self) {
        let mut state = self.state.lock();
        loop {
            match state.waiters.pop_front() {
                // A waiter that gave up before its turn is skipped.
                Some(next) => {
                    if next.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.running = false;
                    return;
                }
            }
        }
    }

    /// Number of callers waiting behind the current holder.
    pub fn remaining(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Whether nothing is queued or running.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        !state.running && state.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_caller_is_admitted_immediately() {
        let queue = AsyncQueue::new();
        assert!(queue.is_idle());
        queue.wait().await;
        assert!(!queue.is_idle());
        queue.shift();
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_fifo_order_without_overlap() {
        let queue = Arc::new(AsyncQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(Mutex::new(0usize));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            let active = Arc::clone(&active);
            tasks.push(tokio::spawn(async move {
                queue.wait().await;
                {
                    let mut active = active.lock();
                    assert_eq!(*active, 0, "queue admitted two callers at once");
                    *active += 1;
                }
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                {
                    *active.lock() -= 1;
                    order.lock().push(i);
                }
                queue.shift();
            }));
            // Stagger arrivals so admission order is deterministic.
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let queue = Arc::new(AsyncQueue::new());
        queue.wait().await;

        // Enqueue a waiter and drop it before its turn.
        let cancelled = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cancelled.abort();
        let _ = cancelled.await;

        let survivor = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.wait().await;
                queue.shift();
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        queue.shift();
        survivor.await.unwrap();
        assert!(queue.is_idle());
    }
}
