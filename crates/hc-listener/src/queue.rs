//! Bounded-memory async FIFO between the accept pipeline and
//! `accept_connection` callers.
//!
//! Items and parked waiters are both FIFO; at most one of the two
//! queues is non-empty at any time. Shutdown wakes every waiter with
//! `None` but leaves already-enqueued items readable, so a closing
//! listener can drain and close unaccepted channels.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

pub struct InputQueue<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    items: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<Option<T>>>,
    closed: bool,
}

impl<T: Send + 'static> InputQueue<T> {
    pub fn new() -> Self {
        InputQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Hands `item` to the oldest live waiter, or parks it in the item
    /// queue. Returns `false` (dropping the item) after shutdown.
    pub fn enqueue(&self, item: T) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        let mut item = item;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(Some(item)) {
                Ok(()) => return true,
                // Waiter gave up (timeout); reclaim the item and try the next.
                Err(rejected) => match rejected {
                    Some(reclaimed) => item = reclaimed,
                    None => unreachable!("enqueue always sends Some"),
                },
            }
        }
        state.items.push_back(item);
        true
    }

    /// Waits for the next item. Resolves `None` once the queue is shut
    /// down and drained.
    pub async fn dequeue(&self) -> Option<T> {
        self.dequeue_inner(None).await
    }

    /// Like [`dequeue`](Self::dequeue) but gives up after `timeout`,
    /// resolving `None` and abandoning the waiter slot.
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        self.dequeue_inner(Some(timeout)).await
    }

    async fn dequeue_inner(&self, timeout: Option<Duration>) -> Option<T> {
        let receiver = {
            let mut state = self.state.lock().unwrap();
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        match timeout {
            None => receiver.await.ok().flatten(),
            Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                Ok(result) => result.ok().flatten(),
                // Dropping the receiver marks the waiter dead; enqueue
                // skips it.
                Err(_) => None,
            },
        }
    }

    /// Closes the queue: every parked waiter resolves with `None` in
    /// park order, later enqueues are dropped, in-flight items stay
    /// dequeueable. Idempotent.
    pub fn shutdown(&self) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(None);
        }
    }

    /// Number of items awaiting a consumer.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    /// Drops every remaining item, running each item's close contract
    /// through `Drop`. Idempotent.
    pub fn dispose(&self) {
        let items = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            std::mem::take(&mut state.items)
        };
        drop(items);
    }
}

impl<T: Send + 'static> Default for InputQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn items_come_out_in_enqueue_order() {
        let queue = InputQueue::new();
        assert!(queue.enqueue(1));
        assert!(queue.enqueue(2));
        assert!(queue.enqueue(3));
        assert_eq!(queue.pending_count(), 3);
        assert_eq!(queue.dequeue().await, Some(1));
        assert_eq!(queue.dequeue().await, Some(2));
        assert_eq!(queue.dequeue().await, Some(3));
    }

    #[tokio::test]
    async fn waiters_are_served_in_park_order() {
        let queue = Arc::new(InputQueue::new());
        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue().await }
        });
        tokio::task::yield_now().await;
        let second = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue().await }
        });
        tokio::task::yield_now().await;

        queue.enqueue(10);
        queue.enqueue(20);
        assert_eq!(first.await.unwrap(), Some(10));
        assert_eq!(second.await.unwrap(), Some(20));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiters_are_skipped() {
        let queue = Arc::new(InputQueue::new());
        assert_eq!(
            queue.dequeue_timeout(Duration::from_millis(50)).await,
            None
        );
        // The dead waiter must not swallow the next item.
        queue.enqueue(7);
        assert_eq!(queue.dequeue().await, Some(7));
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters_and_keeps_items() {
        let queue = Arc::new(InputQueue::new());
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue().await }
        });
        tokio::task::yield_now().await;

        queue.enqueue(1);
        // The waiter consumed the item; enqueue another to survive shutdown.
        assert_eq!(waiter.await.unwrap(), Some(1));
        queue.enqueue(2);
        queue.shutdown();

        // Post-shutdown enqueues are dropped.
        assert!(!queue.enqueue(3));
        // Drain semantics: the in-flight item is still readable.
        assert_eq!(queue.dequeue().await, Some(2));
        assert_eq!(queue.dequeue().await, None);
        // Idempotent.
        queue.shutdown();
        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test]
    async fn dispose_drops_remaining_items() {
        struct Tracked(Arc<std::sync::atomic::AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let queue = InputQueue::new();
        queue.enqueue(Tracked(dropped.clone()));
        queue.enqueue(Tracked(dropped.clone()));
        queue.dispose();
        assert_eq!(dropped.load(std::sync::atomic::Ordering::SeqCst), 2);
        queue.dispose();
        assert_eq!(dropped.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_producers_and_consumers_settle() {
        const PER_PRODUCER: usize = 100;
        let queue = Arc::new(InputQueue::new());

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut got = 0usize;
                    while queue.dequeue().await.is_some() {
                        got += 1;
                    }
                    got
                })
            })
            .collect();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for i in 0..PER_PRODUCER {
                        assert!(queue.enqueue(p * PER_PRODUCER + i));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.await.unwrap();
        }
        queue.shutdown();
        // Consumers drain whatever is left, then see None.
        let mut total = 0;
        for consumer in consumers {
            total += consumer.await.unwrap();
        }
        assert_eq!(total, 4 * PER_PRODUCER);
    }
}
