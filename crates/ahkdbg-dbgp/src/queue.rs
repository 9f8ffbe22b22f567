//! FIFO queue of deferred async tasks.
//!
//! Used to hold front-end requests that arrive before the engine is ready
//! (for example breakpoints set before `configuration_done`) and run them
//! in order once it is.
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// A queued unit of work.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A cloneable FIFO of tasks. Clones share the same queue.
#[derive(Clone, Default)]
pub struct RequestQueue {
    tasks: Arc<Mutex<VecDeque<Task>>>,
    flushing: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the back of the queue.
    pub fn enqueue<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.lock().push_back(Box::pin(task));
    }

    /// Remove the front task without running it.
    pub fn dequeue(&self) -> Option<Task> {
        self.lock().pop_front()
    }

    /// Run queued tasks one at a time until the queue is empty.
    ///
    /// Tasks enqueued while flushing are run too. Concurrent calls wait for
    /// each other. Returns how many tasks this call ran.
    pub async fn flush(&self) -> usize {
        let _guard = self.flushing.lock().await;
        let mut count = 0;
        while let Some(task) = self.dequeue() {
            task.await;
            count += 1;
        }
        if count > 0 {
            tracing::debug!("flushed {} queued request(s)", count);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Task>> {
        // Poisoning is ignored: the deque has no cross-item invariants.
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recorder() -> Arc<Mutex<Vec<u32>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn flush_runs_in_order_and_counts() {
        let queue = RequestQueue::new();
        let log = recorder();
        for i in 0..3 {
            let log = log.clone();
            queue.enqueue(async move {
                // Earlier tasks sleep longer; order must still hold.
                tokio::time::sleep(Duration::from_millis(10 * (3 - i as u64))).await;
                log.lock().unwrap().push(i);
            });
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.flush().await, 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn flush_runs_tasks_enqueued_during_flush() {
        let queue = RequestQueue::new();
        let log = recorder();
        let inner_queue = queue.clone();
        let inner_log = log.clone();
        queue.enqueue(async move {
            inner_log.lock().unwrap().push(1);
            let log = inner_log.clone();
            inner_queue.enqueue(async move {
                log.lock().unwrap().push(2);
            });
        });
        assert_eq!(queue.flush().await, 2);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn empty_flush_returns_zero() {
        assert_eq!(RequestQueue::new().flush().await, 0);
    }

    #[tokio::test]
    async fn concurrent_flushes_serialize() {
        let queue = RequestQueue::new();
        let log = recorder();
        for i in 0..4 {
            let log = log.clone();
            queue.enqueue(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                log.lock().unwrap().push(i);
            });
        }
        let (a, b) = tokio::join!(queue.flush(), queue.flush());
        assert_eq!(a + b, 4);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn dequeue_removes_front_without_running() {
        let queue = RequestQueue::new();
        let log = recorder();
        let first = log.clone();
        queue.enqueue(async move { first.lock().unwrap().push(1) });
        let second = log.clone();
        queue.enqueue(async move { second.lock().unwrap().push(2) });

        let task = queue.dequeue().unwrap();
        assert_eq!(queue.len(), 1);
        assert!(log.lock().unwrap().is_empty());
        task.await;
        assert_eq!(queue.flush().await, 1);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }
}
