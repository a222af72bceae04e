use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::SubmitError;

/// Bounded FIFO of jobs waiting for a free worker
///
/// This is the only state the workers share. Pushing never waits: a full
/// queue rejects the job outright.
pub struct JobQueue<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    max_depth: usize,
}

impl<T> JobQueue<T> {
    pub fn new(max_depth: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(max_depth)),
            notify: Notify::new(),
            max_depth,
        }
    }

    pub fn try_push(&self, job: T) -> Result<(), SubmitError> {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.max_depth {
                return Err(SubmitError::Overloaded { depth: queue.len() });
            }
            queue.push_back(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub async fn pop(&self) -> T {
        loop {
            let next = self.queue.lock().pop_front();
            if let Some(job) = next {
                return job;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Removes every waiting job, oldest first
    pub fn drain(&self) -> Vec<T> {
        self.queue.lock().drain(..).collect()
    }
}
