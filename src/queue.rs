//! Deduplicating work queue with per-key serialization.

use std::{
    collections::{HashSet, VecDeque},
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::Notify;

///
/// A queue of keys that need reconciling.
///
/// A key is held at most once while pending, and is never handed out again while a worker
/// is still processing it. Keys enqueued during processing are redelivered once the worker
/// calls [`WorkQueue::done`].
///
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

#[derive(Debug)]
struct Inner<K> {
    queue: VecDeque<K>,
    /// Keys that need processing, whether queued or waiting for their in-flight run to end.
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `key` as needing a reconcile. Returns false if the queue is shut down.
    pub fn enqueue(&self, key: K) -> bool {
        let mut inner = self.lock();
        if inner.shutting_down {
            return false;
        }
        if !inner.dirty.insert(key.clone()) {
            return true;
        }
        if inner.processing.contains(&key) {
            return true;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Waits for the next key. Returns `None` once the queue has been shut down.
    pub async fn dequeue(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a shutdown in between cannot be missed.
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Ends processing of `key`, requeueing it if it was enqueued in the meantime.
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Stops accepting keys and wakes every waiting [`WorkQueue::dequeue`].
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }
}
