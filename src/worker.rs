//! Fixed pool of tasks draining the work queue.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::task::JoinSet;

use crate::{Action, IngressKey, Reconcile, queue::WorkQueue, repair::RepairScheduler};

///
/// Runs `workers` tasks that each take a key from the queue, reconcile it and report it done.
/// The queue never hands out a key that is already being processed, so no two workers ever
/// reconcile the same key at the same time.
///
pub struct WorkerPool {
    tasks: JoinSet<()>,
}

impl WorkerPool {
    pub fn spawn(
        workers: usize,
        queue: Arc<WorkQueue<IngressKey>>,
        reconciler: Arc<dyn Reconcile>,
        repairs: RepairScheduler,
    ) -> Self {
        let mut tasks = JoinSet::new();
        for id in 0..workers {
            tasks.spawn(run_worker(id, queue.clone(), reconciler.clone(), repairs.clone()));
        }
        info!("Started {workers} worker(s)");
        Self { tasks }
    }

    /// Waits for every worker to finish. Workers exit once the queue shuts down.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!("Worker terminated abnormally: {e}");
            }
        }
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<WorkQueue<IngressKey>>,
    reconciler: Arc<dyn Reconcile>,
    repairs: RepairScheduler,
) {
    while let Some(key) = queue.dequeue().await {
        let action = reconciler.reconcile(&key).await;
        if let Action::Repair(delay) = action {
            repairs.schedule(key.clone(), delay);
        }
        queue.done(&key);
    }
    debug!("Worker {id} stopped");
}
