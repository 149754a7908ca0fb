//! Fire-and-forget post-processing for created orders.
//!
//! Jobs go onto a bounded queue and a single worker launches each one with
//! bounded concurrency. Delivery is best-effort: a full queue drops the job,
//! nothing awaits a job's completion, and queued or running jobs are lost when
//! the process exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

pub const QUEUE_CAPACITY: usize = 1024;
pub const MAX_CONCURRENT_JOBS: usize = 64;
pub const INVENTORY_CHECK_DELAY: Duration = Duration::from_millis(100);

/// Simulated downstream call to the inventory service for a new order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryCheck {
    pub order_id: i32,
}

pub trait TaskDispatch: Send + Sync {
    /// Queues `job` without waiting for it. Returns `false` if it was dropped.
    fn dispatch(&self, job: InventoryCheck) -> bool;
}

pub struct BackgroundTasks {
    sender: mpsc::Sender<InventoryCheck>,
    completed: Arc<AtomicU64>,
}

impl BackgroundTasks {
    /// Spawns the worker onto the current runtime.
    pub fn start(queue_capacity: usize, max_concurrent: usize, job_delay: Duration) -> Self {
        let (tasks, worker) = Self::new(queue_capacity, max_concurrent, job_delay);
        tokio::spawn(worker.run());
        tasks
    }

    fn new(queue_capacity: usize, max_concurrent: usize, job_delay: Duration) -> (Self, TaskWorker) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let completed = Arc::new(AtomicU64::new(0));

        let worker = TaskWorker {
            receiver,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            job_delay,
            completed: completed.clone(),
        };

        (Self { sender, completed }, worker)
    }

    /// Jobs finished so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

impl TaskDispatch for BackgroundTasks {
    fn dispatch(&self, job: InventoryCheck) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(order_id = job.order_id, "Background queue full, dropping inventory check");
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(order_id = job.order_id, "Background worker stopped, dropping inventory check");
                false
            }
        }
    }
}

struct TaskWorker {
    receiver: mpsc::Receiver<InventoryCheck>,
    permits: Arc<Semaphore>,
    job_delay: Duration,
    completed: Arc<AtomicU64>,
}

impl TaskWorker {
    async fn run(mut self) {
        while let Some(job) = self.receiver.recv().await {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let delay = self.job_delay;
            let completed = self.completed.clone();

            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let total = completed.fetch_add(1, Ordering::Relaxed) + 1;
                info!(completed_total = total, "Order {}: Inventory check completed", job.order_id);
                drop(permit);
            });
        }
    }
}
