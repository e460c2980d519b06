//! Cancellable background tasks keyed by instance id

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

type TaskMap = HashMap<String, (u64, JoinHandle<()>)>;

/// At most one reconciliation task runs per instance. Scheduling an id that
/// already has a task aborts the old one.
#[derive(Clone, Default)]
pub struct ReconcileScheduler {
    tasks: Arc<Mutex<TaskMap>>,
    generation: Arc<AtomicU64>,
}

impl ReconcileScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TaskMap> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schedule<F>(&self, instance_id: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let tasks = Arc::clone(&self.tasks);
        let key = instance_id.to_string();

        // Held across spawn so the finished task cannot remove its entry
        // before it has been inserted
        let mut map = self.lock();

        let handle = tokio::spawn({
            let key = key.clone();
            async move {
                task.await;
                let mut map = tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if map.get(&key).is_some_and(|(g, _)| *g == generation) {
                    map.remove(&key);
                }
            }
        });

        if let Some((_, previous)) = map.insert(key, (generation, handle)) {
            debug!(instance_id, "Replacing reconciliation task");
            previous.abort();
        }
    }

    /// Abort the task for `instance_id`; returns whether one was running
    pub fn cancel(&self, instance_id: &str) -> bool {
        match self.lock().remove(instance_id) {
            Some((_, handle)) => {
                handle.abort();
                debug!(instance_id, "Cancelled reconciliation task");
                true
            }
            None => false,
        }
    }

    /// Abort every task; used on shutdown
    pub fn cancel_all(&self) -> usize {
        let tasks: Vec<_> = self.lock().drain().collect();
        for (_, (_, handle)) in &tasks {
            handle.abort();
        }
        tasks.len()
    }

    pub fn is_scheduled(&self, instance_id: &str) -> bool {
        self.lock().contains_key(instance_id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn wait_until_idle(scheduler: &ReconcileScheduler, id: &str) {
        for _ in 0..100 {
            if !scheduler.is_scheduled(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task for {} never finished", id);
    }

    #[tokio::test]
    async fn test_finished_task_removes_itself() {
        let scheduler = ReconcileScheduler::new();
        let (tx, rx) = oneshot::channel::<()>();

        scheduler.schedule("inst-1", async move {
            let _ = rx.await;
        });
        assert!(scheduler.is_scheduled("inst-1"));

        tx.send(()).unwrap();
        wait_until_idle(&scheduler, "inst-1").await;
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test]
    async fn test_reschedule_aborts_previous_task() {
        let scheduler = ReconcileScheduler::new();
        let completed = Arc::new(AtomicUsize::new(0));

        let first = Arc::clone(&completed);
        scheduler.schedule("inst-1", async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            first.fetch_add(1, Ordering::SeqCst);
        });

        let second = Arc::clone(&completed);
        scheduler.schedule("inst-1", async move {
            second.fetch_add(10, Ordering::SeqCst);
        });

        wait_until_idle(&scheduler, "inst-1").await;
        assert_eq!(completed.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_cancel() {
        let scheduler = ReconcileScheduler::new();
        scheduler.schedule("inst-1", std::future::pending());

        assert!(scheduler.cancel("inst-1"));
        assert!(!scheduler.is_scheduled("inst-1"));
        assert!(!scheduler.cancel("inst-1"));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let scheduler = ReconcileScheduler::new();
        scheduler.schedule("inst-1", std::future::pending());
        scheduler.schedule("inst-2", std::future::pending());

        assert_eq!(scheduler.cancel_all(), 2);
        assert_eq!(scheduler.active_count(), 0);
    }
}
