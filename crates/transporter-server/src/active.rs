//! Tracking of in-flight public connections
//!
//! Every public connection accepted by a tunnel runs as one task (rendezvous,
//! then splice). The tracker keeps their handles so teardown can abort
//! whatever is still running.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Tracks tasks serving public connections of one tunnel
#[derive(Default)]
pub struct ActiveConnections {
    next_id: AtomicU64,
    tasks: Arc<DashMap<u64, JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ActiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task. The task removes itself when it finishes.
    ///
    /// Returns `None` (and does not spawn) once [`abort_all`](Self::abort_all)
    /// has been called.
    pub fn spawn<F>(&self, task: F) -> Option<u64>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            // Run only after the handle is in the map so the removal below
            // cannot precede the insert
            let _ = registered_rx.await;
            task.await;
            tasks.remove(&id);
        });

        self.tasks.insert(id, handle);
        let _ = registered_tx.send(());

        // abort_all may have run between the closed check and the insert
        if self.closed.load(Ordering::Acquire) {
            if let Some((_, handle)) = self.tasks.remove(&id) {
                handle.abort();
            }
        }

        Some(id)
    }

    /// Abort every tracked task and refuse new ones. Returns how many were aborted.
    pub fn abort_all(&self) -> usize {
        self.closed.store(true, Ordering::Release);

        let ids: Vec<u64> = self.tasks.iter().map(|entry| *entry.key()).collect();
        let mut aborted = 0;
        for id in ids {
            if let Some((_, handle)) = self.tasks.remove(&id) {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for ActiveConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveConnections")
            .field("active", &self.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_finished_tasks_remove_themselves() {
        let active = ActiveConnections::new();
        let (done_tx, done_rx) = oneshot::channel();

        active.spawn(async move {
            let _ = done_tx.send(());
        });
        done_rx.await.unwrap();

        // Give the task a moment to run its cleanup
        for _ in 0..100 {
            if active.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_abort_all() {
        let active = ActiveConnections::new();
        let (dropped_tx, dropped_rx) = oneshot::channel::<()>();

        active.spawn(async move {
            let _guard = dropped_tx;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        active.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(active.len(), 2);

        assert_eq!(active.abort_all(), 2);
        assert!(active.is_empty());

        // Aborting drops the task's future
        assert!(dropped_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_refused_after_abort_all() {
        let active = ActiveConnections::new();
        active.abort_all();

        assert_eq!(active.spawn(async {}), None);
        assert!(active.is_empty());
    }
}
