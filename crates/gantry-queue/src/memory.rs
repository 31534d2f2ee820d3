//! In-memory queue for tests and single-process development.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

use gantry_core::{BuildPackage, Result};

use crate::{Queue, QueuedItem};

/// Unbounded in-process queue with the same route semantics as the
/// Postgres driver.
#[derive(Default)]
pub struct MemoryQueue {
    pending: Mutex<VecDeque<QueuedItem>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, package: BuildPackage) -> Uuid {
        let id = Uuid::now_v7();
        self.pending
            .lock()
            .expect("queue lock poisoned")
            .push_back(QueuedItem { id, package });
        id
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn pop(&self, _worker: &str, routes: &[String]) -> Result<Option<QueuedItem>> {
        let mut pending = self.pending.lock().expect("queue lock poisoned");
        let position = pending
            .iter()
            .position(|item| item.package.eligible(routes));
        Ok(position.and_then(|i| pending.remove(i)))
    }

    async fn ack(&self, _id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn fail(&self, _id: Uuid, _message: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::Pipeline;

    fn package(routes: &[&str]) -> BuildPackage {
        BuildPackage {
            pipeline: Pipeline {
                routes: routes.iter().map(|r| r.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pops_in_fifo_order() {
        let queue = MemoryQueue::new();
        let first = queue.enqueue(package(&[]));
        let second = queue.enqueue(package(&[]));

        assert_eq!(queue.pop("w", &[]).await.unwrap().unwrap().id, first);
        assert_eq!(queue.pop("w", &[]).await.unwrap().unwrap().id, second);
        assert!(queue.pop("w", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skips_items_the_worker_cannot_serve() {
        let queue = MemoryQueue::new();
        queue.enqueue(package(&["gpu"]));
        let eligible = queue.enqueue(package(&["linux"]));

        let offered = vec!["linux".to_string()];
        let popped = queue.pop("w", &offered).await.unwrap().unwrap();
        assert_eq!(popped.id, eligible);

        // The gpu item stays queued for a worker that offers the label.
        assert_eq!(queue.len(), 1);
        let offered = vec!["gpu".to_string(), "linux".to_string()];
        assert!(queue.pop("w", &offered).await.unwrap().is_some());
    }
}
