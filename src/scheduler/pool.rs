//! Bounded worker slots.
//!
//! Every attempt holds one global permit for as long as it runs. Attempts
//! whose resource class has a sub-limit also hold a permit from that class,
//! acquired first so a queued attempt never sits on a global slot.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::ExecutionError;
use crate::phase::ResourceClass;

/// Permits held by one running attempt. Released on drop.
#[derive(Debug)]
pub struct WorkerPermit {
    _class: Option<OwnedSemaphorePermit>,
    _global: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    max_parallel: usize,
    global: Arc<Semaphore>,
    classes: Arc<BTreeMap<ResourceClass, Arc<Semaphore>>>,
}

impl WorkerPool {
    /// `class_limits` entries larger than `max_parallel` are capped to it;
    /// a limit of zero is raised to one.
    pub fn new(max_parallel: usize, class_limits: &BTreeMap<String, usize>) -> Self {
        let max_parallel = max_parallel.max(1);
        let classes = class_limits
            .iter()
            .map(|(name, limit)| {
                let limit = (*limit).clamp(1, max_parallel);
                (ResourceClass::new(name.clone()), Arc::new(Semaphore::new(limit)))
            })
            .collect();

        Self {
            max_parallel,
            global: Arc::new(Semaphore::new(max_parallel)),
            classes: Arc::new(classes),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Free global slots right now.
    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    /// Wait for a slot for an attempt of `class`.
    pub async fn acquire(&self, class: &ResourceClass) -> Result<WorkerPermit, ExecutionError> {
        let class_permit = match self.classes.get(class) {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| ExecutionError::Context("worker pool closed".into()))?,
            ),
            None => None,
        };

        let global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| ExecutionError::Context("worker pool closed".into()))?;

        Ok(WorkerPermit {
            _class: class_permit,
            _global: global,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn peak_concurrency(pool: WorkerPool, classes: Vec<&'static str>) -> usize {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for class in classes {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = pool.acquire(&ResourceClass::new(class)).await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        peak.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_global_limit_holds() {
        let pool = WorkerPool::new(3, &BTreeMap::new());
        let peak = peak_concurrency(pool, vec!["default"; 10]).await;
        assert!(peak <= 3, "peak {} exceeded limit", peak);
        assert!(peak >= 2);
    }

    #[tokio::test]
    async fn test_class_sub_limit_holds() {
        let limits = BTreeMap::from([("gpu".to_string(), 1)]);
        let pool = WorkerPool::new(4, &limits);
        let peak = peak_concurrency(pool, vec!["gpu"; 5]).await;
        assert_eq!(peak, 1);
    }

    #[test]
    fn test_limits_are_clamped() {
        let limits = BTreeMap::from([("io".to_string(), 99), ("zero".to_string(), 0)]);
        let pool = WorkerPool::new(0, &limits);
        assert_eq!(pool.max_parallel(), 1);
        assert_eq!(pool.available(), 1);
        assert_eq!(
            pool.classes
                .get(&ResourceClass::new("io"))
                .unwrap()
                .available_permits(),
            1
        );
    }

    #[tokio::test]
    async fn test_permit_release_on_drop() {
        let pool = WorkerPool::new(1, &BTreeMap::new());
        let permit = pool.acquire(&ResourceClass::default()).await.unwrap();
        assert_eq!(pool.available(), 0);
        drop(permit);
        assert_eq!(pool.available(), 1);
    }
}
