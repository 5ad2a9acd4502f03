use crate::error::CoreError;
use connectors::pool::ConnectionPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(120);

/// Cross-operation gate on concurrently executing batches.
///
/// One coordinator is shared by every bulk operation of an import so that
/// parallel entities cannot each claim the pool's full capacity for
/// themselves. Capacity tracks the pool's recommended total parallelism and
/// only ever grows; backpressure under throttle comes from batches holding
/// their slot longer, not from revoking permits.
pub struct BatchCoordinator {
    pool: Arc<ConnectionPool>,
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
    acquire_timeout: Duration,
}

/// A permit for one in-flight batch. Released exactly once, on drop; slots
/// cannot be cloned or re-released.
#[derive(Debug)]
pub struct BatchSlot {
    _permit: OwnedSemaphorePermit,
}

impl BatchCoordinator {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self::with_timeout(pool, DEFAULT_ACQUIRE_TIMEOUT)
    }

    pub fn with_timeout(pool: Arc<ConnectionPool>, acquire_timeout: Duration) -> Self {
        let initial = pool.recommended_total_parallelism().max(1);
        Self {
            pool,
            semaphore: Arc::new(Semaphore::new(initial)),
            capacity: AtomicUsize::new(initial),
            acquire_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<BatchSlot, CoreError> {
        self.grow_to_recommendation();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            acquired = timeout(
                self.acquire_timeout,
                self.semaphore.clone().acquire_owned(),
            ) => match acquired {
                Ok(Ok(permit)) => Ok(BatchSlot { _permit: permit }),
                Ok(Err(_)) => Err(CoreError::Cancelled),
                Err(_) => Err(CoreError::CoordinatorExhausted {
                    available: self.available(),
                    capacity: self.capacity(),
                    timeout: self.acquire_timeout,
                }),
            },
        }
    }

    /// Expands capacity to the pool's current recommendation. Never shrinks.
    fn grow_to_recommendation(&self) {
        let target = self.pool.recommended_total_parallelism();
        loop {
            let current = self.capacity.load(Ordering::SeqCst);
            if target <= current {
                return;
            }
            if self
                .capacity
                .compare_exchange(current, target, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.semaphore.add_permits(target - current);
                debug!(from = current, to = target, "Coordinator capacity expanded");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use connectors::client::{ConnectionSource, ServiceClient};
    use connectors::error::ConnectorError;
    use connectors::fault::ClientError;
    use connectors::pool::PoolConfig;
    use connectors::request::{DataverseRequest, DataverseResponse};

    struct FixedClient {
        name: String,
        parallelism: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServiceClient for FixedClient {
        fn connection_name(&self) -> &str {
            &self.name
        }

        fn recommended_parallelism(&self) -> usize {
            self.parallelism.load(Ordering::SeqCst)
        }

        async fn execute(
            &self,
            _request: DataverseRequest,
            _cancel: &CancellationToken,
        ) -> Result<DataverseResponse, ClientError> {
            Ok(DataverseResponse::Ack)
        }
    }

    struct FixedSource {
        parallelism: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionSource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn create_client(&self) -> Result<Box<dyn ServiceClient>, ConnectorError> {
            Ok(Box::new(FixedClient {
                name: "fixed".to_string(),
                parallelism: Arc::clone(&self.parallelism),
            }))
        }
    }

    async fn pool_with_parallelism(parallelism: Arc<AtomicUsize>) -> Arc<ConnectionPool> {
        let pool = ConnectionPool::new(
            vec![Arc::new(FixedSource {
                parallelism,
            })],
            PoolConfig::default(),
        );
        // Prime the pool so the hint map is populated.
        let cancel = CancellationToken::new();
        let handle = pool.acquire(&cancel).await.unwrap();
        handle
            .execute(DataverseRequest::RetrieveManyToManyRelationships, &cancel)
            .await
            .unwrap();
        drop(handle);
        pool
    }

    #[tokio::test]
    async fn capacity_grows_with_the_pool_and_never_shrinks() {
        let parallelism = Arc::new(AtomicUsize::new(2));
        let pool = pool_with_parallelism(Arc::clone(&parallelism)).await;
        let coordinator = BatchCoordinator::new(Arc::clone(&pool));
        assert_eq!(coordinator.capacity(), 2);

        parallelism.store(6, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let handle = pool.acquire(&cancel).await.unwrap();
        handle
            .execute(DataverseRequest::RetrieveManyToManyRelationships, &cancel)
            .await
            .unwrap();
        drop(handle);

        let slot = coordinator.acquire(&cancel).await.unwrap();
        assert_eq!(coordinator.capacity(), 6);
        drop(slot);

        // A lower recommendation leaves capacity untouched.
        parallelism.store(1, Ordering::SeqCst);
        let _slot = coordinator.acquire(&cancel).await.unwrap();
        assert_eq!(coordinator.capacity(), 6);
    }

    #[tokio::test]
    async fn acquire_timeout_reports_exhaustion() {
        let parallelism = Arc::new(AtomicUsize::new(1));
        let pool = pool_with_parallelism(parallelism).await;
        let coordinator =
            BatchCoordinator::with_timeout(Arc::clone(&pool), Duration::from_millis(30));
        let cancel = CancellationToken::new();

        let _held = coordinator.acquire(&cancel).await.unwrap();
        match coordinator.acquire(&cancel).await {
            Err(CoreError::CoordinatorExhausted {
                available,
                capacity,
                ..
            }) => {
                assert_eq!(available, 0);
                assert_eq!(capacity, 1);
            }
            other => panic!("expected CoordinatorExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_beats_waiting() {
        let parallelism = Arc::new(AtomicUsize::new(1));
        let pool = pool_with_parallelism(parallelism).await;
        let coordinator = BatchCoordinator::new(pool);
        let cancel = CancellationToken::new();

        let _held = coordinator.acquire(&cancel).await.unwrap();
        cancel.cancel();
        match coordinator.acquire(&cancel).await {
            Err(CoreError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }
}
