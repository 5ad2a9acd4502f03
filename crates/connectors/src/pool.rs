use crate::{
    client::{ConnectionSource, ServiceClient},
    error::ConnectorError,
    fault::{ClientError, FailureKind},
    redact::redact,
    request::{DataverseRequest, DataverseResponse},
    throttle::ThrottleTracker,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    /// With affinity disabled client creation round-robins across sources;
    /// otherwise it sticks to the first source.
    pub affinity_disabled: bool,
    pub create_retries: usize,
    pub acquire_timeout: Duration,
    /// Generous by default: creating a client may involve interactive
    /// authentication.
    pub create_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 52,
            affinity_disabled: true,
            create_retries: 3,
            acquire_timeout: Duration::from_secs(120),
            create_timeout: Duration::from_secs(300),
        }
    }
}

/// A pool of authenticated service clients shared by every operation of one
/// import run.
///
/// Acquisition is gated by a semaphore sized to `max_pool_size`; released
/// handles return to an idle set unless flagged invalid. The pool observes
/// every response that flows through a handle and feeds throttle signals to
/// its tracker, which in turn shapes `recommended_total_parallelism`.
pub struct ConnectionPool {
    sources: Vec<Arc<dyn ConnectionSource>>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Box<dyn ServiceClient>>>,
    /// Live per-connection parallelism hints, refreshed on every response.
    hints: Mutex<HashMap<String, usize>>,
    throttle: ThrottleTracker,
    next_source: AtomicUsize,
    active: AtomicUsize,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(sources: Vec<Arc<dyn ConnectionSource>>, config: PoolConfig) -> Arc<Self> {
        let permits = config.max_pool_size.max(1);
        Arc::new(Self {
            sources,
            semaphore: Arc::new(Semaphore::new(permits)),
            idle: Mutex::new(VecDeque::new()),
            hints: Mutex::new(HashMap::new()),
            throttle: ThrottleTracker::new(),
            next_source: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            config,
        })
    }

    pub fn throttle(&self) -> &ThrottleTracker {
        &self.throttle
    }

    pub fn max_size(&self) -> usize {
        self.config.max_pool_size
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Waits for a free handle. Raises `PoolExhausted` when nothing frees up
    /// within the configured acquire timeout.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<PooledClient, ConnectorError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
            acquired = timeout(
                self.config.acquire_timeout,
                self.semaphore.clone().acquire_owned(),
            ) => match acquired {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(ConnectorError::Cancelled),
                Err(_) => {
                    return Err(ConnectorError::PoolExhausted {
                        active: self.active_count(),
                        max: self.config.max_pool_size,
                    });
                }
            },
        };

        let client = match self.checkout_idle() {
            Some(client) => client,
            None => self.create_client().await?,
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(PooledClient {
            pool: Arc::clone(self),
            client: Some(client),
            _permit: permit,
            invalid: None,
        })
    }

    /// Sum of per-connection parallelism hints over unthrottled connections,
    /// floored at one. Shrinks while connections sit inside their throttle
    /// window and recovers when the window passes.
    pub fn recommended_total_parallelism(&self) -> usize {
        let hints = self.hints.lock().unwrap_or_else(|e| e.into_inner());
        let total: usize = hints
            .iter()
            .filter(|(name, _)| !self.throttle.is_throttled(name))
            .map(|(_, hint)| *hint)
            .sum();
        total.max(1)
    }

    /// Asks the owning source of `connection` to drop its cached
    /// authentication so the next created client starts from a fresh token.
    pub fn invalidate_source_auth(&self, connection: &str) {
        for source in &self.sources {
            if source.name() == connection {
                warn!(connection, "Invalidating cached authentication");
                source.invalidate_auth();
                return;
            }
        }
    }

    fn checkout_idle(&self) -> Option<Box<dyn ServiceClient>> {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.pop_front()
    }

    fn return_idle(&self, client: Box<dyn ServiceClient>) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.push_back(client);
    }

    fn update_hint(&self, connection: &str, hint: usize) {
        let mut hints = self.hints.lock().unwrap_or_else(|e| e.into_inner());
        hints.insert(connection.to_string(), hint.max(1));
    }

    async fn create_client(&self) -> Result<Box<dyn ServiceClient>, ConnectorError> {
        let source = self.next_source()?;
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match timeout(self.config.create_timeout, source.create_client()).await {
                Ok(Ok(client)) => {
                    self.update_hint(
                        client.connection_name(),
                        client.recommended_parallelism(),
                    );
                    info!(
                        connection = client.connection_name(),
                        "Created pooled service client"
                    );
                    return Ok(client);
                }
                Ok(Err(err)) => {
                    if attempt > self.config.create_retries {
                        return Err(err);
                    }
                    warn!(
                        connection = source.name(),
                        attempt,
                        error = %redact(&err.to_string()),
                        "Client creation failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
                Err(_) => {
                    return Err(ConnectorError::ConnectionFailed {
                        connection: source.name().to_string(),
                        message: format!(
                            "client creation timed out after {:?}",
                            self.config.create_timeout
                        ),
                    });
                }
            }
        }
    }

    fn next_source(&self) -> Result<&Arc<dyn ConnectionSource>, ConnectorError> {
        if self.sources.is_empty() {
            return Err(ConnectorError::ConnectionFailed {
                connection: String::new(),
                message: "pool has no connection sources".to_string(),
            });
        }
        let idx = if self.config.affinity_disabled {
            self.next_source.fetch_add(1, Ordering::Relaxed) % self.sources.len()
        } else {
            0
        };
        Ok(&self.sources[idx])
    }

    fn observe(&self, connection: &str, result: &Result<DataverseResponse, ClientError>) {
        match result {
            Ok(_) => self.throttle.clear(connection),
            Err(err) => match FailureKind::classify(err) {
                FailureKind::Throttle => {
                    let retry_after = match err {
                        ClientError::Fault(fault) => fault.retry_after(),
                        _ => None,
                    };
                    self.throttle.record(connection, retry_after);
                    warn!(
                        connection,
                        retry_after = ?retry_after,
                        "Service protection signal recorded"
                    );
                }
                FailureKind::Cancelled => {}
                _ => self.throttle.clear(connection),
            },
        }
    }
}

/// A checked-out client handle. Scoped ownership: dropping the handle either
/// returns the client to the idle set or, when flagged invalid, discards it.
pub struct PooledClient {
    pool: Arc<ConnectionPool>,
    client: Option<Box<dyn ServiceClient>>,
    _permit: OwnedSemaphorePermit,
    invalid: Option<String>,
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("connection", &self.client.as_deref().map(ServiceClient::connection_name))
            .field("invalid", &self.invalid)
            .finish()
    }
}

impl PooledClient {
    fn inner(&self) -> &dyn ServiceClient {
        self.client
            .as_deref()
            .expect("pooled client present until drop")
    }

    pub fn connection_name(&self) -> &str {
        self.inner().connection_name()
    }

    pub fn display_name(&self) -> &str {
        self.inner().display_name()
    }

    pub fn is_throttled(&self) -> bool {
        self.pool.throttle.is_throttled(self.connection_name())
    }

    pub fn throttle_remaining(&self) -> Option<Duration> {
        self.pool.throttle.remaining(self.connection_name())
    }

    /// Flags the underlying client as unusable; it will be discarded instead
    /// of returned to the pool.
    pub fn mark_invalid(&mut self, reason: impl Into<String>) {
        self.invalid = Some(reason.into());
    }

    pub async fn execute(
        &self,
        request: DataverseRequest,
        cancel: &CancellationToken,
    ) -> Result<DataverseResponse, ClientError> {
        let client = self.inner();
        let result = client.execute(request, cancel).await;
        let name = client.connection_name();
        self.pool.observe(name, &result);
        if result.is_ok() {
            self.pool.update_hint(name, client.recommended_parallelism());
        }
        result
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(client) = self.client.take() {
            match &self.invalid {
                Some(reason) => {
                    debug!(
                        connection = client.connection_name(),
                        reason, "Discarding invalidated client"
                    );
                }
                None => self.pool.return_idle(client),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultDetailValue, RETRY_AFTER_KEY, SERVICE_PROTECTION_CODES, ServiceFault};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct StubClient {
        name: String,
        parallelism: usize,
        throttle_next: AtomicBool,
    }

    #[async_trait]
    impl ServiceClient for StubClient {
        fn connection_name(&self) -> &str {
            &self.name
        }

        fn recommended_parallelism(&self) -> usize {
            self.parallelism
        }

        async fn execute(
            &self,
            _request: DataverseRequest,
            _cancel: &CancellationToken,
        ) -> Result<DataverseResponse, ClientError> {
            if self.throttle_next.swap(false, Ordering::SeqCst) {
                let fault = ServiceFault::new(SERVICE_PROTECTION_CODES[0], "slow down")
                    .with_detail(
                        RETRY_AFTER_KEY,
                        FaultDetailValue::Interval(Duration::from_secs(60)),
                    );
                return Err(ClientError::Fault(fault));
            }
            Ok(DataverseResponse::Ack)
        }
    }

    struct StubSource {
        name: String,
        parallelism: usize,
        throttle_first: bool,
        created: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionSource for StubSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn create_client(&self) -> Result<Box<dyn ServiceClient>, ConnectorError> {
            let first = self.created.fetch_add(1, Ordering::SeqCst) == 0;
            Ok(Box::new(StubClient {
                name: self.name.clone(),
                parallelism: self.parallelism,
                throttle_next: AtomicBool::new(self.throttle_first && first),
            }))
        }
    }

    fn pool_with(source: StubSource, config: PoolConfig) -> Arc<ConnectionPool> {
        ConnectionPool::new(vec![Arc::new(source)], config)
    }

    fn quiet_source(name: &str, parallelism: usize) -> StubSource {
        StubSource {
            name: name.to_string(),
            parallelism,
            throttle_first: false,
            created: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn released_clients_are_reused() {
        let pool = pool_with(quiet_source("primary", 4), PoolConfig::default());
        let cancel = CancellationToken::new();

        let handle = pool.acquire(&cancel).await.unwrap();
        drop(handle);
        let _again = pool.acquire(&cancel).await.unwrap();

        let idle = pool.idle.lock().unwrap();
        assert!(idle.is_empty(), "second acquire should reuse the idle client");
    }

    #[tokio::test]
    async fn invalid_clients_are_discarded() {
        let pool = pool_with(quiet_source("primary", 4), PoolConfig::default());
        let cancel = CancellationToken::new();

        let mut handle = pool.acquire(&cancel).await.unwrap();
        handle.mark_invalid("socket reset");
        drop(handle);

        assert!(pool.idle.lock().unwrap().is_empty());
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn acquire_times_out_with_pool_exhausted() {
        let config = PoolConfig {
            max_pool_size: 1,
            acquire_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let pool = pool_with(quiet_source("primary", 4), config);
        let cancel = CancellationToken::new();

        let _held = pool.acquire(&cancel).await.unwrap();
        let err = pool.acquire(&cancel).await.unwrap_err();
        match err {
            ConnectorError::PoolExhausted { active, max } => {
                assert_eq!(active, 1);
                assert_eq!(max, 1);
            }
            other => panic!("expected PoolExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn throttle_signal_shrinks_recommended_parallelism() {
        let source = StubSource {
            name: "primary".to_string(),
            parallelism: 8,
            throttle_first: true,
            created: AtomicUsize::new(0),
        };
        let pool = pool_with(source, PoolConfig::default());
        let cancel = CancellationToken::new();

        let handle = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.recommended_total_parallelism(), 8);

        let err = handle
            .execute(DataverseRequest::RetrieveManyToManyRelationships, &cancel)
            .await
            .unwrap_err();
        assert_eq!(FailureKind::classify(&err), FailureKind::Throttle);
        assert!(handle.is_throttled());
        assert_eq!(pool.recommended_total_parallelism(), 1);

        // A successful call clears the stale window.
        handle
            .execute(DataverseRequest::RetrieveManyToManyRelationships, &cancel)
            .await
            .unwrap();
        assert_eq!(pool.recommended_total_parallelism(), 8);
    }

    #[tokio::test]
    async fn cancelled_acquire_returns_cancelled() {
        let pool = pool_with(quiet_source("primary", 4), PoolConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        match pool.acquire(&cancel).await {
            Err(ConnectorError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }
}
