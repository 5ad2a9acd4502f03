use crate::bulk::{diagnostics::analyze_batch_failure, support::BulkSupportRegistry};
use crate::error::ProcessingError;
use connectors::{
    error::ConnectorError,
    fault::{ClientError, FailureKind, ServiceFault, is_bulk_unsupported_message},
    pool::{ConnectionPool, PooledClient},
    redact::redact,
    request::{DataverseRequest, DataverseResponse, RequestParams},
};
use engine_core::{
    batch_size::AdaptiveBatchSizer,
    coordinator::BatchCoordinator,
    error::CoreError,
    result::{BulkResult, RecordFailure},
    retry::RetryPolicy,
};
use futures::stream::{self, StreamExt};
use model::{
    core::reference::EntityReference, execution::options::AdaptiveBatchConfig,
    records::record::EntityRecord,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_THROTTLE_WAIT: Duration = Duration::from_secs(300);
const PREFLIGHT_POLL_CAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOperation {
    Create,
    Update,
    Upsert,
    Delete,
}

#[derive(Debug, Clone)]
pub struct BulkExecutorConfig {
    pub batch_size: usize,
    pub use_bulk_apis: bool,
    pub params: RequestParams,
    pub preflight_attempts: usize,
    pub adaptive: Option<AdaptiveBatchConfig>,
}

impl Default for BulkExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            use_bulk_apis: true,
            params: RequestParams::default(),
            preflight_attempts: 10,
            adaptive: None,
        }
    }
}

/// A batch in flight: either whole records or bare identifiers (deletes).
#[derive(Debug, Clone)]
enum BatchPayload {
    Records(Vec<EntityRecord>),
    Ids(Vec<Uuid>),
}

impl BatchPayload {
    fn len(&self) -> usize {
        match self {
            BatchPayload::Records(r) => r.len(),
            BatchPayload::Ids(i) => i.len(),
        }
    }

    fn record_id(&self, index: usize) -> Option<Uuid> {
        match self {
            BatchPayload::Records(r) => r.get(index).map(|rec| rec.id),
            BatchPayload::Ids(i) => i.get(index).copied(),
        }
    }

    fn records(&self) -> Option<&[EntityRecord]> {
        match self {
            BatchPayload::Records(r) => Some(r),
            BatchPayload::Ids(_) => None,
        }
    }

    fn chunk(self, size: usize) -> Vec<BatchPayload> {
        match self {
            BatchPayload::Records(r) => r
                .chunks(size)
                .map(|c| BatchPayload::Records(c.to_vec()))
                .collect(),
            BatchPayload::Ids(i) => i
                .chunks(size)
                .map(|c| BatchPayload::Ids(c.to_vec()))
                .collect(),
        }
    }
}

enum BatchOutcome {
    Done(BulkResult),
    /// The server rejected the multi-record variant for this entity type.
    NotSupported,
}

/// Batches record lists, dispatches batches under the coordinator, and owns
/// the retry taxonomy: throttle waits, bounded auth/connection retries,
/// bulk-infrastructure backoff, pool-exhaustion backoff, partial-success
/// decoding and the per-record fallback for bulk-incapable entities.
pub struct BulkExecutor {
    pool: Arc<ConnectionPool>,
    coordinator: Arc<BatchCoordinator>,
    config: BulkExecutorConfig,
    support: Arc<BulkSupportRegistry>,
    sizer: Option<Mutex<AdaptiveBatchSizer>>,
}

impl BulkExecutor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        coordinator: Arc<BatchCoordinator>,
        config: BulkExecutorConfig,
        support: Arc<BulkSupportRegistry>,
    ) -> Self {
        let sizer = config
            .adaptive
            .clone()
            .map(|adaptive| Mutex::new(AdaptiveBatchSizer::new(config.batch_size, adaptive)));
        Self {
            pool,
            coordinator,
            config,
            support,
            sizer,
        }
    }

    pub async fn create_multiple(
        &self,
        entity: &str,
        records: Vec<EntityRecord>,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, ProcessingError> {
        self.execute_operation(BulkOperation::Create, entity, BatchPayload::Records(records), cancel)
            .await
    }

    pub async fn update_multiple(
        &self,
        entity: &str,
        records: Vec<EntityRecord>,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, ProcessingError> {
        self.execute_operation(BulkOperation::Update, entity, BatchPayload::Records(records), cancel)
            .await
    }

    pub async fn upsert_multiple(
        &self,
        entity: &str,
        records: Vec<EntityRecord>,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, ProcessingError> {
        self.execute_operation(BulkOperation::Upsert, entity, BatchPayload::Records(records), cancel)
            .await
    }

    pub async fn delete_multiple(
        &self,
        entity: &str,
        ids: Vec<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, ProcessingError> {
        self.execute_operation(BulkOperation::Delete, entity, BatchPayload::Ids(ids), cancel)
            .await
    }

    async fn execute_operation(
        &self,
        op: BulkOperation,
        entity: &str,
        payload: BatchPayload,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, ProcessingError> {
        let total = payload.len();
        if total == 0 {
            return Ok(BulkResult::empty());
        }
        let started = Instant::now();

        if !self.config.use_bulk_apis || self.support.is_unsupported(entity) {
            let mut result = self.execute_per_record(op, entity, payload, 0, cancel).await?;
            result.duration = started.elapsed();
            return Ok(result);
        }

        let batch_size = self.next_batch_size().max(1);
        let batches = payload.chunk(batch_size);
        let batch_count = batches.len();
        let parallelism = self.effective_parallelism();
        let mut merged = BulkResult::empty();

        debug!(
            entity,
            records = total,
            batches = batch_count,
            batch_size,
            parallelism,
            "Dispatching bulk operation"
        );

        if batch_count <= 1 || parallelism <= 1 {
            for (index, batch) in batches.into_iter().enumerate() {
                let base = index * batch_size;
                let result = self.run_batch(op, entity, batch, base, cancel).await?;
                merged.merge(result);
            }
        } else {
            let outcomes = stream::iter(batches.into_iter().enumerate().map(|(index, batch)| {
                let base = index * batch_size;
                self.run_batch(op, entity, batch, base, cancel)
            }))
            .buffer_unordered(parallelism)
            .collect::<Vec<_>>()
            .await;
            for outcome in outcomes {
                merged.merge(outcome?);
            }
        }

        merged.duration = started.elapsed();
        self.observe_batches(total, batch_count, merged.duration);
        Ok(merged)
    }

    /// One batch end to end, including the per-record fallback when the
    /// entity turns out not to support the bulk variant.
    async fn run_batch(
        &self,
        op: BulkOperation,
        entity: &str,
        batch: BatchPayload,
        base_index: usize,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, ProcessingError> {
        match self
            .execute_batch_with_throttle_handling(op, entity, &batch, base_index, cancel)
            .await?
        {
            BatchOutcome::Done(result) => Ok(result),
            BatchOutcome::NotSupported => {
                self.support.mark_unsupported(entity);
                self.execute_per_record(op, entity, batch, base_index, cancel).await
            }
        }
    }

    async fn execute_batch_with_throttle_handling(
        &self,
        op: BulkOperation,
        entity: &str,
        batch: &BatchPayload,
        base_index: usize,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, ProcessingError> {
        let _slot = match self.coordinator.acquire(cancel).await {
            Ok(slot) => slot,
            Err(CoreError::Cancelled) => return Ok(BatchOutcome::Done(BulkResult::empty())),
            Err(err) => return Err(err.into()),
        };

        let started = Instant::now();
        let infra_policy = RetryPolicy::bulk_infrastructure();
        let conn_policy = RetryPolicy::connection();
        let mut infra_attempts = 0usize;
        let mut conn_attempts = 0usize;
        let mut auth_attempts = 0usize;

        loop {
            let mut client = match self.acquire_unthrottled(cancel).await {
                Ok(client) => client,
                Err(ProcessingError::Cancelled) => {
                    return Ok(BatchOutcome::Done(BulkResult::empty()));
                }
                Err(err) => return Err(err),
            };

            let request = self.build_bulk_request(op, entity, batch.clone());
            match client.execute(request, cancel).await {
                Ok(response) => {
                    let mut result = self.decode_success(op, batch, response);
                    result.duration = started.elapsed();
                    return Ok(BatchOutcome::Done(result));
                }
                Err(ClientError::Cancelled) => {
                    return Ok(BatchOutcome::Done(BulkResult::empty()));
                }
                Err(err) => match FailureKind::classify(&err) {
                    FailureKind::Throttle => {
                        let wait = match &err {
                            ClientError::Fault(fault) => fault
                                .retry_after()
                                .unwrap_or(connectors::fault::DEFAULT_RETRY_AFTER),
                            _ => connectors::fault::DEFAULT_RETRY_AFTER,
                        }
                        .min(MAX_THROTTLE_WAIT);
                        warn!(
                            entity,
                            connection = client.connection_name(),
                            wait = ?wait,
                            "Batch throttled, waiting out the retry-after"
                        );
                        drop(client);
                        if !self.sleep_cancellable(wait, cancel).await {
                            return Ok(BatchOutcome::Done(BulkResult::empty()));
                        }
                    }
                    FailureKind::AuthToken => {
                        let connection = client.connection_name().to_string();
                        client.mark_invalid("access token rejected");
                        self.pool.invalidate_source_auth(&connection);
                        drop(client);
                        auth_attempts += 1;
                        if conn_policy.is_exhausted(auth_attempts) {
                            return Err(ConnectorError::AuthFailed {
                                connection,
                                message: redact(&err.to_string()),
                            }
                            .into());
                        }
                        let delay = conn_policy.backoff_delay(auth_attempts - 1);
                        if !self.sleep_cancellable(delay, cancel).await {
                            return Ok(BatchOutcome::Done(BulkResult::empty()));
                        }
                    }
                    FailureKind::Connection => {
                        let connection = client.connection_name().to_string();
                        client.mark_invalid("transport failure");
                        drop(client);
                        conn_attempts += 1;
                        if conn_policy.is_exhausted(conn_attempts) {
                            return Err(ConnectorError::ConnectionFailed {
                                connection,
                                message: redact(&err.to_string()),
                            }
                            .into());
                        }
                        let delay = conn_policy.backoff_delay(conn_attempts - 1);
                        if !self.sleep_cancellable(delay, cancel).await {
                            return Ok(BatchOutcome::Done(BulkResult::empty()));
                        }
                    }
                    FailureKind::BulkInfrastructure | FailureKind::Deadlock => {
                        infra_attempts += 1;
                        if infra_policy.is_exhausted(infra_attempts) {
                            error!(
                                entity,
                                attempts = infra_attempts,
                                error = %redact(&err.to_string()),
                                "Bulk infrastructure failure persisted past backoff"
                            );
                            return Err(ProcessingError::BulkInfrastructure {
                                entity: entity.to_string(),
                                attempts: infra_attempts,
                                message: redact(&err.to_string()),
                            });
                        }
                        let delay = infra_policy.backoff_delay(infra_attempts - 1);
                        warn!(
                            entity,
                            attempt = infra_attempts,
                            delay = ?delay,
                            "Transient bulk infrastructure failure, backing off"
                        );
                        drop(client);
                        if !self.sleep_cancellable(delay, cancel).await {
                            return Ok(BatchOutcome::Done(BulkResult::empty()));
                        }
                    }
                    FailureKind::AuthPrivilege => {
                        warn!(entity, "Privilege failure, batch converted to per-record errors");
                        let (code, message) = fault_parts(&err);
                        return Ok(BatchOutcome::Done(self.whole_batch_failure(
                            entity,
                            batch,
                            base_index,
                            code,
                            &message,
                            started.elapsed(),
                        )));
                    }
                    FailureKind::DuplicateKey | FailureKind::Other | FailureKind::Cancelled => {
                        if let ClientError::Fault(fault) = &err {
                            let all_failed = fault
                                .bulk_api_error_details()
                                .map(|rows| rows.len() >= batch.len())
                                .unwrap_or(true);
                            if all_failed && is_bulk_unsupported_message(&fault.message) {
                                return Ok(BatchOutcome::NotSupported);
                            }
                            if let Some(mut result) =
                                self.decode_partial_success(op, entity, batch, base_index, fault)
                            {
                                result.duration = started.elapsed();
                                return Ok(BatchOutcome::Done(result));
                            }
                        }
                        let (code, message) = fault_parts(&err);
                        return Ok(BatchOutcome::Done(self.whole_batch_failure(
                            entity,
                            batch,
                            base_index,
                            code,
                            &message,
                            started.elapsed(),
                        )));
                    }
                },
            }
        }
    }

    /// Drives a batch one record at a time over a single pool handle. Used
    /// for bulk-incapable entities and when bulk APIs are disabled outright.
    async fn execute_per_record(
        &self,
        op: BulkOperation,
        entity: &str,
        payload: BatchPayload,
        base_index: usize,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, ProcessingError> {
        let started = Instant::now();
        let mut result = BulkResult::empty();

        let client = match self.acquire_unthrottled(cancel).await {
            Ok(client) => client,
            Err(ProcessingError::Cancelled) => return Ok(result),
            Err(err) => return Err(err),
        };

        'records: for index in 0..payload.len() {
            if cancel.is_cancelled() {
                break;
            }
            let request = self.build_single_request(op, entity, &payload, index);
            let record_id = payload.record_id(index);
            loop {
                match client.execute(request.clone(), cancel).await {
                    Ok(response) => {
                        tally_single(op, &mut result, record_id, response);
                        break;
                    }
                    Err(ClientError::Cancelled) => break 'records,
                    Err(err) => match FailureKind::classify(&err) {
                        FailureKind::Throttle => {
                            let wait = match &err {
                                ClientError::Fault(fault) => fault
                                    .retry_after()
                                    .unwrap_or(connectors::fault::DEFAULT_RETRY_AFTER),
                                _ => connectors::fault::DEFAULT_RETRY_AFTER,
                            }
                            .min(MAX_THROTTLE_WAIT);
                            if !self.sleep_cancellable(wait, cancel).await {
                                break 'records;
                            }
                        }
                        FailureKind::Cancelled => break 'records,
                        _ => {
                            let (code, message) = fault_parts(&err);
                            result.failure_count += 1;
                            result.errors.push(RecordFailure::new(
                                entity,
                                record_id,
                                Some(base_index + index),
                                code,
                                &message,
                            ));
                            break;
                        }
                    },
                }
            }
        }

        result.duration = started.elapsed();
        Ok(result)
    }

    /// Pool acquisition with the pre-flight throttle guard: a handle whose
    /// connection is inside its retry-after window goes straight back, up to
    /// the bounded attempt count, after which the batch proceeds anyway.
    /// Pool exhaustion backs off exponentially and retries until cancelled.
    async fn acquire_unthrottled(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PooledClient, ProcessingError> {
        let pool_policy = RetryPolicy::pool_exhaustion();
        let mut pool_attempts = 0usize;
        let mut preflight_attempts = 0usize;

        loop {
            match self.pool.acquire(cancel).await {
                Ok(client) => {
                    if let Some(remaining) = client.throttle_remaining() {
                        if preflight_attempts < self.config.preflight_attempts {
                            preflight_attempts += 1;
                            debug!(
                                connection = client.connection_name(),
                                remaining = ?remaining,
                                attempt = preflight_attempts,
                                "Handle throttled, returning it before use"
                            );
                            drop(client);
                            let wait = remaining.min(PREFLIGHT_POLL_CAP);
                            if !self.sleep_cancellable(wait, cancel).await {
                                return Err(ProcessingError::Cancelled);
                            }
                            continue;
                        }
                        warn!(
                            connection = client.connection_name(),
                            "Pre-flight throttle guard exhausted, proceeding on throttled connection"
                        );
                    }
                    return Ok(client);
                }
                Err(ConnectorError::PoolExhausted { active, max }) => {
                    let delay = pool_policy.backoff_delay(pool_attempts);
                    pool_attempts += 1;
                    warn!(active, max, delay = ?delay, "Pool exhausted, backing off");
                    if !self.sleep_cancellable(delay, cancel).await {
                        return Err(ProcessingError::Cancelled);
                    }
                }
                Err(ConnectorError::Cancelled) => return Err(ProcessingError::Cancelled),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn build_bulk_request(
        &self,
        op: BulkOperation,
        entity: &str,
        batch: BatchPayload,
    ) -> DataverseRequest {
        let params = self.config.params.clone();
        match (op, batch) {
            (BulkOperation::Create, BatchPayload::Records(records)) => {
                DataverseRequest::CreateMultiple {
                    entity: entity.to_string(),
                    records,
                    params,
                }
            }
            (BulkOperation::Update, BatchPayload::Records(records)) => {
                DataverseRequest::UpdateMultiple {
                    entity: entity.to_string(),
                    records,
                    params,
                }
            }
            (BulkOperation::Upsert, BatchPayload::Records(records)) => {
                DataverseRequest::UpsertMultiple {
                    entity: entity.to_string(),
                    records,
                    params,
                }
            }
            (BulkOperation::Delete, BatchPayload::Ids(ids)) => DataverseRequest::DeleteMultiple {
                entity: entity.to_string(),
                ids,
                params,
            },
            (op, _) => panic!("payload shape does not match bulk operation {op:?}"),
        }
    }

    fn build_single_request(
        &self,
        op: BulkOperation,
        entity: &str,
        payload: &BatchPayload,
        index: usize,
    ) -> DataverseRequest {
        let params = self.config.params.clone();
        match (op, payload) {
            (BulkOperation::Create, BatchPayload::Records(records)) => DataverseRequest::Create {
                record: records[index].clone(),
                params,
            },
            (BulkOperation::Update, BatchPayload::Records(records)) => DataverseRequest::Update {
                record: records[index].clone(),
                params,
            },
            (BulkOperation::Upsert, BatchPayload::Records(records)) => DataverseRequest::Upsert {
                record: records[index].clone(),
                params,
            },
            (BulkOperation::Delete, BatchPayload::Ids(ids)) => DataverseRequest::Delete {
                target: EntityReference::new(entity, ids[index]),
                params,
            },
            (op, _) => panic!("payload shape does not match bulk operation {op:?}"),
        }
    }

    fn decode_success(
        &self,
        op: BulkOperation,
        batch: &BatchPayload,
        response: DataverseResponse,
    ) -> BulkResult {
        let mut result = BulkResult::empty();
        result.success_count = batch.len();
        match (op, response) {
            (BulkOperation::Create, DataverseResponse::CreatedMultiple { ids }) => {
                result.created_count = ids.len();
                result.created_ids = ids;
            }
            (BulkOperation::Update, DataverseResponse::UpdatedMultiple { count }) => {
                result.updated_count = count;
            }
            (BulkOperation::Upsert, DataverseResponse::UpsertedMultiple { created, updated }) => {
                result.created_count = created;
                result.updated_count = updated;
                if created > 0 {
                    if let Some(records) = batch.records() {
                        result.created_ids = records.iter().map(|r| r.id).collect();
                    }
                }
            }
            (BulkOperation::Delete, DataverseResponse::DeletedMultiple { .. }) => {}
            _ => {}
        }
        result
    }

    /// Decodes `Plugin.BulkApiErrorDetails` into a mixed result. Returns
    /// `None` when the fault carries no per-record rows, which sends the
    /// batch down the whole-batch-failed path.
    fn decode_partial_success(
        &self,
        op: BulkOperation,
        entity: &str,
        batch: &BatchPayload,
        base_index: usize,
        fault: &ServiceFault,
    ) -> Option<BulkResult> {
        let details = fault.bulk_api_error_details()?;
        let failing: HashMap<usize, _> =
            details.iter().map(|row| (row.request_index, row)).collect();

        let mut result = BulkResult::empty();
        for index in 0..batch.len() {
            match failing.get(&index) {
                Some(row) => {
                    result.failure_count += 1;
                    result.errors.push(RecordFailure::new(
                        entity,
                        row.id.or_else(|| batch.record_id(index)),
                        Some(base_index + index),
                        Some(row.status_code),
                        &fault.message,
                    ));
                }
                None => {
                    result.success_count += 1;
                    if op == BulkOperation::Create {
                        if let Some(id) = batch.record_id(index) {
                            result.created_ids.push(id);
                            result.created_count += 1;
                        }
                    }
                }
            }
        }
        info!(
            entity,
            succeeded = result.success_count,
            failed = result.failure_count,
            "Decoded partial batch success"
        );
        Some(result)
    }

    /// Converts a non-retryable batch fault into per-record failure rows and
    /// runs the reference post-mortem over the batch.
    fn whole_batch_failure(
        &self,
        entity: &str,
        batch: &BatchPayload,
        base_index: usize,
        code: Option<i32>,
        message: &str,
        duration: Duration,
    ) -> BulkResult {
        let mut suggestions: HashMap<usize, &'static str> = HashMap::new();
        if let Some(records) = batch.records() {
            for finding in analyze_batch_failure(records, message) {
                warn!(
                    entity,
                    record_index = finding.record_index,
                    field = %finding.field_name,
                    referenced_id = %finding.referenced_id,
                    pattern = ?finding.pattern,
                    "Batch failure post-mortem finding"
                );
                suggestions.entry(finding.record_index).or_insert(finding.suggestion);
            }
        }

        let mut result = BulkResult::empty();
        result.failure_count = batch.len();
        result.duration = duration;
        for index in 0..batch.len() {
            let row_message = match suggestions.get(&index) {
                Some(suggestion) => format!("{message} ({suggestion})"),
                None => message.to_string(),
            };
            result.errors.push(RecordFailure::new(
                entity,
                batch.record_id(index),
                Some(base_index + index),
                code,
                &row_message,
            ));
        }
        result
    }

    fn next_batch_size(&self) -> usize {
        match &self.sizer {
            Some(sizer) => sizer.lock().unwrap_or_else(|e| e.into_inner()).current(),
            None => self.config.batch_size,
        }
    }

    fn observe_batches(&self, records: usize, batches: usize, elapsed: Duration) {
        if batches == 0 {
            return;
        }
        if let Some(sizer) = &self.sizer {
            let per_batch = elapsed / batches as u32;
            sizer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .observe(records / batches, per_batch);
        }
    }

    fn effective_parallelism(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cpus * 4)
            .min(self.pool.recommended_total_parallelism().max(1))
            .max(1)
    }

    async fn sleep_cancellable(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

fn fault_parts(err: &ClientError) -> (Option<i32>, String) {
    match err {
        ClientError::Fault(fault) => (Some(fault.code), fault.message.clone()),
        other => (None, other.to_string()),
    }
}

fn tally_single(
    op: BulkOperation,
    result: &mut BulkResult,
    record_id: Option<Uuid>,
    response: DataverseResponse,
) {
    result.success_count += 1;
    match (op, response) {
        (BulkOperation::Create, DataverseResponse::Created { id }) => {
            result.created_ids.push(id);
            result.created_count += 1;
        }
        (BulkOperation::Create, _) => {
            if let Some(id) = record_id {
                result.created_ids.push(id);
            }
            result.created_count += 1;
        }
        (BulkOperation::Update, _) => result.updated_count += 1,
        (BulkOperation::Upsert, DataverseResponse::Upserted { created }) => {
            if created {
                result.created_count += 1;
                if let Some(id) = record_id {
                    result.created_ids.push(id);
                }
            } else {
                result.updated_count += 1;
            }
        }
        _ => {}
    }
}
