use crate::{archive::ArchiveReader, error::MigrationError};
use connectors::{pool::ConnectionPool, request::RequestParams};
use engine_core::{
    coordinator::BatchCoordinator,
    progress::{ProgressSnapshot, ProgressTracker},
    result::{BulkResult, EntityImportResult, ImportResult, RecordFailure},
};
use engine_processing::{
    bulk::{
        executor::{BulkExecutor, BulkExecutorConfig},
        support::BulkSupportRegistry,
    },
    deferred::DeferredFieldProcessor,
    plugins::PluginStepManager,
    prepare::RecordPreparer,
    relationships::RelationshipProcessor,
    validation::TargetMetadata,
};
use futures::stream::{self, StreamExt};
use model::{
    archive::Archive,
    execution::options::{ImportMode, ImportOptions},
    identity::IdMap,
    records::record::EntityRecord,
};
use planner::plan::ImportPlan;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Orchestrates one import run: tier pass with parallel entities, deferred
/// lookups, many-to-many relationships, and plugin-step bracketing.
pub struct TieredImporter {
    pool: Arc<ConnectionPool>,
    coordinator: Arc<BatchCoordinator>,
    options: ImportOptions,
}

#[derive(Default)]
struct PassOutcome {
    tiers_processed: usize,
    entity_results: Vec<EntityImportResult>,
    records_updated: usize,
    relationships_processed: usize,
    errors: Vec<RecordFailure>,
    cancelled: bool,
    aborted: bool,
}

impl TieredImporter {
    pub fn new(pool: Arc<ConnectionPool>, options: ImportOptions) -> Self {
        let coordinator = Arc::new(BatchCoordinator::new(Arc::clone(&pool)));
        Self {
            pool,
            coordinator,
            options,
        }
    }

    /// Convenience entry: read the archive, plan from its schema, import.
    pub async fn import_from(
        &self,
        reader: &dyn ArchiveReader,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ImportResult, MigrationError> {
        let archive = reader.read(path).await?;
        let plan = ImportPlan::build(&archive.schema);
        self.import(&archive, &plan, cancel).await
    }

    pub async fn import(
        &self,
        archive: &Archive,
        plan: &ImportPlan,
        cancel: &CancellationToken,
    ) -> Result<ImportResult, MigrationError> {
        let started = Instant::now();
        info!(
            plan_hash = %plan.hash(),
            tiers = plan.tiers.len(),
            records = archive.total_record_count(),
            associations = archive.association_count(),
            mode = ?self.options.mode,
            "Starting import"
        );

        let entity_names: Vec<&str> = archive.entity_data.keys().map(String::as_str).collect();
        let metadata = TargetMetadata::load(&self.pool, entity_names, cancel)
            .await
            .map_err(MigrationError::from)?;

        let missing = metadata.detect_missing_columns(archive);
        if !missing.is_empty() {
            if self.options.skip_missing_columns {
                for (entity, columns) in &missing {
                    warn!(
                        entity = %entity,
                        columns = ?columns,
                        "Columns missing in target will be dropped"
                    );
                }
            } else {
                return Err(MigrationError::SchemaMismatch { missing });
            }
        }

        let plugins = PluginStepManager::new(Arc::clone(&self.pool));
        let disabled_steps = self.disable_plugin_steps(archive, &plugins, cancel).await?;

        let support = Arc::new(BulkSupportRegistry::new());
        let executor = BulkExecutor::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.coordinator),
            BulkExecutorConfig {
                batch_size: self.options.batch_size,
                use_bulk_apis: self.options.use_bulk_apis,
                params: RequestParams::from_options(&self.options),
                adaptive: self.options.adaptive_batching.clone(),
                ..Default::default()
            },
            support,
        );
        let id_map = IdMap::new();
        let progress = ProgressTracker::new(archive.total_record_count() as u64);

        let outcome = self
            .run_passes(archive, plan, &executor, &metadata, &id_map, &progress, cancel)
            .await;

        // The re-enable pass always runs, with a token that cannot be the
        // one that was just cancelled.
        if !disabled_steps.is_empty() {
            plugins
                .enable(&disabled_steps, &CancellationToken::new())
                .await;
        }

        let outcome = outcome?;
        let result = compose_result(outcome, started, &progress.snapshot());
        info!(
            success = result.success,
            imported = result.records_imported,
            updated = result.records_updated,
            relationships = result.relationships_processed,
            failed = result.errors.len(),
            duration_s = result.duration.as_secs_f64(),
            "Import finished"
        );
        Ok(result)
    }

    async fn disable_plugin_steps(
        &self,
        archive: &Archive,
        plugins: &PluginStepManager,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, MigrationError> {
        if !self.options.respect_disable_plugins_setting {
            return Ok(Vec::new());
        }
        let codes: Vec<i32> = archive
            .schema
            .entities
            .iter()
            .filter(|e| e.disable_plugins)
            .filter_map(|e| e.object_type_code)
            .collect();
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let steps = plugins.get_active_steps(&codes, cancel).await?;
        plugins.disable(&steps, cancel).await?;
        Ok(steps)
    }

    async fn run_passes(
        &self,
        archive: &Archive,
        plan: &ImportPlan,
        executor: &BulkExecutor,
        metadata: &TargetMetadata,
        id_map: &IdMap,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome, MigrationError> {
        let mut out = PassOutcome::default();

        'tiers: for tier in &plan.tiers {
            if cancel.is_cancelled() {
                out.cancelled = true;
                break;
            }
            info!(tier = tier.number, entities = ?tier.entities, "Processing tier");

            let work: Vec<&str> = tier
                .entities
                .iter()
                .map(String::as_str)
                .filter(|entity| !archive.records(entity).is_empty())
                .collect();

            if !work.is_empty() {
                let parallelism = self.options.max_parallel_entities.max(1);
                let results = stream::iter(work.into_iter().map(|entity| {
                    self.import_entity(
                        tier.number,
                        entity,
                        archive,
                        plan,
                        executor,
                        metadata,
                        id_map,
                        progress,
                        cancel,
                    )
                }))
                .buffer_unordered(parallelism)
                .collect::<Vec<_>>()
                .await;

                for result in results {
                    let entity_result = result?;
                    let had_failures = entity_result.failure_count > 0;
                    out.errors.extend(entity_result.errors.iter().cloned());
                    out.entity_results.push(entity_result);
                    if had_failures && !self.options.continue_on_error {
                        out.aborted = true;
                        out.tiers_processed = tier.number;
                        break 'tiers;
                    }
                }
            }
            out.tiers_processed = tier.number;
        }

        out.cancelled = out.cancelled || cancel.is_cancelled();
        if out.cancelled || out.aborted {
            return Ok(out);
        }

        let deferred = DeferredFieldProcessor { executor, id_map }
            .run(archive, plan, cancel)
            .await?;
        out.records_updated = deferred.success_count;
        out.errors.extend(deferred.errors.iter().cloned());
        if deferred.failure_count > 0 && !self.options.continue_on_error {
            out.aborted = true;
            return Ok(out);
        }

        let relationships = RelationshipProcessor {
            pool: &self.pool,
            id_map,
            params: RequestParams::from_options(&self.options),
            continue_on_error: self.options.continue_on_error,
        }
        .run(archive, cancel)
        .await;
        match relationships {
            Ok(relationships) => {
                out.relationships_processed = relationships.processed;
                out.errors.extend(relationships.errors.iter().cloned());
            }
            Err(err) if err.is_cancelled() => {
                out.cancelled = true;
                return Ok(out);
            }
            Err(err) => return Err(err.into()),
        }

        out.cancelled = cancel.is_cancelled();
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    async fn import_entity(
        &self,
        tier: usize,
        entity: &str,
        archive: &Archive,
        plan: &ImportPlan,
        executor: &BulkExecutor,
        metadata: &TargetMetadata,
        id_map: &IdMap,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<EntityImportResult, MigrationError> {
        let started = Instant::now();
        let records = archive.records(entity);
        let preparer = RecordPreparer {
            metadata,
            deferred: plan.deferred_for(entity),
            id_map,
            options: &self.options,
        };
        let prepared: Vec<EntityRecord> = records.iter().map(|r| preparer.prepare(r)).collect();

        let result = match self.options.mode {
            ImportMode::Create => executor.create_multiple(entity, prepared, cancel).await?,
            ImportMode::Update => executor.update_multiple(entity, prepared, cancel).await?,
            ImportMode::Upsert => executor.upsert_multiple(entity, prepared, cancel).await?,
        };

        record_id_mappings(entity, records, &result, id_map);
        progress.record(result.success_count as u64, result.failure_count as u64);

        info!(
            entity,
            tier,
            succeeded = result.success_count,
            failed = result.failure_count,
            duration_ms = result.duration.as_millis(),
            "Entity import finished"
        );

        Ok(EntityImportResult {
            entity: entity.to_string(),
            tier,
            success_count: result.success_count,
            failure_count: result.failure_count,
            errors: result.errors,
            duration: started.elapsed(),
        })
    }
}

/// Deterministic-id bookkeeping: every record that landed maps `old -> old`
/// so the later passes can tell imported records from dropped ones.
fn record_id_mappings(
    entity: &str,
    records: &[EntityRecord],
    result: &BulkResult,
    id_map: &IdMap,
) {
    if result.success_count == 0 {
        return;
    }
    let failed_ids: HashSet<Uuid> = result
        .errors
        .iter()
        .filter_map(|e| e.record_id)
        .collect();
    let failed_indices: HashSet<usize> = result
        .errors
        .iter()
        .filter_map(|e| e.batch_index)
        .collect();

    for (index, record) in records.iter().enumerate() {
        if failed_indices.contains(&index) || failed_ids.contains(&record.id) {
            continue;
        }
        id_map.insert(entity, record.id, record.id);
    }
}

fn compose_result(
    outcome: PassOutcome,
    started: Instant,
    progress: &ProgressSnapshot,
) -> ImportResult {
    let records_imported = outcome
        .entity_results
        .iter()
        .map(|r| r.success_count)
        .sum();
    let success = !outcome.cancelled && !outcome.aborted && outcome.errors.is_empty();
    if progress.processed > 0 {
        info!(
            processed = progress.processed,
            rate = %format!("{:.1}/s", progress.overall_rate),
            "Import throughput"
        );
    }
    ImportResult {
        success,
        tiers_processed: outcome.tiers_processed,
        records_imported,
        records_updated: outcome.records_updated,
        relationships_processed: outcome.relationships_processed,
        duration: started.elapsed(),
        entity_results: outcome.entity_results,
        errors: outcome.errors,
    }
}
