use crate::error::ProcessingError;
use connectors::{
    fault::{ClientError, DEFAULT_RETRY_AFTER, FailureKind},
    pool::ConnectionPool,
    redact::redact,
    request::{DataverseRequest, DataverseResponse, RequestParams},
};
use engine_core::result::{RecordFailure, RelationshipResult};
use futures::stream::{self, StreamExt};
use model::{archive::Archive, core::reference::EntityReference, identity::IdMap};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_THROTTLE_WAIT: Duration = Duration::from_secs(300);

/// Third pass: materialises the archive's many-to-many blocks as associate
/// requests, after both endpoints exist in the target.
pub struct RelationshipProcessor<'a> {
    pub pool: &'a Arc<ConnectionPool>,
    pub id_map: &'a IdMap,
    pub params: RequestParams,
    pub continue_on_error: bool,
}

struct WorkItem {
    source_entity: String,
    source_id: Uuid,
    relationship: String,
    target_entity: String,
    target_ids: Vec<Uuid>,
}

enum ItemOutcome {
    Done { processed: usize, skipped: usize },
    Failed { count: usize, failure: RecordFailure },
}

impl RelationshipProcessor<'_> {
    pub async fn run(
        &self,
        archive: &Archive,
        cancel: &CancellationToken,
    ) -> Result<RelationshipResult, ProcessingError> {
        let items: Vec<WorkItem> = archive
            .relationship_data
            .iter()
            .flat_map(|(entity, blocks)| {
                blocks.iter().map(|block| WorkItem {
                    source_entity: entity.clone(),
                    source_id: block.source_id,
                    relationship: block.relationship.clone(),
                    target_entity: block.target_entity.clone(),
                    target_ids: block.target_ids.clone(),
                })
            })
            .collect();

        if items.is_empty() {
            return Ok(RelationshipResult::default());
        }

        let total: usize = items.iter().map(|i| i.target_ids.len()).sum();
        info!(blocks = items.len(), associations = total, "Processing relationships");

        let names = self.load_relationship_names(cancel).await?;
        let parallelism = self.pool.recommended_total_parallelism();

        let outcomes = stream::iter(
            items
                .into_iter()
                .map(|item| self.process_item(item, &names, cancel)),
        )
        .buffer_unordered(parallelism)
        .collect::<Vec<_>>()
        .await;

        let mut result = RelationshipResult::default();
        for outcome in outcomes {
            match outcome? {
                ItemOutcome::Done { processed, skipped } => {
                    result.processed += processed;
                    result.skipped += skipped;
                }
                ItemOutcome::Failed { count, failure } => {
                    result.failed += count;
                    result.errors.push(failure);
                }
            }
        }

        if !self.continue_on_error {
            if let Some(first) = result.errors.first() {
                return Err(ProcessingError::Associate(first.message.clone()));
            }
        }
        Ok(result)
    }

    /// An archived block may name a relationship either by schema name or by
    /// its intersect entity. Index both spellings against the target's
    /// relationship metadata.
    async fn load_relationship_names(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>, ProcessingError> {
        let client = self.pool.acquire(cancel).await?;
        let relationships = match client
            .execute(DataverseRequest::RetrieveManyToManyRelationships, cancel)
            .await
        {
            Ok(DataverseResponse::ManyToManyRelationships(relationships)) => relationships,
            Ok(_) => Vec::new(),
            Err(ClientError::Cancelled) => return Err(ProcessingError::Cancelled),
            Err(err) => {
                return Err(ProcessingError::Metadata {
                    entity: "relationship".to_string(),
                    message: err.to_string(),
                });
            }
        };

        let mut names = HashMap::new();
        for relationship in relationships {
            names.insert(
                relationship.schema_name.to_ascii_lowercase(),
                relationship.schema_name.clone(),
            );
            names.insert(
                relationship.intersect_entity.to_ascii_lowercase(),
                relationship.schema_name.clone(),
            );
        }
        debug!(relationships = names.len(), "Relationship name cache loaded");
        Ok(names)
    }

    async fn process_item(
        &self,
        item: WorkItem,
        names: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ItemOutcome, ProcessingError> {
        let count = item.target_ids.len();
        if count == 0 {
            return Ok(ItemOutcome::Done {
                processed: 0,
                skipped: 0,
            });
        }

        let Some(source_id) = self.id_map.get(&item.source_entity, item.source_id) else {
            debug!(
                entity = %item.source_entity,
                id = %item.source_id,
                "Association source never imported, skipping block"
            );
            return Ok(ItemOutcome::Done {
                processed: 0,
                skipped: count,
            });
        };

        let relationship = names
            .get(&item.relationship.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| {
                warn!(
                    relationship = %item.relationship,
                    "Relationship not found in target metadata, using the archived name"
                );
                item.relationship.clone()
            });

        let client = match self.pool.acquire(cancel).await {
            Ok(client) => client,
            Err(connectors::error::ConnectorError::Cancelled) => {
                return Err(ProcessingError::Cancelled);
            }
            Err(err) => return Err(err.into()),
        };

        let mut targets = Vec::with_capacity(count);
        let mut skipped = 0usize;
        for target_id in &item.target_ids {
            match self.id_map.get(&item.target_entity, *target_id) {
                Some(mapped) => targets.push(EntityReference::new(&item.target_entity, mapped)),
                None if item.target_entity == "role" => {
                    // Roles have no name export; accept the id only when the
                    // target tenant happens to share it.
                    let probe = DataverseRequest::Retrieve {
                        entity: "role".to_string(),
                        id: *target_id,
                        columns: vec!["roleid".to_string()],
                    };
                    match client.execute(probe, cancel).await {
                        Ok(DataverseResponse::Record(Some(_))) => {
                            targets.push(EntityReference::new("role", *target_id));
                        }
                        Ok(_) => {
                            warn!(role = %target_id, "Role not resolvable in target, dropping");
                            skipped += 1;
                        }
                        Err(ClientError::Cancelled) => return Err(ProcessingError::Cancelled),
                        Err(err) => {
                            warn!(
                                role = %target_id,
                                error = %redact(&err.to_string()),
                                "Role lookup failed, dropping"
                            );
                            skipped += 1;
                        }
                    }
                }
                None => {
                    debug!(
                        entity = %item.target_entity,
                        id = %target_id,
                        "Association target never imported, skipping"
                    );
                    skipped += 1;
                }
            }
        }

        if targets.is_empty() {
            return Ok(ItemOutcome::Done {
                processed: 0,
                skipped,
            });
        }

        let source = EntityReference::new(&item.source_entity, source_id);
        let associated = targets.len();
        let request = DataverseRequest::Associate {
            source: source.clone(),
            relationship: relationship.clone(),
            targets,
            params: self.params.clone(),
        };

        loop {
            match client.execute(request.clone(), cancel).await {
                Ok(_) => {
                    return Ok(ItemOutcome::Done {
                        processed: associated,
                        skipped,
                    });
                }
                Err(ClientError::Cancelled) => return Err(ProcessingError::Cancelled),
                Err(err) => match FailureKind::classify(&err) {
                    FailureKind::DuplicateKey => {
                        // Pre-existing association; idempotent by design.
                        debug!(
                            source = %source,
                            relationship = %relationship,
                            "Association already exists"
                        );
                        return Ok(ItemOutcome::Done {
                            processed: associated,
                            skipped,
                        });
                    }
                    FailureKind::Throttle => {
                        let wait = match &err {
                            ClientError::Fault(fault) => {
                                fault.retry_after().unwrap_or(DEFAULT_RETRY_AFTER)
                            }
                            _ => DEFAULT_RETRY_AFTER,
                        }
                        .min(MAX_THROTTLE_WAIT);
                        warn!(wait = ?wait, "Associate throttled, waiting");
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(ProcessingError::Cancelled),
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                    FailureKind::Cancelled => return Err(ProcessingError::Cancelled),
                    _ => {
                        let (code, message) = match &err {
                            ClientError::Fault(fault) => (Some(fault.code), fault.message.clone()),
                            other => (None, other.to_string()),
                        };
                        warn!(
                            source = %source,
                            relationship = %relationship,
                            error = %redact(&message),
                            "Associate request failed"
                        );
                        return Ok(ItemOutcome::Failed {
                            count: associated,
                            failure: RecordFailure::new(
                                item.source_entity.clone(),
                                Some(item.source_id),
                                None,
                                code,
                                &message,
                            ),
                        });
                    }
                },
            }
        }
    }
}
