use connectors::redact::redact;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// One failed record, addressable both by identifier and by its index in
/// the originating batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub entity: String,
    pub record_id: Option<Uuid>,
    pub batch_index: Option<usize>,
    pub code: Option<i32>,
    pub message: String,
}

impl RecordFailure {
    /// Builds a failure row; the message is scrubbed of credential material
    /// on the way in.
    pub fn new(
        entity: impl Into<String>,
        record_id: Option<Uuid>,
        batch_index: Option<usize>,
        code: Option<i32>,
        message: &str,
    ) -> Self {
        Self {
            entity: entity.into(),
            record_id,
            batch_index,
            code,
            message: redact(message),
        }
    }
}

/// Outcome of one bulk entry point invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub errors: Vec<RecordFailure>,
    pub created_ids: Vec<Uuid>,
    pub created_count: usize,
    pub updated_count: usize,
    pub duration: Duration,
}

impl BulkResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, other: BulkResult) {
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.errors.extend(other.errors);
        self.created_ids.extend(other.created_ids);
        self.created_count += other.created_count;
        self.updated_count += other.updated_count;
        self.duration += other.duration;
    }

    pub fn is_fully_successful(&self) -> bool {
        self.failure_count == 0
    }
}

/// Per-entity outcome of the tier pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityImportResult {
    pub entity: String,
    pub tier: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub errors: Vec<RecordFailure>,
    pub duration: Duration,
}

/// Outcome of the relationship pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipResult {
    pub processed: usize,
    pub failed: usize,
    /// Associations dropped because an endpoint never mapped (including
    /// unresolved cross-tenant roles).
    pub skipped: usize,
    pub errors: Vec<RecordFailure>,
}

/// Aggregate outcome of a whole import run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    pub success: bool,
    pub tiers_processed: usize,
    pub records_imported: usize,
    /// Records touched by the deferred-field pass.
    pub records_updated: usize,
    pub relationships_processed: usize,
    pub duration: Duration,
    pub entity_results: Vec<EntityImportResult>,
    pub errors: Vec<RecordFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_counts_and_errors() {
        let mut left = BulkResult {
            success_count: 3,
            failure_count: 1,
            errors: vec![RecordFailure::new("account", None, Some(0), None, "boom")],
            created_ids: vec![Uuid::new_v4()],
            created_count: 3,
            updated_count: 0,
            duration: Duration::from_secs(1),
        };
        let right = BulkResult {
            success_count: 2,
            failure_count: 0,
            duration: Duration::from_secs(2),
            created_count: 2,
            ..Default::default()
        };

        left.merge(right);
        assert_eq!(left.success_count, 5);
        assert_eq!(left.failure_count, 1);
        assert_eq!(left.created_count, 5);
        assert_eq!(left.duration, Duration::from_secs(3));
        assert_eq!(left.errors.len(), 1);
    }

    #[test]
    fn failure_messages_are_redacted_on_construction() {
        let failure = RecordFailure::new(
            "account",
            None,
            None,
            None,
            "auth failed: client_secret=super-secret",
        );
        assert!(!failure.message.contains("super-secret"));
    }
}
