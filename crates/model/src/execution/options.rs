use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Which write operation the tier pass issues for every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImportMode {
    Create,
    Update,
    #[default]
    Upsert,
}

/// Server-side custom logic classes that a request may bypass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BypassCustomLogic {
    #[default]
    None,
    Sync,
    Async,
    All,
}

impl BypassCustomLogic {
    /// Wire form of the `BypassBusinessLogicExecution` request parameter.
    pub fn wire_value(&self) -> Option<&'static str> {
        match self {
            BypassCustomLogic::None => None,
            BypassCustomLogic::Sync => Some("CustomSync"),
            BypassCustomLogic::Async => Some("CustomAsync"),
            BypassCustomLogic::All => Some("CustomSync,CustomAsync"),
        }
    }
}

/// Bounds and target for the adaptive per-entity batch-size controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveBatchConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub target_seconds: f64,
}

impl Default for AdaptiveBatchConfig {
    fn default() -> Self {
        Self {
            min_size: 10,
            max_size: 500,
            target_seconds: 10.0,
        }
    }
}

/// Everything the caller can turn on an import run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportOptions {
    pub mode: ImportMode,
    pub batch_size: usize,
    pub use_bulk_apis: bool,
    pub max_parallel_entities: usize,
    pub continue_on_error: bool,
    pub skip_missing_columns: bool,
    pub strip_owner_fields: bool,
    pub bypass_custom_logic: BypassCustomLogic,
    pub bypass_power_automate_flows: bool,
    pub suppress_duplicate_detection: bool,
    pub tag: Option<String>,
    pub respect_disable_plugins_setting: bool,
    /// Source-to-target substitutions for `systemuser`/`team` references.
    pub user_mappings: Option<HashMap<Uuid, Uuid>>,
    /// Fallback identity for unmapped user references.
    pub current_user_id: Option<Uuid>,
    pub adaptive_batching: Option<AdaptiveBatchConfig>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            mode: ImportMode::Upsert,
            batch_size: 100,
            use_bulk_apis: true,
            max_parallel_entities: 4,
            continue_on_error: true,
            skip_missing_columns: false,
            strip_owner_fields: false,
            bypass_custom_logic: BypassCustomLogic::None,
            bypass_power_automate_flows: false,
            suppress_duplicate_detection: false,
            tag: None,
            respect_disable_plugins_setting: true,
            user_mappings: None,
            current_user_id: None,
            adaptive_batching: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_contract() {
        let options = ImportOptions::default();
        assert_eq!(options.mode, ImportMode::Upsert);
        assert_eq!(options.batch_size, 100);
        assert!(options.use_bulk_apis);
        assert!(options.continue_on_error);
        assert!(options.adaptive_batching.is_none());
    }

    #[test]
    fn bypass_wire_values() {
        assert_eq!(BypassCustomLogic::None.wire_value(), None);
        assert_eq!(BypassCustomLogic::Sync.wire_value(), Some("CustomSync"));
        assert_eq!(
            BypassCustomLogic::All.wire_value(),
            Some("CustomSync,CustomAsync")
        );
    }
}
