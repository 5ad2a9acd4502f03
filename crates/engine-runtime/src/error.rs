use connectors::error::ConnectorError;
use engine_core::error::CoreError;
use engine_processing::error::ProcessingError;
use std::collections::BTreeMap;
use thiserror::Error;

/// Top-level errors of the migration engine.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The archive carries columns the target does not have. Fails the
    /// import before any write unless missing columns were opted out.
    #[error("schema mismatch, columns missing in target: {}", render_missing(.missing))]
    SchemaMismatch {
        missing: BTreeMap<String, Vec<String>>,
    },

    #[error("archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("import cancelled")]
    Cancelled,
}

fn render_missing(missing: &BTreeMap<String, Vec<String>>) -> String {
    missing
        .iter()
        .map(|(entity, columns)| format!("{entity}: [{}]", columns.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_mismatch_lists_entities_and_columns() {
        let err = MigrationError::SchemaMismatch {
            missing: BTreeMap::from([(
                "account".to_string(),
                vec!["customfield_x".to_string()],
            )]),
        };
        assert_eq!(
            err.to_string(),
            "schema mismatch, columns missing in target: account: [customfield_x]"
        );
    }
}
