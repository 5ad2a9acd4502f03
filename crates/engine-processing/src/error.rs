use connectors::error::ConnectorError;
use engine_core::error::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Server-side bulk infrastructure kept failing after the bounded
    /// backoff (table-valued-parameter races, deadlocks).
    #[error("bulk write to '{entity}' failed after {attempts} attempts: {message}")]
    BulkInfrastructure {
        entity: String,
        attempts: usize,
        message: String,
    },

    #[error("metadata retrieval failed for '{entity}': {message}")]
    Metadata { entity: String, message: String },

    #[error("associate request failed: {0}")]
    Associate(String),

    #[error("plugin step management failed: {0}")]
    PluginSteps(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProcessingError {
    /// True for every shape a cancelled token can bubble up in.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ProcessingError::Cancelled
                | ProcessingError::Connector(ConnectorError::Cancelled)
                | ProcessingError::Core(CoreError::Cancelled)
        )
    }
}
