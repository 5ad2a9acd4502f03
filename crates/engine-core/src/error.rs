use connectors::error::ConnectorError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// No batch slot freed up within the coordinator's acquire timeout.
    #[error(
        "batch coordinator exhausted: {available} of {capacity} slots free after {timeout:?}"
    )]
    CoordinatorExhausted {
        available: usize,
        capacity: usize,
        timeout: Duration,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}
