use thiserror::Error;

/// Failures surfaced by the connection pool and its sources.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Every pooled client is checked out and none freed up in time.
    #[error("connection pool exhausted: {active} of {max} clients in use")]
    PoolExhausted { active: usize, max: usize },

    /// Authentication failed while creating or refreshing a client.
    #[error("authentication failed on connection '{connection}': {message}")]
    AuthFailed { connection: String, message: String },

    /// The underlying channel to the server could not be established or was
    /// lost.
    #[error("connection '{connection}' failed: {message}")]
    ConnectionFailed { connection: String, message: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl ConnectorError {
    /// The connection a failure is attributable to, where determinable.
    pub fn connection_name(&self) -> Option<&str> {
        match self {
            ConnectorError::AuthFailed { connection, .. }
            | ConnectorError::ConnectionFailed { connection, .. } => Some(connection),
            _ => None,
        }
    }

    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, ConnectorError::PoolExhausted { .. })
    }
}
