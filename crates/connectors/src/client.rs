use crate::{
    error::ConnectorError,
    fault::ClientError,
    request::{DataverseRequest, DataverseResponse},
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// An authenticated client bound to one named connection.
///
/// Implementations own transport and token refresh; the engine only sees
/// organization requests going in and responses or faults coming out.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    fn connection_name(&self) -> &str;

    fn display_name(&self) -> &str {
        self.connection_name()
    }

    /// Live server-advertised safe parallelism for this connection.
    fn recommended_parallelism(&self) -> usize {
        1
    }

    async fn execute(
        &self,
        request: DataverseRequest,
        cancel: &CancellationToken,
    ) -> Result<DataverseResponse, ClientError>;
}

/// Produces fresh authenticated clients on demand. Interactive or device-code
/// authentication happens behind this seam, which is why client creation is
/// allowed a generous timeout.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    fn name(&self) -> &str;

    async fn create_client(&self) -> Result<Box<dyn ServiceClient>, ConnectorError>;

    /// Discard any cached authentication material so that the next
    /// `create_client` call re-authenticates from scratch.
    fn invalidate_auth(&self) {}
}
