use crate::error::ProcessingError;
use connectors::{
    fault::ClientError,
    pool::ConnectionPool,
    redact::redact,
    request::{DataverseRequest, DataverseResponse},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Disables server-side automation on nominated entity types for the
/// lifetime of an import and re-enables it on the way out.
pub struct PluginStepManager {
    pool: Arc<ConnectionPool>,
}

impl PluginStepManager {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Active, visible, first-customization-level steps registered against
    /// the given object type codes.
    pub async fn get_active_steps(
        &self,
        object_type_codes: &[i32],
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, ProcessingError> {
        if object_type_codes.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.pool.acquire(cancel).await?;
        let request = DataverseRequest::QueryPluginSteps {
            object_type_codes: object_type_codes.to_vec(),
        };
        match client.execute(request, cancel).await {
            Ok(DataverseResponse::PluginSteps(steps)) => Ok(steps),
            Ok(_) => Ok(Vec::new()),
            Err(ClientError::Cancelled) => Err(ProcessingError::Cancelled),
            Err(err) => Err(ProcessingError::PluginSteps(err.to_string())),
        }
    }

    /// Failures here propagate: the import has not started yet, so aborting
    /// is safe.
    pub async fn disable(
        &self,
        step_ids: &[Uuid],
        cancel: &CancellationToken,
    ) -> Result<(), ProcessingError> {
        if step_ids.is_empty() {
            return Ok(());
        }
        let client = self.pool.acquire(cancel).await?;
        for step_id in step_ids {
            let request = DataverseRequest::SetPluginStepState {
                step_id: *step_id,
                enabled: false,
            };
            match client.execute(request, cancel).await {
                Ok(_) => {}
                Err(ClientError::Cancelled) => return Err(ProcessingError::Cancelled),
                Err(err) => {
                    return Err(ProcessingError::PluginSteps(format!(
                        "disabling step {step_id} failed: {err}"
                    )));
                }
            }
        }
        info!(steps = step_ids.len(), "Plugin steps disabled for import");
        Ok(())
    }

    /// Failures here are logged and swallowed: re-enabling runs on every
    /// exit path and must not mask the import's own outcome.
    pub async fn enable(&self, step_ids: &[Uuid], cancel: &CancellationToken) {
        if step_ids.is_empty() {
            return;
        }
        let client = match self.pool.acquire(cancel).await {
            Ok(client) => client,
            Err(err) => {
                warn!(
                    error = %redact(&err.to_string()),
                    "Could not acquire a client to re-enable plugin steps"
                );
                return;
            }
        };
        let mut failed = 0usize;
        for step_id in step_ids {
            let request = DataverseRequest::SetPluginStepState {
                step_id: *step_id,
                enabled: true,
            };
            if let Err(err) = client.execute(request, cancel).await {
                warn!(
                    step = %step_id,
                    error = %redact(&err.to_string()),
                    "Failed to re-enable plugin step"
                );
                failed += 1;
            }
        }
        if failed == 0 {
            info!(steps = step_ids.len(), "Plugin steps re-enabled");
        } else {
            warn!(
                steps = step_ids.len(),
                failed, "Plugin steps re-enabled with failures"
            );
        }
    }
}
