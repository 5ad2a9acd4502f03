use crate::error::MigrationError;
use async_trait::async_trait;
use model::archive::Archive;
use std::path::Path;

/// Collaborator seam for the on-disk archive format. The engine only needs
/// the parsed shape back; layout, compression and versioning live with the
/// implementation.
#[async_trait]
pub trait ArchiveReader: Send + Sync {
    async fn read(&self, path: &Path) -> Result<Archive, MigrationError>;
}
