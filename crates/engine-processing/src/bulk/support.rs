use std::collections::HashSet;
use std::sync::RwLock;
use tracing::info;

/// Entities observed to reject the multi-record request variants. Scoped to
/// one import run and injected into the executor; once an entity lands here
/// every later operation against it goes down the per-record path without
/// another probe.
#[derive(Debug, Default)]
pub struct BulkSupportRegistry {
    unsupported: RwLock<HashSet<String>>,
}

impl BulkSupportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_unsupported(&self, entity: &str) -> bool {
        let unsupported = self.unsupported.read().unwrap_or_else(|e| e.into_inner());
        unsupported.contains(entity)
    }

    pub fn mark_unsupported(&self, entity: &str) {
        let mut unsupported = self.unsupported.write().unwrap_or_else(|e| e.into_inner());
        if unsupported.insert(entity.to_string()) {
            info!(entity, "Bulk operations not supported, switching to per-record execution");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_is_sticky_and_idempotent() {
        let registry = BulkSupportRegistry::new();
        assert!(!registry.is_unsupported("team"));

        registry.mark_unsupported("team");
        registry.mark_unsupported("team");

        assert!(registry.is_unsupported("team"));
        assert!(!registry.is_unsupported("account"));
    }
}
