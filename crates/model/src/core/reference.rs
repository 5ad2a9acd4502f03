use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A typed pointer to another entity's record, the payload of a lookup
/// attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityReference {
    pub entity: String,
    pub id: Uuid,
}

impl EntityReference {
    pub fn new(entity: impl Into<String>, id: Uuid) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }

    /// Returns a copy pointing at the same entity with a different id.
    pub fn with_id(&self, id: Uuid) -> Self {
        Self {
            entity: self.entity.clone(),
            id,
        }
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.entity, self.id)
    }
}
