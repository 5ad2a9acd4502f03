use crate::{records::record::EntityRecord, schema::SchemaDescription};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// An exported record set: the schema it was exported under, per-entity
/// record lists and per-entity many-to-many association blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Archive {
    pub schema: SchemaDescription,
    pub entity_data: HashMap<String, Vec<EntityRecord>>,
    #[serde(default)]
    pub relationship_data: HashMap<String, Vec<AssociationBlock>>,
}

impl Archive {
    pub fn records(&self, entity: &str) -> &[EntityRecord] {
        self.entity_data
            .get(entity)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn total_record_count(&self) -> usize {
        self.entity_data.values().map(Vec::len).sum()
    }

    /// Total number of individual associations across all blocks.
    pub fn association_count(&self) -> usize {
        self.relationship_data
            .values()
            .flat_map(|blocks| blocks.iter())
            .map(|b| b.target_ids.len())
            .sum()
    }

    /// Columns present in the archived records, grouped by entity.
    pub fn columns_by_entity(&self) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for (entity, records) in &self.entity_data {
            let columns = out.entry(entity.clone()).or_default();
            for record in records {
                for attr in &record.attributes {
                    if !columns.iter().any(|c| c.eq_ignore_ascii_case(&attr.name)) {
                        columns.push(attr.name.clone());
                    }
                }
            }
        }
        out
    }
}

/// One exported many-to-many block: all targets of a single relationship for
/// a single source record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationBlock {
    pub source_id: Uuid,
    pub relationship: String,
    pub target_entity: String,
    pub target_ids: Vec<Uuid>,
}
