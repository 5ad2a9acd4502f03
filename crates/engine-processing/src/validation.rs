use crate::error::ProcessingError;
use connectors::{
    fault::ClientError,
    pool::ConnectionPool,
    request::{DataverseRequest, DataverseResponse},
};
use model::{archive::Archive, execution::options::ImportMode, schema::FieldValidity};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Attribute-level write validity as loaded from the target tenant, one
/// round trip per entity, cached for the whole import.
///
/// An entity missing in the target yields empty metadata, which means
/// "include every field" for backwards compatibility with older targets.
#[derive(Debug, Default)]
pub struct TargetMetadata {
    entities: HashMap<String, HashMap<String, FieldValidity>>,
}

impl TargetMetadata {
    pub async fn load<'a>(
        pool: &Arc<ConnectionPool>,
        entities: impl IntoIterator<Item = &'a str>,
        cancel: &CancellationToken,
    ) -> Result<Self, ProcessingError> {
        let client = pool.acquire(cancel).await?;
        let mut loaded = HashMap::new();

        for entity in entities {
            let request = DataverseRequest::RetrieveAttributeMetadata {
                entity: entity.to_string(),
            };
            match client.execute(request, cancel).await {
                Ok(DataverseResponse::AttributeMetadata(map)) => {
                    debug!(entity, attributes = map.len(), "Loaded target metadata");
                    let normalized = map
                        .into_iter()
                        .map(|(name, validity)| (name.to_ascii_lowercase(), validity))
                        .collect();
                    loaded.insert(entity.to_string(), normalized);
                }
                Ok(_) => {
                    loaded.insert(entity.to_string(), HashMap::new());
                }
                Err(ClientError::Cancelled) => return Err(ProcessingError::Cancelled),
                Err(ClientError::Fault(fault)) => {
                    warn!(
                        entity,
                        code = fault.code,
                        "Entity metadata unavailable in target, including all fields"
                    );
                    loaded.insert(entity.to_string(), HashMap::new());
                }
                Err(err) => {
                    return Err(ProcessingError::Metadata {
                        entity: entity.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }

        Ok(Self { entities: loaded })
    }

    /// Builds the cache from an already-loaded validity map.
    pub fn from_map(entities: HashMap<String, HashMap<String, FieldValidity>>) -> Self {
        let entities = entities
            .into_iter()
            .map(|(entity, map)| {
                let normalized = map
                    .into_iter()
                    .map(|(name, v)| (name.to_ascii_lowercase(), v))
                    .collect();
                (entity, normalized)
            })
            .collect();
        Self { entities }
    }

    fn validity(&self, entity: &str, field: &str) -> Option<&FieldValidity> {
        self.entities
            .get(entity)?
            .get(&field.to_ascii_lowercase())
    }

    /// Whether the target knows the column at all. Entities with empty or
    /// absent metadata count as knowing everything.
    pub fn is_known_column(&self, entity: &str, field: &str) -> bool {
        match self.entities.get(entity) {
            Some(map) if !map.is_empty() => map.contains_key(&field.to_ascii_lowercase()),
            _ => true,
        }
    }

    /// Per-field inclusion decision for the given operation mode.
    pub fn should_include_field(&self, entity: &str, field: &str, mode: ImportMode) -> bool {
        let Some(validity) = self.validity(entity, field) else {
            return true;
        };
        if !validity.valid_for_create && !validity.valid_for_update {
            return false;
        }
        match mode {
            ImportMode::Create => validity.valid_for_create,
            ImportMode::Update => validity.valid_for_update,
            ImportMode::Upsert => validity.valid_for_create || validity.valid_for_update,
        }
    }

    /// Columns present in the archive but absent from the target, grouped by
    /// entity. The orchestrator fails fast on a non-empty result unless the
    /// caller opted into dropping them.
    pub fn detect_missing_columns(&self, archive: &Archive) -> BTreeMap<String, Vec<String>> {
        let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (entity, columns) in archive.columns_by_entity() {
            let mut absent: Vec<String> = columns
                .into_iter()
                .filter(|column| !self.is_known_column(&entity, column))
                .collect();
            if !absent.is_empty() {
                absent.sort();
                missing.insert(entity, absent);
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::records::record::EntityRecord;
    use model::core::value::Value;
    use uuid::Uuid;

    fn validity(create: bool, update: bool) -> FieldValidity {
        FieldValidity {
            valid_for_create: create,
            valid_for_update: update,
        }
    }

    fn metadata_with(entity: &str, fields: Vec<(&str, FieldValidity)>) -> TargetMetadata {
        let map = fields
            .into_iter()
            .map(|(name, v)| (name.to_string(), v))
            .collect();
        TargetMetadata::from_map(HashMap::from([(entity.to_string(), map)]))
    }

    #[test]
    fn unknown_attributes_are_included() {
        let meta = metadata_with("account", vec![("name", validity(true, true))]);
        assert!(meta.should_include_field("account", "telephone1", ImportMode::Create));
        assert!(meta.should_include_field("contact", "anything", ImportMode::Update));
    }

    #[test]
    fn attributes_invalid_for_both_are_excluded() {
        let meta = metadata_with("account", vec![("createdon", validity(false, false))]);
        for mode in [ImportMode::Create, ImportMode::Update, ImportMode::Upsert] {
            assert!(!meta.should_include_field("account", "createdon", mode));
        }
    }

    #[test]
    fn mode_specific_validity_is_honoured() {
        let meta = metadata_with(
            "account",
            vec![
                ("accountnumber", validity(true, false)),
                ("statuscode", validity(false, true)),
            ],
        );

        assert!(meta.should_include_field("account", "accountnumber", ImportMode::Create));
        assert!(!meta.should_include_field("account", "accountnumber", ImportMode::Update));
        assert!(meta.should_include_field("account", "accountnumber", ImportMode::Upsert));

        assert!(!meta.should_include_field("account", "statuscode", ImportMode::Create));
        assert!(meta.should_include_field("account", "statuscode", ImportMode::Update));
        assert!(meta.should_include_field("account", "statuscode", ImportMode::Upsert));
    }

    #[test]
    fn missing_columns_are_grouped_by_entity() {
        let meta = metadata_with("account", vec![("name", validity(true, true))]);
        let mut archive = Archive::default();
        archive.entity_data.insert(
            "account".to_string(),
            vec![
                EntityRecord::new("account", Uuid::new_v4())
                    .with_attribute("name", Value::from("A"))
                    .with_attribute("customfield_x", Value::from("drop me")),
            ],
        );

        let missing = meta.detect_missing_columns(&archive);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing["account"], vec!["customfield_x".to_string()]);
    }

    #[test]
    fn entity_without_metadata_reports_no_missing_columns() {
        let meta = TargetMetadata::from_map(HashMap::new());
        let mut archive = Archive::default();
        archive.entity_data.insert(
            "annotation".to_string(),
            vec![
                EntityRecord::new("annotation", Uuid::new_v4())
                    .with_attribute("subject", Value::from("note")),
            ],
        );
        assert!(meta.detect_missing_columns(&archive).is_empty());
    }
}
