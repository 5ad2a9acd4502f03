use crate::validation::TargetMetadata;
use model::{
    core::{reference::EntityReference, value::Value},
    execution::options::ImportOptions,
    identity::IdMap,
    records::record::EntityRecord,
};
use std::collections::BTreeSet;

/// Ownership attributes stripped when the caller asked for it.
pub const OWNER_FIELDS: [&str; 8] = [
    "ownerid",
    "createdby",
    "modifiedby",
    "createdonbehalfby",
    "modifiedonbehalfby",
    "owninguser",
    "owningteam",
    "owningbusinessunit",
];

/// Entities whose references may be substituted through the user-mapping
/// table or the current-user fallback.
const USER_LIKE_ENTITIES: [&str; 2] = ["systemuser", "team"];

/// Rewrites one archived record into the shape the tier pass writes:
/// deferred and excluded attributes dropped, references remapped, the
/// primary key carried as an explicit attribute for deterministic upsert.
pub struct RecordPreparer<'a> {
    pub metadata: &'a TargetMetadata,
    pub deferred: Option<&'a BTreeSet<String>>,
    pub id_map: &'a IdMap,
    pub options: &'a ImportOptions,
}

impl RecordPreparer<'_> {
    pub fn prepare(&self, record: &EntityRecord) -> EntityRecord {
        let mut prepared = EntityRecord::new(&record.entity, record.id);
        let pk_attribute = prepared.primary_key_attribute();

        if !record.id.is_nil() {
            prepared.set(&pk_attribute, Value::Uuid(record.id));
        }

        for attr in &record.attributes {
            let name = attr.name.as_str();
            if name.eq_ignore_ascii_case(&pk_attribute) {
                continue;
            }
            if self.is_deferred(name) {
                continue;
            }
            if self.options.strip_owner_fields
                && OWNER_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(name))
            {
                continue;
            }
            if !self
                .metadata
                .should_include_field(&record.entity, name, self.options.mode)
            {
                continue;
            }
            if self.options.skip_missing_columns
                && !self.metadata.is_known_column(&record.entity, name)
            {
                continue;
            }

            let value = match &attr.value {
                Value::Reference(reference) => Value::Reference(self.remap(reference)),
                other => other.clone(),
            };
            prepared.set(name, value);
        }

        // Imported teams must never collide with the target's system
        // default teams.
        if record.entity == "team" {
            prepared.set("isdefault", Value::Boolean(false));
        }

        prepared
    }

    fn is_deferred(&self, name: &str) -> bool {
        self.deferred
            .map(|fields| fields.iter().any(|f| f.eq_ignore_ascii_case(name)))
            .unwrap_or(false)
    }

    /// Reference remapping: user-like references go through the user-mapping
    /// table with an optional current-user fallback; everything else goes
    /// through the ID map. Unmapped references are left as exported.
    fn remap(&self, reference: &EntityReference) -> EntityReference {
        if USER_LIKE_ENTITIES.contains(&reference.entity.as_str()) {
            if let Some(mappings) = &self.options.user_mappings {
                if let Some(mapped) = mappings.get(&reference.id) {
                    return reference.with_id(*mapped);
                }
            }
            if let Some(current_user) = self.options.current_user_id {
                if self.id_map.get(&reference.entity, reference.id).is_none() {
                    return reference.with_id(current_user);
                }
            }
        }

        match self.id_map.get(&reference.entity, reference.id) {
            Some(mapped) => reference.with_id(mapped),
            None => reference.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::execution::options::ImportMode;
    use model::schema::FieldValidity;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn empty_metadata() -> TargetMetadata {
        TargetMetadata::from_map(HashMap::new())
    }

    fn preparer<'a>(
        metadata: &'a TargetMetadata,
        deferred: Option<&'a BTreeSet<String>>,
        id_map: &'a IdMap,
        options: &'a ImportOptions,
    ) -> RecordPreparer<'a> {
        RecordPreparer {
            metadata,
            deferred,
            id_map,
            options,
        }
    }

    #[test]
    fn primary_key_is_carried_as_attribute() {
        let metadata = empty_metadata();
        let id_map = IdMap::new();
        let options = ImportOptions::default();
        let id = Uuid::new_v4();
        let record = EntityRecord::new("account", id).with_attribute("name", Value::from("A"));

        let prepared = preparer(&metadata, None, &id_map, &options).prepare(&record);
        assert_eq!(prepared.get("accountid"), Some(&Value::Uuid(id)));
        assert_eq!(prepared.id, id);
    }

    #[test]
    fn deferred_fields_are_dropped() {
        let metadata = empty_metadata();
        let id_map = IdMap::new();
        let options = ImportOptions::default();
        let deferred: BTreeSet<String> = ["parentaccountid".to_string()].into();
        let record = EntityRecord::new("account", Uuid::new_v4())
            .with_attribute("name", Value::from("A"))
            .with_attribute(
                "parentaccountid",
                Value::Reference(EntityReference::new("account", Uuid::new_v4())),
            );

        let prepared = preparer(&metadata, Some(&deferred), &id_map, &options).prepare(&record);
        assert!(!prepared.contains("parentaccountid"));
        assert!(prepared.contains("name"));
    }

    #[test]
    fn owner_fields_are_stripped_on_request() {
        let metadata = empty_metadata();
        let id_map = IdMap::new();
        let options = ImportOptions {
            strip_owner_fields: true,
            ..Default::default()
        };
        let record = EntityRecord::new("account", Uuid::new_v4())
            .with_attribute("name", Value::from("A"))
            .with_attribute(
                "ownerid",
                Value::Reference(EntityReference::new("systemuser", Uuid::new_v4())),
            )
            .with_attribute(
                "modifiedby",
                Value::Reference(EntityReference::new("systemuser", Uuid::new_v4())),
            );

        let prepared = preparer(&metadata, None, &id_map, &options).prepare(&record);
        assert!(!prepared.contains("ownerid"));
        assert!(!prepared.contains("modifiedby"));
        assert!(prepared.contains("name"));
    }

    #[test]
    fn invalid_columns_are_dropped_by_mode() {
        let mut fields = HashMap::new();
        fields.insert(
            "createdon".to_string(),
            FieldValidity {
                valid_for_create: false,
                valid_for_update: false,
            },
        );
        let metadata =
            TargetMetadata::from_map(HashMap::from([("account".to_string(), fields)]));
        let id_map = IdMap::new();
        let options = ImportOptions {
            mode: ImportMode::Create,
            ..Default::default()
        };
        let record = EntityRecord::new("account", Uuid::new_v4())
            .with_attribute("createdon", Value::from("2021-01-01"))
            .with_attribute("name", Value::from("A"));

        let prepared = preparer(&metadata, None, &id_map, &options).prepare(&record);
        assert!(!prepared.contains("createdon"));
        assert!(prepared.contains("name"));
    }

    #[test]
    fn user_references_prefer_the_mapping_table() {
        let metadata = empty_metadata();
        let id_map = IdMap::new();
        let source_user = Uuid::new_v4();
        let target_user = Uuid::new_v4();
        let current_user = Uuid::new_v4();
        let options = ImportOptions {
            user_mappings: Some(HashMap::from([(source_user, target_user)])),
            current_user_id: Some(current_user),
            ..Default::default()
        };

        let mapped = EntityReference::new("systemuser", source_user);
        let unmapped = EntityReference::new("systemuser", Uuid::new_v4());
        let record = EntityRecord::new("account", Uuid::new_v4())
            .with_attribute("createdby", Value::Reference(mapped))
            .with_attribute("modifiedby", Value::Reference(unmapped));

        let prepared = preparer(&metadata, None, &id_map, &options).prepare(&record);
        assert_eq!(
            prepared.get("createdby").unwrap().as_uuid(),
            Some(target_user)
        );
        assert_eq!(
            prepared.get("modifiedby").unwrap().as_uuid(),
            Some(current_user)
        );
    }

    #[test]
    fn ordinary_references_go_through_the_id_map() {
        let metadata = empty_metadata();
        let id_map = IdMap::new();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        id_map.insert("account", old, new);
        let options = ImportOptions::default();

        let record = EntityRecord::new("contact", Uuid::new_v4()).with_attribute(
            "parentcustomerid",
            Value::Reference(EntityReference::new("account", old)),
        );
        let prepared = preparer(&metadata, None, &id_map, &options).prepare(&record);
        assert_eq!(
            prepared.get("parentcustomerid").unwrap().as_uuid(),
            Some(new)
        );

        // Unmapped references stay as exported.
        let stray = Uuid::new_v4();
        let record = EntityRecord::new("contact", Uuid::new_v4()).with_attribute(
            "parentcustomerid",
            Value::Reference(EntityReference::new("account", stray)),
        );
        let prepared = preparer(&metadata, None, &id_map, &options).prepare(&record);
        assert_eq!(
            prepared.get("parentcustomerid").unwrap().as_uuid(),
            Some(stray)
        );
    }

    #[test]
    fn imported_teams_are_never_default() {
        let metadata = empty_metadata();
        let id_map = IdMap::new();
        let options = ImportOptions::default();
        let record = EntityRecord::new("team", Uuid::new_v4())
            .with_attribute("name", Value::from("Sales"))
            .with_attribute("isdefault", Value::Boolean(true));

        let prepared = preparer(&metadata, None, &id_map, &options).prepare(&record);
        assert_eq!(prepared.get("isdefault"), Some(&Value::Boolean(false)));
    }
}
