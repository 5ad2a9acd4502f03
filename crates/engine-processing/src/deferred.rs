use crate::{bulk::executor::BulkExecutor, error::ProcessingError};
use engine_core::result::BulkResult;
use model::{
    archive::Archive, core::value::Value, identity::IdMap, records::record::EntityRecord,
};
use planner::plan::ImportPlan;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Second pass: writes the self- and cyclic-lookup attributes that were
/// dropped during the tier pass, now that every record they can point at
/// exists in the target.
pub struct DeferredFieldProcessor<'a> {
    pub executor: &'a BulkExecutor,
    pub id_map: &'a IdMap,
}

impl DeferredFieldProcessor<'_> {
    pub async fn run(
        &self,
        archive: &Archive,
        plan: &ImportPlan,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, ProcessingError> {
        let mut total = BulkResult::empty();

        for (entity, fields) in &plan.deferred_fields {
            if cancel.is_cancelled() {
                break;
            }
            let updates = build_deferred_updates(archive.records(entity), fields, self.id_map);
            if updates.is_empty() {
                debug!(entity, "No deferred lookups to apply");
                continue;
            }
            info!(
                entity,
                records = updates.len(),
                fields = fields.len(),
                "Applying deferred lookup updates"
            );
            let result = self
                .executor
                .update_multiple(entity, updates, cancel)
                .await?;
            total.merge(result);
        }

        Ok(total)
    }
}

/// One update record per archived record that (a) landed during the tier
/// pass and (b) has at least one deferred lookup whose target also landed.
pub fn build_deferred_updates(
    records: &[EntityRecord],
    fields: &BTreeSet<String>,
    id_map: &IdMap,
) -> Vec<EntityRecord> {
    let mut updates = Vec::new();
    for record in records {
        let Some(new_id) = id_map.get(&record.entity, record.id) else {
            continue;
        };

        let mut update = EntityRecord::new(&record.entity, new_id);
        let pk_attribute = update.primary_key_attribute();
        update.set(&pk_attribute, Value::Uuid(new_id));

        let mut any_mapped = false;
        for field in fields {
            let Some(Value::Reference(reference)) = record.get(field) else {
                continue;
            };
            let Some(target_id) = id_map.get(&reference.entity, reference.id) else {
                continue;
            };
            update.set(field, Value::Reference(reference.with_id(target_id)));
            any_mapped = true;
        }

        if any_mapped {
            updates.push(update);
        }
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::core::reference::EntityReference;
    use uuid::Uuid;

    #[test]
    fn only_mapped_records_with_mapped_targets_produce_updates() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let never_imported = Uuid::new_v4();

        let id_map = IdMap::new();
        id_map.insert("account", a, a);
        id_map.insert("account", b, b);

        let records = vec![
            // a -> b: both mapped, update expected.
            EntityRecord::new("account", a).with_attribute(
                "parentaccountid",
                Value::Reference(EntityReference::new("account", b)),
            ),
            // b -> never_imported: target unmapped, skipped.
            EntityRecord::new("account", b).with_attribute(
                "parentaccountid",
                Value::Reference(EntityReference::new("account", never_imported)),
            ),
            // never imported source: skipped.
            EntityRecord::new("account", never_imported).with_attribute(
                "parentaccountid",
                Value::Reference(EntityReference::new("account", a)),
            ),
        ];

        let fields: BTreeSet<String> = ["parentaccountid".to_string()].into();
        let updates = build_deferred_updates(&records, &fields, &id_map);

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].id, a);
        assert_eq!(updates[0].get("parentaccountid").unwrap().as_uuid(), Some(b));
        assert_eq!(updates[0].get("accountid"), Some(&Value::Uuid(a)));
    }

    #[test]
    fn records_without_deferred_values_are_skipped() {
        let a = Uuid::new_v4();
        let id_map = IdMap::new();
        id_map.insert("account", a, a);

        let records =
            vec![EntityRecord::new("account", a).with_attribute("name", Value::from("A"))];
        let fields: BTreeSet<String> = ["parentaccountid".to_string()].into();
        assert!(build_deferred_updates(&records, &fields, &id_map).is_empty());
    }
}
