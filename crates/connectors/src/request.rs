use model::{
    core::reference::EntityReference,
    execution::options::{BypassCustomLogic, ImportOptions},
    records::record::EntityRecord,
    schema::{FieldValidity, RelationshipSchema},
};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

/// The server takes a `(name -> value)` parameter bag on every request.
/// This is the closed set of value shapes the engine ever sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    String(String),
    Int(i64),
    Bool(bool),
    Float(f64),
    Reference(EntityReference),
    RecordCollection(Vec<EntityRecord>),
    ReferenceCollection(Vec<EntityReference>),
    IdCollection(Vec<Uuid>),
}

impl ParameterValue {
    /// Wire form of the value as the server expects it.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            ParameterValue::String(v) => json!(v),
            ParameterValue::Int(v) => json!(v),
            ParameterValue::Bool(v) => json!(v),
            ParameterValue::Float(v) => json!(v),
            ParameterValue::Reference(r) => json!({ "entity": r.entity, "id": r.id }),
            ParameterValue::RecordCollection(records) => {
                json!(records)
            }
            ParameterValue::ReferenceCollection(refs) => json!(
                refs.iter()
                    .map(|r| json!({ "entity": r.entity, "id": r.id }))
                    .collect::<Vec<_>>()
            ),
            ParameterValue::IdCollection(ids) => json!(ids),
        }
    }
}

/// Request options carried verbatim to the server on every mutating call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestParams {
    pub bypass_custom_logic: BypassCustomLogic,
    pub bypass_power_automate_flows: bool,
    pub suppress_duplicate_detection: bool,
    pub tag: Option<String>,
}

impl RequestParams {
    pub fn from_options(options: &ImportOptions) -> Self {
        Self {
            bypass_custom_logic: options.bypass_custom_logic,
            bypass_power_automate_flows: options.bypass_power_automate_flows,
            suppress_duplicate_detection: options.suppress_duplicate_detection,
            tag: options.tag.clone(),
        }
    }

    /// Emits the wire parameter names the server-side automation keys on.
    /// The names must survive exactly as written here.
    pub fn to_parameter_bag(&self) -> Vec<(String, ParameterValue)> {
        let mut bag = Vec::new();
        if let Some(wire) = self.bypass_custom_logic.wire_value() {
            bag.push((
                "BypassBusinessLogicExecution".to_string(),
                ParameterValue::String(wire.to_string()),
            ));
        }
        if self.bypass_power_automate_flows {
            bag.push((
                "SuppressCallbackRegistrationExpanderJob".to_string(),
                ParameterValue::Bool(true),
            ));
        }
        if self.suppress_duplicate_detection {
            bag.push((
                "SuppressDuplicateDetection".to_string(),
                ParameterValue::Bool(true),
            ));
        }
        if let Some(tag) = &self.tag {
            bag.push(("tag".to_string(), ParameterValue::String(tag.clone())));
        }
        bag
    }
}

/// Every organization request the engine issues.
#[derive(Debug, Clone)]
pub enum DataverseRequest {
    Create {
        record: EntityRecord,
        params: RequestParams,
    },
    Update {
        record: EntityRecord,
        params: RequestParams,
    },
    Upsert {
        record: EntityRecord,
        params: RequestParams,
    },
    Delete {
        target: EntityReference,
        params: RequestParams,
    },
    CreateMultiple {
        entity: String,
        records: Vec<EntityRecord>,
        params: RequestParams,
    },
    UpdateMultiple {
        entity: String,
        records: Vec<EntityRecord>,
        params: RequestParams,
    },
    UpsertMultiple {
        entity: String,
        records: Vec<EntityRecord>,
        params: RequestParams,
    },
    DeleteMultiple {
        entity: String,
        ids: Vec<Uuid>,
        params: RequestParams,
    },
    Associate {
        source: EntityReference,
        relationship: String,
        targets: Vec<EntityReference>,
        params: RequestParams,
    },
    Retrieve {
        entity: String,
        id: Uuid,
        columns: Vec<String>,
    },
    RetrieveAttributeMetadata {
        entity: String,
    },
    RetrieveManyToManyRelationships,
    QueryPluginSteps {
        object_type_codes: Vec<i32>,
    },
    SetPluginStepState {
        step_id: Uuid,
        enabled: bool,
    },
}

impl DataverseRequest {
    pub fn name(&self) -> &'static str {
        match self {
            DataverseRequest::Create { .. } => "Create",
            DataverseRequest::Update { .. } => "Update",
            DataverseRequest::Upsert { .. } => "Upsert",
            DataverseRequest::Delete { .. } => "Delete",
            DataverseRequest::CreateMultiple { .. } => "CreateMultiple",
            DataverseRequest::UpdateMultiple { .. } => "UpdateMultiple",
            DataverseRequest::UpsertMultiple { .. } => "UpsertMultiple",
            DataverseRequest::DeleteMultiple { .. } => "DeleteMultiple",
            DataverseRequest::Associate { .. } => "Associate",
            DataverseRequest::Retrieve { .. } => "Retrieve",
            DataverseRequest::RetrieveAttributeMetadata { .. } => "RetrieveEntity",
            DataverseRequest::RetrieveManyToManyRelationships => "RetrieveAllRelationships",
            DataverseRequest::QueryPluginSteps { .. } => "RetrieveSdkMessageProcessingSteps",
            DataverseRequest::SetPluginStepState { .. } => "SetState",
        }
    }

    /// Logical entity the request writes to, where that is meaningful.
    pub fn entity(&self) -> Option<&str> {
        match self {
            DataverseRequest::Create { record, .. }
            | DataverseRequest::Update { record, .. }
            | DataverseRequest::Upsert { record, .. } => Some(&record.entity),
            DataverseRequest::Delete { target, .. } => Some(&target.entity),
            DataverseRequest::CreateMultiple { entity, .. }
            | DataverseRequest::UpdateMultiple { entity, .. }
            | DataverseRequest::UpsertMultiple { entity, .. }
            | DataverseRequest::DeleteMultiple { entity, .. } => Some(entity),
            DataverseRequest::Associate { source, .. } => Some(&source.entity),
            DataverseRequest::Retrieve { entity, .. }
            | DataverseRequest::RetrieveAttributeMetadata { entity } => Some(entity),
            _ => None,
        }
    }

    /// Number of records the request carries.
    pub fn record_count(&self) -> usize {
        match self {
            DataverseRequest::CreateMultiple { records, .. }
            | DataverseRequest::UpdateMultiple { records, .. }
            | DataverseRequest::UpsertMultiple { records, .. } => records.len(),
            DataverseRequest::DeleteMultiple { ids, .. } => ids.len(),
            DataverseRequest::Create { .. }
            | DataverseRequest::Update { .. }
            | DataverseRequest::Upsert { .. }
            | DataverseRequest::Delete { .. } => 1,
            _ => 0,
        }
    }

    /// Flattens the request into the server's `(name -> value)` bag,
    /// including the carried request options.
    pub fn to_parameter_bag(&self) -> Vec<(String, ParameterValue)> {
        let mut bag = Vec::new();
        match self {
            DataverseRequest::Create { record, params }
            | DataverseRequest::Update { record, params }
            | DataverseRequest::Upsert { record, params } => {
                bag.push((
                    "Target".to_string(),
                    ParameterValue::RecordCollection(vec![record.clone()]),
                ));
                bag.extend(params.to_parameter_bag());
            }
            DataverseRequest::Delete { target, params } => {
                bag.push(("Target".to_string(), ParameterValue::Reference(target.clone())));
                bag.extend(params.to_parameter_bag());
            }
            DataverseRequest::CreateMultiple { records, params, .. }
            | DataverseRequest::UpdateMultiple { records, params, .. }
            | DataverseRequest::UpsertMultiple { records, params, .. } => {
                bag.push((
                    "Targets".to_string(),
                    ParameterValue::RecordCollection(records.clone()),
                ));
                bag.extend(params.to_parameter_bag());
            }
            DataverseRequest::DeleteMultiple { ids, params, .. } => {
                bag.push(("Targets".to_string(), ParameterValue::IdCollection(ids.clone())));
                bag.extend(params.to_parameter_bag());
            }
            DataverseRequest::Associate {
                source,
                relationship,
                targets,
                params,
            } => {
                bag.push(("Target".to_string(), ParameterValue::Reference(source.clone())));
                bag.push((
                    "Relationship".to_string(),
                    ParameterValue::String(relationship.clone()),
                ));
                bag.push((
                    "RelatedEntities".to_string(),
                    ParameterValue::ReferenceCollection(targets.clone()),
                ));
                bag.extend(params.to_parameter_bag());
            }
            DataverseRequest::Retrieve { id, columns, .. } => {
                bag.push(("Id".to_string(), ParameterValue::String(id.to_string())));
                bag.push((
                    "ColumnSet".to_string(),
                    ParameterValue::String(columns.join(",")),
                ));
            }
            DataverseRequest::RetrieveAttributeMetadata { entity } => {
                bag.push((
                    "LogicalName".to_string(),
                    ParameterValue::String(entity.clone()),
                ));
            }
            DataverseRequest::RetrieveManyToManyRelationships => {}
            DataverseRequest::QueryPluginSteps { object_type_codes } => {
                bag.push((
                    "ObjectTypeCodes".to_string(),
                    ParameterValue::String(
                        object_type_codes
                            .iter()
                            .map(|c| c.to_string())
                            .collect::<Vec<_>>()
                            .join(","),
                    ),
                ));
            }
            DataverseRequest::SetPluginStepState { step_id, enabled } => {
                bag.push(("Id".to_string(), ParameterValue::String(step_id.to_string())));
                bag.push(("Enabled".to_string(), ParameterValue::Bool(*enabled)));
            }
        }
        bag
    }
}

/// Successful responses, one variant per request family.
#[derive(Debug, Clone)]
pub enum DataverseResponse {
    Created { id: Uuid },
    Updated,
    Upserted { created: bool },
    Deleted,
    CreatedMultiple { ids: Vec<Uuid> },
    UpdatedMultiple { count: usize },
    UpsertedMultiple { created: usize, updated: usize },
    DeletedMultiple { count: usize },
    Associated,
    Record(Option<EntityRecord>),
    AttributeMetadata(HashMap<String, FieldValidity>),
    ManyToManyRelationships(Vec<RelationshipSchema>),
    PluginSteps(Vec<Uuid>),
    Ack,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_bag_emits_wire_names() {
        let params = RequestParams {
            bypass_custom_logic: BypassCustomLogic::All,
            bypass_power_automate_flows: true,
            suppress_duplicate_detection: true,
            tag: Some("migration-2024".to_string()),
        };
        let bag = params.to_parameter_bag();
        let names: Vec<&str> = bag.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "BypassBusinessLogicExecution",
                "SuppressCallbackRegistrationExpanderJob",
                "SuppressDuplicateDetection",
                "tag"
            ]
        );
        assert_eq!(
            bag[0].1,
            ParameterValue::String("CustomSync,CustomAsync".to_string())
        );
    }

    #[test]
    fn default_params_emit_nothing() {
        assert!(RequestParams::default().to_parameter_bag().is_empty());
    }

    #[test]
    fn create_multiple_bag_carries_targets_then_options() {
        let record = EntityRecord::new("account", Uuid::new_v4());
        let request = DataverseRequest::CreateMultiple {
            entity: "account".to_string(),
            records: vec![record],
            params: RequestParams {
                suppress_duplicate_detection: true,
                ..Default::default()
            },
        };

        assert_eq!(request.name(), "CreateMultiple");
        assert_eq!(request.entity(), Some("account"));
        assert_eq!(request.record_count(), 1);

        let bag = request.to_parameter_bag();
        assert_eq!(bag[0].0, "Targets");
        assert_eq!(bag[1].0, "SuppressDuplicateDetection");
    }

    #[test]
    fn wire_form_of_references_is_structured() {
        let r = EntityReference::new("account", Uuid::nil());
        let wire = ParameterValue::Reference(r).to_wire();
        assert_eq!(wire["entity"], "account");
    }
}
