//! In-memory stand-in for a target tenant: stores records, answers metadata
//! queries, honours the associate contract and plays back scripted faults.

use async_trait::async_trait;
use connectors::{
    client::{ConnectionSource, ServiceClient},
    error::ConnectorError,
    fault::{ClientError, ERROR_DUPLICATE_KEY, ServiceFault},
    pool::{ConnectionPool, PoolConfig},
    request::{DataverseRequest, DataverseResponse},
};
use model::{
    core::value::Value,
    records::record::EntityRecord,
    schema::{FieldValidity, RelationshipSchema},
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// One scripted failure: fires on matching requests after `skip` matches,
/// for `remaining` occurrences.
pub struct ScriptedFault {
    pub request_name: &'static str,
    pub entity: Option<String>,
    pub skip: usize,
    pub remaining: usize,
    pub fault: ServiceFault,
}

#[derive(Default)]
struct MockState {
    records: Mutex<HashMap<String, HashMap<Uuid, EntityRecord>>>,
    associations: Mutex<HashSet<(String, Uuid, Uuid)>>,
    metadata: Mutex<HashMap<String, HashMap<String, FieldValidity>>>,
    relationships: Mutex<Vec<RelationshipSchema>>,
    plugin_steps: Mutex<HashMap<Uuid, bool>>,
    plugin_log: Mutex<Vec<(Uuid, bool)>>,
    request_log: Mutex<Vec<String>>,
    scripted: Mutex<Vec<ScriptedFault>>,
    latency: Mutex<Duration>,
    parallelism: Mutex<usize>,
}

/// Builder/inspection facade shared by the test and every pooled client.
#[derive(Clone, Default)]
pub struct MockDataverse {
    state: Arc<MockState>,
}

impl MockDataverse {
    pub fn new() -> Self {
        let mock = Self::default();
        *mock.state.parallelism.lock().unwrap() = 4;
        mock
    }

    pub fn with_parallelism(self, parallelism: usize) -> Self {
        *self.state.parallelism.lock().unwrap() = parallelism;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock().unwrap() = latency;
        self
    }

    /// Target attribute metadata for one entity:
    /// `(name, valid_for_create, valid_for_update)` triples.
    pub fn with_metadata(self, entity: &str, fields: &[(&str, bool, bool)]) -> Self {
        let map = fields
            .iter()
            .map(|(name, create, update)| {
                (
                    name.to_string(),
                    FieldValidity {
                        valid_for_create: *create,
                        valid_for_update: *update,
                    },
                )
            })
            .collect();
        self.state
            .metadata
            .lock()
            .unwrap()
            .insert(entity.to_string(), map);
        self
    }

    pub fn with_relationship(self, schema_name: &str, intersect: &str, e1: &str, e2: &str) -> Self {
        self.state
            .relationships
            .lock()
            .unwrap()
            .push(RelationshipSchema {
                schema_name: schema_name.to_string(),
                intersect_entity: intersect.to_string(),
                entity1: e1.to_string(),
                entity2: e2.to_string(),
            });
        self
    }

    pub fn with_plugin_step(self, step_id: Uuid) -> Self {
        self.state.plugin_steps.lock().unwrap().insert(step_id, true);
        self
    }

    /// Pre-existing record in the target (e.g. a role shared across
    /// tenants).
    pub fn with_existing_record(self, record: EntityRecord) -> Self {
        self.state
            .records
            .lock()
            .unwrap()
            .entry(record.entity.clone())
            .or_default()
            .insert(record.id, record);
        self
    }

    pub fn with_existing_association(self, relationship: &str, source: Uuid, target: Uuid) -> Self {
        self.state
            .associations
            .lock()
            .unwrap()
            .insert((relationship.to_string(), source, target));
        self
    }

    pub fn with_scripted_fault(self, scripted: ScriptedFault) -> Self {
        self.state.scripted.lock().unwrap().push(scripted);
        self
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool_with_config(PoolConfig::default())
    }

    pub fn pool_with_config(&self, config: PoolConfig) -> Arc<ConnectionPool> {
        let source = MockSource {
            state: Arc::clone(&self.state),
            name: "mock".to_string(),
        };
        ConnectionPool::new(vec![Arc::new(source)], config)
    }

    // Inspection -----------------------------------------------------------

    pub fn record_count(&self, entity: &str) -> usize {
        self.state
            .records
            .lock()
            .unwrap()
            .get(entity)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn attribute(&self, entity: &str, id: Uuid, field: &str) -> Option<Value> {
        let records = self.state.records.lock().unwrap();
        records
            .get(entity)?
            .get(&id)?
            .get(field)
            .cloned()
    }

    pub fn has_association(&self, relationship: &str, source: Uuid, target: Uuid) -> bool {
        self.state
            .associations
            .lock()
            .unwrap()
            .contains(&(relationship.to_string(), source, target))
    }

    pub fn requests_named(&self, name: &str) -> usize {
        self.state
            .request_log
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.starts_with(name))
            .count()
    }

    pub fn requests_for_entity(&self, name: &str, entity: &str) -> usize {
        let needle = format!("{name}:{entity}");
        self.state
            .request_log
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| **entry == needle)
            .count()
    }

    pub fn plugin_step_enabled(&self, step_id: Uuid) -> bool {
        self.state
            .plugin_steps
            .lock()
            .unwrap()
            .get(&step_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn plugin_transitions(&self, step_id: Uuid) -> Vec<bool> {
        self.state
            .plugin_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == step_id)
            .map(|(_, enabled)| *enabled)
            .collect()
    }
}

struct MockSource {
    state: Arc<MockState>,
    name: String,
}

#[async_trait]
impl ConnectionSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_client(&self) -> Result<Box<dyn ServiceClient>, ConnectorError> {
        Ok(Box::new(MockClient {
            state: Arc::clone(&self.state),
            name: self.name.clone(),
        }))
    }
}

struct MockClient {
    state: Arc<MockState>,
    name: String,
}

#[async_trait]
impl ServiceClient for MockClient {
    fn connection_name(&self) -> &str {
        &self.name
    }

    fn recommended_parallelism(&self) -> usize {
        *self.state.parallelism.lock().unwrap()
    }

    async fn execute(
        &self,
        request: DataverseRequest,
        cancel: &CancellationToken,
    ) -> Result<DataverseResponse, ClientError> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let latency = *self.state.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }

        self.state.request_log.lock().unwrap().push(format!(
            "{}:{}",
            request.name(),
            request.entity().unwrap_or("")
        ));

        if let Some(fault) = self.next_scripted_fault(&request) {
            return Err(ClientError::Fault(fault));
        }

        self.dispatch(request)
    }
}

impl MockClient {
    fn next_scripted_fault(&self, request: &DataverseRequest) -> Option<ServiceFault> {
        let mut scripted = self.state.scripted.lock().unwrap();
        for entry in scripted.iter_mut() {
            if entry.remaining == 0 {
                continue;
            }
            if entry.request_name != request.name() {
                continue;
            }
            if let Some(entity) = &entry.entity {
                if request.entity() != Some(entity.as_str()) {
                    continue;
                }
            }
            if entry.skip > 0 {
                entry.skip -= 1;
                continue;
            }
            entry.remaining -= 1;
            debug!(request = entry.request_name, "Scripted fault fired");
            return Some(entry.fault.clone());
        }
        None
    }

    fn dispatch(&self, request: DataverseRequest) -> Result<DataverseResponse, ClientError> {
        match request {
            DataverseRequest::CreateMultiple {
                entity, records, ..
            } => {
                let ids = records.iter().map(|r| r.id).collect();
                let mut store = self.state.records.lock().unwrap();
                let table = store.entry(entity).or_default();
                for record in records {
                    if table.contains_key(&record.id) {
                        return Err(ClientError::Fault(ServiceFault::new(
                            ERROR_DUPLICATE_KEY,
                            "Cannot insert duplicate key",
                        )));
                    }
                    table.insert(record.id, record);
                }
                Ok(DataverseResponse::CreatedMultiple { ids })
            }
            DataverseRequest::UpdateMultiple {
                entity, records, ..
            } => {
                let mut store = self.state.records.lock().unwrap();
                let table = store.entry(entity).or_default();
                let mut count = 0;
                for record in records {
                    if let Some(existing) = table.get_mut(&record.id) {
                        for attr in record.attributes {
                            existing.set(&attr.name, attr.value);
                        }
                        count += 1;
                    }
                }
                Ok(DataverseResponse::UpdatedMultiple { count })
            }
            DataverseRequest::UpsertMultiple {
                entity, records, ..
            } => {
                let mut store = self.state.records.lock().unwrap();
                let table = store.entry(entity).or_default();
                let mut created = 0;
                let mut updated = 0;
                for record in records {
                    match table.get_mut(&record.id) {
                        Some(existing) => {
                            for attr in record.attributes {
                                existing.set(&attr.name, attr.value);
                            }
                            updated += 1;
                        }
                        None => {
                            table.insert(record.id, record);
                            created += 1;
                        }
                    }
                }
                Ok(DataverseResponse::UpsertedMultiple { created, updated })
            }
            DataverseRequest::DeleteMultiple { entity, ids, .. } => {
                let mut store = self.state.records.lock().unwrap();
                let table = store.entry(entity).or_default();
                let mut count = 0;
                for id in ids {
                    if table.remove(&id).is_some() {
                        count += 1;
                    }
                }
                Ok(DataverseResponse::DeletedMultiple { count })
            }
            DataverseRequest::Create { record, .. } => {
                let mut store = self.state.records.lock().unwrap();
                let table = store.entry(record.entity.clone()).or_default();
                if table.contains_key(&record.id) {
                    return Err(ClientError::Fault(ServiceFault::new(
                        ERROR_DUPLICATE_KEY,
                        "Cannot insert duplicate key",
                    )));
                }
                let id = record.id;
                table.insert(id, record);
                Ok(DataverseResponse::Created { id })
            }
            DataverseRequest::Update { record, .. } => {
                let mut store = self.state.records.lock().unwrap();
                let table = store.entry(record.entity.clone()).or_default();
                match table.get_mut(&record.id) {
                    Some(existing) => {
                        for attr in record.attributes {
                            existing.set(&attr.name, attr.value);
                        }
                        Ok(DataverseResponse::Updated)
                    }
                    None => Err(ClientError::Fault(ServiceFault::new(
                        -2147220969,
                        format!("{} Does Not Exist", record.id),
                    ))),
                }
            }
            DataverseRequest::Upsert { record, .. } => {
                let mut store = self.state.records.lock().unwrap();
                let table = store.entry(record.entity.clone()).or_default();
                match table.get_mut(&record.id) {
                    Some(existing) => {
                        for attr in record.attributes {
                            existing.set(&attr.name, attr.value);
                        }
                        Ok(DataverseResponse::Upserted { created: false })
                    }
                    None => {
                        table.insert(record.id, record);
                        Ok(DataverseResponse::Upserted { created: true })
                    }
                }
            }
            DataverseRequest::Delete { target, .. } => {
                let mut store = self.state.records.lock().unwrap();
                store.entry(target.entity).or_default().remove(&target.id);
                Ok(DataverseResponse::Deleted)
            }
            DataverseRequest::Associate {
                source,
                relationship,
                targets,
                ..
            } => {
                let mut associations = self.state.associations.lock().unwrap();
                let mut any_new = false;
                for target in &targets {
                    let key = (relationship.clone(), source.id, target.id);
                    if !associations.contains(&key) {
                        any_new = true;
                    }
                }
                if !any_new {
                    return Err(ClientError::Fault(ServiceFault::new(
                        ERROR_DUPLICATE_KEY,
                        "Cannot insert duplicate key. The duplicate key value is already associated",
                    )));
                }
                for target in targets {
                    associations.insert((relationship.clone(), source.id, target.id));
                }
                Ok(DataverseResponse::Associated)
            }
            DataverseRequest::Retrieve { entity, id, .. } => {
                let store = self.state.records.lock().unwrap();
                let record = store.get(&entity).and_then(|t| t.get(&id)).cloned();
                Ok(DataverseResponse::Record(record))
            }
            DataverseRequest::RetrieveAttributeMetadata { entity } => {
                let metadata = self.state.metadata.lock().unwrap();
                Ok(DataverseResponse::AttributeMetadata(
                    metadata.get(&entity).cloned().unwrap_or_default(),
                ))
            }
            DataverseRequest::RetrieveManyToManyRelationships => Ok(
                DataverseResponse::ManyToManyRelationships(
                    self.state.relationships.lock().unwrap().clone(),
                ),
            ),
            DataverseRequest::QueryPluginSteps { .. } => {
                let steps = self.state.plugin_steps.lock().unwrap();
                Ok(DataverseResponse::PluginSteps(steps.keys().copied().collect()))
            }
            DataverseRequest::SetPluginStepState { step_id, enabled } => {
                self.state
                    .plugin_steps
                    .lock()
                    .unwrap()
                    .insert(step_id, enabled);
                self.state.plugin_log.lock().unwrap().push((step_id, enabled));
                Ok(DataverseResponse::Ack)
            }
        }
    }
}
