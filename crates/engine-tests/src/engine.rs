use crate::harness::{MockDataverse, ScriptedFault};
use connectors::fault::{
    FaultDetailValue, RETRY_AFTER_KEY, SERVICE_PROTECTION_CODES, ServiceFault,
};
use engine_runtime::{error::MigrationError, import::TieredImporter};
use model::{
    archive::{Archive, AssociationBlock},
    core::{reference::EntityReference, value::Value},
    execution::options::{ImportMode, ImportOptions},
    records::record::EntityRecord,
    schema::{EntitySchema, SchemaDescription},
};
use planner::plan::ImportPlan;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;
use uuid::Uuid;

fn importer(mock: &MockDataverse, options: ImportOptions) -> TieredImporter {
    TieredImporter::new(mock.pool(), options)
}

fn archive_with(schema: SchemaDescription) -> Archive {
    Archive {
        schema,
        ..Default::default()
    }
}

fn account_contact_schema() -> SchemaDescription {
    SchemaDescription {
        entities: vec![
            EntitySchema::new("account").with_lookup("parentaccountid", "account"),
            EntitySchema::new("contact").with_lookup("parentcustomerid", "account"),
        ],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_entity_cycle_defers_and_backfills() {
    let a1 = Uuid::new_v4();
    let a2 = Uuid::new_v4();
    let c1 = Uuid::new_v4();

    let mut archive = archive_with(account_contact_schema());
    archive.entity_data.insert(
        "account".to_string(),
        vec![
            EntityRecord::new("account", a1).with_attribute(
                "parentaccountid",
                Value::Reference(EntityReference::new("account", a2)),
            ),
            EntityRecord::new("account", a2).with_attribute(
                "parentaccountid",
                Value::Reference(EntityReference::new("account", a1)),
            ),
        ],
    );
    archive.entity_data.insert(
        "contact".to_string(),
        vec![EntityRecord::new("contact", c1).with_attribute(
            "parentcustomerid",
            Value::Reference(EntityReference::new("account", a1)),
        )],
    );

    let plan = ImportPlan::build(&archive.schema);
    assert_eq!(plan.tiers.len(), 2);
    assert_eq!(plan.tiers[0].entities, vec!["account"]);
    assert_eq!(plan.tiers[1].entities, vec!["contact"]);
    assert!(plan.is_deferred("account", "parentaccountid"));

    let mock = MockDataverse::new();
    let result = importer(&mock, ImportOptions::default())
        .import(&archive, &plan, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.records_imported, 3);
    assert_eq!(result.records_updated, 2);
    assert_eq!(result.tiers_processed, 2);

    // Cyclic lookups land in the second pass with the original identifiers.
    assert_eq!(
        mock.attribute("account", a1, "parentaccountid").unwrap().as_uuid(),
        Some(a2)
    );
    assert_eq!(
        mock.attribute("account", a2, "parentaccountid").unwrap().as_uuid(),
        Some(a1)
    );
    assert_eq!(
        mock.attribute("contact", c1, "parentcustomerid").unwrap().as_uuid(),
        Some(a1)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn throttle_recovery_finishes_all_batches() {
    let schema = SchemaDescription {
        entities: vec![EntitySchema::new("account").with_attribute("name")],
    };
    let mut archive = archive_with(schema);
    archive.entity_data.insert(
        "account".to_string(),
        (0..1000)
            .map(|i| {
                EntityRecord::new("account", Uuid::new_v4())
                    .with_attribute("name", Value::String(format!("Account {i}")))
            })
            .collect(),
    );

    let throttle = ServiceFault::new(SERVICE_PROTECTION_CODES[0], "Number of requests exceeded")
        .with_detail(
            RETRY_AFTER_KEY,
            FaultDetailValue::Interval(Duration::from_secs(2)),
        );
    let mock = MockDataverse::new().with_parallelism(8).with_scripted_fault(ScriptedFault {
        request_name: "CreateMultiple",
        entity: Some("account".to_string()),
        skip: 2,
        remaining: 1,
        fault: throttle,
    });

    let options = ImportOptions {
        mode: ImportMode::Create,
        ..Default::default()
    };
    let plan = ImportPlan::build(&archive.schema);
    let started = Instant::now();
    let result = importer(&mock, options)
        .import(&archive, &plan, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.records_imported, 1000);
    assert_eq!(mock.record_count("account"), 1000);
    // The throttled batch waited out the full retry-after window.
    assert!(started.elapsed() >= Duration::from_secs(2));
    // Ten batches plus the one throttled retry.
    assert_eq!(mock.requests_for_entity("CreateMultiple", "account"), 11);
}

#[traced_test]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bulk_not_supported_downgrades_to_per_record() {
    let schema = SchemaDescription {
        entities: vec![EntitySchema::new("team").with_attribute("name")],
    };
    let mut archive = archive_with(schema);
    archive.entity_data.insert(
        "team".to_string(),
        (0..3)
            .map(|i| {
                EntityRecord::new("team", Uuid::new_v4())
                    .with_attribute("name", Value::String(format!("Team {i}")))
            })
            .collect(),
    );

    let mock = MockDataverse::new().with_scripted_fault(ScriptedFault {
        request_name: "CreateMultiple",
        entity: Some("team".to_string()),
        skip: 0,
        remaining: 1,
        fault: ServiceFault::new(-1, "CreateMultiple is not enabled on the entity team"),
    });

    let options = ImportOptions {
        mode: ImportMode::Create,
        ..Default::default()
    };
    let plan = ImportPlan::build(&archive.schema);
    let result = importer(&mock, options)
        .import(&archive, &plan, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(mock.record_count("team"), 3);
    assert_eq!(mock.requests_for_entity("CreateMultiple", "team"), 1);
    assert_eq!(mock.requests_for_entity("Create", "team"), 3);
    assert!(logs_contain(
        "Bulk operations not supported, switching to per-record execution"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn schema_mismatch_fails_fast_unless_skipped() {
    let schema = SchemaDescription {
        entities: vec![EntitySchema::new("account").with_attribute("name")],
    };
    let id = Uuid::new_v4();
    let mut archive = archive_with(schema);
    archive.entity_data.insert(
        "account".to_string(),
        vec![
            EntityRecord::new("account", id)
                .with_attribute("name", Value::from("Contoso"))
                .with_attribute("customfield_x", Value::from("dropped")),
        ],
    );
    let plan = ImportPlan::build(&archive.schema);
    let target_fields = [("accountid", true, true), ("name", true, true)];

    // Strict: fail before any write.
    let mock = MockDataverse::new().with_metadata("account", &target_fields);
    let err = importer(&mock, ImportOptions::default())
        .import(&archive, &plan, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        MigrationError::SchemaMismatch { missing } => {
            assert_eq!(missing["account"], vec!["customfield_x".to_string()]);
        }
        other => panic!("expected SchemaMismatch, got {other:?}"),
    }
    assert_eq!(mock.record_count("account"), 0);
    assert_eq!(mock.requests_named("UpsertMultiple"), 0);

    // Lenient: import proceeds with the column dropped.
    let mock = MockDataverse::new().with_metadata("account", &target_fields);
    let options = ImportOptions {
        skip_missing_columns: true,
        ..Default::default()
    };
    let result = importer(&mock, options)
        .import(&archive, &plan, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(mock.record_count("account"), 1);
    assert_eq!(
        mock.attribute("account", id, "name"),
        Some(Value::from("Contoso"))
    );
    assert_eq!(mock.attribute("account", id, "customfield_x"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_association_counts_as_success() {
    let t1 = Uuid::new_v4();
    let r1 = Uuid::new_v4();

    let schema = SchemaDescription {
        entities: vec![EntitySchema::new("team").with_attribute("name")],
    };
    let mut archive = archive_with(schema);
    archive.entity_data.insert(
        "team".to_string(),
        vec![EntityRecord::new("team", t1).with_attribute("name", Value::from("Sales"))],
    );
    archive.relationship_data.insert(
        "team".to_string(),
        vec![AssociationBlock {
            source_id: t1,
            relationship: "teamroles_association".to_string(),
            target_entity: "role".to_string(),
            target_ids: vec![r1],
        }],
    );

    let mock = MockDataverse::new()
        .with_relationship("teamroles_association", "teamroles", "team", "role")
        .with_existing_record(EntityRecord::new("role", r1))
        .with_existing_association("teamroles_association", t1, r1);

    let plan = ImportPlan::build(&archive.schema);
    let result = importer(&mock, ImportOptions::default())
        .import(&archive, &plan, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.relationships_processed, 1);
    assert!(result.errors.is_empty());
    assert!(mock.has_association("teamroles_association", t1, r1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_mid_tier_stops_batches_and_restores_plugins() {
    let step = Uuid::new_v4();
    let mut entity = EntitySchema::new("account").with_attribute("name");
    entity.disable_plugins = true;
    entity.object_type_code = Some(1);
    let schema = SchemaDescription {
        entities: vec![entity],
    };
    let mut archive = archive_with(schema);
    archive.entity_data.insert(
        "account".to_string(),
        (0..1000)
            .map(|i| {
                EntityRecord::new("account", Uuid::new_v4())
                    .with_attribute("name", Value::String(format!("Account {i}")))
            })
            .collect(),
    );

    let mock = MockDataverse::new()
        .with_parallelism(2)
        .with_latency(Duration::from_millis(100))
        .with_plugin_step(step);

    let options = ImportOptions {
        mode: ImportMode::Create,
        ..Default::default()
    };
    let plan = ImportPlan::build(&archive.schema);
    let cancel = CancellationToken::new();

    // Metadata plus the plugin bracket take ~300 ms at this latency, the
    // tier pass another ~500 ms; cancel lands inside the tier pass.
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            cancel.cancel();
        })
    };

    let result = importer(&mock, options)
        .import(&archive, &plan, &cancel)
        .await
        .unwrap();
    canceller.await.unwrap();

    assert!(!result.success);
    assert!(
        mock.record_count("account") < 1000,
        "cancellation should leave batches unstarted"
    );
    assert_eq!(result.relationships_processed, 0);

    // The cleanup pass ran with its own token.
    assert!(mock.plugin_step_enabled(step));
    assert_eq!(mock.plugin_transitions(step), vec![false, true]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn import_from_reads_the_archive_through_the_reader() {
    struct FixedReader(Archive);

    #[async_trait::async_trait]
    impl engine_runtime::archive::ArchiveReader for FixedReader {
        async fn read(&self, _path: &std::path::Path) -> Result<Archive, MigrationError> {
            Ok(self.0.clone())
        }
    }

    let id = Uuid::new_v4();
    let schema = SchemaDescription {
        entities: vec![EntitySchema::new("account").with_attribute("name")],
    };
    let mut archive = archive_with(schema);
    archive.entity_data.insert(
        "account".to_string(),
        vec![EntityRecord::new("account", id).with_attribute("name", Value::from("Contoso"))],
    );

    let mock = MockDataverse::new();
    let result = importer(&mock, ImportOptions::default())
        .import_from(
            &FixedReader(archive),
            std::path::Path::new("export/archive.zip"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(mock.record_count("account"), 1);
    assert_eq!(mock.attribute("account", id, "name"), Some(Value::from("Contoso")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upsert_import_is_idempotent() {
    let a1 = Uuid::new_v4();
    let a2 = Uuid::new_v4();
    let c1 = Uuid::new_v4();

    let mut archive = archive_with(account_contact_schema());
    archive.entity_data.insert(
        "account".to_string(),
        vec![
            EntityRecord::new("account", a1)
                .with_attribute("name", Value::from("First"))
                .with_attribute(
                    "parentaccountid",
                    Value::Reference(EntityReference::new("account", a2)),
                ),
            EntityRecord::new("account", a2).with_attribute("name", Value::from("Second")),
        ],
    );
    archive.entity_data.insert(
        "contact".to_string(),
        vec![EntityRecord::new("contact", c1).with_attribute(
            "parentcustomerid",
            Value::Reference(EntityReference::new("account", a1)),
        )],
    );

    let mock = MockDataverse::new();
    let plan = ImportPlan::build(&archive.schema);

    for run in 0..2 {
        let result = importer(&mock, ImportOptions::default())
            .import(&archive, &plan, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success, "run {run} errors: {:?}", result.errors);
        // Deterministic ids: the same source records, the same target rows.
        assert_eq!(mock.record_count("account"), 2);
        assert_eq!(mock.record_count("contact"), 1);
    }

    assert_eq!(
        mock.attribute("account", a1, "parentaccountid").unwrap().as_uuid(),
        Some(a2)
    );
}
