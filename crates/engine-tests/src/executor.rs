use crate::harness::{MockDataverse, ScriptedFault};
use connectors::fault::{
    BULK_API_ERROR_DETAILS_KEY, BulkApiErrorDetail, FaultDetailValue, ServiceFault,
};
use connectors::request::RequestParams;
use engine_core::coordinator::BatchCoordinator;
use engine_processing::bulk::{
    executor::{BulkExecutor, BulkExecutorConfig},
    support::BulkSupportRegistry,
};
use model::{core::value::Value, records::record::EntityRecord};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn executor_for(mock: &MockDataverse, config: BulkExecutorConfig) -> BulkExecutor {
    let pool = mock.pool();
    let coordinator = Arc::new(BatchCoordinator::new(Arc::clone(&pool)));
    BulkExecutor::new(pool, coordinator, config, Arc::new(BulkSupportRegistry::new()))
}

fn records(entity: &str, count: usize) -> Vec<EntityRecord> {
    (0..count)
        .map(|i| {
            EntityRecord::new(entity, Uuid::new_v4())
                .with_attribute("name", Value::String(format!("{entity} {i}")))
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_success_fault_decodes_into_a_mixed_result() {
    let fault = ServiceFault::new(-1, "one record was rejected").with_detail(
        BULK_API_ERROR_DETAILS_KEY,
        FaultDetailValue::ErrorDetails(vec![BulkApiErrorDetail {
            request_index: 2,
            id: None,
            status_code: 42,
        }]),
    );
    let mock = MockDataverse::new().with_scripted_fault(ScriptedFault {
        request_name: "CreateMultiple",
        entity: Some("account".to_string()),
        skip: 0,
        remaining: 1,
        fault,
    });

    let executor = executor_for(&mock, BulkExecutorConfig::default());
    let batch = records("account", 5);
    let failing_id = batch[2].id;
    let result = executor
        .create_multiple("account", batch, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.success_count, 4);
    assert_eq!(result.failure_count, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].batch_index, Some(2));
    assert_eq!(result.errors[0].record_id, Some(failing_id));
    assert_eq!(result.errors[0].code, Some(42));
    assert_eq!(result.created_ids.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bulk_not_supported_is_cached_for_the_rest_of_the_run() {
    let mock = MockDataverse::new().with_scripted_fault(ScriptedFault {
        request_name: "CreateMultiple",
        entity: Some("team".to_string()),
        skip: 0,
        remaining: usize::MAX,
        fault: ServiceFault::new(-1, "CreateMultiple is not enabled on the entity team"),
    });

    let executor = executor_for(&mock, BulkExecutorConfig::default());
    let cancel = CancellationToken::new();

    let first = executor
        .create_multiple("team", records("team", 3), &cancel)
        .await
        .unwrap();
    assert_eq!(first.success_count, 3);

    // Second operation against the same entity goes straight to singles.
    let second = executor
        .create_multiple("team", records("team", 2), &cancel)
        .await
        .unwrap();
    assert_eq!(second.success_count, 2);

    assert_eq!(mock.requests_for_entity("CreateMultiple", "team"), 1);
    assert_eq!(mock.requests_for_entity("Create", "team"), 5);
    assert_eq!(mock.record_count("team"), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn whole_batch_fault_becomes_per_record_failures() {
    let mock = MockDataverse::new().with_scripted_fault(ScriptedFault {
        request_name: "UpdateMultiple",
        entity: Some("account".to_string()),
        skip: 0,
        remaining: 1,
        fault: ServiceFault::new(-2147220891, "Generic SQL error in the write path"),
    });

    let executor = executor_for(&mock, BulkExecutorConfig::default());
    let result = executor
        .update_multiple("account", records("account", 3), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.success_count, 0);
    assert_eq!(result.failure_count, 3);
    assert_eq!(result.errors.len(), 3);
    for (index, error) in result.errors.iter().enumerate() {
        assert_eq!(error.batch_index, Some(index));
        assert_eq!(error.code, Some(-2147220891));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn self_reference_post_mortem_enriches_failure_rows() {
    let id = Uuid::new_v4();
    let record = EntityRecord::new("account", id).with_attribute(
        "parentaccountid",
        Value::Reference(model::core::reference::EntityReference::new("account", id)),
    );

    let fault = ServiceFault::new(
        -2147220969,
        format!("account With Ids = {id} Do Not Exist"),
    );
    let mock = MockDataverse::new().with_scripted_fault(ScriptedFault {
        request_name: "CreateMultiple",
        entity: Some("account".to_string()),
        skip: 0,
        remaining: 1,
        fault,
    });

    let executor = executor_for(&mock, BulkExecutorConfig::default());
    let result = executor
        .create_multiple("account", vec![record], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.failure_count, 1);
    assert!(
        result.errors[0].message.contains("self-referencing"),
        "post-mortem suggestion missing: {}",
        result.errors[0].message
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_multiple_removes_seeded_records() {
    let seeded = records("account", 4);
    let ids: Vec<Uuid> = seeded.iter().map(|r| r.id).collect();
    let mut mock = MockDataverse::new();
    for record in seeded {
        mock = mock.with_existing_record(record);
    }

    let executor = executor_for(&mock, BulkExecutorConfig::default());
    let result = executor
        .delete_multiple("account", ids, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.success_count, 4);
    assert_eq!(mock.record_count("account"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_token_yields_an_empty_result() {
    let mock = MockDataverse::new();
    let executor = executor_for(&mock, BulkExecutorConfig::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = executor
        .create_multiple("account", records("account", 10), &cancel)
        .await
        .unwrap();

    assert_eq!(result.success_count, 0);
    assert_eq!(result.failure_count, 0);
    assert_eq!(mock.record_count("account"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_bulk_apis_always_use_singles() {
    let mock = MockDataverse::new();
    let executor = executor_for(
        &mock,
        BulkExecutorConfig {
            use_bulk_apis: false,
            ..Default::default()
        },
    );

    let result = executor
        .upsert_multiple("account", records("account", 3), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.success_count, 3);
    assert_eq!(result.created_count, 3);
    assert_eq!(mock.requests_named("UpsertMultiple"), 0);
    assert_eq!(mock.requests_for_entity("Upsert", "account"), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_params_flow_through_to_the_wire() {
    let params = RequestParams {
        suppress_duplicate_detection: true,
        tag: Some("nightly-migration".to_string()),
        ..Default::default()
    };
    let bag = params.to_parameter_bag();
    assert_eq!(bag[0].0, "SuppressDuplicateDetection");
    assert_eq!(bag[1].0, "tag");
}
