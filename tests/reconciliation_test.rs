//! Reconciliation engine: WMS snapshots become compensating adjustments,
//! audit rows, and sync-request state transitions.

mod common;

use std::sync::Arc;

use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};

use inventory_api::entities::ledger_entry::{LedgerEntryType, LedgerSource};
use inventory_api::entities::sync_request::{self, SyncRequestStatus};
use inventory_api::entities::sync_state;
use inventory_api::entities::wms_snapshot;
use inventory_api::events::{ForceWmsSync, FORCE_SYNC_TOPIC};
use inventory_api::message_queue::{InMemoryMessageQueue, Message};
use inventory_api::services::reconciliation::ReconciliationWorker;
use inventory_api::wms::MockWmsClient;

use common::*;

async fn seed_sync_request(db: &DatabaseConnection, batch_id: Option<i64>) -> sync_request::Model {
    sync_request::ActiveModel {
        requested_by: Set("test".to_string()),
        reason: Set("drift suspected".to_string()),
        batch_id: Set(batch_id),
        priority: Set(0),
        status: Set(SyncRequestStatus::Pending),
        completed_at: Set(None),
        error: Set(None),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("seed sync request")
}

fn force_sync_message(request: &sync_request::Model) -> Message {
    let command = ForceWmsSync {
        sync_request_id: request.id,
        batch_id: request.batch_id,
    };
    Message::new(
        request.id,
        FORCE_SYNC_TOPIC,
        serde_json::to_value(command).unwrap(),
    )
}

fn worker(db: &Arc<DatabaseConnection>, wms: Arc<MockWmsClient>) -> ReconciliationWorker {
    ReconciliationWorker::new(db.clone(), Arc::new(InMemoryMessageQueue::new()), wms, 5)
}

async fn fetch_request(db: &DatabaseConnection, id: i64) -> sync_request::Model {
    sync_request::Entity::find_by_id(id)
        .one(db)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn scoped_sync_adjusts_batch_down_to_reported_quantity() {
    let db = setup_db().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let batch = seed_batch(&db, sku.id, 90, Some("WMS-1"), None).await;

    let wms = Arc::new(MockWmsClient::new());
    wms.set_snapshot("WMS-1", 85, None);

    let worker = worker(&db, wms);
    let request = seed_sync_request(&db, Some(batch.id)).await;
    worker.handle_message(force_sync_message(&request)).await.unwrap();

    // Availability now matches the warehouse.
    assert_eq!(fetch_batch(&db, batch.id).await.available_quantity, 85);

    let ledger = ledger_for_batch(&db, batch.id).await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].entry_type, LedgerEntryType::Adjustment);
    assert_eq!(ledger[0].quantity_delta, -5);
    assert_eq!(ledger[0].source, LedgerSource::WmsSync);
    assert_eq!(ledger[0].reference_id.as_deref(), Some("WMS-1"));
    assert_eq!(ledger[0].metadata.as_ref().unwrap()["previous"], 90);
    assert_eq!(ledger[0].metadata.as_ref().unwrap()["new"], 85);

    let outbox = outbox_rows(&db).await;
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].event_type, "InventoryAdjusted");
    assert_eq!(outbox[0].payload["quantityDelta"], -5);
    assert_eq!(outbox[0].payload["newAvailable"], 85);
    assert_eq!(outbox[0].payload["source"], "WMS_SYNC");

    let snapshots = wms_snapshot::Entity::find().all(&*db).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].batch_id, Some(batch.id));
    assert_eq!(snapshots[0].reported_orderable, 85);

    let request = fetch_request(&db, request.id).await;
    assert_eq!(request.status, SyncRequestStatus::Done);
    assert!(request.completed_at.is_some());
    assert!(request.error.is_none());

    assert_ledger_sum(&db, batch.id, 90).await;
}

#[tokio::test]
async fn matching_quantities_record_only_the_snapshot() {
    let db = setup_db().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let batch = seed_batch(&db, sku.id, 90, Some("WMS-1"), None).await;

    let wms = Arc::new(MockWmsClient::new());
    wms.set_snapshot("WMS-1", 90, None);

    let worker = worker(&db, wms);
    let request = seed_sync_request(&db, Some(batch.id)).await;
    worker.handle_message(force_sync_message(&request)).await.unwrap();

    assert_eq!(fetch_batch(&db, batch.id).await.available_quantity, 90);
    assert!(ledger_for_batch(&db, batch.id).await.is_empty());
    assert!(outbox_rows(&db).await.is_empty());
    assert_eq!(
        wms_snapshot::Entity::find().all(&*db).await.unwrap().len(),
        1
    );
    assert_eq!(
        fetch_request(&db, request.id).await.status,
        SyncRequestStatus::Done
    );
}

#[tokio::test]
async fn unmatched_wms_batch_is_audited_but_not_applied() {
    let db = setup_db().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let batch = seed_batch(&db, sku.id, 50, Some("WMS-KNOWN"), None).await;

    let wms = Arc::new(MockWmsClient::new());
    wms.set_snapshot("WMS-UNKNOWN", 10, None);

    let worker = worker(&db, wms);
    let request = seed_sync_request(&db, None).await;
    worker.handle_message(force_sync_message(&request)).await.unwrap();

    let snapshots = wms_snapshot::Entity::find().all(&*db).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].batch_id, None);

    // Local quantities untouched; an unscoped run stamps the sync state.
    assert_eq!(fetch_batch(&db, batch.id).await.available_quantity, 50);
    assert!(outbox_rows(&db).await.is_empty());

    let state = sync_state::Entity::find_by_id(sync_state::SINGLETON_ID)
        .one(&*db)
        .await
        .unwrap()
        .expect("sync state row");
    assert!(state.last_full_sync_at.is_some());
}

#[tokio::test]
async fn wms_reporting_more_than_total_raises_both() {
    let db = setup_db().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let batch = seed_batch(&db, sku.id, 20, Some("WMS-1"), None).await;

    let wms = Arc::new(MockWmsClient::new());
    wms.set_snapshot("WMS-1", 35, None);

    let worker = worker(&db, wms);
    let request = seed_sync_request(&db, Some(batch.id)).await;
    worker.handle_message(force_sync_message(&request)).await.unwrap();

    let after = fetch_batch(&db, batch.id).await;
    assert_eq!(after.available_quantity, 35);
    assert_eq!(after.total_quantity, 35);
    assert_ledger_sum(&db, batch.id, 20).await;
}

#[tokio::test]
async fn scoped_sync_for_missing_batch_fails_the_request() {
    let db = setup_db().await;
    seed_sku(&db, "SKU-1").await;

    let worker = worker(&db, Arc::new(MockWmsClient::new()));
    let request = seed_sync_request(&db, Some(999)).await;
    worker.handle_message(force_sync_message(&request)).await.unwrap();

    let request = fetch_request(&db, request.id).await;
    assert_eq!(request.status, SyncRequestStatus::Failed);
    assert!(request.completed_at.is_some());
    assert!(request.error.is_some());
}

#[tokio::test]
async fn redelivered_command_for_a_done_request_is_a_no_op() {
    let db = setup_db().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let batch = seed_batch(&db, sku.id, 90, Some("WMS-1"), None).await;

    let wms = Arc::new(MockWmsClient::new());
    wms.set_snapshot("WMS-1", 85, None);

    let worker = worker(&db, wms.clone());
    let request = seed_sync_request(&db, Some(batch.id)).await;
    worker.handle_message(force_sync_message(&request)).await.unwrap();

    // Same command again, as an at-least-once broker may deliver it.
    wms.set_snapshot("WMS-1", 80, None);
    worker.handle_message(force_sync_message(&request)).await.unwrap();

    // The DONE request did not run again.
    assert_eq!(fetch_batch(&db, batch.id).await.available_quantity, 85);
    assert_eq!(ledger_for_batch(&db, batch.id).await.len(), 1);
}
