//! Outbox dispatcher behavior: committed rows reach the broker exactly
//! once, failures are parked, and the operator re-queue path works.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};

use inventory_api::entities::outbox_event::{self, OutboxStatus};
use inventory_api::events::outbox::OutboxDispatcher;
use inventory_api::message_queue::{
    InMemoryMessageQueue, Message, MessageQueue, MessageQueueError,
};
use inventory_api::services::inventory::{InventoryService, ReserveLine};

use common::*;

/// A broker that refuses every publish, for exercising the FAILED path.
struct BrokenQueue;

#[async_trait]
impl MessageQueue for BrokenQueue {
    async fn publish(&self, _message: Message) -> Result<(), MessageQueueError> {
        Err(MessageQueueError::ConnectionError("broker down".into()))
    }

    async fn subscribe(&self, _topic: &str) -> Result<Option<Message>, MessageQueueError> {
        Ok(None)
    }

    async fn ack(&self, _message_id: i64) -> Result<(), MessageQueueError> {
        Ok(())
    }

    async fn nack(&self, _message_id: i64) -> Result<(), MessageQueueError> {
        Ok(())
    }
}

#[tokio::test]
async fn drain_publishes_pending_rows_and_marks_them_sent() {
    let db = setup_db().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let batch = seed_batch(&db, sku.id, 100, None, None).await;
    let service = InventoryService::new(db.clone());

    service
        .reserve(
            "ord-1",
            &[ReserveLine {
                batch_id: batch.id,
                quantity: 10,
            }],
        )
        .await
        .unwrap();

    let queue = Arc::new(InMemoryMessageQueue::new());
    let dispatcher = OutboxDispatcher::new(
        db.clone(),
        queue.clone(),
        100,
        Duration::from_millis(200),
    );

    let claimed = dispatcher.drain_once().await.unwrap();
    assert_eq!(claimed, 1);

    let message = queue
        .subscribe("inventory.InventoryAllocated")
        .await
        .unwrap()
        .expect("event published");
    assert_eq!(message.payload["orderId"], "ord-1");
    assert_eq!(message.payload["batchId"], batch.id);

    let rows = outbox_rows(&db).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, OutboxStatus::Sent);
    // The broker message id is the outbox row id.
    assert_eq!(message.id, rows[0].id);

    // A second tick finds nothing: SENT is terminal.
    assert_eq!(dispatcher.drain_once().await.unwrap(), 0);
    assert!(queue
        .subscribe("inventory.InventoryAllocated")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn drain_respects_batch_size_and_creation_order() {
    let db = setup_db().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let batch = seed_batch(&db, sku.id, 100, None, None).await;
    let service = InventoryService::new(db.clone());

    for i in 0..5 {
        service
            .reserve(
                &format!("ord-{i}"),
                &[ReserveLine {
                    batch_id: batch.id,
                    quantity: 1,
                }],
            )
            .await
            .unwrap();
    }

    let queue = Arc::new(InMemoryMessageQueue::new());
    let dispatcher =
        OutboxDispatcher::new(db.clone(), queue.clone(), 2, Duration::from_millis(200));

    assert_eq!(dispatcher.drain_once().await.unwrap(), 2);
    assert_eq!(dispatcher.drain_once().await.unwrap(), 2);
    assert_eq!(dispatcher.drain_once().await.unwrap(), 1);

    // Oldest rows went out first.
    let mut order_ids = Vec::new();
    while let Some(message) = queue
        .subscribe("inventory.InventoryAllocated")
        .await
        .unwrap()
    {
        order_ids.push(message.payload["orderId"].as_str().unwrap().to_string());
    }
    assert_eq!(order_ids, vec!["ord-0", "ord-1", "ord-2", "ord-3", "ord-4"]);
}

#[tokio::test]
async fn publish_failure_parks_the_row_as_failed() {
    let db = setup_db().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let batch = seed_batch(&db, sku.id, 100, None, None).await;
    let service = InventoryService::new(db.clone());

    service
        .reserve(
            "ord-1",
            &[ReserveLine {
                batch_id: batch.id,
                quantity: 10,
            }],
        )
        .await
        .unwrap();

    let dispatcher = OutboxDispatcher::new(
        db.clone(),
        Arc::new(BrokenQueue),
        100,
        Duration::from_millis(200),
    );
    dispatcher.drain_once().await.unwrap();

    let rows = outbox_rows(&db).await;
    assert_eq!(rows[0].status, OutboxStatus::Failed);
    assert_eq!(rows[0].retry_count, 1);
    assert!(rows[0].error.as_deref().unwrap().contains("broker down"));

    // FAILED rows are not retried by the dispatcher.
    assert_eq!(dispatcher.drain_once().await.unwrap(), 0);
}

#[tokio::test]
async fn requeued_failed_row_is_delivered_on_the_next_tick() {
    let db = setup_db().await;
    let sku = seed_sku(&db, "SKU-1").await;
    let batch = seed_batch(&db, sku.id, 100, None, None).await;
    let service = InventoryService::new(db.clone());

    service
        .reserve(
            "ord-1",
            &[ReserveLine {
                batch_id: batch.id,
                quantity: 10,
            }],
        )
        .await
        .unwrap();

    let broken = OutboxDispatcher::new(
        db.clone(),
        Arc::new(BrokenQueue),
        100,
        Duration::from_millis(200),
    );
    broken.drain_once().await.unwrap();

    // Operator action: flip the FAILED row back to PENDING.
    let failed = outbox_event::Entity::find()
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    let mut active: outbox_event::ActiveModel = failed.into();
    active.status = Set(OutboxStatus::Pending);
    active.error = Set(None);
    active.update(&*db).await.unwrap();

    let queue = Arc::new(InMemoryMessageQueue::new());
    let healthy =
        OutboxDispatcher::new(db.clone(), queue.clone(), 100, Duration::from_millis(200));
    assert_eq!(healthy.drain_once().await.unwrap(), 1);

    let message = queue
        .subscribe("inventory.InventoryAllocated")
        .await
        .unwrap()
        .expect("event delivered after requeue");
    assert_eq!(message.payload["orderId"], "ord-1");

    let rows = outbox_rows(&db).await;
    assert_eq!(rows[0].status, OutboxStatus::Sent);
    assert_eq!(rows[0].retry_count, 1);
}
