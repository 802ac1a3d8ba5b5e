//! Shared fixtures: an isolated in-memory database per test, plus seeding
//! and assertion helpers.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, Database, DatabaseConnection, EntityTrait,
    QueryFilter, Set,
};

use inventory_api::entities::{batch, ledger_entry, outbox_event, reservation, sku};

/// Connects to a fresh in-memory SQLite database and applies the embedded
/// migrations. One connection only: each pooled SQLite connection would
/// otherwise get its own private database.
pub async fn setup_db() -> Arc<DatabaseConnection> {
    let mut opt = ConnectOptions::new("sqlite::memory:".to_string());
    opt.max_connections(1)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(5))
        .sqlx_logging(false);

    let db = Database::connect(opt).await.expect("sqlite connect");
    inventory_api::db::run_migrations(&db)
        .await
        .expect("migrations");
    Arc::new(db)
}

pub async fn seed_sku(db: &DatabaseConnection, code: &str) -> sku::Model {
    sku::ActiveModel {
        code: Set(code.to_string()),
        name: Set(Some(format!("{code} test sku"))),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("seed sku")
}

pub async fn seed_batch(
    db: &DatabaseConnection,
    sku_id: i64,
    available: i32,
    external_batch_id: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
) -> batch::Model {
    batch::ActiveModel {
        sku_id: Set(sku_id),
        external_batch_id: Set(external_batch_id.map(str::to_string)),
        lot_number: Set(None),
        expires_at: Set(expires_at),
        total_quantity: Set(available),
        unallocatable_quantity: Set(0),
        available_quantity: Set(available),
        version: Set(1),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("seed batch")
}

pub async fn fetch_batch(db: &DatabaseConnection, id: i64) -> batch::Model {
    batch::Entity::find_by_id(id)
        .one(db)
        .await
        .expect("fetch batch")
        .expect("batch exists")
}

pub async fn reservations_for_order(
    db: &DatabaseConnection,
    order_id: &str,
) -> Vec<reservation::Model> {
    reservation::Entity::find()
        .filter(reservation::Column::OrderId.eq(order_id))
        .all(db)
        .await
        .expect("fetch reservations")
}

pub async fn ledger_for_batch(db: &DatabaseConnection, batch_id: i64) -> Vec<ledger_entry::Model> {
    ledger_entry::Entity::find()
        .filter(ledger_entry::Column::BatchId.eq(batch_id))
        .all(db)
        .await
        .expect("fetch ledger")
}

pub async fn outbox_rows(db: &DatabaseConnection) -> Vec<outbox_event::Model> {
    outbox_event::Entity::find()
        .all(db)
        .await
        .expect("fetch outbox")
}

/// Checks the ledger-sum invariant: the batch's current availability must be
/// its seeded quantity plus the signed sum of its ledger deltas.
pub async fn assert_ledger_sum(db: &DatabaseConnection, batch_id: i64, initial: i32) {
    let current = fetch_batch(db, batch_id).await.available_quantity;
    let delta_sum: i32 = ledger_for_batch(db, batch_id)
        .await
        .iter()
        .map(|entry| entry.quantity_delta)
        .sum();
    assert_eq!(
        current,
        initial + delta_sum,
        "ledger does not sum to availability for batch {batch_id}"
    );
}
