//! The reservation engine: reserve, release, and adjust against batch rows,
//! plus the read-only availability projection.
//!
//! Every writer locks the batch rows it touches in ascending-id order. That
//! single discipline, shared with the reconciliation engine, is what makes
//! concurrent writers deadlock-free: two transactions contending for the
//! same batches always queue on the lowest contended id first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::NullOrdering;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    Order, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::json;
use tracing::{info, instrument};

use crate::entities::batch::{self, Entity as BatchEntity};
use crate::entities::ledger_entry::{self, LedgerEntryType, LedgerSource};
use crate::entities::reservation::{self, Entity as ReservationEntity, ReservationStatus};
use crate::entities::sku::{self, Entity as SkuEntity};
use crate::errors::ServiceError;
use crate::events::{outbox, DomainEvent, InventoryAdjustment, StockMovement};

/// One requested allocation within a reserve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveLine {
    pub batch_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    /// The order already holds exactly this reservation set; nothing was
    /// written.
    AlreadyReserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(usize),
    /// Every reservation for the order was already terminal; nothing was
    /// written.
    AlreadyReleased,
}

/// Locks the given batch rows and returns them ordered by id. Callers pass
/// ids sorted ascending; the query re-sorts anyway so the lock acquisition
/// order is deterministic regardless. SQLite has no row locks (its writer
/// lock serializes transactions instead), so the hint is Postgres-only.
pub(crate) async fn lock_batches<C: ConnectionTrait>(
    conn: &C,
    ids: &[i64],
) -> Result<Vec<batch::Model>, ServiceError> {
    let mut query = BatchEntity::find()
        .filter(batch::Column::Id.is_in(ids.iter().copied()))
        .order_by_asc(batch::Column::Id);

    if conn.get_database_backend() == DbBackend::Postgres {
        query = query.lock_exclusive();
    }

    query.all(conn).await.map_err(ServiceError::db_error)
}

fn validate_lines(lines: &[ReserveLine]) -> Result<(), ServiceError> {
    if lines.is_empty() {
        return Err(ServiceError::InvalidQuantity(
            "reserve requires at least one line".into(),
        ));
    }

    let mut seen = HashSet::new();
    for line in lines {
        if line.quantity <= 0 {
            return Err(ServiceError::InvalidQuantity(format!(
                "quantity must be positive for batch {}",
                line.batch_id
            )));
        }
        if !seen.insert(line.batch_id) {
            return Err(ServiceError::InvalidQuantity(format!(
                "batch {} appears more than once",
                line.batch_id
            )));
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ProbeOutcome {
    /// No reservations exist for the order; proceed.
    Empty,
    /// The existing set matches the request exactly; succeed without writes.
    Match,
    /// The existing set conflicts with the request.
    Conflict,
}

/// Compares the requested lines against the order's existing reservations
/// as an unordered multiset keyed by batch id. A cancelled row always
/// conflicts: the caller released this order once already, and silently
/// re-reserving under the same order id would double-allocate.
fn probe_existing(lines: &[ReserveLine], existing: &[reservation::Model]) -> ProbeOutcome {
    if existing.is_empty() {
        return ProbeOutcome::Empty;
    }

    if existing
        .iter()
        .any(|r| r.status == ReservationStatus::Cancelled)
    {
        return ProbeOutcome::Conflict;
    }

    if lines.len() != existing.len() {
        return ProbeOutcome::Conflict;
    }

    let mut by_batch: HashMap<i64, i32> =
        existing.iter().map(|r| (r.batch_id, r.quantity)).collect();
    for line in lines {
        match by_batch.remove(&line.batch_id) {
            Some(quantity) if quantity == line.quantity => {}
            _ => return ProbeOutcome::Conflict,
        }
    }

    if by_batch.is_empty() {
        ProbeOutcome::Match
    } else {
        ProbeOutcome::Conflict
    }
}

/// Reserves inventory for an order. Runs inside the caller's transaction;
/// the caller's commit is what makes the reservation durable.
pub async fn reserve<C: ConnectionTrait>(
    conn: &C,
    order_id: &str,
    lines: &[ReserveLine],
) -> Result<ReserveOutcome, ServiceError> {
    // Idempotency probe, before any locks are taken.
    let existing = ReservationEntity::find()
        .filter(reservation::Column::OrderId.eq(order_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    match probe_existing(lines, &existing) {
        ProbeOutcome::Match => {
            info!(order_id = %order_id, "reserve replay matched existing reservations");
            counter!("inventory_reserve.idempotent_replay", 1);
            return Ok(ReserveOutcome::AlreadyReserved);
        }
        ProbeOutcome::Conflict => {
            counter!("inventory_reserve.conflict", 1);
            return Err(ServiceError::OrderAlreadyReserved(order_id.to_string()));
        }
        ProbeOutcome::Empty => {}
    }

    validate_lines(lines)?;

    // Deterministic lock acquisition: sorted unique batch ids.
    let mut ids: Vec<i64> = lines.iter().map(|l| l.batch_id).collect();
    ids.sort_unstable();
    ids.dedup();
    let locked = lock_batches(conn, &ids).await?;
    let mut by_id: HashMap<i64, batch::Model> = locked.into_iter().map(|b| (b.id, b)).collect();

    // Inventory check across all lines before any mutation.
    for line in lines {
        let b = by_id
            .get(&line.batch_id)
            .ok_or(ServiceError::BatchNotFound(line.batch_id))?;
        if b.available_quantity < line.quantity {
            counter!("inventory_reserve.insufficient", 1);
            return Err(ServiceError::InsufficientInventory {
                batch_id: line.batch_id,
                requested: line.quantity,
                available: b.available_quantity,
            });
        }
    }

    // Apply, in input order so the ledger reads as the caller wrote it.
    let now = Utc::now();
    for line in lines {
        let b = by_id.remove(&line.batch_id).ok_or_else(|| {
            ServiceError::InternalError(format!("batch {} vanished under lock", line.batch_id))
        })?;

        let mut active: batch::ActiveModel = b.clone().into();
        active.available_quantity = Set(b.available_quantity - line.quantity);
        active.version = Set(b.version + 1);
        active.update(conn).await.map_err(ServiceError::db_error)?;

        ledger_entry::ActiveModel {
            batch_id: Set(line.batch_id),
            entry_type: Set(LedgerEntryType::OrderAllocate),
            quantity_delta: Set(-line.quantity),
            source: Set(LedgerSource::NabisOrder),
            reference_id: Set(Some(order_id.to_string())),
            metadata: Set(None),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;

        reservation::ActiveModel {
            order_id: Set(order_id.to_string()),
            batch_id: Set(line.batch_id),
            quantity: Set(line.quantity),
            status: Set(ReservationStatus::Pending),
            expires_at: Set(None),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;

        outbox::enqueue(
            conn,
            &DomainEvent::InventoryAllocated(StockMovement {
                order_id: order_id.to_string(),
                batch_id: line.batch_id,
                quantity: line.quantity,
                reason: None,
                timestamp: now,
            }),
        )
        .await?;
    }

    counter!("inventory_reserve.succeeded", 1);
    Ok(ReserveOutcome::Reserved)
}

/// Releases every pending reservation held by an order, returning the
/// reserved quantities to their batches.
pub async fn release<C: ConnectionTrait>(
    conn: &C,
    order_id: &str,
    reason: Option<&str>,
) -> Result<ReleaseOutcome, ServiceError> {
    let mut query = ReservationEntity::find()
        .filter(reservation::Column::OrderId.eq(order_id))
        .filter(reservation::Column::Status.eq(ReservationStatus::Pending))
        .order_by_asc(reservation::Column::BatchId);
    if conn.get_database_backend() == DbBackend::Postgres {
        query = query.lock_exclusive();
    }
    let pending = query.all(conn).await.map_err(ServiceError::db_error)?;

    if pending.is_empty() {
        let any = ReservationEntity::find()
            .filter(reservation::Column::OrderId.eq(order_id))
            .limit(1)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;
        return if any.is_empty() {
            Err(ServiceError::OrderNotFound(order_id.to_string()))
        } else {
            info!(order_id = %order_id, "release replay: reservations already terminal");
            Ok(ReleaseOutcome::AlreadyReleased)
        };
    }

    // batch ids come out ascending and unique (one reservation per batch per
    // order), which is exactly the lock order we need.
    let ids: Vec<i64> = pending.iter().map(|r| r.batch_id).collect();
    let locked = lock_batches(conn, &ids).await?;
    let mut by_id: HashMap<i64, batch::Model> = locked.into_iter().map(|b| (b.id, b)).collect();

    let now = Utc::now();
    let count = pending.len();
    for r in pending {
        let b = by_id.remove(&r.batch_id).ok_or_else(|| {
            ServiceError::InternalError(format!(
                "reservation {} references missing batch {}",
                r.id, r.batch_id
            ))
        })?;

        let mut active: batch::ActiveModel = b.clone().into();
        active.available_quantity = Set(b.available_quantity + r.quantity);
        active.version = Set(b.version + 1);
        active.update(conn).await.map_err(ServiceError::db_error)?;

        ledger_entry::ActiveModel {
            batch_id: Set(r.batch_id),
            entry_type: Set(LedgerEntryType::OrderRelease),
            quantity_delta: Set(r.quantity),
            source: Set(LedgerSource::NabisOrder),
            reference_id: Set(Some(order_id.to_string())),
            metadata: Set(reason.map(|why| json!({ "reason": why }))),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;

        let quantity = r.quantity;
        let batch_id = r.batch_id;
        let mut cancelled: reservation::ActiveModel = r.into();
        cancelled.status = Set(ReservationStatus::Cancelled);
        cancelled
            .update(conn)
            .await
            .map_err(ServiceError::db_error)?;

        outbox::enqueue(
            conn,
            &DomainEvent::InventoryReleased(StockMovement {
                order_id: order_id.to_string(),
                batch_id,
                quantity,
                reason: reason.map(str::to_string),
                timestamp: now,
            }),
        )
        .await?;
    }

    counter!("inventory_release.succeeded", 1);
    Ok(ReleaseOutcome::Released(count))
}

/// Applies a signed manual adjustment to one batch's available quantity.
/// Not idempotent: every call adds its delta.
pub async fn adjust<C: ConnectionTrait>(
    conn: &C,
    batch_id: i64,
    delta: i32,
    reason: &str,
) -> Result<i32, ServiceError> {
    let locked = lock_batches(conn, &[batch_id]).await?;
    let b = locked
        .into_iter()
        .next()
        .ok_or(ServiceError::BatchNotFound(batch_id))?;

    let new_available = i64::from(b.available_quantity) + i64::from(delta);
    if new_available < 0 || new_available > i64::from(b.total_quantity) {
        return Err(ServiceError::InvalidQuantity(format!(
            "adjustment of {delta} would leave batch {batch_id} at {new_available} (total {})",
            b.total_quantity
        )));
    }
    let new_available = new_available as i32;

    let previous = b.available_quantity;
    let mut active: batch::ActiveModel = b.clone().into();
    active.available_quantity = Set(new_available);
    active.version = Set(b.version + 1);
    active.update(conn).await.map_err(ServiceError::db_error)?;

    let now = Utc::now();
    ledger_entry::ActiveModel {
        batch_id: Set(batch_id),
        entry_type: Set(LedgerEntryType::Adjustment),
        quantity_delta: Set(delta),
        source: Set(LedgerSource::ManualAdjustment),
        reference_id: Set(None),
        metadata: Set(Some(json!({
            "reason": reason,
            "previous": previous,
            "new": new_available,
        }))),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(conn)
    .await
    .map_err(ServiceError::db_error)?;

    outbox::enqueue(
        conn,
        &DomainEvent::InventoryAdjusted(InventoryAdjustment {
            batch_id,
            quantity_delta: delta,
            new_available,
            source: "MANUAL_ADJUSTMENT".to_string(),
            reason: reason.to_string(),
            timestamp: now,
        }),
    )
    .await?;

    counter!("inventory_adjust.succeeded", 1);
    Ok(new_available)
}

/// Availability projection for one SKU.
#[derive(Debug, Clone)]
pub struct SkuAvailability {
    pub sku_code: String,
    pub total_available: i64,
    pub batches: Vec<batch::Model>,
}

/// Service wrapper owning the pool. HTTP handlers go through here; each call
/// is one transaction, committed on success and rolled back on any error so
/// a failed operation leaves no state and no outbox row behind.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
}

impl InventoryService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, lines), fields(order_id = %order_id, line_count = lines.len()))]
    pub async fn reserve(
        &self,
        order_id: &str,
        lines: &[ReserveLine],
    ) -> Result<ReserveOutcome, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        match reserve(&txn, order_id, lines).await {
            Ok(outcome) => {
                txn.commit().await.map_err(ServiceError::db_error)?;
                Ok(outcome)
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn release(
        &self,
        order_id: &str,
        reason: Option<&str>,
    ) -> Result<ReleaseOutcome, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        match release(&txn, order_id, reason).await {
            Ok(outcome) => {
                txn.commit().await.map_err(ServiceError::db_error)?;
                Ok(outcome)
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn adjust(
        &self,
        batch_id: i64,
        delta: i32,
        reason: &str,
    ) -> Result<i32, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        match adjust(&txn, batch_id, delta, reason).await {
            Ok(new_available) => {
                txn.commit().await.map_err(ServiceError::db_error)?;
                Ok(new_available)
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(e)
            }
        }
    }

    /// Read-only availability by SKU code: batches ordered by expiry
    /// (soonest first, never-expiring last), then id. Takes no locks and
    /// sees the last committed snapshot.
    #[instrument(skip(self))]
    pub async fn get_available_inventory(
        &self,
        sku_code: &str,
    ) -> Result<SkuAvailability, ServiceError> {
        let mut rows = SkuEntity::find()
            .filter(sku::Column::Code.eq(sku_code))
            .find_with_related(BatchEntity)
            .order_by_with_nulls(batch::Column::ExpiresAt, Order::Asc, NullOrdering::Last)
            .order_by_asc(batch::Column::Id)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        match rows.pop() {
            Some((sku, batches)) => {
                let total_available = batches
                    .iter()
                    .map(|b| i64::from(b.available_quantity))
                    .sum();
                Ok(SkuAvailability {
                    sku_code: sku.code,
                    total_available,
                    batches,
                })
            }
            None => Ok(SkuAvailability {
                sku_code: sku_code.to_string(),
                total_available: 0,
                batches: Vec::new(),
            }),
        }
    }
}
