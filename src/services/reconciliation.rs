//! Reconciliation engine: consumes `wms.forceSync` commands, pulls an
//! authoritative snapshot from the WMS, and issues compensating adjustments
//! against local batches.
//!
//! Each snapshot entry is applied in its own transaction that locks the
//! batch row, so reconciliation serializes against Reserve/Release on the
//! same row instead of racing them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::entities::batch::{self, Entity as BatchEntity};
use crate::entities::ledger_entry::{self, LedgerEntryType, LedgerSource};
use crate::entities::sync_request::{self, Entity as SyncRequestEntity, SyncRequestStatus};
use crate::entities::sync_state::{self, Entity as SyncStateEntity, SINGLETON_ID};
use crate::entities::wms_snapshot;
use crate::errors::ServiceError;
use crate::events::{outbox, DomainEvent, ForceWmsSync, InventoryAdjustment, FORCE_SYNC_TOPIC};
use crate::message_queue::{Message, MessageQueue};
use crate::services::inventory::lock_batches;
use crate::wms::{SnapshotEntry, SnapshotScope, WmsClient};

const IDLE_PAUSE: Duration = Duration::from_millis(250);

/// Counters from one sync run, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub snapshots_recorded: usize,
    pub batches_adjusted: usize,
    pub unmatched: usize,
}

pub struct ReconciliationWorker {
    db: Arc<DatabaseConnection>,
    queue: Arc<dyn MessageQueue>,
    wms: Arc<dyn WmsClient>,
    prefetch: usize,
}

impl ReconciliationWorker {
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn MessageQueue>,
        wms: Arc<dyn WmsClient>,
        prefetch: usize,
    ) -> Self {
        Self {
            db,
            queue,
            wms,
            prefetch,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(prefetch = self.prefetch, "reconciliation worker started");

        loop {
            let mut handled = 0usize;
            for _ in 0..self.prefetch {
                match self.queue.subscribe(FORCE_SYNC_TOPIC).await {
                    Ok(Some(message)) => {
                        handled += 1;
                        let message_id = message.id;
                        if let Err(e) = self.handle_message(message).await {
                            error!(message_id, error = %e, "force-sync handling failed");
                        }
                        if let Err(e) = self.queue.ack(message_id).await {
                            warn!(message_id, error = %e, "ack failed");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "broker poll failed");
                        break;
                    }
                }
            }

            if handled == 0 {
                tokio::select! {
                    _ = sleep(IDLE_PAUSE) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("reconciliation worker stopping");
                            return;
                        }
                    }
                }
            } else if *shutdown.borrow() {
                info!("reconciliation worker stopping");
                return;
            }
        }
    }

    /// Processes one force-sync command end to end, transitioning the
    /// SyncRequest through its state machine. Failures land in the request
    /// row; the message itself is always consumed.
    #[instrument(skip(self, message), fields(message_id = message.id))]
    pub async fn handle_message(&self, message: Message) -> Result<(), ServiceError> {
        let command: ForceWmsSync = serde_json::from_value(message.payload.clone())
            .map_err(|e| ServiceError::InternalError(format!("undecodable command: {e}")))?;

        let Some(request) = SyncRequestEntity::find_by_id(command.sync_request_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
        else {
            warn!(
                sync_request_id = command.sync_request_id,
                "sync request does not exist"
            );
            return Ok(());
        };

        match request.status {
            // Redelivered after completion: nothing left to do.
            SyncRequestStatus::Done | SyncRequestStatus::Failed => return Ok(()),
            // IN_PROGRESS means a previous attempt died mid-run; the work is
            // idempotent against the WMS truth, so run it again.
            SyncRequestStatus::Pending | SyncRequestStatus::InProgress => {}
        }

        let mut active: sync_request::ActiveModel = request.clone().into();
        active.status = Set(SyncRequestStatus::InProgress);
        let request = active
            .update(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        match self.execute(&request).await {
            Ok(stats) => {
                info!(
                    sync_request_id = request.id,
                    snapshots = stats.snapshots_recorded,
                    adjusted = stats.batches_adjusted,
                    unmatched = stats.unmatched,
                    "sync completed"
                );
                let mut done: sync_request::ActiveModel = request.into();
                done.status = Set(SyncRequestStatus::Done);
                done.completed_at = Set(Some(Utc::now()));
                done.error = Set(None);
                done.update(&*self.db)
                    .await
                    .map_err(ServiceError::db_error)?;
                counter!("inventory_sync.completed", 1);
            }
            Err(e) => {
                error!(sync_request_id = request.id, error = %e, "sync failed");
                let mut failed: sync_request::ActiveModel = request.into();
                failed.status = Set(SyncRequestStatus::Failed);
                failed.completed_at = Set(Some(Utc::now()));
                failed.error = Set(Some(e.to_string()));
                failed
                    .update(&*self.db)
                    .await
                    .map_err(ServiceError::db_error)?;
                counter!("inventory_sync.failed", 1);
            }
        }

        Ok(())
    }

    async fn execute(&self, request: &sync_request::Model) -> Result<SyncStats, ServiceError> {
        let initial_scope = self.resolve_scope(request).await?;
        let batch_scoped = matches!(initial_scope, SnapshotScope::Batch(_));
        let was_full = matches!(initial_scope, SnapshotScope::Full);

        let mut stats = SyncStats::default();
        let mut scope = initial_scope;
        let mut final_token: Option<String> = None;

        loop {
            let page = self
                .wms
                .fetch_snapshots(&scope)
                .await
                .map_err(|e| ServiceError::WmsApiError(e.to_string()))?;

            for entry in &page.entries {
                self.apply_entry(entry, &mut stats).await?;
            }

            match page.next_token {
                Some(token) if !batch_scoped => {
                    final_token = Some(token.clone());
                    scope = SnapshotScope::Incremental(token);
                }
                _ => break,
            }
        }

        if !batch_scoped {
            self.update_sync_state(was_full, final_token).await?;
        }

        Ok(stats)
    }

    /// Decides what slice of the WMS to pull. A batch-scoped request uses
    /// that batch's external id; an unscoped one continues from the stored
    /// incremental token, falling back to a full scan.
    async fn resolve_scope(
        &self,
        request: &sync_request::Model,
    ) -> Result<SnapshotScope, ServiceError> {
        if let Some(batch_id) = request.batch_id {
            let batch = BatchEntity::find_by_id(batch_id)
                .one(&*self.db)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or(ServiceError::BatchNotFound(batch_id))?;

            let external = batch.external_batch_id.ok_or_else(|| {
                ServiceError::WmsApiError(format!("batch {batch_id} has no WMS mapping"))
            })?;

            return Ok(SnapshotScope::Batch(external));
        }

        let state = SyncStateEntity::find_by_id(SINGLETON_ID)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(match state.and_then(|s| s.last_incremental_token) {
            Some(token) => SnapshotScope::Incremental(token),
            None => SnapshotScope::Full,
        })
    }

    /// Applies one snapshot entry in its own transaction: audit row first,
    /// then — when the WMS batch maps to a local one — a compensating
    /// adjustment under the batch row lock.
    async fn apply_entry(
        &self,
        entry: &SnapshotEntry,
        stats: &mut SyncStats,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let matched_id = BatchEntity::find()
            .filter(batch::Column::ExternalBatchId.eq(&entry.wms_batch_id))
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .map(|b| b.id);

        wms_snapshot::ActiveModel {
            wms_batch_id: Set(entry.wms_batch_id.clone()),
            batch_id: Set(matched_id),
            reported_orderable: Set(entry.orderable),
            reported_unallocatable: Set(entry.unallocatable),
            reported_at: Set(entry.reported_at),
            raw_payload: Set(entry.raw.clone()),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;
        stats.snapshots_recorded += 1;

        let Some(batch_id) = matched_id else {
            // Unknown WMS batch: the snapshot audit is all we record.
            stats.unmatched += 1;
            txn.commit().await.map_err(ServiceError::db_error)?;
            return Ok(());
        };

        let locked = lock_batches(&txn, &[batch_id]).await?;
        let Some(b) = locked.into_iter().next() else {
            stats.unmatched += 1;
            txn.commit().await.map_err(ServiceError::db_error)?;
            return Ok(());
        };

        let delta = entry.orderable - b.available_quantity;
        if delta == 0 {
            txn.commit().await.map_err(ServiceError::db_error)?;
            return Ok(());
        }

        let previous = b.available_quantity;
        let mut active: batch::ActiveModel = b.clone().into();
        active.available_quantity = Set(entry.orderable);
        // The WMS is authoritative; if it reports more orderable than we
        // thought the batch held, the total moves up with it.
        if entry.orderable > b.total_quantity {
            active.total_quantity = Set(entry.orderable);
        }
        active.version = Set(b.version + 1);
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        let now = Utc::now();
        ledger_entry::ActiveModel {
            batch_id: Set(batch_id),
            entry_type: Set(LedgerEntryType::Adjustment),
            quantity_delta: Set(delta),
            source: Set(LedgerSource::WmsSync),
            reference_id: Set(Some(entry.wms_batch_id.clone())),
            metadata: Set(Some(json!({
                "previous": previous,
                "new": entry.orderable,
            }))),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        outbox::enqueue(
            &txn,
            &DomainEvent::InventoryAdjusted(InventoryAdjustment {
                batch_id,
                quantity_delta: delta,
                new_available: entry.orderable,
                source: "WMS_SYNC".to_string(),
                reason: "wms reconciliation".to_string(),
                timestamp: now,
            }),
        )
        .await?;

        txn.commit().await.map_err(ServiceError::db_error)?;
        stats.batches_adjusted += 1;
        counter!("inventory_sync.batch_adjusted", 1);
        Ok(())
    }

    async fn update_sync_state(
        &self,
        was_full: bool,
        token: Option<String>,
    ) -> Result<(), ServiceError> {
        let existing = SyncStateEntity::find_by_id(SINGLETON_ID)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let now = Utc::now();
        match existing {
            Some(state) => {
                let mut active: sync_state::ActiveModel = state.into();
                if was_full {
                    active.last_full_sync_at = Set(Some(now));
                }
                if token.is_some() {
                    active.last_incremental_token = Set(token);
                }
                active
                    .update(&*self.db)
                    .await
                    .map_err(ServiceError::db_error)?;
            }
            None => {
                sync_state::ActiveModel {
                    id: Set(SINGLETON_ID),
                    last_full_sync_at: Set(was_full.then_some(now)),
                    last_incremental_token: Set(token),
                }
                .insert(&*self.db)
                .await
                .map_err(ServiceError::db_error)?;
            }
        }

        Ok(())
    }
}
