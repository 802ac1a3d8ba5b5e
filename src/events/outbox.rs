//! Transactional outbox: events are written in the same transaction as the
//! state change they describe, then drained to the broker by a polling
//! dispatcher. Several dispatchers may run at once; the skip-locked claim
//! keeps them from double-delivering.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, Statement, TransactionTrait,
};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::entities::outbox_event::{self, Entity as OutboxEventEntity, OutboxStatus};
use crate::errors::ServiceError;
use crate::events::DomainEvent;
use crate::message_queue::{Message, MessageQueue};

/// Enqueue a domain event. Must be called with the same transaction handle
/// as the business write it describes; the row becomes visible to the
/// dispatcher only when that transaction commits.
pub async fn enqueue(
    conn: &impl ConnectionTrait,
    event: &DomainEvent,
) -> Result<i64, ServiceError> {
    let now = chrono::Utc::now();
    let row = outbox_event::ActiveModel {
        event_type: Set(event.event_type().to_string()),
        payload: Set(event.payload()),
        status: Set(OutboxStatus::Pending),
        retry_count: Set(0),
        error: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };

    let inserted = row.insert(conn).await.map_err(ServiceError::db_error)?;
    debug!(
        outbox_id = inserted.id,
        event_type = event.event_type(),
        "enqueued outbox event"
    );
    Ok(inserted.id)
}

/// Polls the outbox and publishes pending rows to the broker.
///
/// Per tick: claim up to `batch_size` PENDING rows (oldest first) under a
/// skip-locked read, publish each, mark it SENT or FAILED, commit. FAILED
/// rows stay put until an operator re-queues them.
pub struct OutboxDispatcher {
    db: Arc<DatabaseConnection>,
    queue: Arc<dyn MessageQueue>,
    batch_size: u64,
    poll_interval: Duration,
}

impl OutboxDispatcher {
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn MessageQueue>,
        batch_size: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            db,
            queue,
            batch_size,
            poll_interval,
        }
    }

    /// Runs until the shutdown channel flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "outbox dispatcher started"
        );

        loop {
            if let Err(e) = self.drain_once().await {
                error!(error = %e, "outbox dispatcher tick failed");
            }

            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("outbox dispatcher stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One dispatcher tick. Returns how many rows were claimed.
    pub async fn drain_once(&self) -> Result<usize, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let pending = self.claim_pending(&txn).await?;
        let claimed = pending.len();

        for event in pending {
            let message = Message::new(
                event.id,
                format!("{}{}", crate::events::EVENT_TOPIC_PREFIX, event.event_type),
                event.payload.clone(),
            );

            match self.queue.publish(message).await {
                Ok(()) => {
                    let mut active: outbox_event::ActiveModel = event.into();
                    active.status = Set(OutboxStatus::Sent);
                    active.error = Set(None);
                    active.update(&txn).await.map_err(ServiceError::db_error)?;
                    counter!("inventory_outbox.published", 1);
                }
                Err(e) => {
                    warn!(outbox_id = event.id, error = %e, "outbox publish failed");
                    let retry_count = event.retry_count + 1;
                    let mut active: outbox_event::ActiveModel = event.into();
                    active.status = Set(OutboxStatus::Failed);
                    active.retry_count = Set(retry_count);
                    active.error = Set(Some(e.to_string()));
                    active.update(&txn).await.map_err(ServiceError::db_error)?;
                    counter!("inventory_outbox.failed", 1);
                }
            }
        }

        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(claimed)
    }

    /// Claims up to `batch_size` PENDING rows inside `txn`. On Postgres the
    /// claim is `FOR UPDATE SKIP LOCKED` so concurrent dispatchers partition
    /// the backlog instead of blocking on it.
    async fn claim_pending(
        &self,
        txn: &impl ConnectionTrait,
    ) -> Result<Vec<outbox_event::Model>, ServiceError> {
        if txn.get_database_backend() == DbBackend::Postgres {
            let sql = r#"
                SELECT * FROM outbox_events
                WHERE status = 'PENDING'
                ORDER BY created_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            "#;
            let stmt = Statement::from_sql_and_values(
                DbBackend::Postgres,
                sql,
                vec![(self.batch_size as i64).into()],
            );
            OutboxEventEntity::find()
                .from_raw_sql(stmt)
                .all(txn)
                .await
                .map_err(ServiceError::db_error)
        } else {
            OutboxEventEntity::find()
                .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending))
                .order_by_asc(outbox_event::Column::CreatedAt)
                .order_by_asc(outbox_event::Column::Id)
                .limit(self.batch_size)
                .all(txn)
                .await
                .map_err(ServiceError::db_error)
        }
    }
}
