//! Mirrors committed allocations and releases into the WMS. Consumes the
//! `inventory.InventoryAllocated` / `inventory.InventoryReleased` topics,
//! calls the warehouse, and leaves a zero-delta audit ledger entry so the
//! outbound call is visible in the batch history without moving quantities.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::entities::batch::Entity as BatchEntity;
use crate::entities::ledger_entry::{self, LedgerEntryType, LedgerSource};
use crate::events::StockMovement;
use crate::message_queue::{dead_letter_topic, Message, MessageQueue};
use crate::wms::{WmsClient, WmsOrderAction};

/// Topics this worker consumes, in polling order.
pub const OUTBOUND_TOPICS: [&str; 2] = [
    "inventory.InventoryAllocated",
    "inventory.InventoryReleased",
];

const IDLE_PAUSE: Duration = Duration::from_millis(250);

/// What to do with a consumed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Transient failure; the message goes back on its queue.
    Requeue,
    /// The message can never succeed; park it for operators.
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundAction {
    Allocate,
    Release,
}

impl OutboundAction {
    fn from_topic(topic: &str) -> Option<Self> {
        if topic.ends_with("InventoryAllocated") {
            Some(OutboundAction::Allocate)
        } else if topic.ends_with("InventoryReleased") {
            Some(OutboundAction::Release)
        } else {
            None
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            OutboundAction::Allocate => "allocate",
            OutboundAction::Release => "release",
        }
    }
}

pub struct WmsOutboundWorker {
    db: Arc<DatabaseConnection>,
    queue: Arc<dyn MessageQueue>,
    wms: Arc<dyn WmsClient>,
    prefetch: usize,
}

impl WmsOutboundWorker {
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
        info!(prefetch = self.prefetch, "WMS outbound worker started");

        loop {
            let mut handled = 0usize;
            for topic in OUTBOUND_TOPICS {
                for _ in 0..self.prefetch {
                    match self.queue.subscribe(topic).await {
                        Ok(Some(message)) => {
                            handled += 1;
                            self.settle(topic, message).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(topic, error = %e, "broker poll failed");
                            break;
                        }
                    }
                }
            }

            if handled == 0 {
                tokio::select! {
                    _ = sleep(IDLE_PAUSE) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("WMS outbound worker stopping");
                            return;
                        }
                    }
                }
            } else if *shutdown.borrow() {
                info!("WMS outbound worker stopping");
                return;
            }
        }
    }

    async fn settle(&self, topic: &str, message: Message) {
        let message_id = message.id;
        match self.process(topic, &message).await {
            Disposition::Ack => {
                if let Err(e) = self.queue.ack(message_id).await {
                    warn!(message_id, error = %e, "ack failed");
                }
            }
            Disposition::Requeue => {
                counter!("inventory_wms_outbound.requeued", 1);
                if let Err(e) = self.queue.nack(message_id).await {
                    warn!(message_id, error = %e, "nack failed");
                }
            }
            Disposition::DeadLetter => {
                counter!("inventory_wms_outbound.dead_lettered", 1);
                let mut dead = message;
                dead.topic = dead_letter_topic(topic);
                if let Err(e) = self.queue.publish(dead).await {
                    error!(message_id, error = %e, "dead-letter publish failed");
                }
                if let Err(e) = self.queue.ack(message_id).await {
                    warn!(message_id, error = %e, "ack after dead-letter failed");
                }
            }
        }
    }

    /// Handles one message and decides its fate. Public so tests can drive
    /// the worker without the polling loop.
    pub async fn process(&self, topic: &str, message: &Message) -> Disposition {
        let Some(action) = OutboundAction::from_topic(topic) else {
            warn!(topic, "message on unexpected topic");
            return Disposition::DeadLetter;
        };

        let movement: StockMovement = match serde_json::from_value(message.payload.clone()) {
            Ok(m) => m,
            Err(e) => {
                warn!(message_id = message.id, error = %e, "undecodable payload");
                return Disposition::DeadLetter;
            }
        };

        let batch = match BatchEntity::find_by_id(movement.batch_id).one(&*self.db).await {
            Ok(b) => b,
            Err(e) => {
                warn!(batch_id = movement.batch_id, error = %e, "batch lookup failed");
                return Disposition::Requeue;
            }
        };

        let Some(batch) = batch else {
            warn!(batch_id = movement.batch_id, "batch does not exist");
            return Disposition::DeadLetter;
        };

        let Some(external_batch_id) = batch.external_batch_id else {
            warn!(batch_id = movement.batch_id, "batch has no WMS mapping");
            return Disposition::DeadLetter;
        };

        let wms_action = WmsOrderAction {
            external_batch_id,
            quantity: movement.quantity,
            order_ref: movement.order_id.clone(),
        };

        let result = match action {
            OutboundAction::Allocate => self.wms.allocate(&wms_action).await,
            OutboundAction::Release => self.wms.release(&wms_action).await,
        };

        if let Err(e) = result {
            return if e.is_retriable() {
                warn!(order_id = %movement.order_id, error = %e, "retriable WMS failure");
                Disposition::Requeue
            } else {
                error!(order_id = %movement.order_id, error = %e, "WMS rejected outbound call");
                Disposition::DeadLetter
            };
        }

        let audit = ledger_entry::ActiveModel {
            batch_id: Set(movement.batch_id),
            entry_type: Set(LedgerEntryType::Adjustment),
            quantity_delta: Set(0),
            source: Set(LedgerSource::WmsOutbound),
            reference_id: Set(Some(movement.order_id.clone())),
            metadata: Set(Some(json!({ "action": action.as_str() }))),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        if let Err(e) = audit.insert(&*self.db).await {
            // The WMS call already happened; losing the audit row is worse
            // than writing it twice on redelivery.
            warn!(order_id = %movement.order_id, error = %e, "audit ledger write failed");
            return Disposition::Requeue;
        }

        counter!("inventory_wms_outbound.mirrored", 1);
        Disposition::Ack
    }
}
