use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod outbox;

/// Routing-key prefix for domain events; the full topic is
/// `inventory.<eventType>`.
pub const EVENT_TOPIC_PREFIX: &str = "inventory.";

/// Command topic consumed by the reconciliation engine.
pub const FORCE_SYNC_TOPIC: &str = "wms.forceSync";

/// Payload shared by `InventoryAllocated` and `InventoryReleased`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockMovement {
    pub order_id: String,
    pub batch_id: i64,
    pub quantity: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Payload of `InventoryAdjusted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryAdjustment {
    pub batch_id: i64,
    pub quantity_delta: i32,
    pub new_available: i32,
    pub source: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// The domain events this service publishes. Written to the outbox inside
/// the business transaction; the dispatcher turns them into broker messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    InventoryAllocated(StockMovement),
    InventoryReleased(StockMovement),
    InventoryAdjusted(InventoryAdjustment),
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::InventoryAllocated(_) => "InventoryAllocated",
            DomainEvent::InventoryReleased(_) => "InventoryReleased",
            DomainEvent::InventoryAdjusted(_) => "InventoryAdjusted",
        }
    }

    /// Broker topic this event is published under.
    pub fn topic(&self) -> String {
        format!("{}{}", EVENT_TOPIC_PREFIX, self.event_type())
    }

    /// The stable JSON payload carried on the wire.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            DomainEvent::InventoryAllocated(m) | DomainEvent::InventoryReleased(m) => {
                serde_json::to_value(m).expect("stock movement payload serializes")
            }
            DomainEvent::InventoryAdjusted(a) => {
                serde_json::to_value(a).expect("adjustment payload serializes")
            }
        }
    }
}

/// Command consumed by the reconciliation engine from `wms.forceSync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceWmsSync {
    pub sync_request_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<i64>,
}
