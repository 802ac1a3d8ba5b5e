//! Client abstraction for the external Warehouse Management System. The
//! core never talks to it on the hot path; only the broker consumers do.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::WmsConfig;

pub mod http;
pub mod mock;

pub use http::HttpWmsClient;
pub use mock::{MockWmsClient, RecordedAction};

/// An allocate/release instruction mirrored into the WMS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WmsOrderAction {
    pub external_batch_id: String,
    pub quantity: i32,
    pub order_ref: String,
}

/// What slice of the warehouse a snapshot fetch covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotScope {
    /// One WMS batch, addressed by its external id.
    Batch(String),
    /// Everything the WMS tracks.
    Full,
    /// Changes since the given continuation token.
    Incremental(String),
}

/// One reported batch quantity from the WMS.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub wms_batch_id: String,
    pub orderable: i32,
    pub unallocatable: Option<i32>,
    pub reported_at: DateTime<Utc>,
    pub raw: serde_json::Value,
}

/// A page of snapshot entries; `next_token` continues the scan.
#[derive(Debug, Clone, Default)]
pub struct SnapshotPage {
    pub entries: Vec<SnapshotEntry>,
    pub next_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum WmsError {
    /// Rate limiting or transient unavailability; the consumer requeues.
    #[error("retriable WMS failure (status {status:?}): {message}")]
    Retriable { status: Option<u16>, message: String },

    /// The WMS rejected the request; retrying cannot help.
    #[error("WMS rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The request is malformed on our side (e.g. no external batch id).
    #[error("invalid WMS request: {0}")]
    InvalidRequest(String),
}

impl WmsError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, WmsError::Retriable { .. })
    }

    /// Classifies an HTTP status per the warehouse contract: 429/503/504 are
    /// worth retrying, every other non-2xx is final.
    pub fn from_status(status: u16, message: String) -> Self {
        if status_is_retriable(status) {
            WmsError::Retriable {
                status: Some(status),
                message,
            }
        } else {
            WmsError::Rejected { status, message }
        }
    }
}

pub(crate) fn status_is_retriable(status: u16) -> bool {
    matches!(status, 429 | 503 | 504)
}

#[async_trait]
pub trait WmsClient: Send + Sync {
    async fn allocate(&self, action: &WmsOrderAction) -> Result<(), WmsError>;
    async fn release(&self, action: &WmsOrderAction) -> Result<(), WmsError>;
    async fn fetch_snapshots(&self, scope: &SnapshotScope) -> Result<SnapshotPage, WmsError>;
}

/// Builds the client selected by configuration.
pub fn build_client(config: &WmsConfig) -> Result<Arc<dyn WmsClient>, WmsError> {
    match config.mode.as_str() {
        "http" => {
            let url = config.url.clone().ok_or_else(|| {
                WmsError::InvalidRequest("wms.url is required when wms.mode = http".into())
            })?;
            Ok(Arc::new(HttpWmsClient::new(
                url,
                config.api_key.clone(),
                std::time::Duration::from_secs(config.request_timeout_secs),
            )?))
        }
        _ => Ok(Arc::new(MockWmsClient::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_statuses_match_warehouse_contract() {
        assert!(status_is_retriable(429));
        assert!(status_is_retriable(503));
        assert!(status_is_retriable(504));

        assert!(!status_is_retriable(400));
        assert!(!status_is_retriable(404));
        assert!(!status_is_retriable(409));
        assert!(!status_is_retriable(500));
        assert!(!status_is_retriable(502));
    }

    #[test]
    fn from_status_splits_retriable_and_rejected() {
        assert!(WmsError::from_status(503, "down".into()).is_retriable());
        assert!(!WmsError::from_status(422, "bad".into()).is_retriable());
    }
}
