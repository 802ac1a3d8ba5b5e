//! In-memory WMS double for local runs and tests: actions are recorded,
//! snapshots are whatever the test programmed in, and the next call can be
//! forced to fail to exercise the retry paths.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use super::{SnapshotEntry, SnapshotPage, SnapshotScope, WmsClient, WmsError, WmsOrderAction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedAction {
    Allocate(WmsOrderAction),
    Release(WmsOrderAction),
}

#[derive(Default)]
pub struct MockWmsClient {
    snapshots: Mutex<Vec<SnapshotEntry>>,
    actions: Mutex<Vec<RecordedAction>>,
    failures: Mutex<VecDeque<WmsError>>,
}

impl MockWmsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs the quantity the next snapshot fetch reports for a batch.
    pub fn set_snapshot(&self, wms_batch_id: &str, orderable: i32, unallocatable: Option<i32>) {
        let entry = SnapshotEntry {
            wms_batch_id: wms_batch_id.to_string(),
            orderable,
            unallocatable,
            reported_at: Utc::now(),
            raw: json!({
                "batchId": wms_batch_id,
                "orderable": orderable,
                "unallocatable": unallocatable,
            }),
        };

        let mut snapshots = self.snapshots.lock().unwrap();
        snapshots.retain(|s| s.wms_batch_id != entry.wms_batch_id);
        snapshots.push(entry);
    }

    /// Queues an error returned by the next client call, then normal
    /// behavior resumes.
    pub fn fail_next(&self, error: WmsError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn recorded_actions(&self) -> Vec<RecordedAction> {
        self.actions.lock().unwrap().clone()
    }

    fn take_failure(&self) -> Option<WmsError> {
        self.failures.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl WmsClient for MockWmsClient {
    async fn allocate(&self, action: &WmsOrderAction) -> Result<(), WmsError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.actions
            .lock()
            .unwrap()
            .push(RecordedAction::Allocate(action.clone()));
        Ok(())
    }

    async fn release(&self, action: &WmsOrderAction) -> Result<(), WmsError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.actions
            .lock()
            .unwrap()
            .push(RecordedAction::Release(action.clone()));
        Ok(())
    }

    async fn fetch_snapshots(&self, scope: &SnapshotScope) -> Result<SnapshotPage, WmsError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        let snapshots = self.snapshots.lock().unwrap();
        let entries = match scope {
            SnapshotScope::Batch(external_id) => snapshots
                .iter()
                .filter(|s| &s.wms_batch_id == external_id)
                .cloned()
                .collect(),
            SnapshotScope::Full | SnapshotScope::Incremental(_) => snapshots.clone(),
        };

        Ok(SnapshotPage {
            entries,
            next_token: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_actions_in_order() {
        let wms = MockWmsClient::new();
        let action = WmsOrderAction {
            external_batch_id: "WMS-1".into(),
            quantity: 4,
            order_ref: "ord-1".into(),
        };

        wms.allocate(&action).await.unwrap();
        wms.release(&action).await.unwrap();

        let recorded = wms.recorded_actions();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0], RecordedAction::Allocate(action.clone()));
        assert_eq!(recorded[1], RecordedAction::Release(action));
    }

    #[tokio::test]
    async fn fail_next_fires_once() {
        let wms = MockWmsClient::new();
        wms.fail_next(WmsError::from_status(503, "maintenance".into()));

        let action = WmsOrderAction {
            external_batch_id: "WMS-1".into(),
            quantity: 1,
            order_ref: "ord-2".into(),
        };

        let err = wms.allocate(&action).await.unwrap_err();
        assert!(err.is_retriable());
        assert!(wms.allocate(&action).await.is_ok());
    }

    #[tokio::test]
    async fn batch_scope_filters_snapshots() {
        let wms = MockWmsClient::new();
        wms.set_snapshot("WMS-1", 85, None);
        wms.set_snapshot("WMS-2", 40, Some(2));

        let page = wms
            .fetch_snapshots(&SnapshotScope::Batch("WMS-2".into()))
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].orderable, 40);

        let all = wms.fetch_snapshots(&SnapshotScope::Full).await.unwrap();
        assert_eq!(all.entries.len(), 2);
    }
}
