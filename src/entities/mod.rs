pub mod batch;
pub mod ledger_entry;
pub mod outbox_event;
pub mod reservation;
pub mod sku;
pub mod sync_request;
pub mod sync_state;
pub mod wms_snapshot;
