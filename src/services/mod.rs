pub mod inventory;
pub mod reconciliation;
pub mod wms_outbound;
