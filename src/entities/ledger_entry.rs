use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// What kind of quantity movement a ledger entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum LedgerEntryType {
    #[sea_orm(string_value = "RECEIPT")]
    Receipt,
    #[sea_orm(string_value = "ORDER_ALLOCATE")]
    OrderAllocate,
    #[sea_orm(string_value = "ORDER_RELEASE")]
    OrderRelease,
    #[sea_orm(string_value = "ADJUSTMENT")]
    Adjustment,
}

/// Which system originated the movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum LedgerSource {
    #[sea_orm(string_value = "NABIS_ORDER")]
    NabisOrder,
    #[sea_orm(string_value = "WMS_SYNC")]
    WmsSync,
    #[sea_orm(string_value = "MANUAL_ADJUSTMENT")]
    ManualAdjustment,
    #[sea_orm(string_value = "WMS_OUTBOUND")]
    WmsOutbound,
}

/// Append-only journal of every quantity change. The signed sum of
/// `quantity_delta` over a batch's entries, plus its initial quantity, must
/// equal the batch's committed `available_quantity` at all times.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ledger_entries")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub batch_id: i64,
    pub entry_type: LedgerEntryType,
    pub quantity_delta: i32,
    pub source: LedgerSource,
    pub reference_id: Option<String>,
    pub metadata: Option<Json>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::batch::Entity",
        from = "Column::BatchId",
        to = "super::batch::Column::Id"
    )]
    Batch,
}

impl Related<super::batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
