use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only audit of every quantity report the WMS made, matched or not.
/// `batch_id` stays null when the WMS batch is unknown to us.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "wms_snapshots")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub wms_batch_id: String,
    pub batch_id: Option<i64>,
    pub reported_orderable: i32,
    pub reported_unallocatable: Option<i32>,
    pub reported_at: DateTime<Utc>,
    pub raw_payload: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
