use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_skus_table::Migration),
            Box::new(m20240101_000002_create_batches_table::Migration),
            Box::new(m20240101_000003_create_ledger_entries_table::Migration),
            Box::new(m20240101_000004_create_reservations_table::Migration),
            Box::new(m20240101_000005_create_outbox_events_table::Migration),
            Box::new(m20240101_000006_create_wms_snapshots_table::Migration),
            Box::new(m20240101_000007_create_sync_tables::Migration),
        ]
    }
}

// Migration implementations

mod m20240101_000001_create_skus_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_skus_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Skus::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Skus::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Skus::Code).string().not_null())
                        .col(ColumnDef::new(Skus::Name).string().null())
                        .col(
                            ColumnDef::new(Skus::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_skus_code")
                        .table(Skus::Table)
                        .col(Skus::Code)
                        .unique()
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Skus::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Skus {
        Table,
        Id,
        Code,
        Name,
        CreatedAt,
    }
}

mod m20240101_000002_create_batches_table {
    use sea_orm::DbBackend;
    use sea_orm_migration::prelude::*;

    use super::m20240101_000001_create_skus_table::Skus;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_batches_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Batches::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Batches::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Batches::SkuId).big_integer().not_null())
                        .col(ColumnDef::new(Batches::ExternalBatchId).string().null())
                        .col(ColumnDef::new(Batches::LotNumber).string().null())
                        .col(
                            ColumnDef::new(Batches::ExpiresAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Batches::TotalQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Batches::UnallocatableQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Batches::AvailableQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Batches::Version)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(Batches::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_batches_sku_id")
                                .from(Batches::Table, Batches::SkuId)
                                .to(Skus::Table, Skus::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_batches_sku_id")
                        .table(Batches::Table)
                        .col(Batches::SkuId)
                        .to_owned(),
                )
                .await?;

            let conn = manager.get_connection();
            if manager.get_database_backend() == DbBackend::Postgres {
                // Partial index for the external-id lookup, and the quantity
                // invariants the application code assumes the store enforces.
                conn.execute_unprepared(
                    "CREATE INDEX IF NOT EXISTS idx_batches_external_batch_id \
                     ON batches (external_batch_id) WHERE external_batch_id IS NOT NULL",
                )
                .await?;
                conn.execute_unprepared(
                    "ALTER TABLE batches ADD CONSTRAINT chk_batches_quantities_non_negative \
                     CHECK (total_quantity >= 0 AND unallocatable_quantity >= 0 AND available_quantity >= 0)",
                )
                .await?;
                conn.execute_unprepared(
                    "ALTER TABLE batches ADD CONSTRAINT chk_batches_available_le_total \
                     CHECK (available_quantity <= total_quantity)",
                )
                .await?;
            } else {
                manager
                    .create_index(
                        Index::create()
                            .if_not_exists()
                            .name("idx_batches_external_batch_id")
                            .table(Batches::Table)
                            .col(Batches::ExternalBatchId)
                            .to_owned(),
                    )
                    .await?;
            }

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Batches::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Batches {
        Table,
        Id,
        SkuId,
        ExternalBatchId,
        LotNumber,
        ExpiresAt,
        TotalQuantity,
        UnallocatableQuantity,
        AvailableQuantity,
        Version,
        UpdatedAt,
    }
}

mod m20240101_000003_create_ledger_entries_table {
    use sea_orm::DbBackend;
    use sea_orm_migration::prelude::*;

    use super::m20240101_000002_create_batches_table::Batches;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_ledger_entries_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(LedgerEntries::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(LedgerEntries::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(LedgerEntries::BatchId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(LedgerEntries::EntryType)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(LedgerEntries::QuantityDelta)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(LedgerEntries::Source)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(ColumnDef::new(LedgerEntries::ReferenceId).string().null())
                        .col(ColumnDef::new(LedgerEntries::Metadata).json().null())
                        .col(
                            ColumnDef::new(LedgerEntries::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_ledger_entries_batch_id")
                                .from(LedgerEntries::Table, LedgerEntries::BatchId)
                                .to(Batches::Table, Batches::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_ledger_entries_batch_id")
                        .table(LedgerEntries::Table)
                        .col(LedgerEntries::BatchId)
                        .to_owned(),
                )
                .await?;

            if manager.get_database_backend() == DbBackend::Postgres {
                let conn = manager.get_connection();
                conn.execute_unprepared(
                    "ALTER TABLE ledger_entries ADD CONSTRAINT chk_ledger_entries_entry_type \
                     CHECK (entry_type IN ('RECEIPT', 'ORDER_ALLOCATE', 'ORDER_RELEASE', 'ADJUSTMENT'))",
                )
                .await?;
                conn.execute_unprepared(
                    "ALTER TABLE ledger_entries ADD CONSTRAINT chk_ledger_entries_source \
                     CHECK (source IN ('NABIS_ORDER', 'WMS_SYNC', 'MANUAL_ADJUSTMENT', 'WMS_OUTBOUND'))",
                )
                .await?;
            }

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(LedgerEntries::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum LedgerEntries {
        Table,
        Id,
        BatchId,
        EntryType,
        QuantityDelta,
        Source,
        ReferenceId,
        Metadata,
        CreatedAt,
    }
}

mod m20240101_000004_create_reservations_table {
    use sea_orm_migration::prelude::*;

    use super::m20240101_000002_create_batches_table::Batches;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_reservations_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Reservations::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Reservations::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Reservations::OrderId).string().not_null())
                        .col(
                            ColumnDef::new(Reservations::BatchId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Reservations::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(Reservations::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Reservations::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Reservations::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Reservations::ExpiresAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_reservations_batch_id")
                                .from(Reservations::Table, Reservations::BatchId)
                                .to(Batches::Table, Batches::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            // One reservation per (order, batch): the idempotency probe and
            // the release path both rely on this.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_reservations_order_id_batch_id")
                        .table(Reservations::Table)
                        .col(Reservations::OrderId)
                        .col(Reservations::BatchId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_reservations_order_id")
                        .table(Reservations::Table)
                        .col(Reservations::OrderId)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Reservations::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Reservations {
        Table,
        Id,
        OrderId,
        BatchId,
        Quantity,
        Status,
        CreatedAt,
        UpdatedAt,
        ExpiresAt,
    }
}

mod m20240101_000005_create_outbox_events_table {
    use sea_orm::DbBackend;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000005_create_outbox_events_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OutboxEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OutboxEvents::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(OutboxEvents::EventType).string().not_null())
                        .col(ColumnDef::new(OutboxEvents::Payload).json().not_null())
                        .col(
                            ColumnDef::new(OutboxEvents::Status)
                                .string_len(16)
                                .not_null()
                                .default("PENDING"),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::RetryCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(OutboxEvents::Error).string().null())
                        .col(
                            ColumnDef::new(OutboxEvents::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            if manager.get_database_backend() == DbBackend::Postgres {
                // The dispatcher only ever scans PENDING rows in creation
                // order; a partial index keeps that scan cheap no matter how
                // much delivered history accumulates.
                manager
                    .get_connection()
                    .execute_unprepared(
                        "CREATE INDEX IF NOT EXISTS idx_outbox_events_pending_created_at \
                         ON outbox_events (created_at) WHERE status = 'PENDING'",
                    )
                    .await?;
            } else {
                manager
                    .create_index(
                        Index::create()
                            .if_not_exists()
                            .name("idx_outbox_events_status_created_at")
                            .table(OutboxEvents::Table)
                            .col(OutboxEvents::Status)
                            .col(OutboxEvents::CreatedAt)
                            .to_owned(),
                    )
                    .await?;
            }

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OutboxEvents::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum OutboxEvents {
        Table,
        Id,
        EventType,
        Payload,
        Status,
        RetryCount,
        Error,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000006_create_wms_snapshots_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000006_create_wms_snapshots_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(WmsSnapshots::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(WmsSnapshots::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(WmsSnapshots::WmsBatchId)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WmsSnapshots::BatchId).big_integer().null())
                        .col(
                            ColumnDef::new(WmsSnapshots::ReportedOrderable)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WmsSnapshots::ReportedUnallocatable)
                                .integer()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(WmsSnapshots::ReportedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WmsSnapshots::RawPayload).json().not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_wms_snapshots_wms_batch_id")
                        .table(WmsSnapshots::Table)
                        .col(WmsSnapshots::WmsBatchId)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(WmsSnapshots::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum WmsSnapshots {
        Table,
        Id,
        WmsBatchId,
        BatchId,
        ReportedOrderable,
        ReportedUnallocatable,
        ReportedAt,
        RawPayload,
    }
}

mod m20240101_000007_create_sync_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000007_create_sync_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(SyncRequests::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SyncRequests::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(SyncRequests::RequestedBy)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(SyncRequests::Reason).string().not_null())
                        .col(ColumnDef::new(SyncRequests::BatchId).big_integer().null())
                        .col(
                            ColumnDef::new(SyncRequests::Priority)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(SyncRequests::Status)
                                .string_len(16)
                                .not_null()
                                .default("PENDING"),
                        )
                        .col(
                            ColumnDef::new(SyncRequests::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SyncRequests::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SyncRequests::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(SyncRequests::Error).string().null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(SyncState::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SyncState::Id)
                                .integer()
                                .not_null()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(SyncState::LastFullSyncAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(SyncState::LastIncrementalToken)
                                .string()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(SyncState::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(SyncRequests::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum SyncRequests {
        Table,
        Id,
        RequestedBy,
        Reason,
        BatchId,
        Priority,
        Status,
        CreatedAt,
        UpdatedAt,
        CompletedAt,
        Error,
    }

    #[derive(DeriveIden)]
    pub enum SyncState {
        Table,
        Id,
        LastFullSyncAt,
        LastIncrementalToken,
    }
}
