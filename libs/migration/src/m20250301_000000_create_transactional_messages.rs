use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TransactionalMessages::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TransactionalMessages::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string_len(TransactionalMessages::Topic, 255))
                    .col(string_len(TransactionalMessages::Key, 255))
                    .col(
                        ColumnDef::new(TransactionalMessages::Payload)
                            .blob()
                            .not_null(),
                    )
                    .col(string_len(TransactionalMessages::Status, 20).default("PENDING"))
                    .col(integer(TransactionalMessages::RetryCount).default(0))
                    .col(
                        timestamp_with_time_zone(TransactionalMessages::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(TransactionalMessages::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .check(Expr::col(TransactionalMessages::RetryCount).gte(0))
                    .to_owned(),
            )
            .await?;

        // Serves the forwarder's status + staleness scan
        manager
            .create_index(
                Index::create()
                    .name("idx_transactional_messages_status_updated_at")
                    .table(TransactionalMessages::Table)
                    .col(TransactionalMessages::Status)
                    .col(TransactionalMessages::UpdatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(TransactionalMessages::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum TransactionalMessages {
    Table,
    Id,
    Topic,
    Key,
    Payload,
    Status,
    RetryCount,
    CreatedAt,
    UpdatedAt,
}
