use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let id_col = match manager.get_database_backend() {
            sea_orm::DatabaseBackend::Postgres => ColumnDef::new(DeviceAuthorizations::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
            _ => ColumnDef::new(DeviceAuthorizations::Id)
                .integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
        };

        // Device Authorization Grant (RFC 8628) records
        manager
            .create_table(
                Table::create()
                    .table(DeviceAuthorizations::Table)
                    .if_not_exists()
                    .col(id_col)
                    .col(
                        ColumnDef::new(DeviceAuthorizations::DeviceCode)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string(DeviceAuthorizations::UserCode))
                    .col(string(DeviceAuthorizations::ClientId))
                    .col(string_null(DeviceAuthorizations::ClientName))
                    .col(string(DeviceAuthorizations::Scope))
                    .col(string(DeviceAuthorizations::ClientAuthMethod))
                    .col(string_null(DeviceAuthorizations::DeviceInfo))
                    .col(
                        ColumnDef::new(DeviceAuthorizations::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(big_integer(DeviceAuthorizations::CreatedAt))
                    .col(big_integer(DeviceAuthorizations::ExpiresAt))
                    .col(big_integer_null(DeviceAuthorizations::LastPollAt))
                    .col(
                        ColumnDef::new(DeviceAuthorizations::PollInterval)
                            .big_integer()
                            .not_null()
                            .default(5),
                    )
                    .col(string_null(DeviceAuthorizations::ApprovedSubject))
                    .col(big_integer_null(DeviceAuthorizations::AuthTime))
                    .col(big_integer_null(DeviceAuthorizations::RedeemedAt))
                    .to_owned(),
            )
            .await?;

        // A user_code may only be held by one record that can still be acted on.
        // Partial indexes are supported by both SQLite and PostgreSQL.
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_device_authorizations_active_user_code \
                 ON device_authorizations (user_code) \
                 WHERE status IN ('pending', 'approved', 'denied')",
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_authorizations_user_code")
                    .table(DeviceAuthorizations::Table)
                    .col(DeviceAuthorizations::UserCode)
                    .to_owned(),
            )
            .await?;

        // Reclamation job scans by expiry
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_authorizations_expires_at")
                    .table(DeviceAuthorizations::Table)
                    .col(DeviceAuthorizations::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // Brute-force counters for user_code entry, keyed by client context
        manager
            .create_table(
                Table::create()
                    .table(UserCodeAttempts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserCodeAttempts::ContextKey)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(UserCodeAttempts::Failures)
                            .string()
                            .not_null()
                            .default("[]"),
                    )
                    .col(big_integer_null(UserCodeAttempts::LockedUntil))
                    .col(
                        ColumnDef::new(UserCodeAttempts::Version)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer(UserCodeAttempts::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_user_code_attempts_updated_at")
                    .table(UserCodeAttempts::Table)
                    .col(UserCodeAttempts::UpdatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UserCodeAttempts::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DeviceAuthorizations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DeviceAuthorizations {
    Table,
    Id,
    DeviceCode,
    UserCode,
    ClientId,
    ClientName,
    Scope,
    ClientAuthMethod,
    DeviceInfo,
    Status,
    CreatedAt,
    ExpiresAt,
    LastPollAt,
    PollInterval,
    ApprovedSubject,
    AuthTime,
    RedeemedAt,
}

#[derive(DeriveIden)]
enum UserCodeAttempts {
    Table,
    ContextKey,
    Failures,
    LockedUntil,
    Version,
    UpdatedAt,
}
