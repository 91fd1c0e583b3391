use async_trait::async_trait;
use sea_orm::DatabaseTransaction;

use crate::error::OutboxResult;
use crate::models::{NewOutboxMessage, OutboxMessage, OutboxStatus};

/// Persistence for outbox records
///
/// `create_in_tx` runs on the caller's transaction so the record commits or
/// rolls back together with the business write. The other operations use the
/// store's own connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a PENDING record with retry count 0
    async fn create_in_tx(
        &self,
        tx: &DatabaseTransaction,
        message: NewOutboxMessage,
    ) -> OutboxResult<OutboxMessage>;

    /// PENDING records not touched within the staleness window, oldest id first
    async fn find_pending_messages(&self, limit: u64) -> OutboxResult<Vec<OutboxMessage>>;

    /// Overwrite status and retry count, refreshing `updated_at`
    async fn update_status(
        &self,
        id: i64,
        status: OutboxStatus,
        retry_count: i32,
    ) -> OutboxResult<()>;
}
