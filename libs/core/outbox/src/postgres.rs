use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect,
};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::DEFAULT_STALE_AFTER;
use crate::entity;
use crate::error::{OutboxError, OutboxResult};
use crate::models::{NewOutboxMessage, OutboxMessage, OutboxStatus};
use crate::store::OutboxStore;

/// [`OutboxStore`] over PostgreSQL
#[derive(Clone)]
pub struct PgOutboxStore {
    db: DatabaseConnection,
    stale_after: TimeDelta,
}

impl PgOutboxStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            stale_after: to_time_delta(DEFAULT_STALE_AFTER),
        }
    }

    /// Records updated more recently than this are skipped by the pending query
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = to_time_delta(stale_after);
        self
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    fn stale_cutoff(&self) -> DateTime<Utc> {
        Utc::now()
            .checked_sub_signed(self.stale_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    #[instrument(skip(self, tx, message), fields(topic = %message.topic))]
    async fn create_in_tx(
        &self,
        tx: &DatabaseTransaction,
        message: NewOutboxMessage,
    ) -> OutboxResult<OutboxMessage> {
        let active_model: entity::ActiveModel = message.into();
        let model = active_model.insert(tx).await?;

        debug!(outbox_id = model.id, "Staged outbox message");
        Ok(model.into())
    }

    async fn find_pending_messages(&self, limit: u64) -> OutboxResult<Vec<OutboxMessage>> {
        let models = entity::Entity::find()
            .filter(entity::Column::Status.eq(OutboxStatus::Pending))
            .filter(entity::Column::UpdatedAt.lt(self.stale_cutoff()))
            .order_by_asc(entity::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn update_status(
        &self,
        id: i64,
        status: OutboxStatus,
        retry_count: i32,
    ) -> OutboxResult<()> {
        let changes = entity::ActiveModel {
            status: Set(status),
            retry_count: Set(retry_count),
            updated_at: Set(Utc::now().into()),
            ..Default::default()
        };

        let result = entity::Entity::update_many()
            .set(changes)
            .filter(entity::Column::Id.eq(id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(OutboxError::NotFound(id));
        }

        debug!(outbox_id = id, status = %status, retry_count, "Updated outbox message");
        Ok(())
    }
}
