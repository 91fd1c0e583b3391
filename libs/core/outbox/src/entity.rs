use crate::models::{NewOutboxMessage, OutboxMessage, OutboxStatus};
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Sea-ORM Entity for the transactional_messages table
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transactional_messages")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(column_type = "String(StringLen::N(255))")]
    pub topic: String,
    #[sea_orm(column_type = "String(StringLen::N(255))")]
    pub key: String,
    #[sea_orm(column_type = "VarBinary(StringLen::None)")]
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for OutboxMessage {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            topic: model.topic,
            key: model.key,
            payload: model.payload,
            status: model.status,
            retry_count: model.retry_count,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        }
    }
}

// Id is left to the BIGSERIAL sequence
impl From<NewOutboxMessage> for ActiveModel {
    fn from(input: NewOutboxMessage) -> Self {
        let now = chrono::Utc::now();
        ActiveModel {
            id: NotSet,
            topic: Set(input.topic),
            key: Set(input.key),
            payload: Set(input.payload),
            status: Set(OutboxStatus::Pending),
            retry_count: Set(0),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
    }
}
