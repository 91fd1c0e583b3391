use messaging::MessagingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Publish error: {0}")]
    Publish(#[from] MessagingError),

    #[error("Outbox message not found: {0}")]
    NotFound(i64),
}

pub type OutboxResult<T> = Result<T, OutboxError>;
