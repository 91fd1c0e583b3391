//! Outbox Relay - Entry Point
//!
//! Forwards pending outbox records to Redis Streams.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    outbox_relay::run().await
}
