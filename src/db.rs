use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

/// A result posted back by a downstream handler for an earlier event.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerResponse {
    pub event_id: String,
    pub response: String,
    pub platform: String,
    pub channel_id: String,
}

/// Open the Postgres pool used for the durable rate-limit fallback and the
/// handler-response inbox.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}

/// Create tables if they do not exist. Safe to run on every startup.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS rate_limit_counters (
            bucket_key TEXT PRIMARY KEY,
            count BIGINT NOT NULL DEFAULT 0,
            expires_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create rate_limit_counters table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS handler_responses (
            id BIGSERIAL PRIMARY KEY,
            event_id TEXT NOT NULL,
            response TEXT NOT NULL,
            platform TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            received_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create handler_responses table")?;

    info!("Database schema ready");
    Ok(())
}

/// Persist one posted-back handler result.
pub async fn insert_handler_response(pool: &PgPool, response: &HandlerResponse) -> Result<()> {
    sqlx::query(
        "INSERT INTO handler_responses (event_id, response, platform, channel_id)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(&response.event_id)
    .bind(&response.response)
    .bind(&response.platform)
    .bind(&response.channel_id)
    .execute(pool)
    .await
    .context("Failed to insert handler response")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_response_deserializes() {
        let json = r#"{
            "event_id": "evt-123",
            "response": "done",
            "platform": "twitch",
            "channel_id": "c1"
        }"#;
        let parsed: HandlerResponse = serde_json::from_str(json).expect("deserialize");
        assert_eq!(parsed.event_id, "evt-123");
        assert_eq!(parsed.platform, "twitch");
    }

    #[test]
    fn test_handler_response_rejects_unknown_fields() {
        let json = r#"{
            "event_id": "evt-123",
            "response": "done",
            "platform": "twitch",
            "channel_id": "c1",
            "sneaky": true
        }"#;
        assert!(serde_json::from_str::<HandlerResponse>(json).is_err());
    }
}
