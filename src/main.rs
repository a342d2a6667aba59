use std::time::Duration;

use chrono::Utc;
use courier::{
    config::{Config, ConsumerConfig},
    dead_letter::LogSink,
    message::Message,
    outbox,
    service::Service,
};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

const TOPIC: &str = "user_actions";

#[derive(Debug, Serialize, Deserialize)]
struct UserAction {
    user_id: String,
    action: String,
    content_id: String,
    timestamp: String,
}

async fn analyze_user_action(message: Message) -> eyre::Result<()> {
    let action: UserAction = serde_json::from_slice(&message.body)?;

    tracing::info!(
        message_id = message.id,
        attempt = message.attempts,
        user_id = %action.user_id,
        action = %action.action,
        content_id = %action.content_id,
        timestamp = %action.timestamp,
        "Analyzed user action"
    );

    Ok(())
}

async fn record_view(db: &mut SqliteConnection, user_id: &str, content_id: &str) -> eyre::Result<()> {
    sqlx::query(
        "
        CREATE TABLE IF NOT EXISTS content_views (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            content_id TEXT NOT NULL
        )
        ",
    )
    .execute(&mut *db)
    .await?;

    sqlx::query("INSERT INTO content_views (user_id, content_id) VALUES ($1, $2)")
        .bind(user_id)
        .bind(content_id)
        .execute(&mut *db)
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    courier::init_tracing()?;

    let service = Service::connect_with(Config::load()?).await?;

    let consumer = service.spawn(
        ConsumerConfig::builder()
            .topic(TOPIC)
            .concurrency(5)
            .max_attempts(5)
            .backoff_base(Duration::from_secs(1))
            .backoff_cap(Duration::from_secs(30))
            .backoff_jitter(0.1)
            .poll_interval(Duration::from_millis(200))
            .batch_size(32)
            .lease_timeout(Duration::from_secs(60))
            .sweep_interval(Duration::from_secs(10))
            .build(),
        analyze_user_action,
        LogSink,
    )?;

    let action = UserAction {
        user_id: "123".to_owned(),
        action: "view".to_owned(),
        content_id: "456".to_owned(),
        timestamp: Utc::now().to_rfc3339(),
    };

    let mut tx = service.db().begin().await?;
    record_view(&mut tx, &action.user_id, &action.content_id).await?;
    let message = outbox::publish(&mut tx, TOPIC, serde_json::to_vec(&action)?).await?;
    tx.commit().await?;

    tracing::info!(message_id = message.id, "Published user action, press Ctrl-C to exit");

    tokio::signal::ctrl_c().await?;

    consumer.shutdown().await;

    Ok(())
}
