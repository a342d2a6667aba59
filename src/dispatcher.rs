//! Polls the outbox for due messages and claims them for the consumer pool.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{config::ConsumerConfig, error::Error, message::Message};

pub struct Dispatcher {
    db: SqlitePool,
    topic: String,
    batch_size: u32,
    poll_interval: Duration,
    intake: mpsc::Sender<Message>,
}

impl Dispatcher {
    pub fn new(db: SqlitePool, config: &ConsumerConfig, intake: mpsc::Sender<Message>) -> Self {
        Self {
            db,
            topic: config.topic.clone(),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            intake,
        }
    }

    /// Claims up to `limit` due messages of this dispatcher's topic.
    pub async fn claim(&self, limit: u32) -> Result<Vec<Message>, Error> {
        let mut conn = self.db.acquire().await?;
        Message::claim_batch(&mut conn, &self.topic, limit, Utc::now()).await
    }

    /// Sleeps for one poll interval. Returns `false` if shutdown was requested
    /// in the meantime.
    async fn idle(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }

    /// Runs until `shutdown` is cancelled or the consumer pool goes away.
    ///
    /// Dropping the dispatcher on return closes the intake, which lets the
    /// workers drain what was already claimed and exit.
    #[tracing::instrument(name = "dispatcher", skip_all, fields(topic = %self.topic))]
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("Dispatcher started");

        while !shutdown.is_cancelled() {
            // Never claim more than the pool can take right away, claimed
            // messages are on the lease clock.
            let room = self.intake.capacity();
            if room == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = self.intake.reserve() => match permit {
                        Ok(_) => continue,
                        Err(_) => break,
                    },
                }
            }

            let limit = self.batch_size.min(u32::try_from(room).unwrap_or(u32::MAX));

            match self.claim(limit).await {
                Ok(batch) if batch.is_empty() => {
                    if !self.idle(&shutdown).await {
                        break;
                    }
                }
                Ok(batch) => {
                    tracing::debug!(count = batch.len(), "Claimed batch");

                    for message in batch {
                        if self.intake.send(message).await.is_err() {
                            tracing::warn!("Consumer pool closed, stopping dispatcher");
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim messages");
                    if !self.idle(&shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::MessageStatus, outbox};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_db() -> SqlitePool {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::migrate!("./migrations").run(&db).await.unwrap();

        db
    }

    fn config(batch_size: u32) -> ConsumerConfig {
        ConsumerConfig::builder()
            .topic("orders")
            .concurrency(2)
            .max_attempts(3)
            .backoff_base(Duration::from_millis(10))
            .backoff_cap(Duration::from_millis(100))
            .backoff_jitter(0.0)
            .poll_interval(Duration::from_millis(10))
            .batch_size(batch_size)
            .lease_timeout(Duration::from_secs(30))
            .sweep_interval(Duration::from_secs(1))
            .build()
    }

    #[tokio::test]
    async fn test_delivers_in_publish_order() {
        let db = setup_db().await;

        let mut ids = Vec::new();
        for body in ["a", "b", "c"] {
            let mut conn = db.acquire().await.unwrap();
            ids.push(outbox::publish(&mut conn, "orders", body).await.unwrap().id);
        }

        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Dispatcher::new(db.clone(), &config(8), tx).run(shutdown.clone()));

        let mut received = Vec::new();
        for _ in 0..3 {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.status, MessageStatus::InFlight);
            assert_eq!(message.attempts, 1);
            received.push(message.id);
        }
        assert_eq!(received, ids);

        shutdown.cancel();
        task.await.unwrap();

        // Intake is closed once the dispatcher stops
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_claims_bounded_by_intake_capacity() {
        let db = setup_db().await;

        for i in 0..5u8 {
            let mut conn = db.acquire().await.unwrap();
            outbox::publish(&mut conn, "orders", [i]).await.unwrap();
        }

        let (tx, rx) = mpsc::channel(2);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Dispatcher::new(db.clone(), &config(10), tx).run(shutdown.clone()));

        // Give the dispatcher time to fill the intake
        tokio::time::sleep(Duration::from_millis(100)).await;

        let in_flight: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE status = 'in_flight'")
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(in_flight, 2);

        shutdown.cancel();
        task.await.unwrap();
        drop(rx);
    }

    #[tokio::test]
    async fn test_ignores_other_topics() {
        let db = setup_db().await;

        {
            let mut conn = db.acquire().await.unwrap();
            outbox::publish(&mut conn, "payments", b"x").await.unwrap();
        }

        let (tx, _rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(db.clone(), &config(8), tx);
        assert!(dispatcher.claim(8).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resumes_after_storage_failure() {
        let db = setup_db().await;

        let id = {
            let mut conn = db.acquire().await.unwrap();
            outbox::publish(&mut conn, "orders", b"x").await.unwrap().id
        };

        sqlx::query("ALTER TABLE messages RENAME TO messages_offline")
            .execute(&db)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Dispatcher::new(db.clone(), &config(8), tx).run(shutdown.clone()));

        // Several polls fail while the table is missing
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(!task.is_finished());

        sqlx::query("ALTER TABLE messages_offline RENAME TO messages")
            .execute(&db)
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.attempts, 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
