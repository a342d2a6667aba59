//! The outbox writer.
//!
//! Messages are written on a connection the caller already holds, normally
//! the transaction that performs the business change the message describes:
//!
//! ```no_run
//! # async fn example(service: &courier::service::Service) -> Result<(), courier::error::Error> {
//! let mut tx = service.db().begin().await?;
//!
//! sqlx::query("UPDATE accounts SET balance = balance - 10 WHERE id = 1")
//!     .execute(&mut *tx)
//!     .await?;
//! courier::outbox::publish(&mut tx, "payments", br#"{"account":1,"amount":-10}"#).await?;
//!
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! If the transaction rolls back, the message never existed.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use sqlx::SqliteConnection;

use crate::{error::Error, message::Message, topic};

/// Appends a message that is due immediately.
///
/// No commit happens here; the message becomes visible to dispatchers when
/// the caller's transaction commits.
pub async fn publish(
    db: &mut SqliteConnection,
    topic: impl AsRef<str>,
    body: impl AsRef<[u8]>,
) -> Result<Message, Error> {
    publish_deferred(db, topic, body, Duration::ZERO).await
}

/// Appends a message that will not be dispatched before `delay` has passed.
pub async fn publish_deferred(
    db: &mut SqliteConnection,
    topic: impl AsRef<str>,
    body: impl AsRef<[u8]>,
    delay: Duration,
) -> Result<Message, Error> {
    let topic = topic.as_ref();
    let body = body.as_ref();

    topic::validate(topic, body)?;

    let delay = TimeDelta::from_std(delay)
        .map_err(|_| Error::invalid_config(format!("publish delay {delay:?} is out of range")))?;

    let now = Utc::now();
    let message = Message::insert(db, topic, body, now + delay, now).await?;

    tracing::debug!(
        message_id = message.id,
        topic = %message.topic,
        next_attempt_at = %message.next_attempt_at,
        "Message written to outbox"
    );

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::MessageStatus, topic::ValidationError};
    use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

    async fn setup_db() -> SqlitePool {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::migrate!("./migrations").run(&db).await.unwrap();

        sqlx::query("CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER NOT NULL)")
            .execute(&db)
            .await
            .unwrap();

        db
    }

    async fn message_count(db: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_commits_with_business_write() {
        let db = setup_db().await;

        let mut tx = db.begin().await.unwrap();
        sqlx::query("INSERT INTO accounts (id, balance) VALUES (1, 100)")
            .execute(&mut *tx)
            .await
            .unwrap();
        let message = publish(&mut tx, "accounts", b"opened").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.attempts, 0);
        assert_eq!(message.next_attempt_at, message.created_at);
        assert_eq!(message_count(&db).await, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_message() {
        let db = setup_db().await;

        let mut tx = db.begin().await.unwrap();
        sqlx::query("INSERT INTO accounts (id, balance) VALUES (1, 100)")
            .execute(&mut *tx)
            .await
            .unwrap();
        publish(&mut tx, "accounts", b"opened").await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(message_count(&db).await, 0);

        let accounts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(accounts, 0);
    }

    #[tokio::test]
    async fn test_validation_happens_before_insert() {
        let db = setup_db().await;
        let mut conn = db.acquire().await.unwrap();

        let err = publish(&mut conn, "", b"x").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation {
                source: ValidationError::EmptyTopic
            }
        ));

        drop(conn);
        assert_eq!(message_count(&db).await, 0);
    }

    #[tokio::test]
    async fn test_deferred_publish() {
        let db = setup_db().await;
        let mut conn = db.acquire().await.unwrap();

        let message = publish_deferred(&mut conn, "reminders", b"x", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            message.next_attempt_at - message.created_at,
            TimeDelta::seconds(60)
        );
    }
}
