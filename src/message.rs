//! Message types and state transitions for the outbox.
//!
//! This module defines the durable message record and every statement that
//! moves it through its lifecycle. All transitions are conditional updates
//! guarded by the expected prior state, which is what makes several
//! dispatchers, workers and sweepers safe to run against the same database
//! without any other locking.
//!
//! # Message Lifecycle
//!
//! 1. Messages are created `Pending` by the outbox writer
//! 2. A dispatcher claims them, moving them to `InFlight` and counting the attempt
//! 3. The handler outcome moves them to `Done`, back to `Pending` with a
//!    backoff, or to `Dead` once the attempt budget is spent
//!
//! A message abandoned `InFlight` (crashed worker) is reset by the lease
//! sweeper. The attempt counter doubles as a fencing token: every transition
//! out of `InFlight` names the attempt it belongs to, so a worker that lost
//! its lease cannot overwrite a newer delivery.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, sqlite::SqliteRow, SqliteConnection};
use tokio_stream::StreamExt;

use crate::error::Error;

/// Represents the current status of a message.
///
/// The status transitions follow:
/// `Pending` -> `InFlight` -> `Done`    (success)
/// `Pending` -> `InFlight` -> `Pending` (failure, attempts remain)
/// `Pending` -> `InFlight` -> `Dead`    (failure, attempts exhausted)
///
/// `Done` and `Dead` are terminal.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for its `next_attempt_at` and a dispatcher
    Pending,
    /// Claimed by exactly one worker
    InFlight,
    /// Handled successfully
    Done,
    /// Gave up after the attempt budget was spent
    Dead,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Dead)
    }
}

/// A durable unit of work delivered at least once.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    /// Monotonically increasing identifier, the ordering key within a topic
    pub id: i64,
    pub topic: String,
    /// Opaque payload, interpreted only by the handler
    pub body: Bytes,
    pub status: MessageStatus,
    /// Number of delivery attempts so far, counted when a message is claimed
    pub attempts: u32,
    /// The message is not eligible for dispatch before this instant
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Start of the current lease while `InFlight`
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the message reached `Done` or `Dead`
    pub finished_at: Option<DateTime<Utc>>,
    /// Most recent handler or lease error
    pub last_error: Option<String>,
}

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    topic: String,
    body: Vec<u8>,
    status: MessageStatus,
    attempts: u32,
    next_attempt_at: i64,
    created_at: i64,
    claimed_at: Option<i64>,
    finished_at: Option<i64>,
    last_error: Option<String>,
}

fn timestamp(column: &str, millis: i64) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.to_owned(),
        source: format!("timestamp out of range: {millis}").into(),
    })
}

impl TryFrom<MessageRow> for Message {
    type Error = sqlx::Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            topic: row.topic,
            body: Bytes::from(row.body),
            status: row.status,
            attempts: row.attempts,
            next_attempt_at: timestamp("next_attempt_at", row.next_attempt_at)?,
            created_at: timestamp("created_at", row.created_at)?,
            claimed_at: row
                .claimed_at
                .map(|ms| timestamp("claimed_at", ms))
                .transpose()?,
            finished_at: row
                .finished_at
                .map(|ms| timestamp("finished_at", ms))
                .transpose()?,
            last_error: row.last_error,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Message {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        MessageRow::from_row(row)?.try_into()
    }
}

/// Per-status message counts for one topic.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct TopicStatistics {
    pub topic: String,
    pub pending: u64,
    pub in_flight: u64,
    pub done: u64,
    pub dead: u64,
}

impl Message {
    /// Inserts a new `Pending` message on the given connection.
    ///
    /// Nothing is committed here: when `db` is a transaction the row becomes
    /// visible only if that transaction commits.
    pub async fn insert(
        db: &mut SqliteConnection,
        topic: impl AsRef<str>,
        body: impl AsRef<[u8]>,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Message, Error> {
        Ok(sqlx::query_as(
            "
            INSERT INTO messages (topic, body, status, attempts, next_attempt_at, created_at)
            VALUES ($1, $2, 'pending', 0, $3, $4)
            RETURNING *
            ",
        )
        .bind(topic.as_ref())
        .bind(body.as_ref())
        .bind(next_attempt_at.timestamp_millis())
        .bind(now.timestamp_millis())
        .fetch_one(&mut *db)
        .await?)
    }

    pub async fn get(db: &mut SqliteConnection, id: i64) -> Result<Option<Message>, Error> {
        Ok(sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *db)
            .await?)
    }

    /// Ids of pending messages that are due, oldest first.
    pub async fn eligible(
        db: &mut SqliteConnection,
        topic: impl AsRef<str>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<i64>, Error> {
        Ok(sqlx::query_scalar(
            "
            SELECT id FROM messages
            WHERE status = 'pending' AND topic = $1 AND next_attempt_at <= $2
            ORDER BY topic ASC, id ASC
            LIMIT $3
            ",
        )
        .bind(topic.as_ref())
        .bind(now.timestamp_millis())
        .bind(limit)
        .fetch_all(&mut *db)
        .await?)
    }

    /// Atomically moves one message from `Pending` to `InFlight`.
    ///
    /// Returns `None` when the row is no longer pending, i.e. another
    /// dispatcher won the race for it.
    pub async fn claim(
        db: &mut SqliteConnection,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>, Error> {
        Ok(sqlx::query_as(
            "
            UPDATE messages
            SET status = 'in_flight', attempts = attempts + 1, claimed_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            ",
        )
        .bind(id)
        .bind(now.timestamp_millis())
        .fetch_optional(&mut *db)
        .await?)
    }

    /// Claims up to `limit` due messages of a topic in `(topic, id)` order.
    ///
    /// Rows lost to a concurrent claim are left out of the batch.
    pub async fn claim_batch(
        db: &mut SqliteConnection,
        topic: impl AsRef<str>,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>, Error> {
        let ids = Self::eligible(&mut *db, topic, now, limit).await?;

        let mut claimed = Vec::with_capacity(ids.len());

        for id in ids {
            match Self::claim(&mut *db, id, now).await? {
                Some(message) => claimed.push(message),
                None => tracing::debug!(message_id = id, "Claim conflict, skipping message"),
            }
        }

        Ok(claimed)
    }

    /// `InFlight` -> `Done`. Returns `false` if the lease for `attempt` was lost.
    pub async fn complete(
        db: &mut SqliteConnection,
        id: i64,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "
            UPDATE messages
            SET status = 'done', finished_at = $3, claimed_at = NULL
            WHERE id = $1 AND status = 'in_flight' AND attempts = $2
            ",
        )
        .bind(id)
        .bind(attempt)
        .bind(now.timestamp_millis())
        .execute(&mut *db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// `InFlight` -> `Pending`, eligible again at `next_attempt_at`.
    /// Returns `false` if the lease for `attempt` was lost.
    pub async fn retry(
        db: &mut SqliteConnection,
        id: i64,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: impl AsRef<str>,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "
            UPDATE messages
            SET status = 'pending', next_attempt_at = $3, last_error = $4, claimed_at = NULL
            WHERE id = $1 AND status = 'in_flight' AND attempts = $2
            ",
        )
        .bind(id)
        .bind(attempt)
        .bind(next_attempt_at.timestamp_millis())
        .bind(error.as_ref())
        .execute(&mut *db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// `InFlight` -> `Dead`. Returns `false` if the lease for `attempt` was lost.
    pub async fn bury(
        db: &mut SqliteConnection,
        id: i64,
        attempt: u32,
        error: impl AsRef<str>,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "
            UPDATE messages
            SET status = 'dead', finished_at = $3, last_error = $4, claimed_at = NULL
            WHERE id = $1 AND status = 'in_flight' AND attempts = $2
            ",
        )
        .bind(id)
        .bind(attempt)
        .bind(now.timestamp_millis())
        .bind(error.as_ref())
        .execute(&mut *db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Messages of a topic whose lease started at or before `cutoff`.
    pub async fn expired(
        db: &mut SqliteConnection,
        topic: impl AsRef<str>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Message>, Error> {
        let mut stream = sqlx::query_as(
            "
            SELECT * FROM messages
            WHERE status = 'in_flight' AND topic = $1 AND claimed_at <= $2
            ORDER BY id ASC
            ",
        )
        .bind(topic.as_ref())
        .bind(cutoff.timestamp_millis())
        .fetch(&mut *db);

        let mut messages = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            messages.push(res);
        }

        Ok(messages)
    }

    pub async fn statistics(
        db: &mut SqliteConnection,
        topic: impl AsRef<str>,
    ) -> Result<TopicStatistics, Error> {
        let counts: Vec<(MessageStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM messages WHERE topic = $1 GROUP BY status",
        )
        .bind(topic.as_ref())
        .fetch_all(&mut *db)
        .await?;

        let mut stats = TopicStatistics {
            topic: topic.as_ref().to_owned(),
            ..Default::default()
        };

        for (status, count) in counts {
            let count = count as u64;
            match status {
                MessageStatus::Pending => stats.pending = count,
                MessageStatus::InFlight => stats.in_flight = count,
                MessageStatus::Done => stats.done = count,
                MessageStatus::Dead => stats.dead = count,
            }
        }

        Ok(stats)
    }

    /// Deletes `Done` and `Dead` messages finished at or before `before`.
    pub async fn purge(db: &mut SqliteConnection, before: DateTime<Utc>) -> Result<u64, Error> {
        let res = sqlx::query(
            "
            DELETE FROM messages
            WHERE status IN ('done', 'dead') AND finished_at <= $1
            ",
        )
        .bind(before.timestamp_millis())
        .execute(&mut *db)
        .await?;

        Ok(res.rows_affected())
    }
}
