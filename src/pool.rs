//! The consumer pool: a fixed number of workers sharing one intake.
//!
//! Each worker takes one claimed message at a time, runs the topic's handler
//! and records the outcome with a fenced state transition. Workers never retry
//! in-process; a failed message goes back to `Pending` with a backoff and is
//! picked up again by a later poll.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt;
use sqlx::SqlitePool;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};

use crate::{
    backoff::Backoff,
    config::ConsumerConfig,
    dead_letter::DeadLetterSink,
    error::Error,
    handler::Handler,
    message::{Message, MessageStatus},
};

/// What happened to a message after one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Retry { next_attempt_at: DateTime<Utc> },
    Dead,
    /// The lease was recovered by a sweeper before the outcome was recorded;
    /// the message now belongs to a newer delivery.
    LeaseLost,
}

pub(crate) fn deadline(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

/// Everything a worker needs to process a message.
pub struct ConsumerPool {
    db: SqlitePool,
    handler: Arc<dyn Handler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    max_attempts: u32,
    backoff: Backoff,
}

impl ConsumerPool {
    pub fn new(
        db: SqlitePool,
        config: &ConsumerConfig,
        handler: Arc<dyn Handler>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            db,
            handler,
            dead_letters,
            max_attempts: config.max_attempts,
            backoff: config.backoff(),
        }
    }

    /// Runs the handler for one claimed message and records the outcome.
    ///
    /// Handler errors and panics are consumed here. Only storage failures are
    /// returned, in which case the message stays `InFlight` until its lease
    /// expires.
    pub async fn process(&self, message: Message) -> Result<Outcome, Error> {
        // The handler is called inside the caught future so a panic raised
        // before it returns its future is caught too.
        let result = AssertUnwindSafe(async { self.handler.handle(&message).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(eyre::eyre!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ))
            });

        let now = Utc::now();
        let mut conn = self.db.acquire().await?;

        let error = match result {
            Ok(()) => {
                if !Message::complete(&mut conn, message.id, message.attempts, now).await? {
                    return Ok(self.lease_lost(&message));
                }

                tracing::debug!(message_id = message.id, "Message done");
                return Ok(Outcome::Done);
            }
            Err(error) => error,
        };

        let rendered = format!("{error:#}");

        if message.attempts < self.max_attempts {
            let delay = self
                .backoff
                .jittered_delay(message.attempts, &mut rand::thread_rng());
            let next_attempt_at = deadline(now, delay);

            if !Message::retry(
                &mut conn,
                message.id,
                message.attempts,
                next_attempt_at,
                &rendered,
            )
            .await?
            {
                return Ok(self.lease_lost(&message));
            }

            tracing::warn!(
                message_id = message.id,
                attempts = message.attempts,
                max_attempts = self.max_attempts,
                retry_in = ?delay,
                error = %rendered,
                "Handler failed, message will be retried"
            );

            return Ok(Outcome::Retry { next_attempt_at });
        }

        if !Message::bury(&mut conn, message.id, message.attempts, &rendered, now).await? {
            return Ok(self.lease_lost(&message));
        }
        drop(conn);

        let dead = Message {
            status: MessageStatus::Dead,
            claimed_at: None,
            finished_at: Some(now),
            last_error: Some(rendered),
            ..message
        };

        if let Err(e) = self.dead_letters.dead_letter(&dead, &error).await {
            tracing::error!(
                message_id = dead.id,
                error = %e,
                "Failed to notify dead-letter sink"
            );
        }

        Ok(Outcome::Dead)
    }

    fn lease_lost(&self, message: &Message) -> Outcome {
        tracing::warn!(
            message_id = message.id,
            attempts = message.attempts,
            "Lease lost before outcome was recorded"
        );
        Outcome::LeaseLost
    }

    /// Spawns `concurrency` workers onto `tasks`. They exit once the intake is
    /// closed and drained.
    pub fn spawn(
        self,
        concurrency: usize,
        intake: mpsc::Receiver<Message>,
        tasks: &mut JoinSet<()>,
    ) {
        let pool = Arc::new(self);
        let intake = Arc::new(Mutex::new(intake));

        for worker in 0..concurrency {
            tasks.spawn(Arc::clone(&pool).work(worker, Arc::clone(&intake)));
        }
    }

    #[tracing::instrument(name = "worker", skip(self, intake))]
    async fn work(self: Arc<Self>, worker: usize, intake: Arc<Mutex<mpsc::Receiver<Message>>>) {
        loop {
            let Some(message) = intake.lock().await.recv().await else {
                break;
            };

            let id = message.id;

            match self.process(message).await {
                Ok(outcome) => tracing::trace!(message_id = id, ?outcome, "Processed message"),
                Err(e) => tracing::error!(
                    message_id = id,
                    error = %e,
                    "Failed to record outcome, message stays in flight until its lease expires"
                ),
            }
        }

        tracing::debug!("Worker stopped");
    }
}
