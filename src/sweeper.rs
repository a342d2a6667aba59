//! Recovers messages abandoned `InFlight`.
//!
//! A worker that crashes, hangs past its lease or fails to record its outcome
//! leaves the message `InFlight`. The sweeper puts such messages back to
//! `Pending`, or buries them when their attempt budget is already spent.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::SqlitePool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConsumerConfig,
    dead_letter::DeadLetterSink,
    error::Error,
    message::{Message, MessageStatus},
};

const LEASE_EXPIRED: &str = "lease expired";

/// Result of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Messages put back to `Pending`
    pub recovered: u64,
    /// Messages moved to `Dead`
    pub buried: u64,
}

pub struct Sweeper {
    db: SqlitePool,
    topic: String,
    lease_timeout: Duration,
    interval: Duration,
    max_attempts: u32,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl Sweeper {
    pub fn new(
        db: SqlitePool,
        config: &ConsumerConfig,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            db,
            topic: config.topic.clone(),
            lease_timeout: config.lease_timeout,
            interval: config.sweep_interval,
            max_attempts: config.max_attempts,
            dead_letters,
        }
    }

    /// Recovers every message of this sweeper's topic whose lease started at
    /// or before `now - lease_timeout`.
    ///
    /// Each transition is guarded by the attempt the lease belongs to, so a
    /// message is recovered once even when several sweepers race for it.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, Error> {
        let cutoff = TimeDelta::from_std(self.lease_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut report = SweepReport::default();
        let mut buried = Vec::new();

        {
            let mut conn = self.db.acquire().await?;

            for message in Message::expired(&mut conn, &self.topic, cutoff).await? {
                if message.attempts < self.max_attempts {
                    if Message::retry(&mut conn, message.id, message.attempts, now, LEASE_EXPIRED)
                        .await?
                    {
                        tracing::warn!(
                            message_id = message.id,
                            attempts = message.attempts,
                            "Lease expired, message returned to pending"
                        );
                        report.recovered += 1;
                    }
                } else if Message::bury(&mut conn, message.id, message.attempts, LEASE_EXPIRED, now)
                    .await?
                {
                    report.buried += 1;
                    buried.push(Message {
                        status: MessageStatus::Dead,
                        claimed_at: None,
                        finished_at: Some(now),
                        last_error: Some(LEASE_EXPIRED.to_owned()),
                        ..message
                    });
                }
            }
        }

        for message in buried {
            let error = eyre::eyre!("lease expired after {} attempts", message.attempts);

            if let Err(e) = self.dead_letters.dead_letter(&message, &error).await {
                tracing::error!(
                    message_id = message.id,
                    error = %e,
                    "Failed to notify dead-letter sink"
                );
            }
        }

        Ok(report)
    }

    #[tracing::instrument(name = "sweeper", skip_all, fields(topic = %self.topic))]
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.sweep(Utc::now()).await {
                Ok(report) if report == SweepReport::default() => {}
                Ok(report) => tracing::info!(
                    recovered = report.recovered,
                    buried = report.buried,
                    "Recovered expired leases"
                ),
                Err(e) => tracing::error!(error = %e, "Lease sweep failed"),
            }
        }

        tracing::debug!("Sweeper stopped");
    }
}
