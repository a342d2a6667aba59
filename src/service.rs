use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};

use crate::{
    config::{Config, ConsumerConfig},
    consumer::{self, ConsumerHandle},
    dead_letter::DeadLetterSink,
    error::Error,
    handler::Handler,
    message::{Message, TopicStatistics},
    outbox,
};

/// Owns the outbox database and spawns consumers against it.
pub struct Service {
    db: SqlitePool,
    config: Config,
}

impl Service {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> Result<Self, Error> {
        let opts = if let Some(path) = config.db_path() {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        let mut pool_opts = SqlitePoolOptions::new();

        // Every in-memory connection opens a database of its own, and the
        // database is gone once its connection closes
        if config.db_path().is_none() {
            pool_opts = pool_opts
                .max_connections(1)
                .min_connections(1)
                .max_lifetime(None)
                .idle_timeout(None);
        }

        let pool = pool_opts.connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!(
            db_path = config.db_path().unwrap_or(":memory:"),
            "Outbox database ready"
        );

        Ok(Self { db: pool, config })
    }

    /// The underlying pool. Begin business transactions here and publish
    /// into them with [`outbox::publish`].
    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Publishes a message in a transaction of its own.
    pub async fn publish(
        &self,
        topic: impl AsRef<str>,
        body: impl AsRef<[u8]>,
    ) -> Result<Message, Error> {
        self.publish_deferred(topic, body, Duration::ZERO).await
    }

    /// Publishes a message in a transaction of its own that is not dispatched
    /// before `delay` has passed.
    pub async fn publish_deferred(
        &self,
        topic: impl AsRef<str>,
        body: impl AsRef<[u8]>,
        delay: Duration,
    ) -> Result<Message, Error> {
        let mut tx = self.db.begin().await?;

        let message = outbox::publish_deferred(&mut tx, topic, body, delay).await?;

        tx.commit().await?;

        Ok(message)
    }

    pub async fn get(&self, id: i64) -> Result<Message, Error> {
        let mut conn = self.db.acquire().await?;

        Message::get(&mut conn, id)
            .await?
            .ok_or_else(|| Error::message_not_found(id))
    }

    pub async fn stats(&self, topic: impl AsRef<str>) -> Result<TopicStatistics, Error> {
        let mut conn = self.db.acquire().await?;
        Message::statistics(&mut conn, topic).await
    }

    /// Deletes `Done` and `Dead` messages that finished at or before `before`.
    /// Returns the number of messages removed.
    pub async fn purge(&self, before: DateTime<Utc>) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;

        let purged = Message::purge(&mut conn, before).await?;

        tracing::info!(purged, before = %before, "Purged finished messages");

        Ok(purged)
    }

    /// Starts a consumer for `config.topic`.
    pub fn spawn(
        &self,
        config: ConsumerConfig,
        handler: impl Handler,
        dead_letters: impl DeadLetterSink,
    ) -> Result<ConsumerHandle, Error> {
        consumer::spawn(
            self.db.clone(),
            config,
            Arc::new(handler),
            Arc::new(dead_letters),
        )
    }
}
