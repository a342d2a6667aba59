//! A running consumer: one dispatcher, a pool of workers and a lease sweeper
//! for a single topic.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConsumerConfig, dead_letter::DeadLetterSink, dispatcher::Dispatcher, error::Error,
    handler::Handler, pool::ConsumerPool, sweeper::Sweeper,
};

/// Handle to the tasks of a spawned consumer.
///
/// Dropping the handle aborts the consumer's tasks on the spot. Messages they
/// held stay `InFlight` until the sweeper recovers them, so prefer
/// [`ConsumerHandle::shutdown`].
pub struct ConsumerHandle {
    topic: String,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl ConsumerHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Token that stops the consumer when cancelled, e.g. to tie several
    /// consumers to one shutdown signal.
    pub fn cancellation(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops claiming new messages, lets the workers finish what was already
    /// claimed and waits for every task to exit.
    #[tracing::instrument(skip_all, fields(topic = %self.topic))]
    pub async fn shutdown(mut self) {
        tracing::info!("Shutting down consumer");

        self.shutdown.cancel();

        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "Consumer task failed");
            }
        }

        tracing::info!("Consumer stopped");
    }
}

/// Validates `config` and starts a consumer for its topic on the current
/// tokio runtime.
pub fn spawn(
    db: SqlitePool,
    config: ConsumerConfig,
    handler: Arc<dyn Handler>,
    dead_letters: Arc<dyn DeadLetterSink>,
) -> Result<ConsumerHandle, Error> {
    config.validate()?;

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let (intake_tx, intake_rx) = mpsc::channel(config.concurrency);

    ConsumerPool::new(db.clone(), &config, handler, Arc::clone(&dead_letters)).spawn(
        config.concurrency,
        intake_rx,
        &mut tasks,
    );
    tasks.spawn(Dispatcher::new(db.clone(), &config, intake_tx).run(shutdown.clone()));
    tasks.spawn(Sweeper::new(db, &config, dead_letters).run(shutdown.clone()));

    tracing::info!(
        topic = %config.topic,
        concurrency = config.concurrency,
        max_attempts = config.max_attempts,
        "Consumer started"
    );

    Ok(ConsumerHandle {
        topic: config.topic,
        shutdown,
        tasks,
    })
}
