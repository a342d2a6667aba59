//! Transactional outbox with at-least-once delivery over SQLite.
//!
//! Messages are written in the same transaction as the business change that
//! produced them ([`outbox::publish`]). A consumer per topic
//! ([`service::Service::spawn`]) claims due messages, runs the topic's handler
//! on a fixed number of workers, retries failures with exponential backoff and
//! dead-letters messages that exhaust their attempts.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod backoff;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod message;
pub mod outbox;
pub mod pool;
pub mod service;
pub mod sweeper;
pub mod topic;

/// Installs the global `tracing` subscriber, filtered by `COURIER_LOG`.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("COURIER_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
