//! Dead-letter sinks.
//!
//! A sink is notified once for every message that exhausts its attempt
//! budget. The message itself stays in the outbox with status `dead`; the
//! sink decides how that is surfaced.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::message::Message;

/// Receives messages that reached the `Dead` state, together with the error
/// of their final attempt.
pub trait DeadLetterSink: Send + Sync + 'static {
    fn dead_letter<'a>(
        &'a self,
        message: &'a Message,
        error: &'a eyre::Report,
    ) -> BoxFuture<'a, eyre::Result<()>>;
}

/// Reports dead letters as `tracing` error events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DeadLetterSink for LogSink {
    fn dead_letter<'a>(
        &'a self,
        message: &'a Message,
        error: &'a eyre::Report,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin(async move {
            tracing::error!(
                message_id = message.id,
                topic = %message.topic,
                attempts = message.attempts,
                error = %error,
                "Message dead-lettered"
            );
            Ok(())
        })
    }
}

/// A dead-lettered message as forwarded by [`ChannelSink`].
#[derive(Debug)]
pub struct DeadLetter {
    pub message: Message,
    /// Rendered error of the final attempt
    pub error: String,
}

/// Forwards dead letters over a channel, e.g. to an alerting task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelSink {
    /// Creates a sink and the receiving half of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DeadLetterSink for ChannelSink {
    fn dead_letter<'a>(
        &'a self,
        message: &'a Message,
        error: &'a eyre::Report,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        let letter = DeadLetter {
            message: message.clone(),
            error: format!("{error:#}"),
        };

        Box::pin(async move {
            self.tx
                .send(letter)
                .map_err(|_| eyre::eyre!("Dead-letter receiver dropped"))
        })
    }
}
