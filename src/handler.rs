use std::future::Future;

use futures_util::future::BoxFuture;

use crate::message::Message;

/// Processes the messages of one topic.
///
/// Returning `Ok(())` marks the message done. Any error counts as a failed
/// attempt: the message is retried after a backoff or, once the consumer's
/// attempt budget is spent, dead-lettered. Handlers must tolerate seeing the
/// same message more than once.
pub trait Handler: Send + Sync + 'static {
    fn handle<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, eyre::Result<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    fn handle<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin(self(message.clone()))
    }
}
