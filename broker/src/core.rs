use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("queue '{queue}' has not been declared")]
    UnknownQueue { queue: String },

    #[error("queue '{queue}' already has an active consumer")]
    ConsumerTaken { queue: String },

    #[error("queue '{queue}' is closed")]
    QueueClosed { queue: String },
}

/// The queue operations the cluster depends on.
///
/// Queues are declared by the first component to touch them; declaring an
/// existing queue is a no-op. Delivery is FIFO per queue, to at most one
/// consumer.
#[async_trait]
pub trait MessageBus: Debug + Send + Sync + 'static {
    /// Declare `queue`, creating it if it does not exist yet.
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), BusError>;

    /// Append a message to `queue`.
    ///
    /// Publishing does not require a consumer; messages accumulate until one
    /// attaches.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Attach the single consumer of `queue`.
    ///
    /// Fails with [`BusError::ConsumerTaken`] while another consumer is
    /// attached; dropping a consumer releases the queue.
    async fn consumer(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, BusError>;

    /// Return type (like `"memory"`) of this bus.
    fn type_name(&self) -> &'static str;
}

/// The receiving end of one queue.
#[async_trait]
pub trait QueueConsumer: Debug + Send + Sync {
    /// Await the next message in FIFO order.
    async fn recv(&mut self) -> Result<Vec<u8>, BusError>;
}
