//! In-process [`MessageBus`] implementation.

use crate::{BusError, MessageBus, QueueConsumer};
use async_trait::async_trait;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueState {
    durable: bool,
    messages: VecDeque<Vec<u8>>,
    consumer_attached: bool,
}

#[derive(Debug, Default)]
struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// An in-memory bus shared by every role of an in-process cluster.
///
/// Queues live for the lifetime of the bus, independent of consumers; a
/// publish into a queue whose consumer is gone simply accumulates, exactly
/// like publishing into a broker queue whose node has died.
#[derive(Debug, Default)]
pub struct MemoryBus {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.lock().get(name).map(Arc::clone)
    }

    /// Number of messages currently sitting in `queue`, for tests and
    /// introspection.
    pub fn depth(&self, queue: &str) -> Option<usize> {
        self.queue(queue).map(|q| q.state.lock().messages.len())
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), BusError> {
        let mut queues = self.queues.lock();
        queues.entry(queue.to_string()).or_insert_with(|| {
            debug!(queue, durable, "declared queue");
            Arc::new(Queue {
                state: Mutex::new(QueueState {
                    durable,
                    ..Default::default()
                }),
                notify: Notify::new(),
            })
        });
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let q = self.queue(queue).ok_or_else(|| BusError::UnknownQueue {
            queue: queue.to_string(),
        })?;
        q.state.lock().messages.push_back(payload);
        q.notify.notify_one();
        Ok(())
    }

    async fn consumer(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, BusError> {
        let q = self.queue(queue).ok_or_else(|| BusError::UnknownQueue {
            queue: queue.to_string(),
        })?;
        {
            let mut state = q.state.lock();
            if state.consumer_attached {
                return Err(BusError::ConsumerTaken {
                    queue: queue.to_string(),
                });
            }
            state.consumer_attached = true;
        }
        Ok(Box::new(MemoryConsumer {
            queue_name: queue.to_string(),
            queue: q,
        }))
    }

    fn type_name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Debug)]
pub struct MemoryConsumer {
    queue_name: String,
    queue: Arc<Queue>,
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn recv(&mut self) -> Result<Vec<u8>, BusError> {
        loop {
            // grab the wakeup permit before checking, so a publish racing
            // with the check cannot be lost
            let notified = self.queue.notify.notified();
            if let Some(msg) = self.queue.state.lock().messages.pop_front() {
                return Ok(msg);
            }
            notified.await;
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.queue.state.lock().consumer_attached = false;
        debug!(queue = %self.queue_name, "consumer detached");
    }
}
