//! The storage node: primary owner of a partition of dates.

use crate::{merge_chunk, Dataset, NodeError};
use broker::{MessageBus, QueueConsumer};
use data_types::{
    replica_queue, storage_queue, Date, StorageId, MANAGER_PINGS, MANAGER_RESPONSES, SHOWCASE_DATA,
};
use observability_deps::tracing::{debug, error, info, warn};
use protocol::{NodeCommand, NodeReply, RestoreProgress};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runtime knobs of a storage node.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageConfig {
    /// Declare queues as durable.
    pub durable: bool,

    /// Report restore progress for every chunk instead of only the terminal
    /// one.
    pub ack_every_chunk: bool,
}

/// A storage node: consumes its `storage-{id}` queue, owns the in-memory
/// dataset for its ring partition, mirrors every write to its paired replica
/// and to the showcase.
#[derive(Debug)]
pub struct StorageNode {
    id: StorageId,
    queue_name: String,
    replica_queue: String,
    config: StorageConfig,
    data: Dataset,
    bus: Arc<dyn MessageBus>,
    consumer: Box<dyn QueueConsumer>,
}

impl StorageNode {
    /// Declare this node's queues and attach to its input queue.
    pub async fn new(
        id: StorageId,
        bus: Arc<dyn MessageBus>,
        config: StorageConfig,
    ) -> Result<Self, NodeError> {
        let queue_name = storage_queue(id);
        let replica_queue = replica_queue(id);

        bus.declare(&queue_name, config.durable).await?;
        bus.declare(&replica_queue, config.durable).await?;
        bus.declare(SHOWCASE_DATA, config.durable).await?;
        bus.declare(MANAGER_RESPONSES, config.durable).await?;
        bus.declare(MANAGER_PINGS, config.durable).await?;

        let consumer = bus.consumer(&queue_name).await?;
        Ok(Self {
            id,
            queue_name,
            replica_queue,
            config,
            data: Dataset::new(),
            bus,
            consumer,
        })
    }

    /// Consume commands until killed or shut down.
    ///
    /// Handler errors are logged and never end the loop; only KILL (or
    /// cluster shutdown) does.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(node_id = %self.id, queue = %self.queue_name, "storage node started");
        loop {
            let payload = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = self.consumer.recv() => match msg {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(node_id = %self.id, %e, "input queue failed");
                        break;
                    }
                },
            };

            let command = match protocol::decode::<NodeCommand>(&payload) {
                Ok(command) => command,
                Err(e) => {
                    warn!(node_id = %self.id, %e, "dropping malformed envelope");
                    continue;
                }
            };

            match self.handle(command).await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(e) => error!(node_id = %self.id, %e, "command handler failed"),
            }
        }
        info!(node_id = %self.id, "storage node stopped");
    }

    async fn handle(&mut self, command: NodeCommand) -> Result<ControlFlow<()>, NodeError> {
        match command {
            NodeCommand::Load { data } => self.handle_load(data).await?,
            NodeCommand::Get { date, reply_to } => self.handle_get(&date, &reply_to).await?,
            NodeCommand::Ping { reply_to } => {
                let pong = NodeReply::pong(self.id, &self.queue_name);
                self.reply(&reply_to, &pong).await?;
            }
            NodeCommand::Kill => {
                warn!(node_id = %self.id, "KILL received, simulating death");
                return Ok(ControlFlow::Break(()));
            }
            NodeCommand::LoadChunk {
                data,
                replica_id,
                chunk_id,
                total_chunks,
                reply_to,
            } => {
                self.handle_restore_chunk(data, replica_id, chunk_id, total_chunks, &reply_to)
                    .await?
            }
            NodeCommand::Copy { .. } | NodeCommand::CopyChunk { .. } | NodeCommand::Relocate { .. } => {
                warn!(node_id = %self.id, ?command, "unknown command for a storage node, dropping");
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn handle_load(&mut self, data: data_types::Record) -> Result<(), NodeError> {
        let date = data.date_parsed().ok_or(NodeError::MissingDate)?;
        self.data.entry(date).or_default().push(data.clone());
        debug!(node_id = %self.id, %date, "stored record");

        // mirror first, showcase copy second; per-queue FIFO keeps both in
        // ingest order
        let copy = protocol::encode(&NodeCommand::Copy { data: data.clone() })?;
        self.bus.publish(&self.replica_queue, copy).await?;

        let showcase_copy = protocol::encode(&NodeCommand::Load { data })?;
        self.bus.publish(SHOWCASE_DATA, showcase_copy).await?;
        Ok(())
    }

    async fn handle_get(&mut self, date: &str, reply_to: &str) -> Result<(), NodeError> {
        let reply = match Date::parse_canonical(date)
            .ok()
            .and_then(|date| self.data.get(&date))
        {
            Some(bucket) => {
                debug!(node_id = %self.id, date, hits = bucket.len(), "GET hit");
                NodeReply::records(self.id, &self.queue_name, bucket.clone())
            }
            None => {
                debug!(node_id = %self.id, date, "GET miss");
                NodeReply::not_found(self.id, &self.queue_name)
            }
        };
        self.reply(reply_to, &reply).await
    }

    async fn handle_restore_chunk(
        &mut self,
        data: protocol::ChunkData,
        replica_id: StorageId,
        chunk_id: usize,
        total_chunks: usize,
        reply_to: &str,
    ) -> Result<(), NodeError> {
        let dates = data.len();
        merge_chunk(&mut self.data, data.clone());
        debug!(
            node_id = %self.id,
            %replica_id,
            chunk_id,
            total_chunks,
            dates,
            "merged restore chunk"
        );

        // keep the paired mirror in sync with the adopted partition
        let echo = protocol::encode(&NodeCommand::CopyChunk {
            data,
            replica_id,
            chunk_id,
            total_chunks,
        })?;
        self.bus.publish(&self.replica_queue, echo).await?;

        let progress = RestoreProgress {
            node_id: self.id,
            replica_id,
            chunk_id,
            total_chunks,
            message: format!(
                "storage {} applied chunk {}/{} from replica {}",
                self.id,
                chunk_id + 1,
                total_chunks,
                replica_id
            ),
        };
        if self.config.ack_every_chunk || progress.is_terminal() {
            if progress.is_terminal() {
                info!(node_id = %self.id, %replica_id, total_chunks, "restore complete");
            }
            self.reply(reply_to, &progress).await?;
        }
        Ok(())
    }

    async fn reply<T: serde::Serialize>(&self, reply_to: &str, msg: &T) -> Result<(), NodeError> {
        self.bus.publish(reply_to, protocol::encode(msg)?).await?;
        Ok(())
    }
}
