//! The replica node: passive mirror of one storage, source of truth during
//! relocation.

use crate::{merge_chunk, Dataset, NodeError};
use broker::{MessageBus, QueueConsumer};
use data_types::{replica_queue, storage_queue, Date, Record, StorageId, MANAGER_RESPONSES};
use observability_deps::tracing::{debug, error, info, warn};
use protocol::{ChunkData, NodeCommand, NodeReply};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runtime knobs of a replica node.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaConfig {
    /// Declare queues as durable.
    pub durable: bool,

    /// Date buckets per LOAD_2 envelope when streaming a restore.
    pub chunk_size: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            durable: false,
            chunk_size: 1000,
        }
    }
}

/// A replica node: consumes its `replica-{id}` queue, mirrors its paired
/// storage's dataset, and on RELOCATE streams that mirror to a designated
/// new owner before exiting.
#[derive(Debug)]
pub struct ReplicaNode {
    storage_id: StorageId,
    queue_name: String,
    config: ReplicaConfig,
    data: Dataset,
    bus: Arc<dyn MessageBus>,
    consumer: Box<dyn QueueConsumer>,
}

impl ReplicaNode {
    /// Declare this node's queues and attach to its input queue.
    pub async fn new(
        storage_id: StorageId,
        bus: Arc<dyn MessageBus>,
        config: ReplicaConfig,
    ) -> Result<Self, NodeError> {
        let queue_name = replica_queue(storage_id);
        bus.declare(&queue_name, config.durable).await?;
        bus.declare(MANAGER_RESPONSES, config.durable).await?;

        let consumer = bus.consumer(&queue_name).await?;
        Ok(Self {
            storage_id,
            queue_name,
            config,
            data: Dataset::new(),
            bus,
            consumer,
        })
    }

    /// Consume commands until relocated away or shut down.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(node_id = %self.storage_id, queue = %self.queue_name, "replica node started");
        loop {
            let payload = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = self.consumer.recv() => match msg {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(node_id = %self.storage_id, %e, "input queue failed");
                        break;
                    }
                },
            };

            let command = match protocol::decode::<NodeCommand>(&payload) {
                Ok(command) => command,
                Err(e) => {
                    warn!(node_id = %self.storage_id, %e, "dropping malformed envelope");
                    continue;
                }
            };

            match self.handle(command).await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(e) => error!(node_id = %self.storage_id, %e, "command handler failed"),
            }
        }
        info!(node_id = %self.storage_id, "replica node stopped");
    }

    async fn handle(&mut self, command: NodeCommand) -> Result<ControlFlow<()>, NodeError> {
        match command {
            NodeCommand::Copy { data } => self.handle_copy(data)?,
            NodeCommand::CopyChunk { data, chunk_id, .. } => {
                merge_chunk(&mut self.data, data);
                debug!(node_id = %self.storage_id, chunk_id, "mirrored restore chunk");
            }
            NodeCommand::Get { date, reply_to } => self.handle_get(&date, &reply_to).await?,
            NodeCommand::Relocate {
                storage_id,
                reply_to,
            } => {
                self.relocate(storage_id, &reply_to).await?;
                return Ok(ControlFlow::Break(()));
            }
            NodeCommand::Load { .. }
            | NodeCommand::LoadChunk { .. }
            | NodeCommand::Ping { .. }
            | NodeCommand::Kill => {
                warn!(node_id = %self.storage_id, ?command, "unknown command for a replica node, dropping");
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn handle_copy(&mut self, data: Record) -> Result<(), NodeError> {
        let date = data.date_parsed().ok_or(NodeError::MissingDate)?;
        self.data.entry(date).or_default().push(data);
        debug!(node_id = %self.storage_id, %date, "mirrored record");
        Ok(())
    }

    async fn handle_get(&mut self, date: &str, reply_to: &str) -> Result<(), NodeError> {
        let reply = match Date::parse_canonical(date)
            .ok()
            .and_then(|date| self.data.get(&date))
        {
            Some(bucket) => NodeReply::records(self.storage_id, &self.queue_name, bucket.clone()),
            None => NodeReply::not_found(self.storage_id, &self.queue_name),
        };
        self.bus
            .publish(reply_to, protocol::encode(&reply)?)
            .await?;
        Ok(())
    }

    /// Stream the whole mirror to the new owner in `chunk_size` buckets,
    /// with monotonically increasing chunk ids.
    async fn relocate(&mut self, new_owner: StorageId, reply_to: &str) -> Result<(), NodeError> {
        let target_queue = storage_queue(new_owner);
        let chunk_size = self.config.chunk_size.max(1);
        let buckets: Vec<(Date, Vec<Record>)> = std::mem::take(&mut self.data).into_iter().collect();
        let total_chunks = (buckets.len() + chunk_size - 1) / chunk_size;

        for (chunk_id, chunk) in buckets.chunks(chunk_size).enumerate() {
            let data: ChunkData = chunk.iter().cloned().collect();
            let envelope = protocol::encode(&NodeCommand::LoadChunk {
                data,
                replica_id: self.storage_id,
                chunk_id,
                total_chunks,
                reply_to: reply_to.to_string(),
            })?;
            self.bus.publish(&target_queue, envelope).await?;
            debug!(
                node_id = %self.storage_id,
                %new_owner,
                chunk_id,
                total_chunks,
                "dispatched restore chunk"
            );
        }

        info!(
            node_id = %self.storage_id,
            %new_owner,
            total_chunks,
            "relocation complete, shutting down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use broker::MemoryBus;
    use pretty_assertions::assert_eq;
    use protocol::ReplyData;
    use serde_json::json;
    use std::time::Duration;

    const REPLY_QUEUE: &str = "test-replies";

    struct Harness {
        bus: Arc<MemoryBus>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        async fn start(id: u32, config: ReplicaConfig) -> Self {
            test_helpers::maybe_start_logging();
            let bus = Arc::new(MemoryBus::new());
            bus.declare(REPLY_QUEUE, false).await.unwrap();

            let node = ReplicaNode::new(
                StorageId::new(id),
                Arc::clone(&bus) as Arc<dyn MessageBus>,
                config,
            )
            .await
            .unwrap();

            let shutdown = CancellationToken::new();
            let task = tokio::spawn(node.run(shutdown.clone()));
            Self {
                bus,
                shutdown,
                task,
            }
        }

        async fn send(&self, queue: &str, command: &NodeCommand) {
            self.bus
                .publish(queue, protocol::encode(command).unwrap())
                .await
                .unwrap();
        }
    }

    fn record(date: &str, tag: i64) -> Record {
        let mut r = Record::new();
        r.set_date_parsed(Date::parse_canonical(date).unwrap());
        r.insert("tag", json!(tag));
        r
    }

    #[tokio::test]
    async fn copies_are_mirrored_and_readable() {
        let h = Harness::start(1, ReplicaConfig::default()).await;

        h.send("replica-1", &NodeCommand::Copy { data: record("05-05-2005", 1) })
            .await;
        h.send(
            "replica-1",
            &NodeCommand::Get {
                date: "05-05-2005".to_string(),
                reply_to: REPLY_QUEUE.to_string(),
            },
        )
        .await;

        let mut consumer = h.bus.consumer(REPLY_QUEUE).await.unwrap();
        let reply: NodeReply =
            protocol::decode(&consumer.recv().await.unwrap()).unwrap();
        assert_eq!(reply.node_id, StorageId::new(1));
        assert_eq!(reply.queue_name, "replica-1");
        assert_matches!(reply.data, ReplyData::Records(records) => {
            assert_eq!(records, vec![record("05-05-2005", 1)]);
        });

        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn relocate_streams_ordered_chunks_then_exits() {
        let h = Harness::start(
            1,
            ReplicaConfig {
                chunk_size: 2,
                ..Default::default()
            },
        )
        .await;
        // target queue must exist before the replica streams into it
        h.bus.declare("storage-2", false).await.unwrap();

        // five distinct dates -> 3 chunks of at most 2 buckets
        for day in 1..=5 {
            h.send(
                "replica-1",
                &NodeCommand::Copy {
                    data: record(&format!("{day:02}-06-2010"), day),
                },
            )
            .await;
        }
        h.send(
            "replica-1",
            &NodeCommand::Relocate {
                storage_id: StorageId::new(2),
                reply_to: MANAGER_RESPONSES.to_string(),
            },
        )
        .await;

        // the replica terminates after streaming
        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .expect("replica should exit after RELOCATE")
            .unwrap();

        let mut target = h.bus.consumer("storage-2").await.unwrap();
        let mut seen_dates = 0;
        for expected_chunk in 0..3 {
            let envelope: NodeCommand =
                protocol::decode(&target.recv().await.unwrap()).unwrap();
            assert_matches!(envelope, NodeCommand::LoadChunk {
                data,
                replica_id,
                chunk_id,
                total_chunks,
                reply_to,
            } => {
                assert_eq!(replica_id, StorageId::new(1));
                assert_eq!(chunk_id, expected_chunk);
                assert_eq!(total_chunks, 3);
                assert_eq!(reply_to, MANAGER_RESPONSES);
                seen_dates += data.len();
            });
        }
        assert_eq!(seen_dates, 5);
        assert_eq!(h.bus.depth("storage-2"), Some(0));
    }

    #[tokio::test]
    async fn relocate_of_an_empty_mirror_sends_nothing() {
        let h = Harness::start(0, ReplicaConfig::default()).await;
        h.bus.declare("storage-1", false).await.unwrap();

        h.send(
            "replica-0",
            &NodeCommand::Relocate {
                storage_id: StorageId::new(1),
                reply_to: MANAGER_RESPONSES.to_string(),
            },
        )
        .await;

        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .expect("replica should exit after RELOCATE")
            .unwrap();
        assert_eq!(h.bus.depth("storage-1"), Some(0));
    }

    #[tokio::test]
    async fn copy_chunks_overwrite_buckets() {
        let h = Harness::start(2, ReplicaConfig::default()).await;
        let date = Date::parse_canonical("01-01-2000").unwrap();

        h.send("replica-2", &NodeCommand::Copy { data: record("01-01-2000", 1) })
            .await;
        h.send(
            "replica-2",
            &NodeCommand::CopyChunk {
                data: [(date, vec![record("01-01-2000", 2), record("01-01-2000", 3)])]
                    .into_iter()
                    .collect(),
                replica_id: StorageId::new(0),
                chunk_id: 0,
                total_chunks: 1,
            },
        )
        .await;
        h.send(
            "replica-2",
            &NodeCommand::Get {
                date: "01-01-2000".to_string(),
                reply_to: REPLY_QUEUE.to_string(),
            },
        )
        .await;

        let mut consumer = h.bus.consumer(REPLY_QUEUE).await.unwrap();
        let reply: NodeReply =
            protocol::decode(&consumer.recv().await.unwrap()).unwrap();
        assert_matches!(reply.data, ReplyData::Records(records) => {
            assert_eq!(records, vec![record("01-01-2000", 2), record("01-01-2000", 3)]);
        });

        h.shutdown.cancel();
    }
}
