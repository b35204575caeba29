//! Cluster assembly: starts every role as an independent task over one
//! shared bus.
//!
//! Roles share nothing but the bus, so swapping the in-memory bus for a
//! networked broker binding turns the same wiring into separate processes.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use broker::{BusError, MessageBus};
use data_types::StorageId;
use manager::{ClusterView, Manager, ManagerConfig};
use observability_deps::tracing::info;
use parking_lot::Mutex;
use showcase::Showcase;
use std::sync::Arc;
use std::time::Duration;
use storage::{ReplicaConfig, ReplicaNode, StorageConfig, StorageNode};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod client;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("broker failure: {0}")]
    Broker(#[from] BusError),

    #[error("failed to start a storage or replica node: {0}")]
    Node(#[from] storage::NodeError),

    #[error("failed to start the showcase: {0}")]
    Showcase(#[from] showcase::ShowcaseError),

    #[error("failed to start the manager: {0}")]
    Manager(#[from] manager::ManagerError),
}

/// The single static configuration surface of a cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Storage/replica pairs at startup.
    pub num_storages: u32,

    /// Declare broker queues as durable.
    pub durability: bool,

    /// Seconds between ping rounds.
    pub ping_interval: Duration,

    /// Consecutive missed pongs that declare death.
    pub max_retries: u32,

    /// Date buckets per RELOCATE chunk.
    pub chunk_size: usize,

    /// Ring-key prefix for storages.
    pub hash_prefix: String,

    /// Acknowledge every restore chunk instead of only the terminal one.
    pub ack_every_chunk: bool,

    /// Log every ingest step. Mapped onto debug-level logging by the binary.
    pub print_each_step: bool,

    /// Keep ping-round logging quiet unless a death is declared.
    pub print_only_if_dead: bool,

    /// Log every applied restore chunk.
    pub print_every_chunk: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_storages: 3,
            durability: false,
            ping_interval: Duration::from_secs(2),
            max_retries: 3,
            chunk_size: 1000,
            hash_prefix: "storage-".to_string(),
            ack_every_chunk: false,
            print_each_step: false,
            print_only_if_dead: true,
            print_every_chunk: false,
        }
    }
}

/// A running cluster: every role spawned, plus the handles to stop it.
#[derive(Debug)]
pub struct Cluster {
    bus: Arc<dyn MessageBus>,
    view: Arc<Mutex<ClusterView>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Start showcase, replicas, storages and manager over `bus`.
    ///
    /// Startup order follows data flow: consumers attach before the manager
    /// starts pinging and routing, so nothing published at startup is ever
    /// stuck behind a missing queue.
    pub async fn start(
        config: ClusterConfig,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self, ClusterError> {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let showcase = Showcase::new(Arc::clone(&bus), config.durability).await?;
        tasks.push(tokio::spawn(showcase.run(shutdown.clone())));

        for id in (0..config.num_storages).map(StorageId::new) {
            let replica = ReplicaNode::new(
                id,
                Arc::clone(&bus),
                ReplicaConfig {
                    durable: config.durability,
                    chunk_size: config.chunk_size,
                },
            )
            .await?;
            tasks.push(tokio::spawn(replica.run(shutdown.clone())));

            let storage = StorageNode::new(
                id,
                Arc::clone(&bus),
                StorageConfig {
                    durable: config.durability,
                    ack_every_chunk: config.ack_every_chunk,
                },
            )
            .await?;
            tasks.push(tokio::spawn(storage.run(shutdown.clone())));
        }

        let manager = Manager::new(
            Arc::clone(&bus),
            ManagerConfig {
                num_storages: config.num_storages,
                durable: config.durability,
                ping_interval: config.ping_interval,
                max_retries: config.max_retries,
                hash_prefix: config.hash_prefix.clone(),
            },
        )
        .await?;
        let view = manager.view();
        tasks.push(tokio::spawn(manager.run(shutdown.clone())));

        info!(
            num_storages = config.num_storages,
            bus = bus.type_name(),
            "cluster started"
        );
        Ok(Self {
            bus,
            view,
            shutdown,
            tasks,
        })
    }

    /// The bus every role is attached to.
    pub fn bus(&self) -> Arc<dyn MessageBus> {
        Arc::clone(&self.bus)
    }

    /// The manager's cluster view, for tests and introspection.
    pub fn view(&self) -> Arc<Mutex<ClusterView>> {
        Arc::clone(&self.view)
    }

    /// Stop every role and wait for the tasks to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            // a panicked role already logged; nothing to unwind here
            let _ = task.await;
        }
        info!("cluster stopped");
    }
}
