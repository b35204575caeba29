//! Implementation of the `run` subcommand.

use broker::{MemoryBus, MessageBus};
use cluster::{Cluster, ClusterConfig};
use observability_deps::tracing::info;
use snafu::{ResultExt, Snafu};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::console;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid log filter '{}': {}", filter, source))]
    LogFilter {
        filter: String,
        source: tracing_subscriber::filter::ParseError,
    },

    #[snafu(display("Cannot start cluster: {}", source))]
    ClusterStartup { source: cluster::ClusterError },

    #[snafu(display("Console failed: {}", source))]
    Console { source: console::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
#[clap(
    name = "run",
    about = "Run an in-process stratus cluster",
    long_about = "Run an in-process stratus cluster.\n\nStarts the manager, \
    the configured number of storage/replica pairs and the showcase over an \
    in-memory broker, then serves an operator console on stdin. The \
    configuration options below can be set either with command line flags \
    or with the specified environment variable."
)]
pub struct Config {
    /// Log filter directives, e.g. "info" or "manager=debug,info"
    #[clap(
        long = "--log-filter",
        env = "STRATUS_LOG_FILTER",
        default_value = "info",
        action
    )]
    log_filter: String,

    /// Number of storage/replica pairs at startup
    #[clap(
        long = "--num-storages",
        env = "STRATUS_NUM_STORAGES",
        default_value = "3",
        action
    )]
    num_storages: u32,

    /// Declare broker queues as durable
    #[clap(long = "--durability", env = "STRATUS_DURABILITY", action)]
    durability: bool,

    /// Seconds between liveness ping rounds
    #[clap(
        long = "--ping-interval",
        env = "STRATUS_PING_INTERVAL",
        default_value = "2",
        action
    )]
    ping_interval_seconds: u64,

    /// Consecutive missed pongs that declare a storage dead
    #[clap(
        long = "--max-retries",
        env = "STRATUS_MAX_RETRIES",
        default_value = "3",
        action
    )]
    max_retries: u32,

    /// Date buckets per RELOCATE chunk during recovery
    #[clap(
        long = "--chunk-size",
        env = "STRATUS_CHUNK_SIZE",
        default_value = "1000",
        action
    )]
    chunk_size: usize,

    /// Ring-key prefix for storage placement
    #[clap(
        long = "--hash-prefix",
        env = "STRATUS_HASH_PREFIX",
        default_value = "storage-",
        action
    )]
    hash_prefix: String,

    /// Acknowledge every restore chunk instead of only the terminal one
    #[clap(long = "--ack-every-chunk", env = "STRATUS_ACK_EVERY_CHUNK", action)]
    ack_every_chunk: bool,

    /// Log every ingest and mirror step (debug-level node logging)
    #[clap(long = "--print-each-step", env = "STRATUS_PRINT_EACH_STEP", action)]
    print_each_step: bool,

    /// Keep ping-round logging quiet unless a death is declared
    #[clap(
        long = "--print-only-if-dead",
        env = "STRATUS_PRINT_ONLY_IF_DEAD",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    print_only_if_dead: bool,

    /// Log every applied restore chunk
    #[clap(
        long = "--print-every-chunk",
        env = "STRATUS_PRINT_EVERY_CHUNK",
        action
    )]
    print_every_chunk: bool,
}

impl Config {
    fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            num_storages: self.num_storages,
            durability: self.durability,
            ping_interval: Duration::from_secs(self.ping_interval_seconds),
            max_retries: self.max_retries,
            chunk_size: self.chunk_size,
            hash_prefix: self.hash_prefix.clone(),
            ack_every_chunk: self.ack_every_chunk,
            print_each_step: self.print_each_step,
            print_only_if_dead: self.print_only_if_dead,
            print_every_chunk: self.print_every_chunk,
        }
    }

    /// The effective filter: the base directives plus whatever the
    /// verbosity toggles pull up to debug.
    fn log_filter(&self) -> String {
        let mut filter = self.log_filter.clone();
        if self.print_each_step {
            filter.push_str(",manager=debug,storage=debug,showcase=debug");
        }
        if self.print_every_chunk {
            filter.push_str(",storage=debug");
        }
        if !self.print_only_if_dead {
            filter.push_str(",manager=debug");
        }
        filter
    }
}

pub async fn command(config: Config) -> Result<()> {
    let filter = config.log_filter();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).context(LogFilterSnafu { filter })?)
        .init();

    let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
    let cluster = Cluster::start(config.cluster_config(), Arc::clone(&bus))
        .await
        .context(ClusterStartupSnafu)?;

    info!("cluster is up");
    console::run(bus).await.context(ConsoleSnafu)?;

    cluster.shutdown().await;
    Ok(())
}
