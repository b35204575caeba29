//! The manager: fronts clients, owns the ring, detects failures, and
//! orchestrates recovery.
//!
//! Four cooperating tasks run over one shared [`ClusterView`]: the command
//! loop dispatching client lines, the relay loop forwarding node replies to
//! clients, the pong listener, and the pinger. All state transitions happen
//! under the view's mutex; broker publishes happen outside it.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use broker::{BusError, MessageBus, QueueConsumer};
use data_types::{
    replica_queue, storage_queue, Date, StorageId, CLIENT_RESPONSES, MANAGER_COMMANDS,
    MANAGER_PINGS, MANAGER_RESPONSES,
};
use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use protocol::{ClientRequest, CodecError, NodeCommand, NodeReply, StatusReply};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod ingest;
pub use ingest::{load_csv, IngestError, DATE_COLUMNS};

mod liveness;
pub use liveness::{ClusterView, Death, PongOutcome};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("broker failure: {0}")]
    Broker(#[from] BusError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Runtime knobs of the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Storage/replica pairs the cluster starts with.
    pub num_storages: u32,

    /// Declare queues as durable.
    pub durable: bool,

    /// Seconds slept between ping rounds.
    pub ping_interval: Duration,

    /// Consecutive missed pongs that declare a storage dead.
    pub max_retries: u32,

    /// Ring-key prefix for storage placement.
    pub hash_prefix: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            num_storages: 3,
            durable: false,
            ping_interval: Duration::from_secs(2),
            max_retries: 3,
            hash_prefix: "storage-".to_string(),
        }
    }
}

/// The manager service.
#[derive(Debug)]
pub struct Manager {
    bus: Arc<dyn MessageBus>,
    view: Arc<Mutex<ClusterView>>,
    config: ManagerConfig,
    command_consumer: Box<dyn QueueConsumer>,
    response_consumer: Box<dyn QueueConsumer>,
    pong_consumer: Box<dyn QueueConsumer>,
}

impl Manager {
    /// Declare every queue the manager touches and attach its consumers.
    pub async fn new(bus: Arc<dyn MessageBus>, config: ManagerConfig) -> Result<Self, ManagerError> {
        for queue in [
            MANAGER_COMMANDS,
            MANAGER_RESPONSES,
            MANAGER_PINGS,
            CLIENT_RESPONSES,
        ] {
            bus.declare(queue, config.durable).await?;
        }
        for id in (0..config.num_storages).map(StorageId::new) {
            bus.declare(&storage_queue(id), config.durable).await?;
            bus.declare(&replica_queue(id), config.durable).await?;
        }

        let view = ClusterView::new(
            &config.hash_prefix,
            (0..config.num_storages).map(StorageId::new),
            config.max_retries,
        );

        let command_consumer = bus.consumer(MANAGER_COMMANDS).await?;
        let response_consumer = bus.consumer(MANAGER_RESPONSES).await?;
        let pong_consumer = bus.consumer(MANAGER_PINGS).await?;
        Ok(Self {
            bus,
            view: Arc::new(Mutex::new(view)),
            config,
            command_consumer,
            response_consumer,
            pong_consumer,
        })
    }

    /// Shared handle on the cluster view, for tests and introspection.
    pub fn view(&self) -> Arc<Mutex<ClusterView>> {
        Arc::clone(&self.view)
    }

    /// Run all manager loops until shut down.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            num_storages = self.config.num_storages,
            ping_interval = ?self.config.ping_interval,
            max_retries = self.config.max_retries,
            "manager started"
        );
        let Self {
            bus,
            view,
            config,
            command_consumer,
            response_consumer,
            pong_consumer,
        } = self;

        tokio::join!(
            command_loop(
                Arc::clone(&bus),
                Arc::clone(&view),
                command_consumer,
                shutdown.clone()
            ),
            relay_loop(Arc::clone(&bus), response_consumer, shutdown.clone()),
            pong_loop(Arc::clone(&view), pong_consumer, shutdown.clone()),
            pinger_loop(bus, view, config, shutdown),
        );
        info!("manager stopped");
    }
}

/// Consume client command lines and dispatch them.
async fn command_loop(
    bus: Arc<dyn MessageBus>,
    view: Arc<Mutex<ClusterView>>,
    mut consumer: Box<dyn QueueConsumer>,
    shutdown: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = consumer.recv() => match msg {
                Ok(payload) => payload,
                Err(e) => {
                    error!(%e, "command queue failed");
                    break;
                }
            },
        };

        let request = match protocol::decode::<ClientRequest>(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(%e, "dropping malformed client request");
                continue;
            }
        };

        info!(command = %request.command, "client command");
        let reply = dispatch(&bus, &view, &request.command).await;
        match protocol::encode(&reply) {
            Ok(encoded) => {
                if let Err(e) = bus.publish(&request.reply_to, encoded).await {
                    error!(%e, reply_to = %request.reply_to, "failed to reply to client");
                }
            }
            Err(e) => error!(%e, "failed to encode a client reply"),
        }
    }
}

/// Parse and execute one client command line.
async fn dispatch(
    bus: &Arc<dyn MessageBus>,
    view: &Arc<Mutex<ClusterView>>,
    line: &str,
) -> StatusReply {
    let mut parts = line.split_whitespace();
    let verb = match parts.next() {
        Some(verb) => verb.to_uppercase(),
        None => return StatusReply::error("empty command"),
    };

    match verb.as_str() {
        "LOAD" => {
            let path = match parts.next() {
                Some(path) => path,
                None => return StatusReply::error("usage: LOAD <file>"),
            };
            match ingest::load_csv(bus, view, path).await {
                Ok(rows) => StatusReply::ok(format!("loaded {rows} rows from {path}")),
                Err(e) => {
                    warn!(%e, path, "ingest failed");
                    StatusReply::error(format!("failed to load {path}: {e}"))
                }
            }
        }
        "GET" => {
            let raw = match parts.next() {
                Some(raw) => raw,
                None => return StatusReply::error("usage: GET <date>"),
            };
            match send_get(bus, view, raw).await {
                Ok((date, target)) => {
                    debug!(%date, %target, "GET dispatched");
                    StatusReply::ok("GET sent")
                }
                Err(e) => StatusReply::error(e.to_string()),
            }
        }
        "KILL" => {
            let id = match parts.next().and_then(|raw| raw.parse::<u32>().ok()) {
                Some(id) => StorageId::new(id),
                None => return StatusReply::error("usage: KILL <storage id>"),
            };
            match send_kill(bus, id).await {
                Ok(()) => StatusReply::ok(format!("KILL sent to storage {id}")),
                Err(e) => StatusReply::error(e.to_string()),
            }
        }
        _ => StatusReply::error("unknown command"),
    }
}

#[derive(Debug, Error)]
enum DispatchError {
    #[error("'{raw}' is not a recognizable date")]
    BadDate { raw: String },

    #[error(transparent)]
    Routing(#[from] sharder::Error),

    #[error("broker failure: {0}")]
    Broker(#[from] BusError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Route a point lookup and forward it to the owning storage; the reply
/// comes back through `manager_responses` asynchronously.
async fn send_get(
    bus: &Arc<dyn MessageBus>,
    view: &Arc<Mutex<ClusterView>>,
    raw: &str,
) -> Result<(Date, StorageId), DispatchError> {
    let date = Date::parse_canonical(raw)
        .or_else(|_| Date::normalize(raw))
        .map_err(|_| DispatchError::BadDate {
            raw: raw.to_string(),
        })?;

    let target = view.lock().route(&date.to_string())?;
    let envelope = protocol::encode(&NodeCommand::Get {
        date: date.to_string(),
        reply_to: MANAGER_RESPONSES.to_string(),
    })?;
    bus.publish(&storage_queue(target), envelope).await?;
    Ok((date, target))
}

async fn send_kill(bus: &Arc<dyn MessageBus>, id: StorageId) -> Result<(), DispatchError> {
    let envelope = protocol::encode(&NodeCommand::Kill)?;
    bus.publish(&storage_queue(id), envelope).await?;
    Ok(())
}

/// Relay every node reply arriving on `manager_responses` verbatim to
/// `client_responses`.
async fn relay_loop(
    bus: Arc<dyn MessageBus>,
    mut consumer: Box<dyn QueueConsumer>,
    shutdown: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = consumer.recv() => match msg {
                Ok(payload) => payload,
                Err(e) => {
                    error!(%e, "response queue failed");
                    break;
                }
            },
        };
        debug!(bytes = payload.len(), "relaying node reply to clients");
        if let Err(e) = bus.publish(CLIENT_RESPONSES, payload).await {
            error!(%e, "failed to relay a node reply");
        }
    }
}

/// Consume PONGs and feed them into the liveness state.
async fn pong_loop(
    view: Arc<Mutex<ClusterView>>,
    mut consumer: Box<dyn QueueConsumer>,
    shutdown: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = consumer.recv() => match msg {
                Ok(payload) => payload,
                Err(e) => {
                    error!(%e, "ping queue failed");
                    break;
                }
            },
        };

        let reply = match protocol::decode::<NodeReply>(&payload) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%e, "dropping malformed pong");
                continue;
            }
        };

        match view.lock().observe_pong(reply.node_id) {
            PongOutcome::Accepted => debug!(node_id = %reply.node_id, "pong"),
            PongOutcome::IgnoredDead => {
                info!(node_id = %reply.node_id, "ignoring pong from a declared-dead storage")
            }
            PongOutcome::IgnoredUnexpected => {
                debug!(node_id = %reply.node_id, "ignoring pong with no outstanding ping")
            }
        }
    }
}

/// Ping live storages every `ping_interval`, reconcile missed pongs, and
/// drive recovery for any declared death.
async fn pinger_loop(
    bus: Arc<dyn MessageBus>,
    view: Arc<Mutex<ClusterView>>,
    config: ManagerConfig,
    shutdown: CancellationToken,
) {
    loop {
        let targets = view.lock().begin_ping_round(Instant::now());
        debug!(targets = targets.len(), "ping round");
        for id in targets {
            let ping = NodeCommand::Ping {
                reply_to: MANAGER_PINGS.to_string(),
            };
            match protocol::encode(&ping) {
                Ok(encoded) => {
                    if let Err(e) = bus.publish(&storage_queue(id), encoded).await {
                        warn!(node_id = %id, %e, "failed to ping storage");
                    }
                }
                Err(e) => error!(%e, "failed to encode a ping"),
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.ping_interval) => {}
        }

        let deaths = view.lock().end_ping_round();
        for death in deaths {
            warn!(node_id = %death.id, successor = ?death.successor, "recovering dead storage");
            if let Err(e) = relocate(&bus, death).await {
                error!(node_id = %death.id, %e, "failed to start recovery");
            }
        }
    }
}

/// Ask the dead node's replica to stream its mirror to the successor.
async fn relocate(bus: &Arc<dyn MessageBus>, death: Death) -> Result<(), ManagerError> {
    let successor = match death.successor {
        Some(successor) => successor,
        None => {
            error!(node_id = %death.id, "no live storage left to adopt the partition");
            return Ok(());
        }
    };
    let envelope = protocol::encode(&NodeCommand::Relocate {
        storage_id: successor,
        reply_to: MANAGER_RESPONSES.to_string(),
    })?;
    bus.publish(&replica_queue(death.id), envelope).await?;
    info!(node_id = %death.id, %successor, "RELOCATE dispatched");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use broker::MemoryBus;
    use pretty_assertions::assert_eq;

    struct Harness {
        bus: Arc<MemoryBus>,
        view: Arc<Mutex<ClusterView>>,
        shutdown: CancellationToken,
    }

    impl Harness {
        async fn start(config: ManagerConfig) -> Self {
            test_helpers::maybe_start_logging();
            let bus = Arc::new(MemoryBus::new());
            let manager = Manager::new(Arc::clone(&bus) as Arc<dyn MessageBus>, config)
                .await
                .unwrap();
            let view = manager.view();
            let shutdown = CancellationToken::new();
            tokio::spawn(manager.run(shutdown.clone()));
            Self {
                bus,
                view,
                shutdown,
            }
        }

        async fn send_command(&self, line: &str) {
            let request = ClientRequest {
                command: line.to_string(),
                reply_to: CLIENT_RESPONSES.to_string(),
            };
            self.bus
                .publish(MANAGER_COMMANDS, protocol::encode(&request).unwrap())
                .await
                .unwrap();
        }

        async fn recv<T: serde::de::DeserializeOwned>(&self, queue: &str) -> T {
            let mut consumer = self.bus.consumer(queue).await.unwrap();
            let payload = tokio::time::timeout(Duration::from_secs(5), consumer.recv())
                .await
                .expect("timed out waiting for a message")
                .unwrap();
            protocol::decode(&payload).unwrap()
        }
    }

    fn fast_config() -> ManagerConfig {
        ManagerConfig {
            num_storages: 2,
            ping_interval: Duration::from_millis(20),
            max_retries: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_commands_are_rejected() {
        let h = Harness::start(ManagerConfig::default()).await;

        h.send_command("FROBNICATE now").await;
        let reply: StatusReply = h.recv(CLIENT_RESPONSES).await;
        assert_eq!(reply, StatusReply::error("unknown command"));

        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn get_routes_an_envelope_and_acks_the_client() {
        let h = Harness::start(ManagerConfig {
            ping_interval: Duration::from_secs(3600),
            ..ManagerConfig::default()
        })
        .await;

        h.send_command("GET 2012-01-31").await;
        let reply: StatusReply = h.recv(CLIENT_RESPONSES).await;
        assert_eq!(reply, StatusReply::ok("GET sent"));

        let owner = h.view.lock().route("31-01-2012").unwrap();
        // skip the pings the manager may have sent in its first round
        let mut consumer = h.bus.consumer(&storage_queue(owner)).await.unwrap();
        loop {
            let envelope: NodeCommand = protocol::decode(&consumer.recv().await.unwrap()).unwrap();
            if let NodeCommand::Get { date, reply_to } = envelope {
                assert_eq!(date, "31-01-2012");
                assert_eq!(reply_to, MANAGER_RESPONSES);
                break;
            }
        }

        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn get_without_argument_is_an_error() {
        let h = Harness::start(ManagerConfig::default()).await;

        h.send_command("GET").await;
        let reply: StatusReply = h.recv(CLIENT_RESPONSES).await;
        assert_eq!(reply, StatusReply::error("usage: GET <date>"));

        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn load_of_a_missing_file_is_an_error() {
        let h = Harness::start(ManagerConfig::default()).await;

        h.send_command("LOAD no/such/file.csv").await;
        let reply: StatusReply = h.recv(CLIENT_RESPONSES).await;
        assert_matches!(reply.status, protocol::Status::Error);

        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn node_replies_are_relayed_verbatim() {
        let h = Harness::start(ManagerConfig {
            ping_interval: Duration::from_secs(3600),
            ..ManagerConfig::default()
        })
        .await;

        let reply = NodeReply::not_found(StorageId::new(1), "storage-1");
        h.bus
            .publish(MANAGER_RESPONSES, protocol::encode(&reply).unwrap())
            .await
            .unwrap();

        let relayed: NodeReply = h.recv(CLIENT_RESPONSES).await;
        assert_eq!(relayed, reply);

        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn silent_storages_are_declared_dead_and_relocated() {
        // nothing consumes the storage queues, so every ping goes unanswered
        let h = Harness::start(fast_config()).await;

        for _ in 0..500 {
            if h.view.lock().is_dead(StorageId::new(0)) && h.view.lock().is_dead(StorageId::new(1))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.view.lock().is_dead(StorageId::new(0)));
        assert!(!h.view.lock().ring_contains(StorageId::new(0)));

        // both died in the same round; the first declared found the other
        // still on the ring, the second found the ring empty
        let relocate: NodeCommand = h.recv("replica-0").await;
        assert_matches!(relocate, NodeCommand::Relocate { storage_id, reply_to } => {
            assert_eq!(storage_id, StorageId::new(1));
            assert_eq!(reply_to, MANAGER_RESPONSES);
        });
        assert_eq!(h.bus.depth("replica-1"), Some(0));

        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn pongs_keep_storages_alive() {
        let h = Harness::start(fast_config()).await;

        // a fake storage 0 that answers every ping
        let bus = Arc::clone(&h.bus);
        let ponger = tokio::spawn(async move {
            let mut consumer = bus.consumer("storage-0").await.unwrap();
            loop {
                let payload = consumer.recv().await.unwrap();
                if let Ok(NodeCommand::Ping { reply_to }) = protocol::decode(&payload) {
                    let pong = NodeReply::pong(StorageId::new(0), "storage-0");
                    bus.publish(&reply_to, protocol::encode(&pong).unwrap())
                        .await
                        .unwrap();
                }
            }
        });

        for _ in 0..500 {
            if h.view.lock().is_dead(StorageId::new(1)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.view.lock().is_dead(StorageId::new(1)));
        assert!(h.view.lock().is_live(StorageId::new(0)));

        ponger.abort();
        h.shutdown.cancel();
    }
}
