//! The showcase: an independent aggregation service that consumes mirrored
//! ingests and answers temperature range queries.
//!
//! Ingest events and client requests arrive on separate queues and are
//! handled by separate tasks; a single mutex serializes every read and write
//! of the index between them.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use broker::{BusError, MessageBus, QueueConsumer};
use data_types::{Date, DateError, CLIENT_RESPONSES, SHOWCASE_DATA, SHOWCASE_REQUESTS};
use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use protocol::{
    CodecError, NodeCommand, RangeAvgReply, RangeReply, RangeStatus, ShowcaseFailure,
    ShowcaseRequest, SHOWCASE_RANGE, SHOWCASE_RANGE_AVG,
};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod extract;
pub use extract::{extract_sample, ExtractError, Sample};

mod index;
pub use index::{round, MeanIndex, MeanState, RangeResult};

#[derive(Debug, Error)]
pub enum ShowcaseError {
    #[error("broker failure: {0}")]
    Broker(#[from] BusError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Date(#[from] DateError),

    #[error("record is missing its date_parsed field")]
    MissingDate,
}

/// The showcase service.
#[derive(Debug)]
pub struct Showcase {
    bus: Arc<dyn MessageBus>,
    index: Arc<Mutex<MeanIndex>>,
    data_consumer: Box<dyn QueueConsumer>,
    request_consumer: Box<dyn QueueConsumer>,
}

impl Showcase {
    /// Declare the showcase queues and attach to both inputs.
    pub async fn new(bus: Arc<dyn MessageBus>, durable: bool) -> Result<Self, ShowcaseError> {
        bus.declare(SHOWCASE_DATA, durable).await?;
        bus.declare(SHOWCASE_REQUESTS, durable).await?;
        bus.declare(CLIENT_RESPONSES, durable).await?;

        let data_consumer = bus.consumer(SHOWCASE_DATA).await?;
        let request_consumer = bus.consumer(SHOWCASE_REQUESTS).await?;
        Ok(Self {
            bus,
            index: Arc::new(Mutex::new(MeanIndex::new())),
            data_consumer,
            request_consumer,
        })
    }

    /// Shared handle on the index, for tests and introspection.
    pub fn index(&self) -> Arc<Mutex<MeanIndex>> {
        Arc::clone(&self.index)
    }

    /// Run both consume loops until shut down.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("showcase started");
        let Self {
            bus,
            index,
            data_consumer,
            request_consumer,
        } = self;

        let data_loop = ingest_loop(
            Arc::clone(&bus),
            Arc::clone(&index),
            data_consumer,
            shutdown.clone(),
        );
        let request_loop = request_loop(bus, index, request_consumer, shutdown);
        tokio::join!(data_loop, request_loop);
        info!("showcase stopped");
    }
}

/// Consume mirrored LOAD envelopes and fold them into the index.
async fn ingest_loop(
    bus: Arc<dyn MessageBus>,
    index: Arc<Mutex<MeanIndex>>,
    mut consumer: Box<dyn QueueConsumer>,
    shutdown: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = consumer.recv() => match msg {
                Ok(payload) => payload,
                Err(e) => {
                    error!(%e, "showcase data queue failed");
                    break;
                }
            },
        };

        if let Err(e) = apply_ingest(&index, &payload) {
            warn!(%e, "failed to fold a record into the showcase");
            let failure = ShowcaseFailure::new(e.to_string());
            if let Err(e) = publish(&bus, CLIENT_RESPONSES, &failure).await {
                error!(%e, "failed to report a showcase ingest failure");
            }
        }
    }
}

fn apply_ingest(index: &Mutex<MeanIndex>, payload: &[u8]) -> Result<(), ShowcaseError> {
    let record = match protocol::decode::<NodeCommand>(payload)? {
        NodeCommand::Load { data } => data,
        other => {
            warn!(?other, "unknown command on the showcase data queue, dropping");
            return Ok(());
        }
    };
    let date = record.date_parsed().ok_or(ShowcaseError::MissingDate)?;

    let sample = match extract_sample(&record)? {
        Some(sample) => sample,
        None => {
            debug!(%date, "record carries no usable temperature, dropped");
            return Ok(());
        }
    };

    index.lock().record(date, sample);
    debug!(%date, temperature = sample.temperature, weight = sample.weight, "folded sample");
    Ok(())
}

/// Consume range queries and reply to their `reply_to` queues.
async fn request_loop(
    bus: Arc<dyn MessageBus>,
    index: Arc<Mutex<MeanIndex>>,
    mut consumer: Box<dyn QueueConsumer>,
    shutdown: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = consumer.recv() => match msg {
                Ok(payload) => payload,
                Err(e) => {
                    error!(%e, "showcase request queue failed");
                    break;
                }
            },
        };

        let request = match protocol::decode::<ShowcaseRequest>(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(%e, "dropping malformed showcase request");
                continue;
            }
        };

        let reply_to = match &request {
            ShowcaseRequest::TempRange { reply_to, .. }
            | ShowcaseRequest::TempRangeAvg { reply_to, .. } => reply_to.clone(),
        };

        let outcome = handle_request(&index, request);
        let result = match outcome {
            Ok(reply) => publish_reply(&bus, &reply_to, reply).await,
            Err(e) => {
                warn!(%e, "showcase request failed");
                publish(&bus, &reply_to, &ShowcaseFailure::new(e.to_string())).await
            }
        };
        if let Err(e) = result {
            error!(%e, "failed to publish a showcase reply");
        }
    }
}

/// Reply payload of a successful request dispatch.
#[derive(Debug, PartialEq)]
enum Reply {
    Range(RangeReply),
    RangeAvg(RangeAvgReply),
}

fn handle_request(
    index: &Mutex<MeanIndex>,
    request: ShowcaseRequest,
) -> Result<Reply, ShowcaseError> {
    match request {
        ShowcaseRequest::TempRange { date1, date2, .. } => {
            Ok(Reply::Range(temp_range(index, &date1, &date2)?))
        }
        ShowcaseRequest::TempRangeAvg { date1, date2, .. } => {
            let range = temp_range(index, &date1, &date2)?;
            if range.status != RangeStatus::Success {
                // propagate 404/204 unchanged
                return Ok(Reply::Range(range));
            }
            let count = range.data.len() as f64;
            let avg = range.data.values().sum::<f64>() / count;
            Ok(Reply::RangeAvg(RangeAvgReply {
                from: SHOWCASE_RANGE_AVG.to_string(),
                status: RangeStatus::Success,
                avg_temperature: round(avg),
            }))
        }
    }
}

fn temp_range(
    index: &Mutex<MeanIndex>,
    date1: &str,
    date2: &str,
) -> Result<RangeReply, ShowcaseError> {
    let from = Date::parse_canonical(date1)?;
    let to = Date::parse_canonical(date2)?;

    let (status, data) = match index.lock().range(from, to) {
        RangeResult::Found(data) => (RangeStatus::Success, data),
        RangeResult::NotFound => (RangeStatus::NotFound, Default::default()),
        RangeResult::Empty => (RangeStatus::Empty, Default::default()),
    };
    Ok(RangeReply {
        from: SHOWCASE_RANGE.to_string(),
        status,
        data,
    })
}

async fn publish_reply(
    bus: &Arc<dyn MessageBus>,
    reply_to: &str,
    reply: Reply,
) -> Result<(), ShowcaseError> {
    match reply {
        Reply::Range(reply) => publish(bus, reply_to, &reply).await,
        Reply::RangeAvg(reply) => publish(bus, reply_to, &reply).await,
    }
}

async fn publish<T: serde::Serialize>(
    bus: &Arc<dyn MessageBus>,
    queue: &str,
    msg: &T,
) -> Result<(), ShowcaseError> {
    bus.publish(queue, protocol::encode(msg)?).await?;
    Ok(())
}
