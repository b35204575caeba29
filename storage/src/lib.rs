//! The storage/replica pair: primary ingest with replica mirroring, liveness
//! replies, simulated death, and chunked restore.
//!
//! Both roles are single consumer tasks over their input queue, so their
//! datasets need no locking; all cross-role effects go back through the bus.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use broker::BusError;
use data_types::{Date, Record, DATE_PARSED};
use protocol::{ChunkData, CodecError};
use std::collections::BTreeMap;
use thiserror::Error;

mod node;
pub use node::{StorageConfig, StorageNode};

mod replica;
pub use replica::{ReplicaConfig, ReplicaNode};

/// In-memory dataset of a storage or replica: date bucket -> records in
/// insertion order, duplicates allowed.
pub type Dataset = BTreeMap<Date, Vec<Record>>;

/// Merge one restore chunk into a dataset.
///
/// Last writer wins at the date-key level: the incoming bucket replaces the
/// local one. During a restore the sender is the authoritative holder and
/// the target held nothing for these dates, so no per-record reconciliation
/// is needed.
pub(crate) fn merge_chunk(dataset: &mut Dataset, chunk: ChunkData) {
    for (date, bucket) in chunk {
        dataset.insert(date, bucket);
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("broker failure: {0}")]
    Broker(#[from] BusError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("record is missing its '{DATE_PARSED}' field")]
    MissingDate,
}
