//! Message envelopes exchanged over the broker, and their JSON wire codec.
//!
//! Every queue carries UTF-8 JSON objects. Node commands are tagged by an
//! uppercase `command` field; showcase requests use the client grammar words
//! verbatim. Reply shapes mirror what clients and the manager expect field
//! for field, so the wire format is stable against refactors on either side.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{Date, Record, StorageId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A dataset fragment shipped in one restore chunk: date bucket -> records.
pub type ChunkData = BTreeMap<Date, Vec<Record>>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {source}")]
    MalformedEnvelope { source: serde_json::Error },

    #[error("unencodable envelope: {source}")]
    Unencodable { source: serde_json::Error },
}

/// Serialize an envelope to its UTF-8 JSON wire form.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(msg).map_err(|source| CodecError::Unencodable { source })
}

/// Deserialize an envelope from its UTF-8 JSON wire form.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|source| CodecError::MalformedEnvelope { source })
}

/// Commands accepted on storage and replica input queues.
///
/// Storage and replica each accept a subset; a variant arriving at the wrong
/// receiver is logged and dropped there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum NodeCommand {
    /// Primary ingest of one record (manager -> storage).
    #[serde(rename = "LOAD")]
    Load { data: Record },

    /// Point lookup by canonical date.
    #[serde(rename = "GET")]
    Get { date: String, reply_to: String },

    /// Liveness probe (manager -> storage).
    #[serde(rename = "PING")]
    Ping { reply_to: String },

    /// Simulated death: stop consuming and terminate.
    #[serde(rename = "KILL")]
    Kill,

    /// One restore chunk (replica -> new owner storage).
    #[serde(rename = "LOAD_2")]
    LoadChunk {
        data: ChunkData,
        replica_id: StorageId,
        chunk_id: usize,
        total_chunks: usize,
        reply_to: String,
    },

    /// Mirrored ingest of one record (storage -> its replica).
    #[serde(rename = "COPY")]
    Copy { data: Record },

    /// Mirrored restore chunk (new owner storage -> its replica).
    #[serde(rename = "COPY_2")]
    CopyChunk {
        data: ChunkData,
        replica_id: StorageId,
        chunk_id: usize,
        total_chunks: usize,
    },

    /// Stream the mirror to a designated new owner, then exit
    /// (manager -> replica of a dead storage).
    #[serde(rename = "RELOCATE")]
    Relocate {
        storage_id: StorageId,
        reply_to: String,
    },
}

/// A client command line as published on `manager_commands`.
///
/// The `command` field carries the whole line (`"LOAD weather.csv"`); the
/// manager parses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub command: String,
    pub reply_to: String,
}

/// Range queries accepted on `showcase_requests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ShowcaseRequest {
    #[serde(rename = "temp_range")]
    TempRange {
        date1: String,
        date2: String,
        reply_to: String,
    },

    #[serde(rename = "temp_range_avg")]
    TempRangeAvg {
        date1: String,
        date2: String,
        reply_to: String,
    },
}

/// Terminal status of a manager command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

/// The manager's reply to a client command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: Status,
    pub message: String,
}

impl StatusReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
        }
    }
}

/// Payload of a node reply: record list on a hit, explanatory text otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyData {
    Records(Vec<Record>),
    Text(String),
}

/// Reply from a storage or replica to a GET or PING.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReply {
    pub data: ReplyData,
    pub node_id: StorageId,
    pub queue_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

impl NodeReply {
    /// The text a node replies with when it holds nothing for a date.
    pub const NOT_FOUND: &'static str = "not found";

    pub fn records(node_id: StorageId, queue_name: impl Into<String>, data: Vec<Record>) -> Self {
        Self {
            data: ReplyData::Records(data),
            node_id,
            queue_name: queue_name.into(),
            answer: None,
        }
    }

    pub fn not_found(node_id: StorageId, queue_name: impl Into<String>) -> Self {
        Self {
            data: ReplyData::Text(Self::NOT_FOUND.to_string()),
            node_id,
            queue_name: queue_name.into(),
            answer: None,
        }
    }

    pub fn pong(node_id: StorageId, queue_name: impl Into<String>) -> Self {
        Self {
            data: ReplyData::Text("pong".to_string()),
            node_id,
            queue_name: queue_name.into(),
            answer: Some("PONG".to_string()),
        }
    }
}

/// Progress report for one applied restore chunk (storage -> manager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreProgress {
    pub node_id: StorageId,
    pub replica_id: StorageId,
    pub chunk_id: usize,
    pub total_chunks: usize,
    pub message: String,
}

impl RestoreProgress {
    /// True for the last chunk of a restore stream.
    pub fn is_terminal(&self) -> bool {
        self.chunk_id + 1 == self.total_chunks
    }
}

/// Sender tag of `temp_range` replies.
pub const SHOWCASE_RANGE: &str = "showcase1";
/// Sender tag of `temp_range_avg` replies.
pub const SHOWCASE_RANGE_AVG: &str = "showcase2";
/// Sender tag of showcase failure replies.
pub const SHOWCASE_ERROR: &str = "showcaseX";

/// Status of a showcase range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeStatus {
    #[serde(rename = "success")]
    Success,
    /// Index is non-empty but no date falls inside the range.
    #[serde(rename = "404")]
    NotFound,
    /// Index holds no data at all.
    #[serde(rename = "204")]
    Empty,
}

/// Reply to `temp_range`: per-date means, rounded to three decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeReply {
    pub from: String,
    pub status: RangeStatus,
    pub data: BTreeMap<String, f64>,
}

/// Reply to `temp_range_avg` on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeAvgReply {
    pub from: String,
    pub status: RangeStatus,
    pub avg_temperature: f64,
}

/// Reply sent when a showcase handler fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowcaseFailure {
    pub from: String,
    pub status: String,
    pub message: String,
}

impl ShowcaseFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            from: SHOWCASE_ERROR.to_string(),
            status: "500".to_string(),
            message: message.into(),
        }
    }
}
