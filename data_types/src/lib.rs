//! Shared data types for the stratus cluster.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

mod date;
mod record;

pub use date::{Date, DateError, CANONICAL_FORMAT};
pub use record::{Record, DATE_PARSED};

/// Unique id of a storage node and of its paired replica.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StorageId(u32);

impl StorageId {
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue carrying client command lines to the manager.
pub const MANAGER_COMMANDS: &str = "manager_commands";

/// Queue carrying manager and showcase replies back to clients.
pub const CLIENT_RESPONSES: &str = "client_responses";

/// Queue carrying point-GET results and recovery progress to the manager.
pub const MANAGER_RESPONSES: &str = "manager_responses";

/// Queue carrying PONG replies to the manager's liveness detector.
pub const MANAGER_PINGS: &str = "manager_pings";

/// Queue carrying mirrored ingests to the showcase.
pub const SHOWCASE_DATA: &str = "showcase_data";

/// Queue carrying client range queries to the showcase.
pub const SHOWCASE_REQUESTS: &str = "showcase_requests";

/// Name of the input queue of storage node `id`.
pub fn storage_queue(id: StorageId) -> String {
    format!("storage-{id}")
}

/// Name of the input queue of replica node `id`.
pub fn replica_queue(id: StorageId) -> String {
    format!("replica-{id}")
}
