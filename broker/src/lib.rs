//! Queue-based message bus: the only channel between cluster roles.
//!
//! The core relies on a handful of broker semantics and nothing else: named
//! queues, FIFO delivery to a single consumer per queue, and queues that
//! outlive their consumers. [`MessageBus`] captures exactly that surface;
//! [`MemoryBus`] implements it in-process so a whole cluster can run inside
//! one binary and inside tests. A networked binding would implement the same
//! trait without touching any node code.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod core;
pub use self::core::*;

mod memory;
pub use self::memory::*;
