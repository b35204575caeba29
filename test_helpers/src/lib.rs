//! Helpers shared by the workspace's tests.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use observability_deps::tracing;
use parking_lot::Once;
use tracing_subscriber::EnvFilter;

static LOG_SETUP: Once = Once::new();

/// Start tracing output for a test if `RUST_LOG` is set.
///
/// Tests call this at the top so that `RUST_LOG=debug cargo test some_test`
/// shows what the cluster is doing; without `RUST_LOG` it is a no-op.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Start tracing output for a test unconditionally.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        tracing_log::LogTracer::init().expect("log forwarding installs once");
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("tracing subscriber installs once");
    });
}
