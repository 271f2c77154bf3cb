pub mod network;
pub mod peer;
pub mod remote;

pub use network::{BusTransport, TestNetwork};
pub use peer::TestPeer;
pub use remote::FakeRemote;

use tracing_subscriber::EnvFilter;

/// Installs a test-writer subscriber once per test binary. Filter with
/// `RUST_LOG`, e.g. `RUST_LOG=spacesync_engine=debug`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .compact()
        .try_init();
}
