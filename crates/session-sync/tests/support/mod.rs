#![allow(dead_code)]

pub mod mock_backend;
pub mod raw_client;

/// Route library logs to the test harness. `RUST_LOG=session_sync=debug`
/// to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
