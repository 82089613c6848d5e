//! Cross-crate test suite for the recompiler.
#![cfg(test)]

mod backend;
mod cache;
mod core;
mod exec;

/// Route engine logs into the test harness when a test opts in.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
