//! Monotonic time source.

use tokio::time::Instant;

/// Supplies "now" for call start stamps, timeout checks and the monitor.
///
/// Sleeping always goes through `tokio::time`, so a paused tokio clock in tests
/// moves both together.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Reads `tokio::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
