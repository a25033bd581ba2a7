//! # Configuration
//!
//! Plain structs with `Default` impls, passed explicitly (behind `Arc`) into the
//! hub, its peers, trackers and monitors. There is no global state.

use std::ops::BitOr;
use std::time::Duration;

use rand::Rng;

/// What the timeout sweep does with a call that ran out of time.
///
/// A bitmask: `LOG | THROW` both logs and fails the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutAction(u8);

impl TimeoutAction {
    pub const NONE: Self = Self(0);
    pub const LOG: Self = Self(1);
    pub const THROW: Self = Self(2);
    pub const LOG_AND_THROW: Self = Self(3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for TimeoutAction {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Per-method timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    /// `None` disables the timeout.
    pub timeout: Option<Duration>,
    pub action: TimeoutAction,
}

impl CallTimeouts {
    pub const NONE: Self = Self { timeout: None, action: TimeoutAction::NONE };

    pub fn new(timeout: Duration, action: TimeoutAction) -> Self {
        Self { timeout: Some(timeout), action }
    }

    /// The timeout, if one is set and its action does something.
    pub fn effective(&self) -> Option<Duration> {
        if self.action.is_none() { None } else { self.timeout }
    }
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self::NONE
    }
}

/// Settings shared by every peer of a hub.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Advertised in the handshake. Below 1 the reconnect query is skipped.
    pub protocol_version: u32,
    /// Applied to methods that declare no timeouts of their own.
    pub call_timeouts: CallTimeouts,
    pub timeout_check_period: Duration,
    /// Relative jitter of the check period, e.g. `0.1` for up to 10% shorter.
    /// Sweeps never run later than `timeout_check_period`, so a call with
    /// timeout `D` is failed by `T + D + timeout_check_period`.
    pub timeout_check_jitter: f64,
    pub abort_cycle_period: Duration,
    /// Bounds both the handshake and the reconnect query round trip.
    pub handshake_timeout: Duration,
    pub reconnect_delay_min: Duration,
    pub reconnect_delay_max: Duration,
    pub reconnect_jitter: f64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            call_timeouts: CallTimeouts::NONE,
            timeout_check_period: Duration::from_secs(10),
            timeout_check_jitter: 0.1,
            abort_cycle_period: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            reconnect_delay_min: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(10),
            reconnect_jitter: 0.1,
        }
    }
}

impl RpcConfig {
    /// The delay before the next timeout sweep.
    pub fn next_timeout_check(&self) -> Duration {
        jittered(self.timeout_check_period, self.timeout_check_jitter)
    }

    /// The delay before reconnect attempt number `failures` (1-based).
    ///
    /// Doubles from `reconnect_delay_min` up to `reconnect_delay_max`.
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let base = self
            .reconnect_delay_min
            .saturating_mul(1u32 << exponent)
            .min(self.reconnect_delay_max);
        jittered(base, self.reconnect_jitter)
    }
}

fn jittered(period: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || period.is_zero() {
        return period;
    }
    // Downward only: the period is an upper bound.
    let jitter = jitter.min(1.0);
    let factor = 1.0 - rand::thread_rng().gen_range(0.0..=jitter);
    period.mul_f64(factor)
}

/// Grace periods of the peer state monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub just_connected_period: Duration,
    pub just_disconnected_period: Duration,
    /// A reconnect closer than this keeps the state at `JustDisconnected`.
    pub min_reconnects_in: Duration,
    /// Added to every scheduled re-evaluation.
    pub extra_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            just_connected_period: Duration::from_millis(1500),
            just_disconnected_period: Duration::from_secs(3),
            min_reconnects_in: Duration::from_secs(1),
            extra_delay: Duration::from_millis(100),
        }
    }
}
