//! # Peer State Monitor
//!
//! Turns the raw connect/disconnect events of a peer into a debounced state
//! that is safe to show to users or to base retry decisions on.
//!
//! | raw state    | derived state                                              |
//! |--------------|------------------------------------------------------------|
//! | connected    | `JustConnected` for `just_connected_period`, then `Connected` |
//! | disconnected | `JustDisconnected` for `just_disconnected_period`, then `Disconnected` with the reconnect ETA |
//!
//! ## Invariants
//! - `JustConnected` lasts its full period from the original connect, even if
//!   the connection drops inside it.
//! - After the `JustDisconnected` window a disconnected peer stays
//!   `Disconnected` until it reconnects. The reconnect ETA is only reported
//!   while it is at least `min_reconnects_in` away.
//! - Every evaluation schedules the next one at the exact due time plus
//!   `extra_delay`. Nothing polls.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::peer::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStateKind {
    Connected,
    JustConnected,
    Disconnected,
    JustDisconnected,
}

impl PeerStateKind {
    /// Connected or about to be considered connected.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::JustConnected)
    }
}

impl fmt::Display for PeerStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "Connected",
            Self::JustConnected => "JustConnected",
            Self::Disconnected => "Disconnected",
            Self::JustDisconnected => "JustDisconnected",
        };
        f.write_str(name)
    }
}

/// The derived connectivity of a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerState {
    pub kind: PeerStateKind,
    /// Why the last connection ended, while disconnected.
    pub error: Option<String>,
    /// When the next connection attempt starts, while disconnected.
    pub reconnects_at: Option<Instant>,
}

impl PeerState {
    fn just_connected() -> Self {
        Self { kind: PeerStateKind::JustConnected, error: None, reconnects_at: None }
    }
}

/// What the evaluator remembers between evaluations.
#[derive(Debug, Clone, Default)]
pub struct MonitorMemory {
    /// End of the current `JustConnected` window.
    just_connected_until: Option<Instant>,
}

/// Derives the state for `raw` at `now`, and when to evaluate again.
pub fn evaluate(
    raw: &ConnectionState,
    memory: &mut MonitorMemory,
    now: Instant,
    config: &MonitorConfig,
) -> (PeerState, Option<Instant>) {
    if let Some(until) = memory.just_connected_until {
        if now < until {
            return (PeerState::just_connected(), Some(until));
        }
        memory.just_connected_until = None;
    }

    match raw {
        ConnectionState::Connected { since } => {
            let until = *since + config.just_connected_period;
            if now < until {
                memory.just_connected_until = Some(until);
                return (PeerState::just_connected(), Some(until));
            }
            (PeerState { kind: PeerStateKind::Connected, error: None, reconnects_at: None }, None)
        }
        ConnectionState::Disconnected { since, reconnects_at, error } => {
            let disconnected = |kind| PeerState { kind, error: error.clone(), reconnects_at: *reconnects_at };

            let until = *since + config.just_disconnected_period;
            if now < until {
                return (disconnected(PeerStateKind::JustDisconnected), Some(until));
            }
            match reconnects_at {
                Some(at) if *at >= now + config.min_reconnects_in => {
                    (disconnected(PeerStateKind::Disconnected), Some(*at - config.min_reconnects_in))
                }
                // Imminent, overdue or unknown: no ETA worth showing.
                _ => (PeerState { kind: PeerStateKind::Disconnected, error: error.clone(), reconnects_at: None }, None),
            }
        }
    }
}

/// Keeps a [`PeerState`] up to date in a background task.
///
/// The task ends when the monitor is disposed or dropped, or when its raw
/// state channel closes and no replacement can be found.
pub struct PeerStateMonitor {
    state: watch::Receiver<PeerState>,
    stop: CancellationToken,
}

impl PeerStateMonitor {
    /// Monitors a single raw state channel.
    pub fn new(raw: watch::Receiver<ConnectionState>, config: Arc<MonitorConfig>, clock: Arc<dyn Clock>) -> Self {
        Self::with_source(raw, || None, config, clock)
    }

    /// Monitors `raw`, calling `resubscribe` for a fresh channel whenever the
    /// current one closes.
    pub fn with_source<F>(
        raw: watch::Receiver<ConnectionState>,
        resubscribe: F,
        config: Arc<MonitorConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        F: FnMut() -> Option<watch::Receiver<ConnectionState>> + Send + 'static,
    {
        let mut memory = MonitorMemory::default();
        let (initial, _) = evaluate(&raw.borrow(), &mut memory, clock.now(), &config);
        let (tx, state) = watch::channel(initial);
        let stop = CancellationToken::new();

        let task = MonitorTask { raw, resubscribe, tx, memory, config, clock, stop: stop.clone() };
        tokio::spawn(task.run());
        Self { state, stop }
    }

    /// Subscribes to the derived state.
    pub fn state(&self) -> watch::Receiver<PeerState> {
        self.state.clone()
    }

    pub fn current(&self) -> PeerState {
        self.state.borrow().clone()
    }

    /// Stops the background task, which releases the raw state channel.
    pub fn dispose(&self) {
        self.stop.cancel();
    }
}

impl Drop for PeerStateMonitor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct MonitorTask<F> {
    raw: watch::Receiver<ConnectionState>,
    resubscribe: F,
    tx: watch::Sender<PeerState>,
    memory: MonitorMemory,
    config: Arc<MonitorConfig>,
    clock: Arc<dyn Clock>,
    stop: CancellationToken,
}

impl<F> MonitorTask<F>
where
    F: FnMut() -> Option<watch::Receiver<ConnectionState>> + Send + 'static,
{
    async fn run(mut self) {
        loop {
            let raw = (*self.raw.borrow_and_update()).clone();
            let (state, due) = evaluate(&raw, &mut self.memory, self.clock.now(), &self.config);
            self.tx.send_if_modified(|current| {
                if *current == state {
                    return false;
                }
                tracing::debug!(from = %current.kind, to = %state.kind, "peer state changed");
                *current = state;
                true
            });

            let wake = due.map(|at| at + self.config.extra_delay);
            let raw_closed = tokio::select! {
                changed = self.raw.changed() => changed.is_err(),
                _ = sleep_until(wake) => false,
                _ = self.stop.cancelled() => break,
                _ = self.tx.closed() => break,
            };
            if raw_closed && !self.restart() {
                break;
            }
        }
        tracing::trace!("peer state monitor stopped");
    }

    /// Replaces a closed raw channel. False if there is no live replacement.
    fn restart(&mut self) -> bool {
        match (self.resubscribe)() {
            Some(raw) if raw.has_changed().is_ok() => {
                tracing::info!("peer state channel closed, monitor restarted");
                self.raw = raw;
                true
            }
            _ => false,
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
