//! # Outbound Call Tracker
//!
//! Assigns call ids and keeps two views of the calls this peer issued:
//! `calls` holds everything registered until it is explicitly unregistered,
//! `in_progress` only the calls still waiting for a terminal result.
//!
//! ## Reconnect
//!
//! After every (re)connect, before the timeout sweep resumes:
//!
//! 1. If the remote identity changed or it speaks protocol 0, every
//!    in-progress call is resent.
//! 2. Otherwise staged calls are reported to the remote side with
//!    `$sys.Reconnect`, grouped by stage as compressed id sets. The remote
//!    answers with the ids it does not know; exactly those are resent, plus
//!    every unstaged call. The rest is assumed to be running remotely.
//! 3. A call that completed in the meantime is never resent.
//!
//! ## Abort
//!
//! Sweeps the registry repeatedly, failing every call it has not failed yet,
//! and stops at the first sweep from the third onward that finds nothing new.
//! Calls registered concurrently are picked up by the next sweep.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::time::Instant;

use tetherrpc::ReconnectRequest;
use tetherrpc::SystemCall;
use tetherrpc::Value;
use tetherrpc::seq;
use tetherrpc::system;

use crate::call::CallError;
use crate::call::CallResult;
use crate::call::OutboundCall;
use crate::clock::Clock;
use crate::config::CallTimeouts;
use crate::config::RpcConfig;
use crate::config::TimeoutAction;
use crate::peer::Link;
use crate::peer::PeerRef;
use crate::service::MethodDef;
use crate::tracker::Error;
use crate::tracker::Result;
use crate::transport;

pub struct OutboundCallTracker {
    peer: PeerRef,
    config: Arc<RpcConfig>,
    clock: Arc<dyn Clock>,
    last_id: AtomicI64,
    calls: DashMap<i64, Arc<OutboundCall>>,
    in_progress: DashMap<i64, Arc<OutboundCall>>,
    reconnect_def: Arc<MethodDef>,
}

impl OutboundCallTracker {
    pub fn new(peer: PeerRef, config: Arc<RpcConfig>, clock: Arc<dyn Clock>) -> Self {
        let mut reconnect_def = MethodDef::new(system::SYSTEM_SERVICE, system::method::RECONNECT, Vec::new());
        reconnect_def.timeouts = Some(CallTimeouts::NONE);

        Self {
            peer,
            config,
            clock,
            last_id: AtomicI64::new(0),
            calls: DashMap::new(),
            in_progress: DashMap::new(),
            reconnect_def: Arc::new(reconnect_def),
        }
    }

    // ========================================================================
    //  REGISTRY
    // ========================================================================

    /// Assigns a fresh id, stamps the start time and starts tracking the call.
    pub fn register(&self, call: &Arc<OutboundCall>) -> Result<i64> {
        if call.is_no_wait() {
            return Err(Error::NoWait(call.method().method.clone()));
        }
        if call.id() != 0 {
            return Err(Error::AlreadyRegistered(call.id()));
        }

        let id = self.last_id.fetch_add(1, Ordering::Relaxed) + 1;
        if !call.assign_id(id, self.clock.now()) {
            return Err(Error::AlreadyRegistered(call.id()));
        }
        self.calls.insert(id, call.clone());
        self.in_progress.insert(id, call.clone());
        tracing::trace!(peer = %self.peer, call_id = id, method = %call.method().method, "registered outbound call");
        Ok(id)
    }

    /// Drops the call from the in-progress view. Idempotent.
    pub fn complete(&self, call: &OutboundCall) -> bool {
        remove_same(&self.in_progress, call)
    }

    /// Forgets the call entirely.
    pub fn unregister(&self, call: &OutboundCall) -> bool {
        remove_same(&self.in_progress, call);
        remove_same(&self.calls, call)
    }

    /// Sets the call's terminal result and completes it.
    ///
    /// Returns whether this result won; the call completes either way.
    pub fn finish(&self, call: &OutboundCall, result: CallResult) -> bool {
        let won = call.set_result(result);
        self.complete(call);
        won
    }

    pub fn get(&self, id: i64) -> Option<Arc<OutboundCall>> {
        self.calls.get(&id).map(|entry| entry.value().clone())
    }

    pub fn count(&self) -> usize {
        self.calls.len()
    }

    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }

    /// All registered calls, in registration order.
    pub fn calls(&self) -> Vec<Arc<OutboundCall>> {
        snapshot(&self.calls)
    }

    /// Calls still waiting for a result, in registration order.
    pub fn in_progress(&self) -> Vec<Arc<OutboundCall>> {
        snapshot(&self.in_progress)
    }

    // ========================================================================
    //  MAINTENANCE
    // ========================================================================

    /// Runs the reconnect protocol on a fresh link, then the timeout sweep
    /// until the future is dropped with the connection.
    pub async fn maintain(&self, link: &Link) {
        self.reconnect(link).await;
        loop {
            tokio::time::sleep(self.config.next_timeout_check()).await;
            self.check_timeouts(self.clock.now());
        }
    }

    /// Applies every in-progress call's timeout policy as of `now`.
    ///
    /// Returns the number of calls failed with [`CallError::Timeout`].
    pub fn check_timeouts(&self, now: Instant) -> usize {
        let mut failed = 0;
        for call in self.in_progress() {
            if call.is_completed() {
                continue;
            }
            let timeouts = call.method().timeouts.unwrap_or(self.config.call_timeouts);
            let (Some(timeout), Some(started_at)) = (timeouts.effective(), call.started_at()) else {
                continue;
            };
            let elapsed = now.saturating_duration_since(started_at);
            if elapsed <= timeout {
                continue;
            }

            if timeouts.action.contains(TimeoutAction::LOG) && call.mark_timeout_reported() {
                tracing::error!(
                    peer = %self.peer,
                    call_id = call.id(),
                    method = %call.method().method,
                    ?elapsed,
                    ?timeout,
                    "outbound call timed out"
                );
            }
            if timeouts.action.contains(TimeoutAction::THROW) {
                let error = CallError::Timeout { method: call.method().method.clone(), timeout, elapsed };
                if self.finish(&call, Err(error)) {
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Resends whatever the remote side of `link` has not seen.
    pub async fn reconnect(&self, link: &Link) {
        let calls: Vec<Arc<OutboundCall>> =
            self.in_progress().into_iter().filter(|c| !c.method().is_system()).collect();
        if calls.is_empty() {
            return;
        }

        if link.peer_changed || link.remote.protocol_version < 1 {
            tracing::debug!(
                peer = %self.peer,
                count = calls.len(),
                peer_changed = link.peer_changed,
                "resending all outbound calls"
            );
            self.resend(link, &calls).await;
            return;
        }

        let mut stages: BTreeMap<u8, Vec<u64>> = BTreeMap::new();
        let mut resend = Vec::new();
        for call in &calls {
            match (call.reconnect_stage(), u64::try_from(call.id())) {
                (Some(stage), Ok(id)) => stages.entry(stage.0).or_default().push(id),
                _ => resend.push(call.clone()),
            }
        }

        if !stages.is_empty() {
            let request = ReconnectRequest {
                handshake_index: link.remote.index,
                stages: stages.into_iter().map(|(stage, ids)| (stage, seq::compress(ids))).collect(),
            };
            match self.query_reconnect(link, request).await {
                Ok(ids) => {
                    tracing::debug!(peer = %self.peer, requested = ids.len(), "remote requested resends");
                    resend.extend(ids.into_iter().filter_map(|id| i64::try_from(id).ok()).filter_map(|id| self.get(id)));
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "reconnect query failed, resending all outbound calls");
                    resend = calls.clone();
                }
            }
        }

        resend.sort_by_key(|call| call.id());
        resend.dedup_by_key(|call| call.id());
        self.resend(link, &resend).await;
    }

    /// Sends `$sys.Reconnect` and returns the ids the remote side asks for.
    async fn query_reconnect(&self, link: &Link, request: ReconnectRequest) -> std::result::Result<Vec<u64>, CallError> {
        let call = Arc::new(OutboundCall::new(self.reconnect_def.clone(), Vec::new()));
        let id = self.register(&call)?;
        let _registered = Registered { tracker: self, call: &call };
        self.exchange_reconnect(&call, id, link, request).await
    }

    async fn exchange_reconnect(
        &self,
        call: &OutboundCall,
        id: i64,
        link: &Link,
        request: ReconnectRequest,
    ) -> std::result::Result<Vec<u64>, CallError> {
        call.set_message(Arc::new(SystemCall::Reconnect(request).to_message(id)?));
        call.send(link.transport.as_ref()).await?;

        let reply = tokio::time::timeout(self.config.handshake_timeout, call.result())
            .await
            .map_err(|_| CallError::Transport(transport::Error::Timeout))??;
        match reply {
            Value::Bytes(bytes) => Ok(seq::decompress(&bytes)?),
            other => Err(CallError::Codec(tetherrpc::Error::TypeMismatch {
                expected: "bytes".into(),
                found: other.kind().into(),
            })),
        }
    }

    async fn resend(&self, link: &Link, calls: &[Arc<OutboundCall>]) {
        for call in calls {
            match call.send(link.transport.as_ref()).await {
                Ok(true) => tracing::trace!(peer = %self.peer, call_id = call.id(), "resent outbound call"),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(peer = %self.peer, error = %e, "resend interrupted by disconnect");
                    return;
                }
            }
        }
    }

    /// Fails every tracked call with [`CallError::PeerUnrecoverable`].
    ///
    /// Returns the number of calls it failed.
    pub async fn abort(&self, reason: &str) -> usize {
        let mut aborted = HashSet::new();
        let mut sweep = 0usize;
        loop {
            let mut added = false;
            for call in self.calls() {
                if aborted.insert(call.id()) {
                    added = true;
                    self.finish(&call, Err(CallError::PeerUnrecoverable(reason.to_string())));
                }
            }
            if sweep >= 2 && !added {
                break;
            }
            sweep += 1;
            tokio::time::sleep(self.config.abort_cycle_period).await;
        }
        tracing::debug!(peer = %self.peer, aborted = aborted.len(), sweeps = sweep + 1, "outbound calls aborted");
        aborted.len()
    }

    /// Fails in-progress calls whose route changed with [`CallError::Rerouted`].
    pub fn try_reroute(&self, is_route_changed: impl Fn(&OutboundCall) -> bool) -> usize {
        let mut rerouted = 0;
        for call in self.in_progress() {
            if call.method().is_system() || !is_route_changed(call.as_ref()) {
                continue;
            }
            if self.finish(&call, Err(CallError::Rerouted)) {
                rerouted += 1;
            }
        }
        rerouted
    }
}

/// Unregisters a call when dropped, also when its future is.
struct Registered<'a> {
    tracker: &'a OutboundCallTracker,
    call: &'a OutboundCall,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        self.tracker.unregister(self.call);
    }
}

fn remove_same(map: &DashMap<i64, Arc<OutboundCall>>, call: &OutboundCall) -> bool {
    map.remove_if(&call.id(), |_, registered| std::ptr::eq(Arc::as_ptr(registered), call))
        .is_some()
}

fn snapshot(map: &DashMap<i64, Arc<OutboundCall>>) -> Vec<Arc<OutboundCall>> {
    let mut calls: Vec<Arc<OutboundCall>> = map.iter().map(|entry| entry.value().clone()).collect();
    calls.sort_by_key(|call| call.id());
    calls
}
