//! # RPC Peer
//!
//! One remote endpoint, as seen from this hub. A peer survives any number of
//! connections: it owns the call trackers, while connections come and go
//! underneath it.
//!
//! ## Lifecycle
//!
//! The background task loops over:
//!
//! 1. **Connect**: ask the [`Connector`] for a transport. Active connectors
//!    are retried with exponential backoff, passive ones wait for the remote
//!    side to dial in.
//! 2. **Handshake**: both sides send `$sys.Handshake` as their first frame.
//!    Each handshake carries the sender's peer id, protocol version and a
//!    per-peer connection index.
//! 3. **Serve**: publish the [`Link`], run the outbound reconnect protocol and
//!    timeout sweep, and pump incoming messages until the transport fails.
//!
//! Stopping the peer cancels its scope: inbound handlers are cancelled and
//! every outbound call fails with `PeerUnrecoverable`.
//!
//! ## Invariants
//! - At most one link is published at a time, and only after its handshake.
//! - An inbound result is sent only while its call is still tracked. A result
//!   that finds no live link waits for the next one; results of calls cleared
//!   by a remote restart are dropped.
//! - Inbound calls are unregistered only after their result was sent, so a
//!   `$sys.Reconnect` that races the result never asks for a resend of a call
//!   whose result is already on the wire.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tetherrpc::ArgumentCodec;
use tetherrpc::Handshake;
use tetherrpc::Message;
use tetherrpc::ReconnectRequest;
use tetherrpc::RemoteError;
use tetherrpc::RemoteErrorKind;
use tetherrpc::SystemCall;
use tetherrpc::Value;
use tetherrpc::seq;
use tetherrpc::system;

use crate::call::CallError;
use crate::call::CallResult;
use crate::call::InboundCall;
use crate::call::OutboundCall;
use crate::clock::Clock;
use crate::config::RpcConfig;
use crate::service::MethodDef;
use crate::service::ServiceRegistry;
use crate::tracker::InboundCallTracker;
use crate::tracker::OutboundCallTracker;
use crate::transport;
use crate::transport::Connector;
use crate::transport::Transport;

// ============================================================================
//  ERRORS
// ============================================================================

/// Why a connection attempt or a live connection ended.
#[derive(Debug, Clone)]
pub enum Error {
    Transport(transport::Error),
    Codec(tetherrpc::Error),
    /// The remote side did not open with a valid handshake.
    Handshake(String),
    Stopped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
            Self::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
            Self::Stopped => write!(f, "Peer stopped"),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<tetherrpc::Error> for Error {
    fn from(e: tetherrpc::Error) -> Self {
        Self::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
//  IDENTITY AND STATE
// ============================================================================

/// The name a hub knows a peer by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerRef(Arc<str>);

impl PeerRef {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerRef {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// The raw connection state of a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connected {
        since: Instant,
    },
    Disconnected {
        since: Instant,
        /// When the next connection attempt starts. `None` when unknown, e.g.
        /// while waiting for the remote side to dial in.
        reconnects_at: Option<Instant>,
        error: Option<String>,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn since(&self) -> Instant {
        match self {
            Self::Connected { since } | Self::Disconnected { since, .. } => *since,
        }
    }
}

/// A live, handshaken connection.
pub struct Link {
    pub transport: Arc<dyn Transport>,
    pub local: Handshake,
    pub remote: Handshake,
    /// The remote peer id differs from the previous connection's, or this is
    /// the first connection.
    pub peer_changed: bool,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("peer_changed", &self.peer_changed)
            .finish()
    }
}

/// Everything a peer shares with its hub.
pub(crate) struct PeerContext {
    pub local_peer_id: u64,
    pub config: Arc<RpcConfig>,
    pub services: Arc<ServiceRegistry>,
    pub codec: Arc<dyn ArgumentCodec>,
    pub clock: Arc<dyn Clock>,
}

// ============================================================================
//  PEER
// ============================================================================

pub struct Peer {
    peer_ref: PeerRef,
    ctx: Arc<PeerContext>,
    connector: Arc<dyn Connector>,
    outbound: OutboundCallTracker,
    inbound: InboundCallTracker,
    link: watch::Sender<Option<Arc<Link>>>,
    state: watch::Sender<ConnectionState>,
    /// Root of every inbound call's token.
    scope: CancellationToken,
    terminated: CancellationToken,
    handshake_index: AtomicU32,
}

impl Peer {
    /// Creates the peer and starts its connection loop.
    pub(crate) fn spawn(peer_ref: PeerRef, ctx: Arc<PeerContext>, connector: Arc<dyn Connector>) -> Arc<Self> {
        let now = ctx.clock.now();
        let (link, _) = watch::channel(None);
        let (state, _) = watch::channel(ConnectionState::Disconnected { since: now, reconnects_at: Some(now), error: None });
        let peer = Arc::new(Self {
            outbound: OutboundCallTracker::new(peer_ref.clone(), ctx.config.clone(), ctx.clock.clone()),
            inbound: InboundCallTracker::new(),
            peer_ref,
            ctx,
            connector,
            link,
            state,
            scope: CancellationToken::new(),
            terminated: CancellationToken::new(),
            handshake_index: AtomicU32::new(0),
        });

        tokio::spawn(peer.clone().run());
        peer
    }

    pub fn peer_ref(&self) -> &PeerRef {
        &self.peer_ref
    }

    /// Subscribes to the raw connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.link.borrow().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.scope.is_cancelled()
    }

    pub fn outbound(&self) -> &OutboundCallTracker {
        &self.outbound
    }

    pub fn inbound(&self) -> &InboundCallTracker {
        &self.inbound
    }

    /// The current link, if connected.
    pub fn link(&self) -> Option<Arc<Link>> {
        self.link.borrow().clone()
    }

    /// Waits for a link. `None` once the peer is stopped.
    pub async fn connected(&self) -> Option<Arc<Link>> {
        self.link_other_than(None).await
    }

    /// Waits for a link that is not `failed`. `None` once the peer is stopped.
    async fn link_other_than(&self, failed: Option<&Arc<Link>>) -> Option<Arc<Link>> {
        let next = next_link(self.link.subscribe(), failed.cloned());
        tokio::select! {
            link = next => link,
            _ = self.scope.cancelled() => None,
        }
    }

    /// Stops the peer and waits until its connection loop has shut down.
    pub async fn stop(&self) {
        self.begin_stop();
        self.terminated.cancelled().await;
    }

    /// Starts stopping without waiting for the connection loop to finish.
    pub(crate) fn begin_stop(&self) {
        if !self.scope.is_cancelled() {
            tracing::info!(peer = %self.peer_ref, "stopping peer");
        }
        self.scope.cancel();
    }

    // ========================================================================
    //  CALLING
    // ========================================================================

    /// Calls `method` on the remote side and waits for its result.
    ///
    /// The call survives disconnects: it is resent or recovered by the
    /// reconnect protocol until it completes, times out or the peer stops.
    /// Dropping the returned future cancels the call, locally and remotely.
    pub async fn call(self: &Arc<Self>, method: Arc<MethodDef>, args: Vec<Value>) -> CallResult {
        self.start_call(method, args, false).await
    }

    /// Like [`Peer::call`], for a call the hub routed here. It fails with
    /// `Rerouted` when [`Hub::reroute_calls`](crate::Hub::reroute_calls)
    /// finds its method served elsewhere.
    pub async fn call_routed(self: &Arc<Self>, method: Arc<MethodDef>, args: Vec<Value>) -> CallResult {
        self.start_call(method, args, true).await
    }

    async fn start_call(self: &Arc<Self>, method: Arc<MethodDef>, args: Vec<Value>, routed: bool) -> CallResult {
        if self.is_stopped() {
            return Err(CallError::PeerUnrecoverable("peer is stopped".into()));
        }
        if method.no_wait {
            return self.send_no_wait(method, args).await.map(|()| Value::Unit);
        }

        let call = OutboundCall::new(method, args);
        let call = Arc::new(if routed { call.routed() } else { call });
        self.outbound.register(&call)?;
        match call.build_message(self.ctx.codec.as_ref()) {
            Ok(msg) => call.set_message(msg),
            Err(e) => {
                self.outbound.unregister(&call);
                return Err(e);
            }
        }
        let pending = PendingCall { peer: self.clone(), call: call.clone(), armed: true };

        // Registered before reading the link: a call that misses this link is
        // still in the reconnect snapshot of the next one.
        if let Some(link) = self.link() {
            if let Err(e) = call.send(link.transport.as_ref()).await {
                tracing::debug!(peer = %self.peer_ref, call_id = call.id(), error = %e, "send failed, awaiting reconnect");
            }
        }

        let result = call.result().await;
        pending.disarm();
        self.outbound.unregister(&call);
        result
    }

    async fn send_no_wait(&self, method: Arc<MethodDef>, args: Vec<Value>) -> std::result::Result<(), CallError> {
        let call = OutboundCall::new(method, args);
        let msg = call.build_message(self.ctx.codec.as_ref())?;
        let Some(link) = self.connected().await else {
            return Err(CallError::PeerUnrecoverable("peer is stopped".into()));
        };
        link.transport.send(msg).await?;
        Ok(())
    }

    /// Fails in-progress calls for which `is_route_changed` holds.
    pub fn reroute(&self, is_route_changed: impl Fn(&OutboundCall) -> bool) -> usize {
        self.outbound.try_reroute(is_route_changed)
    }

    // ========================================================================
    //  CONNECTION LOOP
    // ========================================================================

    async fn run(self: Arc<Self>) {
        let mut failures = 0u32;
        let mut last_remote: Option<u64> = None;

        while !self.scope.is_cancelled() {
            let attempt = tokio::select! {
                attempt = self.establish(last_remote) => attempt,
                _ = self.scope.cancelled() => break,
            };

            let error = match attempt {
                Ok(link) => {
                    failures = 0;
                    let remote_restarted = last_remote.is_some() && link.peer_changed;
                    last_remote = Some(link.remote.peer_id);
                    self.serve(link, remote_restarted).await
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(peer = %self.peer_ref, failures, error = %e, "connection attempt failed");
                    e
                }
            };
            if self.scope.is_cancelled() {
                break;
            }

            let passive = self.connector.is_passive();
            let delay = if failures == 0 || passive { None } else { Some(self.ctx.config.reconnect_delay(failures)) };
            let reconnects_at = if passive { None } else { Some(self.ctx.clock.now() + delay.unwrap_or_default()) };
            self.set_disconnected(Some(error.to_string()), reconnects_at);

            if let Some(delay) = delay {
                tracing::debug!(peer = %self.peer_ref, ?delay, "reconnecting after delay");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.scope.cancelled() => break,
                }
            }
        }

        self.terminate().await;
    }

    async fn establish(&self, last_remote: Option<u64>) -> Result<Link> {
        let transport: Arc<dyn Transport> = Arc::from(self.connector.connect().await?);

        let local = Handshake {
            peer_id: self.ctx.local_peer_id,
            protocol_version: self.ctx.config.protocol_version,
            index: self.handshake_index.fetch_add(1, Ordering::Relaxed) + 1,
        };
        transport.send(Arc::new(SystemCall::Handshake(local).to_message(0)?)).await?;

        let first = tokio::time::timeout(self.ctx.config.handshake_timeout, transport.recv())
            .await
            .map_err(|_| Error::Transport(transport::Error::Timeout))??;
        let Some(msg) = first else {
            return Err(Error::Handshake("connection closed before handshake".into()));
        };
        let remote = match system::is_system(&msg).then(|| SystemCall::decode(&msg)) {
            Some(Ok(SystemCall::Handshake(remote))) => remote,
            Some(Err(e)) => return Err(Error::Codec(e)),
            _ => return Err(Error::Handshake(format!("expected handshake, got {}", msg.method))),
        };

        Ok(Link { transport, local, remote, peer_changed: last_remote != Some(remote.peer_id) })
    }

    /// Runs one connection until it breaks or the peer stops.
    async fn serve(self: &Arc<Self>, link: Link, remote_restarted: bool) -> Error {
        let link = Arc::new(link);
        if remote_restarted {
            let cancelled = self.inbound.clear();
            tracing::info!(peer = %self.peer_ref, cancelled, "remote peer restarted, inbound calls dropped");
        }

        self.link.send_replace(Some(link.clone()));
        self.state.send_replace(ConnectionState::Connected { since: self.ctx.clock.now() });
        tracing::info!(
            peer = %self.peer_ref,
            remote_peer_id = link.remote.peer_id,
            index = link.local.index,
            peer_changed = link.peer_changed,
            "connected"
        );

        let error = tokio::select! {
            error = self.pump(&link) => error,
            _ = self.outbound.maintain(&link) => Error::Stopped,
            _ = self.scope.cancelled() => Error::Stopped,
        };

        self.link.send_replace(None);
        tracing::info!(peer = %self.peer_ref, error = %error, "disconnected");
        error
    }

    async fn pump(self: &Arc<Self>, link: &Arc<Link>) -> Error {
        loop {
            match link.transport.recv().await {
                Ok(Some(msg)) => self.dispatch(link, msg),
                Ok(None) => return Error::Transport(transport::Error::ConnectionLost("stream closed".into())),
                Err(e) => return Error::Transport(e),
            }
        }
    }

    fn set_disconnected(&self, error: Option<String>, reconnects_at: Option<Instant>) {
        let now = self.ctx.clock.now();
        self.state.send_modify(|state| {
            let since = match state {
                ConnectionState::Disconnected { since, .. } => *since,
                ConnectionState::Connected { .. } => now,
            };
            *state = ConnectionState::Disconnected { since, reconnects_at, error };
        });
    }

    async fn terminate(&self) {
        self.link.send_replace(None);
        self.set_disconnected(Some(Error::Stopped.to_string()), None);

        let cancelled = self.inbound.clear();
        let aborted = self.outbound.abort("peer stopped").await;
        tracing::info!(peer = %self.peer_ref, aborted, cancelled, "peer terminated");
        self.terminated.cancel();
    }

    // ========================================================================
    //  DISPATCH
    // ========================================================================

    fn dispatch(self: &Arc<Self>, link: &Arc<Link>, msg: Arc<Message>) {
        tracing::trace!(peer = %self.peer_ref, message = %msg, "received");
        let id = msg.related_id;

        if !system::is_system(&msg) {
            self.accept_inbound(msg);
            return;
        }

        match SystemCall::decode(&msg) {
            Ok(SystemCall::Ok(value)) => self.complete_outbound(id, Ok(value)),
            Ok(SystemCall::Error(e)) => self.complete_outbound(id, Err(CallError::Remote(e))),
            Ok(SystemCall::Cancel) => {
                if let Some(call) = self.inbound.get(id) {
                    tracing::debug!(peer = %self.peer_ref, call_id = id, "inbound call cancelled by caller");
                    call.cancel();
                }
            }
            Ok(SystemCall::Reconnect(request)) => {
                let reply = self.answer_reconnect(link, request);
                send_detached(link.transport.clone(), reply, id);
            }
            Ok(SystemCall::Handshake(_)) => {
                tracing::warn!(peer = %self.peer_ref, "unexpected handshake on a live connection");
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer_ref, method = %msg.method, error = %e, "malformed system call");
            }
        }
    }

    fn complete_outbound(&self, id: i64, result: CallResult) {
        match self.outbound.get(id) {
            Some(call) => {
                self.outbound.finish(&call, result);
            }
            None => tracing::trace!(peer = %self.peer_ref, call_id = id, "result for unknown call"),
        }
    }

    fn accept_inbound(self: &Arc<Self>, msg: Arc<Message>) {
        let method = self.ctx.services.get(&msg.method).cloned();
        let call = Arc::new(InboundCall::new(msg, method, self.scope.child_token()));

        let registered = self.inbound.get_or_register(call.clone());
        if !Arc::ptr_eq(&registered, &call) {
            tracing::warn!(peer = %self.peer_ref, call_id = call.id(), "duplicate inbound call id, folded into the running call");
            return;
        }
        if !call.is_endpoint_found() {
            tracing::debug!(peer = %self.peer_ref, method = %call.method_ref(), "no endpoint for inbound call");
        }

        let peer = self.clone();
        tokio::spawn(async move { peer.run_inbound(call).await });
    }

    async fn run_inbound(self: Arc<Self>, call: Arc<InboundCall>) {
        let result = call.invoke(self.ctx.codec.as_ref()).await;
        if let Err(e) = &result {
            tracing::debug!(peer = %self.peer_ref, call_id = call.id(), method = %call.method_ref(), error = %e, "inbound call failed");
        }

        if !call.is_no_wait() {
            let reply = match result {
                Ok(value) => SystemCall::Ok(value),
                Err(e) => SystemCall::Error(e),
            };
            self.reply(&call, reply).await;
        }
        self.inbound.unregister(&call);
    }

    /// Sends the result of `call`, waiting for a live link if necessary.
    ///
    /// Gives up once the call is no longer tracked or the peer stops.
    async fn reply(&self, call: &InboundCall, reply: SystemCall) {
        let msg = match reply.to_message(call.id()) {
            Ok(msg) => Arc::new(msg),
            Err(e) => {
                tracing::warn!(peer = %self.peer_ref, call_id = call.id(), error = %e, "could not encode reply");
                return;
            }
        };

        let mut failed = None;
        loop {
            let Some(link) = self.link_other_than(failed.as_ref()).await else {
                return;
            };
            if !self.inbound.is_tracked(call) {
                tracing::debug!(peer = %self.peer_ref, call_id = call.id(), "reply dropped for untracked call");
                return;
            }
            match link.transport.send(msg.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::debug!(peer = %self.peer_ref, call_id = call.id(), error = %e, "reply deferred to next connection");
                    failed = Some(link);
                }
            }
        }
    }

    /// The ids of `request` this side does not track, or a handshake mismatch
    /// when the request was meant for another connection.
    fn answer_reconnect(&self, link: &Link, request: ReconnectRequest) -> SystemCall {
        if request.handshake_index != link.local.index {
            return SystemCall::Error(RemoteError::new(
                RemoteErrorKind::HandshakeMismatch,
                format!("expected handshake #{}, got #{}", link.local.index, request.handshake_index),
            ));
        }

        let mut unknown = Vec::new();
        for (stage, ids) in &request.stages {
            let ids = match seq::decompress(ids) {
                Ok(ids) => ids,
                Err(e) => {
                    return SystemCall::Error(RemoteError::new(
                        RemoteErrorKind::BadArguments,
                        format!("stage {}: {}", stage, e),
                    ));
                }
            };
            unknown.extend(
                ids.into_iter()
                    .filter(|id| i64::try_from(*id).map_or(true, |id| self.inbound.get(id).is_none())),
            );
        }
        tracing::debug!(peer = %self.peer_ref, unknown = unknown.len(), "answered reconnect query");
        SystemCall::Ok(Value::Bytes(seq::compress(unknown)))
    }
}

/// Cancels a call whose caller stopped waiting.
struct PendingCall {
    peer: Arc<Peer>,
    call: Arc<OutboundCall>,
    armed: bool,
}

impl PendingCall {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let cancelled = self.peer.outbound.finish(&self.call, Err(CallError::Cancelled));
        self.peer.outbound.unregister(&self.call);
        if !cancelled || self.call.reconnect_stage().is_none() {
            return;
        }

        tracing::debug!(peer = %self.peer.peer_ref, call_id = self.call.id(), "outbound call cancelled");
        let (Some(link), Ok(runtime)) = (self.peer.link(), tokio::runtime::Handle::try_current()) else {
            return;
        };
        let transport = link.transport.clone();
        let id = self.call.id();
        runtime.spawn(async move {
            if let Ok(msg) = SystemCall::Cancel.to_message(id) {
                let _ = transport.send(Arc::new(msg)).await;
            }
        });
    }
}

fn send_detached(transport: Arc<dyn Transport>, reply: SystemCall, id: i64) {
    tokio::spawn(async move {
        match reply.to_message(id) {
            Ok(msg) => {
                let _ = transport.send(Arc::new(msg)).await;
            }
            Err(e) => tracing::warn!(call_id = id, error = %e, "could not encode system reply"),
        }
    });
}

async fn next_link(mut rx: watch::Receiver<Option<Arc<Link>>>, failed: Option<Arc<Link>>) -> Option<Arc<Link>> {
    let usable = |link: &Option<Arc<Link>>| match (link, &failed) {
        (Some(link), Some(failed)) => !Arc::ptr_eq(link, failed),
        (Some(_), None) => true,
        (None, _) => false,
    };
    match rx.wait_for(usable).await {
        Ok(link) => (*link).clone(),
        Err(_) => None,
    }
}
