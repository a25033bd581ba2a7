//! # Hub
//!
//! The process-wide entry point: owns the service registry, the connectors,
//! the router and every [`Peer`].
//!
//! Peers are created on first reference with [`Hub::peer`] and live until the
//! hub shuts down. The hub is a cheap, cloneable handle; all clones share the
//! same peers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::watch;

use tetherrpc::ArgumentCodec;
use tetherrpc::MethodRef;
use tetherrpc::PackCodec;

use crate::client::ServiceClient;
use crate::clock::Clock;
use crate::clock::TokioClock;
use crate::config::MonitorConfig;
use crate::config::RpcConfig;
use crate::monitor::PeerStateMonitor;
use crate::peer::Peer;
use crate::peer::PeerContext;
use crate::peer::PeerRef;
use crate::service;
use crate::service::ServiceDef;
use crate::service::ServiceRegistry;
use crate::transport::Connector;

#[derive(Debug)]
pub enum Error {
    /// Neither a peer-specific nor a default connector is configured.
    NoConnector(PeerRef),
    PeerExists(PeerRef),
    ShutDown,
    Service(service::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConnector(peer) => write!(f, "No connector for peer: {}", peer),
            Self::PeerExists(peer) => write!(f, "Peer already exists: {}", peer),
            Self::ShutDown => write!(f, "Hub is shut down"),
            Self::Service(e) => write!(f, "Service error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<service::Error> for Error {
    fn from(e: service::Error) -> Self {
        Self::Service(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Picks the peer that serves a method. `None` means unroutable.
pub type Router = Arc<dyn Fn(&MethodRef) -> Option<PeerRef> + Send + Sync>;

struct HubInner {
    ctx: Arc<PeerContext>,
    monitor_config: Arc<MonitorConfig>,
    default_connector: Option<Arc<dyn Connector>>,
    connectors: DashMap<PeerRef, Arc<dyn Connector>>,
    peers: DashMap<PeerRef, Arc<Peer>>,
    router: watch::Sender<Option<Router>>,
    shut_down: AtomicBool,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn builder() -> HubBuilder {
        HubBuilder::new()
    }

    /// The random id this hub announces in every handshake.
    pub fn peer_id(&self) -> u64 {
        self.inner.ctx.local_peer_id
    }

    pub fn config(&self) -> &Arc<RpcConfig> {
        &self.inner.ctx.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.ctx.clock
    }

    // ========================================================================
    //  PEERS
    // ========================================================================

    /// The peer named `peer_ref`, created and started on first use.
    pub fn peer(&self, peer_ref: impl Into<PeerRef>) -> Result<Arc<Peer>> {
        let peer_ref = peer_ref.into();
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        if let Some(peer) = self.inner.peers.get(&peer_ref) {
            return Ok(peer.clone());
        }

        let connector = self.connector(&peer_ref)?;
        let ctx = self.inner.ctx.clone();
        let peer = self
            .inner
            .peers
            .entry(peer_ref.clone())
            .or_insert_with(|| {
                tracing::info!(peer = %peer_ref, "starting peer");
                Peer::spawn(peer_ref, ctx, connector)
            })
            .value()
            .clone();

        // A shutdown that cleared the map before this insert never saw it.
        if self.is_shut_down() {
            self.inner.peers.remove_if(peer.peer_ref(), |_, entry| Arc::ptr_eq(entry, &peer));
            peer.begin_stop();
            return Err(Error::ShutDown);
        }
        Ok(peer)
    }

    /// Registers `connector` for `peer_ref` and starts the peer.
    pub fn add_peer(&self, peer_ref: impl Into<PeerRef>, connector: impl Connector) -> Result<Arc<Peer>> {
        let peer_ref = peer_ref.into();
        if self.inner.peers.contains_key(&peer_ref) {
            return Err(Error::PeerExists(peer_ref));
        }
        self.inner.connectors.insert(peer_ref.clone(), Arc::new(connector));
        self.peer(peer_ref)
    }

    pub fn get_peer(&self, peer_ref: &PeerRef) -> Option<Arc<Peer>> {
        self.inner.peers.get(peer_ref).map(|peer| peer.clone())
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Stops and forgets one peer. Its outbound calls fail as unrecoverable.
    pub async fn remove_peer(&self, peer_ref: &PeerRef) -> bool {
        let Some((_, peer)) = self.inner.peers.remove(peer_ref) else {
            return false;
        };
        peer.stop().await;
        true
    }

    fn connector(&self, peer_ref: &PeerRef) -> Result<Arc<dyn Connector>> {
        self.inner
            .connectors
            .get(peer_ref)
            .map(|c| c.value().clone())
            .or_else(|| self.inner.default_connector.clone())
            .ok_or_else(|| Error::NoConnector(peer_ref.clone()))
    }

    // ========================================================================
    //  ROUTING
    // ========================================================================

    pub fn set_router(&self, router: impl Fn(&MethodRef) -> Option<PeerRef> + Send + Sync + 'static) {
        self.inner.router.send_replace(Some(Arc::new(router)));
    }

    /// The peer currently serving `method`.
    pub fn route(&self, method: &MethodRef) -> Option<PeerRef> {
        let router = self.inner.router.borrow().clone();
        router.and_then(|router| router(method))
    }

    /// Fails every in-progress routed call whose method now routes to
    /// another peer with `Rerouted`. Calls made on a chosen peer (see
    /// [`Hub::client_for`]) are left alone. Returns the number of rerouted
    /// calls.
    pub fn reroute_calls(&self) -> usize {
        let Some(router) = self.inner.router.borrow().clone() else {
            return 0;
        };
        let mut rerouted = 0;
        for peer in self.peers() {
            let current = peer.peer_ref().clone();
            rerouted += peer.reroute(|call| {
                call.is_routed() && router(&call.method().method).as_ref() != Some(&current)
            });
        }
        if rerouted > 0 {
            tracing::info!(rerouted, "calls rerouted");
        }
        rerouted
    }

    // ========================================================================
    //  MONITORING AND CLIENTS
    // ========================================================================

    /// A state monitor for `peer_ref` that follows the peer across restarts.
    pub fn monitor(&self, peer_ref: impl Into<PeerRef>) -> Result<PeerStateMonitor> {
        let peer_ref = peer_ref.into();
        let raw = self.peer(peer_ref.clone())?.state();
        let hub: Weak<HubInner> = Arc::downgrade(&self.inner);
        let resubscribe = move || {
            let inner = hub.upgrade()?;
            Hub { inner }.peer(peer_ref.clone()).ok().map(|peer| peer.state())
        };
        Ok(PeerStateMonitor::with_source(
            raw,
            resubscribe,
            self.inner.monitor_config.clone(),
            self.inner.ctx.clock.clone(),
        ))
    }

    /// A client for `service` that routes each call with the hub's router.
    pub fn client(&self, service: ServiceDef) -> ServiceClient {
        ServiceClient::new(self.clone(), service, None)
    }

    /// A client for `service` pinned to one peer.
    pub fn client_for(&self, peer_ref: impl Into<PeerRef>, service: ServiceDef) -> ServiceClient {
        ServiceClient::new(self.clone(), service, Some(peer_ref.into()))
    }

    // ========================================================================
    //  SHUTDOWN
    // ========================================================================

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Stops every peer and waits for their call trackers to abort.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let peers: Vec<Arc<Peer>> = self.peers();
        tracing::info!(peers = peers.len(), "shutting down hub");
        futures::future::join_all(peers.iter().map(|peer| peer.stop())).await;
        self.inner.peers.clear();
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("peer_id", &self.peer_id())
            .field("peers", &self.inner.peers.len())
            .finish()
    }
}

/// Fluent builder for a [`Hub`].
pub struct HubBuilder {
    config: RpcConfig,
    monitor_config: MonitorConfig,
    services: Vec<ServiceDef>,
    codec: Arc<dyn ArgumentCodec>,
    clock: Arc<dyn Clock>,
    peer_id: Option<u64>,
    default_connector: Option<Arc<dyn Connector>>,
    connectors: HashMap<PeerRef, Arc<dyn Connector>>,
    router: Option<Router>,
}

impl HubBuilder {
    pub fn new() -> Self {
        Self {
            config: RpcConfig::default(),
            monitor_config: MonitorConfig::default(),
            services: Vec::new(),
            codec: Arc::new(PackCodec),
            clock: Arc::new(TokioClock),
            peer_id: None,
            default_connector: None,
            connectors: HashMap::new(),
            router: None,
        }
    }

    pub fn config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    pub fn monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    pub fn service(mut self, service: ServiceDef) -> Self {
        self.services.push(service);
        self
    }

    pub fn codec(mut self, codec: impl ArgumentCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Overrides the random handshake id, e.g. to simulate a restart.
    pub fn peer_id(mut self, peer_id: u64) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    /// Used for every peer without a connector of its own.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.default_connector = Some(Arc::new(connector));
        self
    }

    pub fn peer_connector(mut self, peer_ref: impl Into<PeerRef>, connector: impl Connector) -> Self {
        self.connectors.insert(peer_ref.into(), Arc::new(connector));
        self
    }

    pub fn router(mut self, router: impl Fn(&MethodRef) -> Option<PeerRef> + Send + Sync + 'static) -> Self {
        self.router = Some(Arc::new(router));
        self
    }

    pub fn build(self) -> Result<Hub> {
        let mut services = ServiceRegistry::new();
        for service in self.services {
            services.add(service)?;
        }

        let local_peer_id = self.peer_id.unwrap_or_else(|| rand::thread_rng().r#gen::<u64>().max(1));
        let ctx = PeerContext {
            local_peer_id,
            config: Arc::new(self.config),
            services: Arc::new(services),
            codec: self.codec,
            clock: self.clock,
        };
        let (router, _) = watch::channel(self.router);

        tracing::debug!(peer_id = local_peer_id, methods = ctx.services.len(), "hub built");
        Ok(Hub {
            inner: Arc::new(HubInner {
                ctx: Arc::new(ctx),
                monitor_config: Arc::new(self.monitor_config),
                default_connector: self.default_connector,
                connectors: self.connectors.into_iter().collect(),
                peers: DashMap::new(),
                router,
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

impl Default for HubBuilder {
    fn default() -> Self {
        Self::new()
    }
}
