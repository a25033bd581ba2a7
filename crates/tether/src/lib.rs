//! # Tether
//!
//! Bidirectional RPC between peers that keep their calls alive across
//! reconnects. A [`Hub`] owns one [`Peer`] per remote endpoint; each peer owns
//! an outbound and an inbound call tracker and reconnects in place.

pub mod call;
pub mod client;
pub mod clock;
pub mod config;
pub mod hub;
pub mod mock_transport;
pub mod monitor;
pub mod peer;
pub mod service;
pub mod tracker;
pub mod transport;


pub use call::CallError;
pub use call::CallResult;
pub use call::InboundCall;
pub use call::OutboundCall;
pub use call::ReconnectStage;
pub use client::ServiceClient;
pub use clock::Clock;
pub use clock::TokioClock;
pub use config::CallTimeouts;
pub use config::MonitorConfig;
pub use config::RpcConfig;
pub use config::TimeoutAction;
pub use hub::Hub;
pub use hub::HubBuilder;
pub use monitor::PeerState;
pub use monitor::PeerStateKind;
pub use monitor::PeerStateMonitor;
pub use peer::ConnectionState;
pub use peer::Link;
pub use peer::Peer;
pub use peer::PeerRef;
pub use service::MethodDef;
pub use service::ServiceBuilder;
pub use service::ServiceDef;
pub use service::ServiceRegistry;
pub use tracker::InboundCallTracker;
pub use tracker::OutboundCallTracker;
pub use transport::Connector;
pub use transport::Transport;

pub use tokio_util::sync::CancellationToken;

pub use tetherrpc::Value;
pub use tetherrpc::ValueType;
