//! # Service Client
//!
//! The base of hand-written client stubs: resolves a method by name against a
//! [`ServiceDef`], picks the peer and issues the call.
//!
//! ```ignore
//! struct Calculator(ServiceClient);
//!
//! impl Calculator {
//!     async fn add(&self, a: i64, b: i64) -> client::Result<Value> {
//!         self.0.call("Add", vec![Value::I64(a), Value::I64(b)]).await
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use tetherrpc::MethodRef;
use tetherrpc::Value;

use crate::call::CallError;
use crate::hub;
use crate::hub::Hub;
use crate::peer::Peer;
use crate::peer::PeerRef;
use crate::service::MethodDef;
use crate::service::ServiceDef;

/// Calls failed with `Rerouted` are retried this many times.
pub const MAX_REROUTES: usize = 8;

#[derive(Debug)]
pub enum Error {
    Call(CallError),
    Hub(hub::Error),
    /// The router has no peer for the method.
    NoRoute(MethodRef),
}

impl Error {
    /// The call error, if the call was issued at all.
    pub fn as_call_error(&self) -> Option<&CallError> {
        match self {
            Self::Call(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(e) => write!(f, "{}", e),
            Self::Hub(e) => write!(f, "Hub error: {}", e),
            Self::NoRoute(method) => write!(f, "No route for {}", method),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Call(e) => Some(e),
            Self::Hub(e) => Some(e),
            Self::NoRoute(_) => None,
        }
    }
}

impl From<CallError> for Error {
    fn from(e: CallError) -> Self {
        Self::Call(e)
    }
}

impl From<hub::Error> for Error {
    fn from(e: hub::Error) -> Self {
        Self::Hub(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone)]
pub struct ServiceClient {
    hub: Hub,
    service: ServiceDef,
    peer: Option<PeerRef>,
}

impl ServiceClient {
    /// With `peer` set every call goes there, otherwise the hub routes.
    pub fn new(hub: Hub, service: ServiceDef, peer: Option<PeerRef>) -> Self {
        Self { hub, service, peer }
    }

    pub fn service(&self) -> &ServiceDef {
        &self.service
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let def = self
            .service
            .method(method)
            .cloned()
            .ok_or_else(|| CallError::UnknownMethod(MethodRef::new(self.service.name(), method)))?;

        let mut attempt = 0;
        loop {
            let peer = self.resolve(&def)?;
            let result = match self.peer {
                Some(_) => peer.call(def.clone(), args.clone()).await,
                None => peer.call_routed(def.clone(), args.clone()).await,
            };
            match result {
                Err(CallError::Rerouted) if attempt < MAX_REROUTES => {
                    attempt += 1;
                    tracing::debug!(method = %def.method, attempt, "retrying rerouted call");
                }
                result => return Ok(result?),
            }
        }
    }

    fn resolve(&self, def: &MethodDef) -> Result<Arc<Peer>> {
        let peer_ref = match &self.peer {
            Some(peer_ref) => peer_ref.clone(),
            None => self.hub.route(&def.method).ok_or_else(|| Error::NoRoute(def.method.clone()))?,
        };
        Ok(self.hub.peer(peer_ref)?)
    }
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service", &self.service.name())
            .field("peer", &self.peer)
            .finish()
    }
}
