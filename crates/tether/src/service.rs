//! # Services
//!
//! An explicit dispatch table from `(service, method)` to handler thunks.
//!
//! ## Philosophy
//!
//! - **Registration, not Reflection**: services are described once with a
//!   [`ServiceBuilder`]. The same [`ServiceDef`] serves both sides: the server
//!   registers it with handlers, a client builds it without handlers and uses
//!   the declarations for argument types, timeouts and NoWait.
//! - **Handlers are Thunks**: a handler receives the decoded arguments and the
//!   call's [`CancellationToken`], and returns `anyhow::Result<Value>`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::future::FutureExt;

use tokio_util::sync::CancellationToken;

use tetherrpc::MethodRef;
use tetherrpc::Value;
use tetherrpc::ValueType;
use tetherrpc::system::SYSTEM_SERVICE;

use crate::config::CallTimeouts;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The `$sys` service is reserved for control messages.
    ReservedService(String),
    DuplicateMethod(MethodRef),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedService(name) => write!(f, "Service name is reserved: {}", name),
            Self::DuplicateMethod(method) => write!(f, "Method registered twice: {}", method),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A type-erased method implementation.
pub type Handler = Arc<dyn Fn(Vec<Value>, CancellationToken) -> HandlerFuture + Send + Sync>;

/// A method declaration, optionally with its implementation.
pub struct MethodDef {
    pub method: MethodRef,
    pub params: Vec<ValueType>,
    /// Fire-and-forget: no id, no tracking, no reply.
    pub no_wait: bool,
    /// Overrides `RpcConfig::call_timeouts` when set.
    pub timeouts: Option<CallTimeouts>,
    handler: Option<Handler>,
}

impl MethodDef {
    pub fn new(service: impl Into<String>, name: impl Into<String>, params: Vec<ValueType>) -> Self {
        Self {
            method: MethodRef::new(service, name),
            params,
            no_wait: false,
            timeouts: None,
            handler: None,
        }
    }

    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }

    pub fn is_system(&self) -> bool {
        self.method.service == SYSTEM_SERVICE
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("method", &self.method)
            .field("params", &self.params)
            .field("no_wait", &self.no_wait)
            .field("timeouts", &self.timeouts)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Erases a handler closure.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Vec<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |args, scope| f(args, scope).boxed())
}

/// The methods of one service.
#[derive(Debug, Clone)]
pub struct ServiceDef {
    name: String,
    methods: Vec<Arc<MethodDef>>,
}

impl ServiceDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodDef>> {
        self.methods.iter().find(|m| m.method.method == name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodDef>> {
        self.methods.iter()
    }
}

/// Fluent builder for a [`ServiceDef`].
///
/// Settings like [`no_wait`](Self::no_wait) apply to the most recently added
/// method.
pub struct ServiceBuilder {
    name: String,
    methods: Vec<MethodDef>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), methods: Vec::new() }
    }

    /// Declares a method without an implementation (client side).
    pub fn declare(mut self, name: impl Into<String>, params: Vec<ValueType>) -> Self {
        self.methods.push(MethodDef::new(self.name.clone(), name, params));
        self
    }

    /// Declares and implements a method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, params: Vec<ValueType>, f: F) -> Self
    where
        F: Fn(Vec<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let mut def = MethodDef::new(self.name.clone(), name, params);
        def.handler = Some(handler(f));
        self.methods.push(def);
        self
    }

    pub fn no_wait(mut self) -> Self {
        if let Some(def) = self.methods.last_mut() {
            def.no_wait = true;
        }
        self
    }

    pub fn timeouts(mut self, timeouts: CallTimeouts) -> Self {
        if let Some(def) = self.methods.last_mut() {
            def.timeouts = Some(timeouts);
        }
        self
    }

    pub fn build(self) -> ServiceDef {
        ServiceDef {
            name: self.name,
            methods: self.methods.into_iter().map(Arc::new).collect(),
        }
    }
}

/// The dispatch table of a hub.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    methods: HashMap<MethodRef, Arc<MethodDef>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, service: ServiceDef) -> Result<()> {
        if service.name == SYSTEM_SERVICE {
            return Err(Error::ReservedService(service.name));
        }
        // Validate the whole service first; a rejected add changes nothing.
        let mut seen = HashSet::new();
        for def in &service.methods {
            if self.methods.contains_key(&def.method) || !seen.insert(&def.method) {
                return Err(Error::DuplicateMethod(def.method.clone()));
            }
        }
        for def in service.methods {
            self.methods.insert(def.method.clone(), def);
        }
        Ok(())
    }

    /// The implemented method behind `method`, if any.
    pub fn get(&self, method: &MethodRef) -> Option<&Arc<MethodDef>> {
        self.methods.get(method).filter(|def| def.handler.is_some())
    }

    /// Whether `method` is registered, implemented or only declared.
    pub fn contains(&self, method: &MethodRef) -> bool {
        self.methods.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
