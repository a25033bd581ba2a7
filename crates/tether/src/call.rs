//! # Calls
//!
//! The unit of RPC work on a peer: an [`OutboundCall`] this side issued, or an
//! [`InboundCall`] the remote side asked for.
//!
//! ## Invariants
//! - An outbound call's id is assigned once, by its tracker; 0 means unassigned.
//! - The result slot of an outbound call is set at most once. Whoever sets it
//!   first decides the outcome; later attempts report `false`.
//! - An inbound call's arguments are deserialized at most once and cached on
//!   its message.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tetherrpc::ArgumentCodec;
use tetherrpc::Header;
use tetherrpc::Message;
use tetherrpc::MethodRef;
use tetherrpc::RemoteError;
use tetherrpc::RemoteErrorKind;
use tetherrpc::Value;
use tetherrpc::ValueType;
use tetherrpc::message::call_kind;

use crate::service::MethodDef;
use crate::tracker;
use crate::transport;
use crate::transport::Transport;

// ============================================================================
//  ERRORS
// ============================================================================

/// The terminal failure of an outbound call.
#[derive(Debug, Clone)]
pub enum CallError {
    /// The remote side ran the call and reported a failure.
    Remote(RemoteError),
    /// The call outlived its method's timeout.
    Timeout { method: MethodRef, timeout: Duration, elapsed: Duration },
    /// The peer was stopped; the call may or may not have run remotely.
    PeerUnrecoverable(String),
    /// The call's route changed; retrying it on the new route is safe.
    Rerouted,
    /// The caller gave up on the call.
    Cancelled,
    /// The client stub has no declaration for the method.
    UnknownMethod(MethodRef),
    Codec(tetherrpc::Error),
    Transport(transport::Error),
    Registration(tracker::Error),
}

impl CallError {
    /// Whether the remote side may have executed the call despite this error.
    pub fn is_maybe_completed_remotely(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::PeerUnrecoverable(_) | Self::Rerouted)
    }

    /// Whether the error is a cancellation (by the caller or by peer abort).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::PeerUnrecoverable(_))
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(e) => write!(f, "Remote error: {}", e),
            Self::Timeout { method, timeout, elapsed } => {
                write!(f, "Call {} timed out after {:?} (timeout {:?})", method, elapsed, timeout)
            }
            Self::PeerUnrecoverable(reason) => write!(f, "Peer is unrecoverable: {}", reason),
            Self::Rerouted => write!(f, "Call was rerouted"),
            Self::Cancelled => write!(f, "Call was cancelled"),
            Self::UnknownMethod(method) => write!(f, "Unknown method: {}", method),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Registration(e) => write!(f, "Registration error: {}", e),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(e) => Some(e),
            Self::Codec(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::Registration(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RemoteError> for CallError {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

impl From<tetherrpc::Error> for CallError {
    fn from(e: tetherrpc::Error) -> Self {
        Self::Codec(e)
    }
}

impl From<transport::Error> for CallError {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<tracker::Error> for CallError {
    fn from(e: tracker::Error) -> Self {
        Self::Registration(e)
    }
}

pub type CallResult = Result<Value, CallError>;

// ============================================================================
//  OUTBOUND
// ============================================================================

/// How far an outbound request got on its way to the remote side.
///
/// Calls without a stage were never written to a transport and are always
/// resent after a reconnect. Staged calls are reported to the remote side,
/// grouped by stage, which answers with the ids it has not seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReconnectStage(pub u8);

impl ReconnectStage {
    /// The request was written to the transport of a live connection.
    pub const SENT: Self = Self(0);
}

const UNSTAGED: u8 = u8::MAX;

pub struct OutboundCall {
    id: AtomicI64,
    method: Arc<MethodDef>,
    arguments: Arc<Vec<Value>>,
    started_at: OnceLock<Instant>,
    message: OnceLock<Arc<Message>>,
    stage: AtomicU8,
    timeout_reported: AtomicBool,
    routed: bool,
    result: watch::Sender<Option<CallResult>>,
}

impl OutboundCall {
    pub fn new(method: Arc<MethodDef>, arguments: Vec<Value>) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            id: AtomicI64::new(0),
            method,
            arguments: Arc::new(arguments),
            started_at: OnceLock::new(),
            message: OnceLock::new(),
            stage: AtomicU8::new(UNSTAGED),
            timeout_reported: AtomicBool::new(false),
            routed: false,
            result,
        }
    }

    /// Marks the call as placed by the hub's router. Only routed calls can
    /// be rerouted; a call made on a chosen peer stays there.
    pub fn routed(mut self) -> Self {
        self.routed = true;
        self
    }

    pub fn is_routed(&self) -> bool {
        self.routed
    }

    /// The assigned id, or 0 before registration.
    pub fn id(&self) -> i64 {
        self.id.load(Ordering::Acquire)
    }

    /// Assigns the id and start stamp. Fails if an id is already assigned.
    pub(crate) fn assign_id(&self, id: i64, now: Instant) -> bool {
        if self.id.compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return false;
        }
        let _ = self.started_at.set(now);
        true
    }

    pub fn method(&self) -> &Arc<MethodDef> {
        &self.method
    }

    pub fn arguments(&self) -> &Arc<Vec<Value>> {
        &self.arguments
    }

    pub fn is_no_wait(&self) -> bool {
        self.method.no_wait
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at.get().copied()
    }

    pub fn reconnect_stage(&self) -> Option<ReconnectStage> {
        match self.stage.load(Ordering::Acquire) {
            UNSTAGED => None,
            stage => Some(ReconnectStage(stage)),
        }
    }

    pub(crate) fn set_reconnect_stage(&self, stage: ReconnectStage) {
        self.stage.store(stage.0, Ordering::Release);
    }

    pub fn message(&self) -> Option<&Arc<Message>> {
        self.message.get()
    }

    pub(crate) fn set_message(&self, msg: Arc<Message>) {
        let _ = self.message.set(msg);
    }

    /// Builds the request message, announcing argument types that are
    /// narrower than the declared parameter types.
    pub(crate) fn build_message(&self, codec: &dyn ArgumentCodec) -> Result<Arc<Message>, CallError> {
        let mut headers = Vec::new();
        for (index, (param, arg)) in self.method.params.iter().zip(self.arguments.iter()).enumerate() {
            let actual = arg.value_type();
            if *param != actual && param.is_assignable_from(&actual) {
                headers.push(Header::arg_type(index, &actual));
            }
        }

        let related_id = if self.is_no_wait() { 0 } else { self.id() };
        let msg = Message::new(
            call_kind::REGULAR,
            related_id,
            self.method.method.clone(),
            codec.serialize(&self.arguments)?,
            headers,
        )
        .with_arguments(self.arguments.clone());
        Ok(Arc::new(msg))
    }

    /// Writes the request to `transport` and marks it [`ReconnectStage::SENT`].
    ///
    /// Returns `Ok(false)` without sending if the call already completed or
    /// has no message yet.
    pub(crate) async fn send(&self, transport: &dyn Transport) -> transport::Result<bool> {
        if self.is_completed() {
            return Ok(false);
        }
        let Some(msg) = self.message().cloned() else {
            return Ok(false);
        };
        transport.send(msg).await?;
        self.set_reconnect_stage(ReconnectStage::SENT);
        Ok(true)
    }

    pub fn is_completed(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// Sets the terminal result unless one is set already.
    pub fn set_result(&self, result: CallResult) -> bool {
        self.result.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }

    pub fn try_result(&self) -> Option<CallResult> {
        (*self.result.borrow()).clone()
    }

    /// Waits for the terminal result.
    pub async fn result(&self) -> CallResult {
        let mut rx = self.result.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone().unwrap_or(Err(CallError::Cancelled)),
            Err(_) => Err(CallError::Cancelled),
        }
    }

    /// Marks the timeout as reported; true only the first time.
    pub(crate) fn mark_timeout_reported(&self) -> bool {
        !self.timeout_reported.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for OutboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundCall")
            .field("id", &self.id())
            .field("method", &self.method.method)
            .field("stage", &self.reconnect_stage())
            .field("completed", &self.is_completed())
            .finish()
    }
}

// ============================================================================
//  INBOUND
// ============================================================================

pub struct InboundCall {
    message: Arc<Message>,
    method: Option<Arc<MethodDef>>,
    scope: CancellationToken,
}

impl InboundCall {
    /// `method` is `None` when nothing implements the requested method.
    /// `scope` is usually a child of the peer's token, so peer teardown
    /// cancels the call as well.
    pub fn new(message: Arc<Message>, method: Option<Arc<MethodDef>>, scope: CancellationToken) -> Self {
        Self { message, method, scope }
    }

    pub fn id(&self) -> i64 {
        self.message.related_id
    }

    pub fn is_no_wait(&self) -> bool {
        self.message.related_id == 0
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    pub fn method_ref(&self) -> &MethodRef {
        &self.message.method
    }

    pub fn is_endpoint_found(&self) -> bool {
        self.method.as_ref().is_some_and(|def| def.handler().is_some())
    }

    /// Cancels this call only (remote `$sys.Cancel`), never its parent.
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Runs the handler and captures every outcome as a `Result`.
    ///
    /// The handler receives the call's token. Panics become `HandlerFailed`.
    pub async fn invoke(&self, codec: &dyn ArgumentCodec) -> Result<Value, RemoteError> {
        let Some((def, handler)) = self
            .method
            .as_ref()
            .and_then(|def| def.handler().map(|handler| (def, handler.clone())))
        else {
            return Err(RemoteError::endpoint_not_found(self.method_ref()));
        };
        let args = self.arguments(def, codec)?;

        if self.scope.is_cancelled() {
            return Err(cancelled_error());
        }

        let run = {
            let scope = self.scope.clone();
            let args = args.as_ref().clone();
            async move { handler(args, scope).await }
        };
        let outcome = tokio::select! {
            biased;
            _ = self.scope.cancelled() => return Err(cancelled_error()),
            outcome = AssertUnwindSafe(run).catch_unwind() => outcome,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RemoteError::new(RemoteErrorKind::HandlerFailed, format!("{:#}", e))),
            Err(panic) => Err(RemoteError::new(
                RemoteErrorKind::HandlerFailed,
                format!("handler panicked: {}", panic_message(panic.as_ref())),
            )),
        }
    }

    /// The call's arguments, deserialized on first use.
    fn arguments(&self, def: &MethodDef, codec: &dyn ArgumentCodec) -> Result<Arc<Vec<Value>>, RemoteError> {
        let types = self.effective_types(def)?;

        if let Some(args) = self.message.arguments() {
            if args.len() != types.len() {
                return Err(RemoteError::new(
                    RemoteErrorKind::BadArguments,
                    format!("expected {} arguments, got {}", types.len(), args.len()),
                ));
            }
            if let Some(index) = types.iter().zip(args.iter()).position(|(ty, arg)| !ty.accepts(arg)) {
                return Err(RemoteError::new(
                    RemoteErrorKind::IncompatibleArgumentType,
                    format!("argument {} is a {}, expected {}", index, args[index].kind(), types[index]),
                ));
            }
            return Ok(args.clone());
        }

        let values = codec
            .deserialize(&self.message.argument_data, &types)
            .map_err(|e| RemoteError::new(RemoteErrorKind::BadArguments, e.to_string()))?;
        Ok(self.message.attach_arguments(Arc::new(values)).clone())
    }

    /// Declared parameter types with `@argType$` overrides applied.
    fn effective_types(&self, def: &MethodDef) -> Result<Vec<ValueType>, RemoteError> {
        let mut types = def.params.clone();
        for header in self.message.headers.iter().filter(|h| h.is_arg_type()) {
            let incompatible = |why: String| {
                RemoteError::new(RemoteErrorKind::IncompatibleArgumentType, format!("{}: {}", header.name, why))
            };
            let index = header
                .arg_type_index()
                .filter(|i| *i < types.len())
                .ok_or_else(|| incompatible("no such argument".into()))?;
            let announced: ValueType = header.value.parse().map_err(|e: tetherrpc::Error| incompatible(e.to_string()))?;
            if !types[index].is_assignable_from(&announced) {
                return Err(incompatible(format!("{} cannot hold {}", types[index], announced)));
            }
            types[index] = announced;
        }
        Ok(types)
    }
}

impl fmt::Debug for InboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundCall")
            .field("id", &self.id())
            .field("method", self.method_ref())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn cancelled_error() -> RemoteError {
    RemoteError::new(RemoteErrorKind::Cancelled, "call was cancelled")
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
