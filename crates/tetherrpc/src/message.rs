//! # Messages
//!
//! The immutable wire record exchanged between peers.
//!
//! ## Identity
//!
//! `Message` deliberately implements neither `PartialEq` nor `Hash`: two messages
//! with identical fields are still different messages. Peers pass them around as
//! `Arc<Message>` and compare with `Arc::ptr_eq` when identity matters. This
//! keeps the lazily attached argument list tied to the one message it was
//! decoded (or built) for.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;

use crate::value::Value;
use crate::value::ValueType;

/// Call kinds carried in [`Message::call_kind`].
pub mod call_kind {
    /// A plain request/response (or NoWait) call. System calls use it too.
    pub const REGULAR: u8 = 0;
}

/// Header name prefix announcing a per-argument runtime type.
///
/// The full name is the prefix followed by the decimal argument index, the value
/// is a [`ValueType`] name, e.g. `@argType$1 = list<str>`.
pub const ARG_TYPE_HEADER_PREFIX: &str = "@argType$";

/// Identifies a method on a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub service: String,
    pub method: String,
}

impl MethodRef {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self { service: service.into(), method: method.into() }
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// Serialized argument payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentData {
    Text(String),
    Bytes(Vec<u8>),
}

impl ArgumentData {
    pub fn len(&self) -> usize {
        match self {
            ArgumentData::Text(t) => t.len(),
            ArgumentData::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ArgumentData {
    fn default() -> Self {
        ArgumentData::Bytes(Vec::new())
    }
}

/// A name/value pair. Names may repeat; order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    /// Builds the header announcing the runtime type of argument `index`.
    pub fn arg_type(index: usize, ty: &ValueType) -> Self {
        Self::new(format!("{}{}", ARG_TYPE_HEADER_PREFIX, index), ty.to_string())
    }

    /// Whether the name carries the argument type prefix.
    pub fn is_arg_type(&self) -> bool {
        self.name.starts_with(ARG_TYPE_HEADER_PREFIX)
    }

    /// The argument index of an `@argType$<index>` header.
    ///
    /// Returns `None` for other headers and for unparsable indexes.
    pub fn arg_type_index(&self) -> Option<usize> {
        self.name.strip_prefix(ARG_TYPE_HEADER_PREFIX)?.parse().ok()
    }
}

/// The unit of transport.
#[derive(Debug)]
pub struct Message {
    pub call_kind: u8,
    /// The call id; 0 for NoWait calls and handshakes.
    pub related_id: i64,
    pub method: MethodRef,
    pub argument_data: ArgumentData,
    pub headers: Vec<Header>,
    arguments: OnceLock<Arc<Vec<Value>>>,
}

impl Message {
    pub fn new(
        call_kind: u8,
        related_id: i64,
        method: MethodRef,
        argument_data: ArgumentData,
        headers: Vec<Header>,
    ) -> Self {
        Self { call_kind, related_id, method, argument_data, headers, arguments: OnceLock::new() }
    }

    /// Attaches already known arguments, so in-process receivers skip decoding.
    pub fn with_arguments(self, arguments: Arc<Vec<Value>>) -> Self {
        let _ = self.arguments.set(arguments);
        self
    }

    /// The attached arguments, if they were built or decoded already.
    pub fn arguments(&self) -> Option<&Arc<Vec<Value>>> {
        self.arguments.get()
    }

    /// Attaches decoded arguments unless some are attached already.
    ///
    /// Returns whichever list ends up attached; an existing one always wins.
    pub fn attach_arguments(&self, arguments: Arc<Vec<Value>>) -> &Arc<Vec<Value>> {
        self.arguments.get_or_init(|| arguments)
    }

    /// The value of the first header named `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|h| h.name == name).map(|h| h.value.as_str())
    }

    /// Whether any header announces a runtime argument type.
    pub fn has_arg_type_headers(&self) -> bool {
        self.headers.iter().any(Header::is_arg_type)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message #{}/{}: {}", self.related_id, self.call_kind, self.method)?;
        match self.arguments() {
            Some(args) => write!(f, ", arguments: {:?}", args)?,
            None => write!(f, ", argument data: {} bytes", self.argument_data.len())?,
        }
        if !self.headers.is_empty() {
            let headers: Vec<String> = self.headers.iter().map(|h| format!("{}={}", h.name, h.value)).collect();
            write!(f, ", headers: [{}]", headers.join(", "))?;
        }
        Ok(())
    }
}
