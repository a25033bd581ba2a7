//! # System Calls
//!
//! Control messages exchanged between peers under the reserved `$sys` service:
//! the handshake, call completions, remote cancellation and the reconnect
//! query. Their argument payload is always a tetherpack List:
//!
//! ```text
//! Handshake  [peer_id: u64, protocol_version: u32, index: u32]     related_id = 0
//! Ok         [result: value]                                       related_id = call id
//! Error      [kind: str, message: str]                             related_id = call id
//! Cancel     []                                                    related_id = call id
//! Reconnect  [handshake_index: u32, [[stage: u8, ids: bytes], ..]] related_id = call id
//! ```
//!
//! A `Reconnect` is itself a regular call: the responder answers it with an
//! `Ok` whose value is the compressed list of ids to resend, as produced by
//! [`crate::seq::compress`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tetherpack::Decoder;
use tetherpack::Encoder;
use tetherpack::ListIter;

use crate::codec::decode_value;
use crate::codec::encode_value;
use crate::error::Error;
use crate::error::Result;
use crate::message::call_kind;
use crate::message::ArgumentData;
use crate::message::Message;
use crate::message::MethodRef;
use crate::value::Value;
use crate::value::ValueType;

/// The reserved service name. Applications cannot register it.
pub const SYSTEM_SERVICE: &str = "$sys";

/// Method names of the system service.
pub mod method {
    pub const HANDSHAKE: &str = "Handshake";
    pub const OK: &str = "Ok";
    pub const ERROR: &str = "Error";
    pub const CANCEL: &str = "Cancel";
    pub const RECONNECT: &str = "Reconnect";
}

/// Whether `msg` targets the system service.
pub fn is_system(msg: &Message) -> bool {
    msg.method.service == SYSTEM_SERVICE
}

// ============================================================================
//  PAYLOADS
// ============================================================================

/// The first message each side writes on a fresh connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Random per-process identity; a change means the remote restarted.
    pub peer_id: u64,
    pub protocol_version: u32,
    /// Counts connections made by the sender, starting at 1.
    pub index: u32,
}

/// Arguments of `$sys.Reconnect`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectRequest {
    /// The responder's handshake index the caller observed on this connection.
    pub handshake_index: u32,
    /// Compressed call ids, grouped by reconnect stage.
    pub stages: BTreeMap<u8, Vec<u8>>,
}

/// Classifies failures reported by the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// No handler is registered for the method.
    EndpointNotFound,
    /// An `@argType$` header names a type the parameter cannot hold.
    IncompatibleArgumentType,
    /// The argument payload could not be deserialized.
    BadArguments,
    /// The handler returned an error or panicked.
    HandlerFailed,
    /// The call was cancelled on the remote side.
    Cancelled,
    /// A reconnect query referred to an older connection.
    HandshakeMismatch,
    /// A kind this build does not know.
    Other(String),
}

impl RemoteErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::EndpointNotFound => "EndpointNotFound",
            Self::IncompatibleArgumentType => "IncompatibleArgumentType",
            Self::BadArguments => "BadArguments",
            Self::HandlerFailed => "HandlerFailed",
            Self::Cancelled => "Cancelled",
            Self::HandshakeMismatch => "HandshakeMismatch",
            Self::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "EndpointNotFound" => Self::EndpointNotFound,
            "IncompatibleArgumentType" => Self::IncompatibleArgumentType,
            "BadArguments" => Self::BadArguments,
            "HandlerFailed" => Self::HandlerFailed,
            "Cancelled" => Self::Cancelled,
            "HandshakeMismatch" => Self::HandshakeMismatch,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by the remote side through `$sys.Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn endpoint_not_found(method: &MethodRef) -> Self {
        Self::new(RemoteErrorKind::EndpointNotFound, format!("Endpoint not found: {}", method))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

// ============================================================================
//  SYSTEM CALL
// ============================================================================

/// A decoded system message.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemCall {
    Handshake(Handshake),
    Ok(Value),
    Error(RemoteError),
    Cancel,
    Reconnect(ReconnectRequest),
}

impl SystemCall {
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Handshake(_) => method::HANDSHAKE,
            Self::Ok(_) => method::OK,
            Self::Error(_) => method::ERROR,
            Self::Cancel => method::CANCEL,
            Self::Reconnect(_) => method::RECONNECT,
        }
    }

    /// Builds the message carrying this system call for call `related_id`.
    pub fn to_message(&self, related_id: i64) -> Result<Message> {
        let mut enc = Encoder::new();
        enc.list_begin()?;
        match self {
            Self::Handshake(h) => {
                enc.u64(h.peer_id)?;
                enc.u32(h.protocol_version)?;
                enc.u32(h.index)?;
            }
            Self::Ok(value) => encode_value(&mut enc, value)?,
            Self::Error(err) => {
                enc.str(err.kind.as_str())?;
                enc.str(&err.message)?;
            }
            Self::Cancel => {}
            Self::Reconnect(req) => {
                enc.u32(req.handshake_index)?;
                enc.list_begin()?;
                for (stage, ids) in &req.stages {
                    enc.list_begin()?;
                    enc.u8(*stage)?;
                    enc.bytes(ids)?;
                    enc.list_end()?;
                }
                enc.list_end()?;
            }
        }
        enc.list_end()?;

        let msg = Message::new(
            call_kind::REGULAR,
            related_id,
            MethodRef::new(SYSTEM_SERVICE, self.method_name()),
            ArgumentData::Bytes(enc.into_bytes()?),
            Vec::new(),
        );
        Ok(match self {
            Self::Ok(value) => msg.with_arguments(Arc::new(vec![value.clone()])),
            _ => msg,
        })
    }

    /// Decodes a `$sys` message.
    pub fn decode(msg: &Message) -> Result<Self> {
        if !is_system(msg) {
            return Err(Error::ProtocolViolation(format!("{} is not a system call", msg.method)));
        }
        let ArgumentData::Bytes(bytes) = &msg.argument_data else {
            return Err(Error::UnsupportedPayload("text"));
        };

        let mut dec = Decoder::new(bytes);
        let mut items = dec.list()?;
        let mut next = || next_item(&mut items, msg);

        let call = match msg.method.method.as_str() {
            method::HANDSHAKE => Self::Handshake(Handshake {
                peer_id: next()?.u64()?,
                protocol_version: next()?.u32()?,
                index: next()?.u32()?,
            }),
            method::OK => Self::Ok(decode_value(&mut next()?, &ValueType::Any)?),
            method::ERROR => {
                let kind = RemoteErrorKind::parse(next()?.str()?);
                let message = next()?.str()?.to_string();
                Self::Error(RemoteError { kind, message })
            }
            method::CANCEL => Self::Cancel,
            method::RECONNECT => {
                let handshake_index = next()?.u32()?;
                let mut stages = BTreeMap::new();
                let mut list = next()?;
                let mut entries = list.list()?;
                while let Some(mut entry) = entries.next()? {
                    let mut fields = entry.list()?;
                    let missing = || Error::ProtocolViolation("truncated reconnect stage".into());
                    let stage = fields.next()?.ok_or_else(missing)?.u8()?;
                    let ids = fields.next()?.ok_or_else(missing)?.bytes()?.to_vec();
                    stages.insert(stage, ids);
                }
                Self::Reconnect(ReconnectRequest { handshake_index, stages })
            }
            other => {
                return Err(Error::ProtocolViolation(format!("unknown system method: {}", other)));
            }
        };
        Ok(call)
    }
}

fn next_item<'a>(items: &mut ListIter<'a>, msg: &Message) -> Result<Decoder<'a>> {
    items
        .next()?
        .ok_or_else(|| Error::ProtocolViolation(format!("truncated {}", msg.method)))
}
