//! # Error Definitions
//!
//! Failures of the wire layer: framing, value decoding, and system-call payloads.
//! Remote execution failures are not here; they travel as [`crate::RemoteError`].

use tetherpack::Error as PackError;

/// Operational failures within the RPC wire layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The underlying tetherpack encoding failed.
    Pack(PackError),
    /// The wire value did not match the expected type.
    TypeMismatch { expected: String, found: String },
    /// A type name in a header could not be parsed.
    UnknownType(String),
    /// The number of decoded arguments differs from the parameter count.
    ArgumentCount { expected: usize, found: usize },
    /// The codec cannot read this kind of argument payload.
    UnsupportedPayload(&'static str),
    /// The structure of a frame was malformed (e.g., a missing field).
    ProtocolViolation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pack(e) => write!(f, "Encoding error: {}", e),
            Self::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch: expected {}, found {}", expected, found)
            }
            Self::UnknownType(name) => write!(f, "Unknown type: {}", name),
            Self::ArgumentCount { expected, found } => {
                write!(f, "Argument count mismatch: expected {}, found {}", expected, found)
            }
            Self::UnsupportedPayload(kind) => write!(f, "Unsupported argument payload: {}", kind),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pack(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self { Self::Pack(e) }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
