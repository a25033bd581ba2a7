//! # TetherRPC
//!
//! The wire vocabulary of a tether peer: messages, values, argument codecs and
//! the `$sys` control calls, all carried over tetherpack.
//!
//! ## Architecture
//!
//! - [`message`]: the immutable [`Message`] record and its header conventions.
//! - [`value`]: the dynamic [`Value`] model and the [`ValueType`] descriptors
//!   methods declare for their parameters.
//! - [`codec`]: `Value` <-> tetherpack, and the pluggable [`ArgumentCodec`].
//! - [`frame`]: a whole `Message` as one self-contained byte frame.
//! - [`seq`]: the increasing-sequence compressor used by reconnects.
//! - [`system`]: handshake, completion, cancel and reconnect payloads.
//!
//! Nothing here knows about connections or time; the `tether` crate owns the
//! runtime.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod seq;
pub mod system;
pub mod value;


pub use codec::ArgumentCodec;
pub use codec::PackCodec;
pub use error::Error;
pub use error::Result;
pub use message::ArgumentData;
pub use message::Header;
pub use message::Message;
pub use message::MethodRef;
pub use system::Handshake;
pub use system::ReconnectRequest;
pub use system::RemoteError;
pub use system::RemoteErrorKind;
pub use system::SystemCall;
pub use value::Value;
pub use value::ValueType;
