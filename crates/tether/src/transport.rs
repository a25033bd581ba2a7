//! # Transport Abstraction
//!
//! The channels a peer talks through.
//!
//! ## Philosophy
//!
//! - **Message-Oriented**: a [`Transport`] moves whole `Arc<Message>`s. In-process
//!   transports hand the same `Arc` to the other side, so lazily attached
//!   arguments survive and nothing is re-encoded.
//! - **Byte Transports are Adapters**: anything that moves byte frames
//!   ([`ByteTransport`]) becomes a `Transport` through [`Framed`].
//! - **One Connection per Transport**: a transport is never reused after
//!   `recv` returns `Ok(None)` or an error. Reconnecting means asking the
//!   [`Connector`] for a fresh one.

use std::fmt;
use std::sync::Arc;

use tetherrpc::Message;
use tetherrpc::frame;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The connector refused to produce a transport.
    Refused(String),
    /// The operation did not finish in time.
    Timeout,
    /// A frame could not be encoded or decoded.
    Codec(tetherrpc::Error),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Refused(msg) => write!(f, "Connection refused: {}", msg),
            Self::Timeout => write!(f, "Transport operation timed out"),
            Self::Codec(e) => write!(f, "Frame error: {}", e),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tetherrpc::Error> for Error {
    fn from(e: tetherrpc::Error) -> Self {
        Self::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A bidirectional channel of messages for one connection.
///
/// Object-safe, used as `Arc<dyn Transport>`. `send` may be called
/// concurrently with `recv`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, msg: Arc<Message>) -> Result<()>;

    /// The next message, or `Ok(None)` once the connection is closed.
    async fn recv(&self) -> Result<Option<Arc<Message>>>;
}

/// A bidirectional channel of opaque, already delimited byte frames.
#[async_trait::async_trait]
pub trait ByteTransport: Send + Sync + 'static {
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    async fn recv(&self) -> Result<Option<Vec<u8>>>;
}

/// Lifts a [`ByteTransport`] to a [`Transport`] with the tetherrpc frame codec.
pub struct Framed<B> {
    inner: B,
}

impl<B: ByteTransport> Framed<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

#[async_trait::async_trait]
impl<B: ByteTransport> Transport for Framed<B> {
    async fn send(&self, msg: Arc<Message>) -> Result<()> {
        let bytes = frame::encode_message(&msg)?;
        self.inner.send(bytes).await
    }

    async fn recv(&self) -> Result<Option<Arc<Message>>> {
        match self.inner.recv().await? {
            Some(bytes) => Ok(Some(Arc::new(frame::decode_message(&bytes)?))),
            None => Ok(None),
        }
    }
}

/// Produces the transport of a new connection.
///
/// Active connectors dial out and are retried with backoff. Passive ones wait
/// for the remote side to dial in, so the peer calls them again right away.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Transport>>;

    fn is_passive(&self) -> bool {
        false
    }
}

#[async_trait::async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        (**self).connect().await
    }

    fn is_passive(&self) -> bool {
        (**self).is_passive()
    }
}
