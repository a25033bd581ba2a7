//! # Call Trackers
//!
//! Per-peer registries of in-flight calls. A peer owns exactly one tracker of
//! each kind.
//!
//! ## Philosophy
//!
//! - **No Central Lock**: every registry is a `DashMap` keyed by call id, and
//!   outbound ids come from one atomic counter. Unrelated calls never contend.
//! - **Snapshots across Awaits**: sweeps copy the `Arc`s they need out of the
//!   maps before they suspend, so no shard guard is ever held over I/O.

use std::fmt;

use tetherrpc::MethodRef;

pub mod inbound;
pub mod outbound;

pub use inbound::InboundCallTracker;
pub use outbound::OutboundCallTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// NoWait calls are never tracked.
    NoWait(MethodRef),
    /// The call already carries an id.
    AlreadyRegistered(i64),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoWait(method) => write!(f, "NoWait call {} cannot be registered", method),
            Self::AlreadyRegistered(id) => write!(f, "Call is already registered as #{}", id),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
