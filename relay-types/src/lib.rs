#![deny(missing_docs)]
//! Core type definitions for the relay broker and connector.
//!
//! This crate groups together the strongly-typed values and message
//! structures both relay processes exchange over the duplex link. It
//! provides:
//!
//! * Thin wrappers around identifiers such as session ids and frame
//!   correlation ids, with consistent serialization and display
//!   implementations.
//! * The tagged [`Frame`](frame::Frame) sum type with one payload struct per
//!   wire message (see [`frame`] module).
//! * The JSON codec with frame size enforcement (see [`codec`] module).
//! * The closed set of wire error codes (see [`error_code`] module).
//!
//! The codec is the only place that touches raw JSON; everything above it
//! works on typed frames.

use std::fmt;

use http::HeaderName;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod codec;
pub mod error_code;
pub mod frame;
pub mod limits;

pub(crate) mod b64;

/// The name of the relay-protocol-version header.
///
/// Connectors send their crate version in this header when dialing the
/// broker's duplex endpoint; the broker checks it against its accepted
/// version requirement before upgrading the connection.
pub static RELAY_PROTOCOL_VERSION_HEADER: HeaderName =
    HeaderName::from_static("x-relay-protocol-version");

/// A broker-assigned identifier for one authenticated connector session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Allocates a fresh random session id.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the wrapped [`Uuid`].
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The correlation identifier scoping all frames of one relayed request.
///
/// Ids are opaque on the wire. The broker generates them with negligible
/// collision probability within a session; auth-handshake frames use the
/// distinguished [`FrameId::bootstrap`] id because no request exists yet.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(String);

impl FrameId {
    /// The distinguished id carried by AUTH, AUTH_OK and AUTH_FAIL frames.
    pub const BOOTSTRAP: &'static str = "0";

    /// Allocates a fresh random correlation id (128-bit, hex encoded).
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Returns the bootstrap id used by the auth handshake.
    pub fn bootstrap() -> Self {
        Self(Self::BOOTSTRAP.to_owned())
    }

    /// Returns `true` iff this is the bootstrap id.
    pub fn is_bootstrap(&self) -> bool {
        self.0 == Self::BOOTSTRAP
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_ids_are_unique_and_not_bootstrap() {
        let a = FrameId::fresh();
        let b = FrameId::fresh();
        assert_ne!(a, b);
        assert!(!a.is_bootstrap());
        assert!(FrameId::bootstrap().is_bootstrap());
    }
}
