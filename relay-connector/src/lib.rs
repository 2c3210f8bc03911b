#![deny(missing_docs)]
//! The connector half of the relay.
//!
//! The connector runs next to a local OpenAI-compatible inference backend,
//! opens an outbound duplex session to the broker, declares the models it
//! serves, and relays REQUEST frames to the local upstream. Responses flow
//! back as a single RESPONSE frame or as bounded STREAM_CHUNK frames, so no
//! full response body ever sits in memory.
//!
//! The entry point is [`session::run`], which owns the
//! reconnect-with-backoff loop and returns once the shutdown signal fires
//! and the in-flight upstream calls have drained.

pub mod config;
pub mod metrics;
pub mod session;

pub(crate) mod backoff;
pub(crate) mod upstream;
