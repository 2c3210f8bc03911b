//! API module for the relay broker.
//!
//! This module defines all endpoints the broker serves and organizes them
//! into submodules:
//!
//! - [`errors`] – API error types and their HTTP representation.
//! - [`health`] – The status snapshot (`/health`) and `/version`.
//! - [`openai`] – The external OpenAI-compatible surface
//!   (`/v1/chat/completions`, `/v1/models`).
//! - [`connector`] – The connector duplex endpoint `/ws`.

pub(crate) mod connector;
pub(crate) mod errors;
pub(crate) mod health;
pub(crate) mod openai;
