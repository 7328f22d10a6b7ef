//! # cobrowse-core
//!
//! Foundation types shared by every cobrowse crate.
//!
//! - **Branded IDs**: `SessionId`, `PageId`, `ContextId`, `RequestId` newtypes
//! - **Session model**: [`session::Session`], [`session::Tab`], control ownership
//!   and status enums
//! - **Wire protocol**: [`protocol::InboundMessage`] / [`protocol::OutboundMessage`]
//!   JSON envelopes for the real-time channel
//! - **Errors**: connection, protocol, transition, and terminal reconnect errors
//!   via `thiserror`
//! - **Backoff**: reconnect delay math
//! - **Logging**: `tracing` subscriber bootstrap and test capture helpers

#![deny(unsafe_code)]

pub mod backoff;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;
pub mod session;
