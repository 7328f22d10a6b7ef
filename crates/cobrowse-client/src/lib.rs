//! # cobrowse-client
//!
//! Client-side coordinator for browser sessions shared between a human and
//! an automation agent.
//!
//! - [`connection`]: one multiplexed real-time channel with bounded
//!   exponential-backoff reconnects and typed event fan-out
//! - [`registry`]: authoritative local view of every session, merged from
//!   local actions, streamed updates, and polled snapshots
//! - [`handoff`]: two-phase control transfer with optimistic update, ack
//!   matching, timeout, and rollback
//! - [`subscription`]: idempotent opt-in feeds that lapse with the connection
//! - [`backend`]: HTTP lifecycle calls (create, pause, resume, stop, close)
//! - [`client`]: [`SessionClient`], the owned service wiring them together

#![deny(unsafe_code)]

pub mod backend;
pub mod client;
pub mod connection;
pub mod handoff;
pub mod registry;
pub mod subscription;

#[cfg(test)]
mod testing;

pub use backend::{BackendError, BrowserBackend, HttpBackend};
pub use client::{ClientError, SessionClient};
pub use connection::{ConnectionEvent, ConnectionManager, EventFilter, ListenerId};
pub use handoff::HandoffCoordinator;
pub use registry::{RegistryEvent, SessionRegistry, TransitionOrigin};
pub use subscription::SubscriptionManager;
