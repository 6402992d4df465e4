//! # beacon-hub
//!
//! Connection registry and message-dispatch core for the beacon
//! notification service.
//!
//! - One live [`session`] per address, enforced by a single serialized
//!   dispatcher command stream (no shared-map locking)
//! - Unicast and broadcast delivery over bounded per-session queues;
//!   a saturated queue evicts that session instead of stalling the rest
//! - Keepalive via transport-level pings plus an idle read deadline
//!
//! The HTTP layer performs the handshake and hands the raw socket to
//! [`session::run_session`]; event producers push notifications through
//! the [`Hub`] handle.

#![deny(unsafe_code)]

pub mod dispatch;
pub mod envelope;
pub mod session;

pub use dispatch::{Hub, HubConfig, HubStats};
pub use envelope::{Address, ControlFrame, Envelope, SessionId};
