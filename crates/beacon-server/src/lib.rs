//! # beacon-server
//!
//! Axum HTTP + WebSocket wiring around the beacon notification hub.
//!
//! - `GET /ws/{address}`: validate the wallet address, upgrade, and
//!   hand the socket to the hub's session pumps
//! - `GET /health`, `GET /stats`, `GET /metrics`: liveness, registry
//!   snapshot, Prometheus text
//! - Configuration via defaults + `BEACON_*` environment variables,
//!   overridable from the CLI
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod shutdown;
