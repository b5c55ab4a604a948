//! netbill Daemon - HTTP surface and background tasks
//!
//! Wires billing, enforcement and the router pool together, serves the gateway
//! callback and admin endpoints, and runs the overdue sweeper and enforcement
//! engine until shutdown.

#![warn(clippy::all)]

pub mod app;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;

pub use app::{Background, Netbill, StartupError};
pub use config::{ConfigError, DaemonConfig};
pub use routes::{build_router, AppState};
