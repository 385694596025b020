//! Tenantgate - materializes a multi-tenant hosting topology and supervises its rollout
//!
//! This library:
//! - Expands replica groups of a host/path topology into concrete routes
//! - Assigns deterministic ports to every route above a base port
//! - Builds the reverse-proxy routing table and persists it for reloads
//! - Plans the backend listener behind each route
//! - Rolls deploy targets out one by one, waiting for readiness and probing liveness
//! - Retries failed targets behind an operator confirmation gate

pub mod config;
pub mod controller;
pub mod error;
pub mod expand;
pub mod launcher;
pub mod manifest;
pub mod ports;
pub mod probe;
pub mod readiness;
pub mod router;
pub mod supervisor;
pub mod topology;

pub use error::{Error, ErrorCode, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
