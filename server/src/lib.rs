//! # Storefront Server
//!
//! Configuration and wiring for the `storefront` binary: Postgres-backed
//! services, configured payment providers, the HTTP router and the
//! background jobs that expire reservations and time out payments.

pub mod config;
pub mod wiring;

pub use config::{Config, ConfigError};
