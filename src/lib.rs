//! Tenantgate - a multi-tenant reverse proxy host
//!
//! This library provides a shared-host reverse proxy that:
//! - Routes HTTP(S) traffic to per-site backends by exact or wildcard domain
//! - Supervises pools of worker processes, scaling them with demand
//! - Proxies to fixed upstreams, serves static trees, and issues redirects
//! - Forwards WebSocket and other protocol upgrades end to end
//! - Obtains and renews TLS certificates via ACME, resolved per SNI name
//! - Samples per-site traffic and resource usage into a SQLite-backed store
//! - Streams live stats and activity events to dashboard sessions

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod acme;
pub mod cert;
pub mod config;
pub mod dashboard;
pub mod dispatcher;
pub mod error;
pub mod proxy;
pub mod reputation;
pub mod ring;
pub mod site;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod worker;
