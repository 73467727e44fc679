//! Servicegate - the request-forwarding core of a registry-driven API gateway
//!
//! Requests addressed as `/{prefix}/{service}/{rest}` are resolved to one
//! backend instance through a service registry, rewritten to `/{rest}`, and
//! streamed to the backend. The backend's response streams back to the caller
//! with bounded buffering in both directions.

pub mod config;
pub mod error;
pub mod filter;
pub mod pool;
pub mod proxy;
pub mod pump;
pub mod registry;
pub mod resolver;
pub mod rewrite;
pub mod session;
pub mod timeout;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
