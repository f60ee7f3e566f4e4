//! Reverse SSH tunneling gateway.
//!
//! An SSH server accepts `tcpip-forward` requests, derives a subdomain for
//! each, and records it in a shared registry; an HTTP(S) edge routes
//! incoming requests by virtual host back through a freshly opened SSH
//! channel to whichever client bound that subdomain.

pub mod auth;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod http_edge;
pub mod key;
pub mod registry;
pub mod ssh;
pub mod terminal;

pub use config::Config;
pub use error::GatewayError;
pub use registry::ForwardRegistry;
pub use ssh::{GatewayHandler, GatewayServer};
