//! Nodegate - A reverse proxy for the web consoles of containerised cluster nodes
//!
//! Cluster nodes run in containers whose ports are not published to the host.
//! This library provides a loopback-only HTTP proxy that:
//! - Maps `/proxy/<host>:<port>/<path>` to a node's internal web UI
//! - Finds a running container of the target's cluster through the container runtime CLI
//! - Fetches the page by executing an HTTP client inside that container
//! - Rewrites links, redirects and asset references so browsing stays on the proxy
//! - Serves a landing page listing running clusters and their consoles

pub mod config;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod landing;
pub mod proxy;
pub mod resolver;
pub mod response;
pub mod rewrite;
pub mod runtime;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
