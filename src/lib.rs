//! Gatehouse - Session-Aware Proxy Gateway
//!
//! A session-aware forward/reverse proxy gateway written in Rust.
//!
//! ## Features
//!
//! - Sticky per-session upstream egress (stable outbound IP per session)
//! - Bounded pool of outbound clients with affinity and idle reclamation
//! - HTML/CSS rewriting so embedded resources route back through the gateway
//! - Override-script injection (geolocation, language, timezone)
//! - Sliding-window rate limiting with burst control and temporary blocks
//! - Duplex WebSocket channel with heartbeats and in-order command dispatch

pub mod api;
pub mod config;
pub mod error;
pub mod fetch;
pub mod models;
pub mod pool;
pub mod rewrite;
pub mod session;
pub mod upstream;

pub use config::Config;
pub use error::{GatehouseError, Result};
