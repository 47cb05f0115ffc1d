//! Upstream egress proxy integration

mod sticky;

pub use sticky::StickySessionBinder;
