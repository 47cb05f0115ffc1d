//! Duplex client channel

mod hub;

pub use hub::{session_ws, ConnectionHub};

/// Bounded per-connection outbound buffer; full buffers drop pushes
/// instead of blocking the sender
pub const WS_BUFFER_SIZE: usize = 64;
