//! Shared model and wire types for the bedrockproxy control plane.
//!
//! This crate has no transport or runtime dependencies of its own: it is
//! consumed both by `bedrockproxy_core` (which owns the long-lived state)
//! and `bedrockproxy_ws` (which serializes it over the WebSocket control
//! plane).

pub mod envelope;
pub mod error;
pub mod model;

pub use envelope::*;
pub use error::ErrorCode;
