//! Realtime report streaming modules.
//!
//! - `client`: SSE transport, frame decoding, and reconnect handling.
//! - `proto`: wire types shared with the report stream endpoint.
//! - `session`: connection lifecycle, report retention, and status signals.

/// Stream transport and background worker.
pub mod client;
/// Report stream wire types and frame decoding.
pub mod proto;
/// Session wrapper that maintains the report window and connection status.
pub mod session;
