//! WebSocket subscriber surface
//!
//! `protocol` defines the wire frames; `session` drives the per-client
//! state machine. The HTTP upgrade handler lives in the API layer.

pub mod protocol;
pub mod session;

pub use protocol::{ClientFrame, ErrorCode, ServerFrame};
pub use session::SessionDeps;
