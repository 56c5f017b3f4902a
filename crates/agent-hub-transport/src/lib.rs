//! Transports connecting remote clients to the agent hub.
//!
//! Provides:
//! - Wire protocol (type-tagged JSON frames, stream cursors)
//! - `Gateway` - Session open/close, operation calls, stream resume
//! - Duplex transport over any byte stream (stdio, pipes)
//! - HTTP transport with SSE push streams (feature: http)

pub mod duplex;
pub mod gateway;
pub mod protocol;

#[cfg(feature = "http")]
pub mod http;

pub use duplex::{DuplexTransport, serve_duplex};
pub use gateway::Gateway;
pub use protocol::{ClientMessage, ServerMessage, StreamCursor};
