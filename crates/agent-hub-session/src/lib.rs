//! Session lifecycle management for the agent hub.
//!
//! Provides:
//! - `SessionManager` - Live sessions, idle sweep, idempotent teardown
//! - `SessionObserver` - Removal notifications for dependent state

pub mod manager;
pub mod session;

pub use manager::SessionManager;
pub use session::{EndedSession, RemovalReason, SessionConfig, SessionInfo, SessionObserver};
