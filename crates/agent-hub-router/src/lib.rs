//! Agent registry and message router for the agent hub.
//!
//! Provides:
//! - `Hub` - Registration, routing, conversations, live delivery
//! - `Operation` - Named operations dispatched from transports

pub mod hub;
pub mod lane;
pub mod operation;
pub mod registry;

pub use hub::Hub;
pub use operation::Operation;
pub use registry::Registry;
