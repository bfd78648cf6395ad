//! Connection registry for signaling connections
//!
//! This module provides:
//! - Transport-independent connection handles
//! - Pending and authenticated indexes with one session per user
//! - Capacity-limited admission

mod registry;
mod stats;
mod types;

pub use registry::{Admission, ConnectionRegistry, Promotion, RemovedConnection, SessionEntry};
pub use stats::RegistryStats;
pub use types::{ConnectionHandle, ConnectionId, SendError, UserId};
