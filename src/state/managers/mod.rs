//! Domain managers for gateway state.
//!
//! Each manager owns one domain: the connection registry tracks reachable
//! devices, the group manager tracks membership and presence. They are
//! constructed once at startup and shared by handle.

pub mod client;
pub mod group;

pub use client::{ConnectionRegistry, RegistrySettings};
pub use group::{BatchReport, GroupManager, NotifyOutcome};
