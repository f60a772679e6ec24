//! State management module.
//!
//! Contains the connection and group entities and the managers that own them.

mod client;
pub mod dashmap_ext;
mod group;
pub mod managers;
mod observer;
pub mod uid;

pub use client::{Connection, NewConnection, Outbound, OverflowPolicy, PushOutcome, Transport};
pub use group::{
    DeviceTargets, Group, GroupInfo, GroupUpdate, MemberFlags, MemberUpdate, Subscribers,
};
pub use managers::{
    BatchReport, ConnectionRegistry, GroupManager, NotifyOutcome, RegistrySettings,
};
pub use observer::{InboundHandler, PresenceObserver};
pub use uid::{ConnIdGenerator, TEMP_UID_BASE, is_temporary};
