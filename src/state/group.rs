//! Group state: membership, mute, and the online-subscriber set.
//!
//! The subscriber set is a persistent map so a broadcast can snapshot it with
//! an O(1) clone under the read lock and fan out after releasing it.

use chrono::{DateTime, Utc};
use imgate_proto::{DeviceId, Gid, Uid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state::Outbound;

/// Per-member flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub struct MemberFlags {
    /// May notify while the group is muted.
    pub admin: bool,
    /// May never notify.
    pub muted: bool,
}

impl MemberFlags {
    /// Bit for [`MemberFlags::admin`].
    pub const ADMIN: i32 = 1;
    /// Bit for [`MemberFlags::muted`].
    pub const MUTED: i32 = 2;

    /// Normal member.
    pub const NORMAL: MemberFlags = MemberFlags {
        admin: false,
        muted: false,
    };

    /// Admin member.
    pub const fn admin() -> Self {
        Self {
            admin: true,
            muted: false,
        }
    }

    /// Muted member.
    pub const fn muted() -> Self {
        Self {
            admin: false,
            muted: true,
        }
    }

    /// Integer encoding used on the wire.
    pub fn bits(self) -> i32 {
        let mut bits = 0;
        if self.admin {
            bits |= Self::ADMIN;
        }
        if self.muted {
            bits |= Self::MUTED;
        }
        bits
    }
}

impl From<i32> for MemberFlags {
    fn from(bits: i32) -> Self {
        Self {
            admin: bits & Self::ADMIN != 0,
            muted: bits & Self::MUTED != 0,
        }
    }
}

impl From<MemberFlags> for i32 {
    fn from(flags: MemberFlags) -> Self {
        flags.bits()
    }
}

/// One entry of a membership batch.
#[derive(Debug, Clone)]
pub enum MemberUpdate {
    /// Insert or update a member.
    Add { uid: Uid, flags: MemberFlags },
    /// Remove a member and all of their subscriptions.
    Del { uid: Uid },
    /// Subscribe one device of a member.
    Online {
        uid: Uid,
        device: DeviceId,
        outbound: Outbound,
    },
    /// Unsubscribe one device, or every device when `device` is `None`.
    Offline { uid: Uid, device: Option<DeviceId> },
}

impl MemberUpdate {
    /// The uid the entry applies to.
    pub fn uid(&self) -> Uid {
        match self {
            Self::Add { uid, .. }
            | Self::Del { uid }
            | Self::Online { uid, .. }
            | Self::Offline { uid, .. } => *uid,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Del { .. } => "del",
            Self::Online { .. } => "online",
            Self::Offline { .. } => "offline",
        }
    }
}

/// A group lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupUpdate {
    /// Create if absent.
    Create { name: String, owner: Uid },
    /// Remove the group and drop every subscriber.
    Dissolve,
    /// Set the mute flag.
    Mute,
    /// Clear the mute flag.
    CancelMute,
}

/// Per-device fan-out targets of one user.
pub type DeviceTargets = im::HashMap<DeviceId, Outbound>;

/// Online-subscriber snapshot.
pub type Subscribers = im::HashMap<Uid, DeviceTargets>;

/// A group.
#[derive(Debug, Clone)]
pub struct Group {
    pub gid: Gid,
    pub name: String,
    pub owner: Uid,
    pub muted: bool,
    pub created: DateTime<Utc>,
    pub members: HashMap<Uid, MemberFlags>,
    /// Invariant: every key is also a key of `members`.
    pub online: Subscribers,
    /// Set once on dissolve; holders of a stale handle must treat the group as gone.
    pub dissolved: bool,
}

impl Group {
    /// Create an empty group. The owner is not implicitly a member.
    pub fn new(gid: Gid, name: String, owner: Uid) -> Self {
        Self {
            gid,
            name,
            owner,
            muted: false,
            created: Utc::now(),
            members: HashMap::new(),
            online: Subscribers::new(),
            dissolved: false,
        }
    }

    pub fn is_member(&self, uid: Uid) -> bool {
        self.members.contains_key(&uid)
    }

    /// Owner or admin-flagged member.
    pub fn is_admin(&self, uid: Uid) -> bool {
        uid == self.owner || self.members.get(&uid).is_some_and(|f| f.admin)
    }

    /// Whether a notify from `sender` may be delivered.
    pub fn can_notify(&self, sender: Uid) -> bool {
        if self.members.get(&sender).is_some_and(|f| f.muted && !f.admin) {
            return false;
        }
        !self.muted || self.is_admin(sender)
    }

    /// Subscribe `(uid, device)`. Fails for non-members.
    pub fn subscribe(&mut self, uid: Uid, device: DeviceId, outbound: Outbound) -> bool {
        if !self.is_member(uid) {
            return false;
        }
        let mut devices = self.online.get(&uid).cloned().unwrap_or_default();
        devices.insert(device, outbound);
        self.online.insert(uid, devices);
        true
    }

    /// Unsubscribe one device or all of them. Returns whether anything changed.
    pub fn unsubscribe(&mut self, uid: Uid, device: Option<DeviceId>) -> bool {
        let Some(mut devices) = self.online.get(&uid).cloned() else {
            return false;
        };
        let changed = match device {
            Some(device) => devices.remove(&device).is_some(),
            None => {
                devices.clear();
                true
            }
        };
        if devices.is_empty() {
            self.online.remove(&uid);
        } else {
            self.online.insert(uid, devices);
        }
        changed
    }

    /// Remove a member and their subscriptions.
    pub fn remove_member(&mut self, uid: Uid) -> bool {
        self.online.remove(&uid);
        self.members.remove(&uid).is_some()
    }

    /// Number of subscribed devices.
    pub fn online_devices(&self) -> usize {
        self.online.values().map(|d| d.len()).sum()
    }

    pub fn info(&self) -> GroupInfo {
        GroupInfo {
            gid: self.gid,
            name: self.name.clone(),
            owner: self.owner,
            muted: self.muted,
            created: self.created,
            members: self.members.len(),
            online_members: self.online.len(),
            online_devices: self.online_devices(),
        }
    }
}

/// Read-only summary of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub gid: Gid,
    pub name: String,
    pub owner: Uid,
    pub muted: bool,
    pub created: DateTime<Utc>,
    pub members: usize,
    pub online_members: usize,
    pub online_devices: usize,
}
