//! Group presence engine.
//!
//! This module contains the `GroupManager`, which owns every group's
//! membership and online-subscriber set and fans notify messages out to
//! the subscribed devices.
//!
//! # Locking
//!
//! One `RwLock` per group. A membership batch is applied under a single
//! write acquisition, so readers observe it whole or not at all. Fan-out
//! holds the read lock only long enough to clone the persistent subscriber
//! map, then pushes with no lock held.
//!
//! The engine also keeps a presence cache (`uid → device → Outbound`), fed by
//! the connection registry through [`PresenceObserver`]. Adding a member
//! subscribes their already-online devices, and a device coming online
//! subscribes to every group its user belongs to.

use dashmap::DashMap;
use imgate_proto::{DeviceId, Gid, Message, Uid};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::GroupError;
use crate::state::dashmap_ext::DashMapExt;
use crate::state::{
    Group, GroupInfo, GroupUpdate, MemberFlags, MemberUpdate, Outbound, PresenceObserver,
    PushOutcome,
};

/// Outcome of [`GroupManager::update_member`].
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Entries applied.
    pub applied: usize,
    /// Entries skipped, by batch index.
    pub skipped: Vec<(usize, GroupError)>,
}

impl BatchReport {
    /// Whether every entry applied.
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Outcome of [`GroupManager::dispatch_notify_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Pushed to this many devices.
    Delivered { recipients: usize },
    /// Muted group and a sender without admin flags, or a muted sender.
    Suppressed,
}

/// Group management state and behavior.
pub struct GroupManager {
    groups: DashMap<Gid, Arc<RwLock<Group>>>,
    /// Reverse index: uid → groups the uid is a member of.
    memberships: DashMap<Uid, HashSet<Gid>>,
    /// Last known online devices per uid.
    presence: DashMap<Uid, HashMap<DeviceId, Outbound>>,
}

impl GroupManager {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
            memberships: DashMap::new(),
            presence: DashMap::new(),
        }
    }

    fn group(&self, gid: Gid) -> Result<Arc<RwLock<Group>>, GroupError> {
        self.groups
            .get_cloned(&gid)
            .ok_or(GroupError::GroupNotFound(gid))
    }

    fn index_add(&self, uid: Uid, gid: Gid) {
        self.memberships.entry(uid).or_default().insert(gid);
    }

    fn index_remove(&self, uid: Uid, gid: Gid) {
        self.memberships.remove_if_mut(&uid, |_, gids| {
            gids.remove(&gid);
            gids.is_empty()
        });
    }

    /// Apply an ordered membership batch atomically.
    ///
    /// Fails wholesale with `GroupNotFound`. Per-entry failures (marking a
    /// non-member online or offline) are logged and skipped while the rest
    /// of the batch applies.
    pub fn update_member(
        &self,
        gid: Gid,
        updates: Vec<MemberUpdate>,
    ) -> Result<BatchReport, GroupError> {
        let group = self.group(gid)?;
        let mut g = group.write();
        if g.dissolved {
            return Err(GroupError::GroupNotFound(gid));
        }

        let mut report = BatchReport::default();
        for (idx, update) in updates.into_iter().enumerate() {
            let uid = update.uid();
            let kind = update.kind();
            let ok = match update {
                MemberUpdate::Add { uid, flags } => {
                    g.members.insert(uid, flags);
                    self.index_add(uid, gid);
                    if let Some(devices) = self.presence.get_cloned(&uid) {
                        for (device, outbound) in devices {
                            g.subscribe(uid, device, outbound);
                        }
                    }
                    true
                }
                MemberUpdate::Del { uid } => {
                    g.remove_member(uid);
                    self.index_remove(uid, gid);
                    true
                }
                MemberUpdate::Online {
                    uid,
                    device,
                    outbound,
                } => g.subscribe(uid, device, outbound),
                MemberUpdate::Offline { uid, device } => {
                    if g.is_member(uid) {
                        g.unsubscribe(uid, device);
                        true
                    } else {
                        false
                    }
                }
            };
            if ok {
                report.applied += 1;
            } else {
                let err = GroupError::MembershipInconsistency { gid, uid };
                warn!(gid, uid, kind, error = %err, "membership update skipped");
                report.skipped.push((idx, err));
            }
        }
        debug!(
            gid,
            applied = report.applied,
            skipped = report.skipped.len(),
            "member batch applied"
        );
        Ok(report)
    }

    /// Apply a group lifecycle operation.
    pub fn update_group(&self, gid: Gid, update: GroupUpdate) -> Result<(), GroupError> {
        match update {
            GroupUpdate::Create { name, owner } => {
                let mut created = false;
                self.groups.entry(gid).or_insert_with(|| {
                    created = true;
                    Arc::new(RwLock::new(Group::new(gid, name, owner)))
                });
                if created {
                    crate::metrics::set_active_groups(self.groups.len() as i64);
                    info!(gid, owner, "group created");
                }
                Ok(())
            }
            GroupUpdate::Dissolve => {
                let (_, group) = self
                    .groups
                    .remove(&gid)
                    .ok_or(GroupError::GroupNotFound(gid))?;
                let mut g = group.write();
                g.dissolved = true;
                g.online.clear();
                for uid in std::mem::take(&mut g.members).into_keys() {
                    self.index_remove(uid, gid);
                }
                crate::metrics::set_active_groups(self.groups.len() as i64);
                info!(gid, "group dissolved");
                Ok(())
            }
            GroupUpdate::Mute | GroupUpdate::CancelMute => {
                let group = self.group(gid)?;
                let mut g = group.write();
                if g.dissolved {
                    return Err(GroupError::GroupNotFound(gid));
                }
                g.muted = update == GroupUpdate::Mute;
                debug!(gid, muted = g.muted, "group mute changed");
                Ok(())
            }
        }
    }

    /// Fan `msg` out to the group's online subscribers.
    ///
    /// `msg.from` is the sender checked against mute gating. The delivered
    /// set is the subscriber set as of the snapshot.
    pub fn dispatch_notify_message(
        &self,
        gid: Gid,
        msg: Arc<Message>,
    ) -> Result<NotifyOutcome, GroupError> {
        let group = self.group(gid)?;
        let snapshot = {
            let g = group.read();
            if g.dissolved {
                return Err(GroupError::GroupNotFound(gid));
            }
            if !g.can_notify(msg.from) {
                crate::metrics::record_notify_suppressed();
                debug!(gid, sender = msg.from, "notify suppressed");
                return Ok(NotifyOutcome::Suppressed);
            }
            g.online.clone()
        };

        let mut recipients = 0;
        for devices in snapshot.values() {
            for outbound in devices.values() {
                if outbound.push(Arc::clone(&msg)) == PushOutcome::Queued {
                    recipients += 1;
                }
            }
        }
        crate::metrics::record_fanout(recipients);
        Ok(NotifyOutcome::Delivered { recipients })
    }

    /// Attach `(uid, device)` as a fan-out target. Members only.
    pub fn subscribe(
        &self,
        gid: Gid,
        uid: Uid,
        device: DeviceId,
        outbound: Outbound,
    ) -> Result<(), GroupError> {
        let report = self.update_member(
            gid,
            vec![MemberUpdate::Online {
                uid,
                device,
                outbound,
            }],
        )?;
        match report.skipped.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }

    /// Detach one device of `uid`, or all of them when `device` is `None`.
    pub fn unsubscribe(
        &self,
        gid: Gid,
        uid: Uid,
        device: Option<DeviceId>,
    ) -> Result<(), GroupError> {
        let report = self.update_member(gid, vec![MemberUpdate::Offline { uid, device }])?;
        match report.skipped.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }

    /// Subscribe every currently online device of `uid`.
    pub fn member_online(&self, gid: Gid, uid: Uid) -> Result<BatchReport, GroupError> {
        let updates: Vec<_> = self
            .presence
            .get_cloned(&uid)
            .unwrap_or_default()
            .into_iter()
            .map(|(device, outbound)| MemberUpdate::Online {
                uid,
                device,
                outbound,
            })
            .collect();
        if updates.is_empty() {
            // still reject unknown groups
            self.group(gid)?;
            return Ok(BatchReport::default());
        }
        self.update_member(gid, updates)
    }

    /// Unsubscribe every device of `uid`.
    pub fn member_offline(&self, gid: Gid, uid: Uid) -> Result<BatchReport, GroupError> {
        self.update_member(gid, vec![MemberUpdate::Offline { uid, device: None }])
    }

    /// Insert or update members with the given flags.
    pub fn put_members(
        &self,
        gid: Gid,
        members: impl IntoIterator<Item = (Uid, MemberFlags)>,
    ) -> Result<BatchReport, GroupError> {
        let updates = members
            .into_iter()
            .map(|(uid, flags)| MemberUpdate::Add { uid, flags })
            .collect();
        self.update_member(gid, updates)
    }

    /// Remove members.
    pub fn remove_members(
        &self,
        gid: Gid,
        uids: impl IntoIterator<Item = Uid>,
    ) -> Result<BatchReport, GroupError> {
        let updates = uids.into_iter().map(|uid| MemberUpdate::Del { uid }).collect();
        self.update_member(gid, updates)
    }

    /// Summary of a group.
    pub fn group_info(&self, gid: Gid) -> Option<GroupInfo> {
        self.groups.get_cloned(&gid).map(|g| g.read().info())
    }

    pub fn is_member(&self, gid: Gid, uid: Uid) -> bool {
        self.groups
            .get_cloned(&gid)
            .is_some_and(|g| g.read().is_member(uid))
    }

    /// Whether any device of `uid` is subscribed to `gid`.
    pub fn is_subscribed(&self, gid: Gid, uid: Uid) -> bool {
        self.groups
            .get_cloned(&gid)
            .is_some_and(|g| g.read().online.contains_key(&uid))
    }

    /// Members and their flags, sorted by uid.
    pub fn members(&self, gid: Gid) -> Result<Vec<(Uid, MemberFlags)>, GroupError> {
        let group = self.group(gid)?;
        let mut members: Vec<_> = group.read().members.iter().map(|(u, f)| (*u, *f)).collect();
        members.sort_unstable_by_key(|(uid, _)| *uid);
        Ok(members)
    }

    /// Subscribed uids, sorted.
    pub fn online_members(&self, gid: Gid) -> Result<Vec<Uid>, GroupError> {
        let group = self.group(gid)?;
        let mut uids: Vec<_> = group.read().online.keys().copied().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Groups `uid` belongs to, sorted.
    pub fn groups_of(&self, uid: Uid) -> Vec<Gid> {
        let mut gids: Vec<_> = self
            .memberships
            .get_cloned(&uid)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        gids.sort_unstable();
        gids
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

impl Default for GroupManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceObserver for GroupManager {
    fn on_device_online(&self, uid: Uid, device: DeviceId, outbound: &Outbound) {
        self.presence
            .entry(uid)
            .or_default()
            .insert(device, outbound.clone());
        for gid in self.groups_of(uid) {
            if let Some(group) = self.groups.get_cloned(&gid) {
                group.write().subscribe(uid, device, outbound.clone());
            }
        }
    }

    fn on_device_offline(&self, uid: Uid, device: DeviceId) {
        self.presence.remove_if_mut(&uid, |_, devices| {
            devices.remove(&device);
            devices.is_empty()
        });
        for gid in self.groups_of(uid) {
            if let Some(group) = self.groups.get_cloned(&gid) {
                group.write().unsubscribe(uid, Some(device));
            }
        }
    }
}
