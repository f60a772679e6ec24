//! Instance selection policies.

use imgate_proto::{RoutePolicy, Uid};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Virtual nodes per healthy instance on the hash ring.
pub const VNODES: usize = 64;

/// First eight bytes of SHA-256, big-endian.
fn hash64(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Consistent-hash ring over instance indices.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Sorted by point.
    points: Vec<(u64, usize)>,
}

impl HashRing {
    /// Build a ring from `(index, id)` pairs of the healthy instances.
    pub fn build<'a>(members: impl IntoIterator<Item = (usize, &'a str)>) -> Self {
        let mut points = Vec::new();
        for (idx, id) in members {
            for vnode in 0..VNODES {
                points.push((hash64(format!("{id}#{vnode}").as_bytes()), idx));
            }
        }
        points.sort_unstable();
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Instance index owning `uid`: the first point clockwise from its hash.
    pub fn lookup(&self, uid: Uid) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let h = hash64(&uid.to_be_bytes());
        let pos = self.points.partition_point(|(point, _)| *point < h);
        let (_, idx) = self.points[pos % self.points.len()];
        Some(idx)
    }
}

/// Pick a position in `healthy` (indices into the instance list).
///
/// `ConsistentHash` consults `ring`, which must have been built from the
/// same healthy set.
pub fn choose(
    policy: RoutePolicy,
    healthy: &[usize],
    ring: &HashRing,
    cursor: &AtomicUsize,
    uid: Uid,
) -> Option<usize> {
    if healthy.is_empty() {
        return None;
    }
    match policy {
        RoutePolicy::RoundRobin => {
            let n = cursor.fetch_add(1, Ordering::Relaxed);
            Some(healthy[n % healthy.len()])
        }
        RoutePolicy::ConsistentHash => ring.lookup(uid),
        RoutePolicy::Random => Some(healthy[rand::thread_rng().gen_range(0..healthy.len())]),
    }
}
