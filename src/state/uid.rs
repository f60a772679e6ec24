//! Connection id generation.
//!
//! A freshly accepted connection has no user yet. Its connection id doubles
//! as a temporary uid until sign-in, so ids are drawn from a reserved range
//! above every real user id.

use imgate_proto::Uid;
use std::sync::atomic::{AtomicI64, Ordering};

/// First id of the reserved connection-id range (2^48).
pub const TEMP_UID_BASE: Uid = 1 << 48;

/// Whether `uid` is a temporary (connection) id rather than a user id.
#[inline]
pub fn is_temporary(uid: Uid) -> bool {
    uid >= TEMP_UID_BASE
}

/// Generates unique connection ids.
pub struct ConnIdGenerator {
    counter: AtomicI64,
}

impl ConnIdGenerator {
    /// Create a generator starting at [`TEMP_UID_BASE`].
    pub fn new() -> Self {
        Self {
            counter: AtomicI64::new(TEMP_UID_BASE),
        }
    }

    /// Generate the next connection id.
    pub fn next(&self) -> Uid {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ConnIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_temporary() {
        let ids = ConnIdGenerator::new();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, b);
        assert!(is_temporary(a) && is_temporary(b));
        assert!(!is_temporary(42));
    }
}
