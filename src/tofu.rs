//! Trust-on-first-use replay guard
//!
//! When TOFU is enforced, the identity derived from a token may be used
//! exactly once. The store is a pluggable collaborator so clustered CAs can
//! swap in a shared backend; the contract is insert-if-absent with a TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

/// Insert-if-absent store with per-entry expiry.
pub trait TofuStore: Send + Sync + std::fmt::Debug {
    /// Record `id` until `expires_at`. Returns `true` when `id` was unseen
    /// (the caller may proceed), `false` when it was already recorded and
    /// has not expired.
    fn insert_if_absent(&self, id: &str, expires_at: SystemTime) -> bool;
}

/// In-memory, per-provisioner store. Expired entries are evicted lazily on
/// insert; the set is bounded by the token lifetime.
#[derive(Debug, Default)]
pub struct MemoryTofuStore {
    seen: Mutex<HashMap<String, SystemTime>>,
}

impl MemoryTofuStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TofuStore for MemoryTofuStore {
    fn insert_if_absent(&self, id: &str, expires_at: SystemTime) -> bool {
        let now = SystemTime::now();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.retain(|_, expiry| *expiry > now);
        if seen.contains_key(id) {
            return false;
        }
        seen.insert(id.to_string(), expires_at);
        true
    }
}
