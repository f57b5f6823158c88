//! Cache of offerings the cloud recently refused to provision
//!
//! Insufficient-capacity and unauthorized responses are remembered per
//! (instance type, zone, capacity type) so the next launch doesn't retry a
//! combination that just failed. Entries age out on a TTL; a sequence number
//! advances on every write so dependent caches can key on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::cache::TtlCache;
use crate::nodeclaim::CapacityType;

/// How long a refused offering stays blocked
pub const UNAVAILABLE_OFFERING_TTL: Duration = Duration::from_secs(3 * 60);

/// Tracks (instance type, zone, capacity type) triples that recently failed
pub struct UnavailableOfferings {
    cache: TtlCache<()>,
    seq_num: AtomicU64,
}

impl Default for UnavailableOfferings {
    fn default() -> Self {
        Self::new()
    }
}

impl UnavailableOfferings {
    /// Create an empty cache with the default TTL
    pub fn new() -> Self {
        Self {
            cache: TtlCache::new(UNAVAILABLE_OFFERING_TTL),
            seq_num: AtomicU64::new(0),
        }
    }

    /// Monotonic change counter, baked into dependent cache keys
    pub fn seq_num(&self) -> u64 {
        self.seq_num.load(Ordering::SeqCst)
    }

    /// True when the triple is currently blocked
    pub fn is_unavailable(
        &self,
        instance_type: &str,
        zone: &str,
        capacity_type: CapacityType,
    ) -> bool {
        self.cache
            .get(&Self::key(instance_type, zone, capacity_type))
            .is_some()
    }

    /// Block a triple for the TTL
    pub fn mark_unavailable(
        &self,
        reason: &str,
        instance_type: &str,
        zone: &str,
        capacity_type: CapacityType,
    ) {
        debug!(
            reason,
            instance_type,
            zone,
            capacity_type = %capacity_type,
            ttl_secs = UNAVAILABLE_OFFERING_TTL.as_secs(),
            "marking offering unavailable"
        );
        self.cache
            .insert(Self::key(instance_type, zone, capacity_type), ());
        self.seq_num.fetch_add(1, Ordering::SeqCst);
    }

    fn key(instance_type: &str, zone: &str, capacity_type: CapacityType) -> String {
        format!("{}:{}:{}", capacity_type.as_str(), instance_type, zone)
    }
}
