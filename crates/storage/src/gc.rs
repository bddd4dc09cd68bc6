//! TTL-based garbage collection of dispersed objects.
//!
//! A sweep scans the `meta` bucket and, for every object whose age exceeds
//! the configured TTL, removes its fragments and then all of its KV rows
//! (FPCC, meta, vote evidence). Deletion is best-effort per object: a
//! failure is logged and the object is retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::fragments::{FragmentError, FragmentStore};
use crate::kv::{KvError, MetaDb};

#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error("kv: {0}")]
    Kv(#[from] KvError),

    #[error("fragments: {0}")]
    Fragment(#[from] FragmentError),
}

/// Outcome of one sweep.
#[derive(Debug, Default)]
pub struct SweepStats {
    /// Objects examined.
    pub scanned: usize,
    /// Object ids fully removed this sweep.
    pub expired: Vec<String>,
    /// Objects whose teardown failed; retried next tick.
    pub failed: usize,
}

pub struct Gc {
    kv: Arc<MetaDb>,
    fragments: Arc<FragmentStore>,
    ttl: Duration,
}

impl Gc {
    pub fn new(kv: Arc<MetaDb>, fragments: Arc<FragmentStore>, ttl: Duration) -> Self {
        Gc { kv, fragments, ttl }
    }

    /// How often the periodic task should fire: ttl/2, at least a second.
    pub fn interval(&self) -> Duration {
        std::cmp::max(self.ttl / 2, Duration::from_secs(1))
    }

    /// Remove every object older than the TTL as of `now_ms`.
    pub fn sweep_once(&self, now_ms: u64) -> SweepStats {
        let mut stats = SweepStats::default();
        let entries = match self.kv.meta_entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "gc meta scan failed");
                return stats;
            }
        };

        let ttl_ms = self.ttl.as_millis() as u64;
        for (object, created_at) in entries {
            stats.scanned += 1;
            if now_ms.saturating_sub(created_at) <= ttl_ms {
                continue;
            }
            match self.delete_object(&object) {
                Ok(()) => {
                    info!(object = %object, "gc removed expired object");
                    stats.expired.push(object);
                }
                Err(e) => {
                    warn!(object = %object, error = %e, "gc delete failed, will retry");
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    /// Fragments first, then KV rows: a crash in between leaves only KV
    /// rows, which the next sweep removes.
    fn delete_object(&self, object: &str) -> Result<(), GcError> {
        self.fragments.delete(object)?;
        self.kv.delete_object(object)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::VoteBucket;
    use tempfile::TempDir;

    fn setup(ttl: Duration) -> (TempDir, Arc<MetaDb>, Arc<FragmentStore>, Gc) {
        let dir = TempDir::new().expect("tmpdir");
        let kv = Arc::new(MetaDb::open(dir.path().join("meta.redb")).expect("kv"));
        let fragments = Arc::new(FragmentStore::new(dir.path().join("data")).expect("fragments"));
        let gc = Gc::new(kv.clone(), fragments.clone(), ttl);
        (dir, kv, fragments, gc)
    }

    fn seed_object(kv: &MetaDb, fragments: &FragmentStore, object: &str, created_at: u64) {
        kv.pin_fpcc(object, b"fpcc").expect("pin");
        kv.record_created_at(object, created_at).expect("meta");
        kv.record_vote_keys(VoteBucket::Echo, &[format!("{object}|peer-a")])
            .expect("echo");
        kv.record_vote_keys(VoteBucket::Ready, &[format!("{object}|peer-a")])
            .expect("ready");
        fragments.put(object, 0, b"frag").expect("frag");
    }

    #[test]
    fn test_sweep_removes_only_expired_objects() {
        let ttl = Duration::from_secs(60);
        let (_dir, kv, fragments, gc) = setup(ttl);

        let now: u64 = 1_000_000;
        seed_object(&kv, &fragments, "old", now - 61_000);
        seed_object(&kv, &fragments, "fresh", now - 1_000);

        let stats = gc.sweep_once(now);
        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.expired, vec!["old".to_string()]);
        assert_eq!(stats.failed, 0);

        // expired object fully gone across fragments and every bucket
        assert!(fragments.get("old", 0).expect("get").is_none());
        assert!(kv.fpcc("old").expect("get").is_none());
        assert!(kv.created_at("old").expect("get").is_none());
        for bucket in [VoteBucket::Echo, VoteBucket::Ready] {
            assert!(kv
                .vote_entries(bucket)
                .expect("entries")
                .iter()
                .all(|(object, _)| object == "fresh"));
        }

        // fresh object untouched
        assert!(fragments.get("fresh", 0).expect("get").is_some());
        assert!(kv.fpcc("fresh").expect("get").is_some());
    }

    #[test]
    fn test_object_exactly_at_ttl_survives() {
        let ttl = Duration::from_secs(60);
        let (_dir, kv, fragments, gc) = setup(ttl);

        let now: u64 = 500_000;
        seed_object(&kv, &fragments, "edge", now - 60_000);

        let stats = gc.sweep_once(now);
        assert!(stats.expired.is_empty());
        assert!(kv.fpcc("edge").expect("get").is_some());
    }

    #[test]
    fn test_interval_is_half_ttl() {
        let (_dir, _kv, _fragments, gc) = setup(Duration::from_secs(60));
        assert_eq!(gc.interval(), Duration::from_secs(30));

        let (_dir2, _kv2, _fragments2, gc2) = setup(Duration::from_millis(500));
        assert_eq!(gc2.interval(), Duration::from_secs(1));
    }
}
