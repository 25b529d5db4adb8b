use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::shard::ShardIdentity;

/// How the registry asks a slot holder whether it is still alive.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self) -> bool;

    /// Called after the holder lost its slot to a newer session.
    fn evict(&self);
}

#[derive(Clone)]
pub struct SlotHolder {
    pub connection_id: u64,
    probe: Arc<dyn LivenessProbe>,
}

impl SlotHolder {
    pub fn new(connection_id: u64, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            connection_id,
            probe,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.probe.is_alive()
    }
}

impl std::fmt::Debug for SlotHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotHolder")
            .field("connection_id", &self.connection_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Result of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// Slot was vacant.
    Claimed,
    /// Slot was held by a dead session, which has been replaced and told to close.
    Evicted { previous_connection_id: u64 },
    /// Slot is held by a live session; nothing changed.
    Rejected { holder_connection_id: u64 },
}

impl ClaimResult {
    pub fn is_granted(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Exclusive `ShardIdentity -> session` map.
///
/// Claims on the same identity are serialized by the map's per-key entry
/// lock; claims on different identities never contend beyond sharing a
/// dashmap shard.
#[derive(Default)]
pub struct ShardRegistry {
    slots: DashMap<ShardIdentity, SlotHolder>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, identity: ShardIdentity, holder: SlotHolder) -> ClaimResult {
        let evicted = match self.slots.entry(identity) {
            Entry::Vacant(slot) => {
                slot.insert(holder);
                return ClaimResult::Claimed;
            }
            Entry::Occupied(mut slot) => {
                if slot.get().is_alive() {
                    return ClaimResult::Rejected {
                        holder_connection_id: slot.get().connection_id,
                    };
                }
                slot.insert(holder)
            }
        };
        // Entry lock is released before the zombie is told to close.
        evicted.probe.evict();
        ClaimResult::Evicted {
            previous_connection_id: evicted.connection_id,
        }
    }

    /// Remove the slot only if `connection_id` still holds it. A stale
    /// release (the slot was re-claimed after an eviction) is a no-op.
    pub fn release(&self, identity: &ShardIdentity, connection_id: u64) -> bool {
        self.slots
            .remove_if(identity, |_, holder| holder.connection_id == connection_id)
            .is_some()
    }

    pub fn holder(&self, identity: &ShardIdentity) -> Option<u64> {
        self.slots.get(identity).map(|h| h.connection_id)
    }

    /// Every slot and its holder's connection id, ordered by identity.
    pub fn snapshot(&self) -> Vec<(ShardIdentity, u64)> {
        let mut out: Vec<_> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().connection_id))
            .collect();
        out.sort_unstable();
        out
    }

    /// Slots whose holder is still alive.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|entry| entry.value().is_alive()).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[derive(Default)]
    struct TestProbe {
        dead: AtomicBool,
        evicted: AtomicBool,
    }

    impl LivenessProbe for TestProbe {
        fn is_alive(&self) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }
        fn evict(&self) {
            self.evicted.store(true, Ordering::SeqCst);
        }
    }

    fn holder(conn: u64) -> (SlotHolder, Arc<TestProbe>) {
        let probe = Arc::new(TestProbe::default());
        (SlotHolder::new(conn, probe.clone()), probe)
    }

    fn shard(id: u32, n: u32) -> ShardIdentity {
        ShardIdentity::new(id, n).unwrap()
    }

    #[test]
    fn test_claim_vacant_then_reject_live() {
        let reg = ShardRegistry::new();
        let (a, _) = holder(1);
        let (b, probe_b) = holder(2);
        assert_eq!(reg.claim(shard(0, 1), a), ClaimResult::Claimed);
        assert_eq!(
            reg.claim(shard(0, 1), b),
            ClaimResult::Rejected {
                holder_connection_id: 1
            }
        );
        assert_eq!(reg.holder(&shard(0, 1)), Some(1));
        assert!(!probe_b.evicted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dead_holder_is_evicted() {
        let reg = ShardRegistry::new();
        let (a, probe_a) = holder(1);
        reg.claim(shard(2, 4), a);
        probe_a.dead.store(true, Ordering::SeqCst);

        let (b, _) = holder(2);
        assert_eq!(
            reg.claim(shard(2, 4), b),
            ClaimResult::Evicted {
                previous_connection_id: 1
            }
        );
        assert!(probe_a.evicted.load(Ordering::SeqCst));
        assert_eq!(reg.holder(&shard(2, 4)), Some(2));
    }

    #[test]
    fn test_release_is_guarded_by_connection_id() {
        let reg = ShardRegistry::new();
        let (a, probe_a) = holder(1);
        reg.claim(shard(0, 1), a);
        probe_a.dead.store(true, Ordering::SeqCst);
        let (b, _) = holder(2);
        reg.claim(shard(0, 1), b);

        // Evicted session cleaning up late must not remove the new holder.
        assert!(!reg.release(&shard(0, 1), 1));
        assert_eq!(reg.holder(&shard(0, 1)), Some(2));
        assert!(reg.release(&shard(0, 1), 2));
        assert!(reg.is_empty());
        assert!(!reg.release(&shard(0, 1), 2));
    }

    #[test]
    fn test_distinct_identities_do_not_conflict() {
        let reg = ShardRegistry::new();
        assert_eq!(reg.claim(shard(0, 1), holder(1).0), ClaimResult::Claimed);
        assert_eq!(reg.claim(shard(0, 2), holder(2).0), ClaimResult::Claimed);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_snapshot_and_active_count() {
        let reg = ShardRegistry::new();
        let (a, probe_a) = holder(10);
        reg.claim(shard(1, 2), a);
        reg.claim(shard(0, 2), holder(11).0);
        probe_a.dead.store(true, Ordering::SeqCst);

        assert_eq!(reg.snapshot(), vec![(shard(0, 2), 11), (shard(1, 2), 10)]);
        assert_eq!(reg.active_count(), 1);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        const RACERS: usize = 16;
        let reg = Arc::new(ShardRegistry::new());
        let barrier = Arc::new(Barrier::new(RACERS));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..RACERS as u64)
            .map(|conn| {
                let reg = reg.clone();
                let barrier = barrier.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    let (h, _probe) = holder(conn);
                    barrier.wait();
                    if reg.claim(shard(5, 16), h).is_granted() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(reg.len(), 1);
    }
}
