//! Live waiting-room presence, independent of the persisted player list.
//!
//! Sessions are spread over a fixed set of shards keyed by session id, so
//! joins and leaves for different sessions never contend on one lock.
//! Join and leave are idempotent and commute.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::KnockoutError;
use crate::events::ServerEvent;
use crate::types::{Capacity, IdentityId, SessionId};

const SHARD_COUNT: usize = 16;

/// Result of a membership change, broadcast as `membership_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipUpdate {
    pub session_id: SessionId,
    pub count: u32,
    pub min: u32,
    pub max: u32,
    /// False when the call was an idempotent repeat.
    pub changed: bool,
}

impl MembershipUpdate {
    pub fn to_event(self) -> ServerEvent {
        ServerEvent::MembershipUpdate {
            count: self.count,
            min: self.min,
            max: self.max,
        }
    }
}

/// Outcome of healing a persisted roster against live presence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    /// Deduplicated roster: persisted entries still present, in persisted
    /// order, then live members the persisted list was missing.
    pub roster: Vec<IdentityId>,
    /// Persisted entries with no live presence.
    pub dropped: Vec<IdentityId>,
    /// Number of repeated persisted entries removed.
    pub duplicates: usize,
}

#[derive(Debug)]
struct Room {
    capacity: Capacity,
    members: BTreeSet<IdentityId>,
}

impl Room {
    fn update(&self, session_id: SessionId, changed: bool) -> MembershipUpdate {
        MembershipUpdate {
            session_id,
            count: self.members.len() as u32,
            min: self.capacity.min,
            max: self.capacity.max,
            changed,
        }
    }
}

type Shard = HashMap<SessionId, Room>;

pub struct MembershipRegistry {
    shards: Vec<Mutex<Shard>>,
}

impl Default for MembershipRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, session_id: SessionId) -> MutexGuard<'_, Shard> {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        // A poisoned shard only means another thread panicked mid-update of a
        // plain set; the data is still consistent.
        self.shards[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add `identity` to the session's waiting room.
    ///
    /// Repeating a join is a no-op that still reports the current count.
    /// Fails with `CapacityExceeded` when the room is at `capacity.max`.
    pub fn join(
        &self,
        session_id: SessionId,
        capacity: Capacity,
        identity: &IdentityId,
    ) -> Result<MembershipUpdate, KnockoutError> {
        let mut shard = self.shard(session_id);
        let room = shard.entry(session_id).or_insert_with(|| Room {
            capacity,
            members: BTreeSet::new(),
        });
        if room.members.contains(identity) {
            return Ok(room.update(session_id, false));
        }
        if room.members.len() as u32 >= room.capacity.max {
            return Err(KnockoutError::CapacityExceeded {
                session_id,
                max: room.capacity.max,
            });
        }
        room.members.insert(identity.clone());
        Ok(room.update(session_id, true))
    }

    /// Remove `identity`. Returns `None` when it was not a member.
    pub fn leave(&self, session_id: SessionId, identity: &IdentityId) -> Option<MembershipUpdate> {
        let mut shard = self.shard(session_id);
        let room = shard.get_mut(&session_id)?;
        if !room.members.remove(identity) {
            return None;
        }
        Some(room.update(session_id, true))
    }

    /// Remove `identity` from every room it is in (disconnect path).
    pub fn leave_all(&self, identity: &IdentityId) -> Vec<MembershipUpdate> {
        let mut updates = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            for (session_id, room) in shard.iter_mut() {
                if room.members.remove(identity) {
                    updates.push(room.update(*session_id, true));
                }
            }
        }
        updates.sort_by_key(|u| u.session_id);
        updates
    }

    pub fn size(&self, session_id: SessionId) -> u32 {
        self.shard(session_id)
            .get(&session_id)
            .map_or(0, |r| r.members.len() as u32)
    }

    pub fn contains(&self, session_id: SessionId, identity: &IdentityId) -> bool {
        self.shard(session_id)
            .get(&session_id)
            .is_some_and(|r| r.members.contains(identity))
    }

    /// Current members in stable (sorted) order.
    pub fn snapshot(&self, session_id: SessionId) -> Vec<IdentityId> {
        self.shard(session_id)
            .get(&session_id)
            .map(|r| r.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn current(&self, session_id: SessionId) -> Option<MembershipUpdate> {
        self.shard(session_id)
            .get(&session_id)
            .map(|r| r.update(session_id, false))
    }

    /// Heal drift between a persisted roster and live presence.
    pub fn reconcile(&self, session_id: SessionId, persisted: &[IdentityId]) -> ReconcileReport {
        let live: BTreeSet<IdentityId> = self.snapshot(session_id).into_iter().collect();
        let mut seen: HashSet<&IdentityId> = HashSet::new();
        let mut report = ReconcileReport::default();

        for id in persisted {
            if !seen.insert(id) {
                report.duplicates += 1;
                continue;
            }
            if live.contains(id) {
                report.roster.push(id.clone());
            } else {
                report.dropped.push(id.clone());
            }
        }
        for id in &live {
            if !seen.contains(id) {
                report.roster.push(id.clone());
            }
        }
        report
    }

    /// Forget a room entirely (its session started or finished).
    pub fn clear(&self, session_id: SessionId) -> Vec<IdentityId> {
        self.shard(session_id)
            .remove(&session_id)
            .map(|r| r.members.into_iter().collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CAP: Capacity = Capacity { min: 2, max: 3 };

    fn id(s: &str) -> IdentityId {
        IdentityId::new(s)
    }

    #[test]
    fn join_is_idempotent() {
        let reg = MembershipRegistry::new();
        let s = SessionId(1);
        let first = reg.join(s, CAP, &id("a")).unwrap();
        assert!(first.changed);
        assert_eq!(first.count, 1);

        let again = reg.join(s, CAP, &id("a")).unwrap();
        assert!(!again.changed);
        assert_eq!(again.count, 1);
        assert_eq!(reg.size(s), 1);
    }

    #[test]
    fn join_at_capacity_fails_without_change() {
        let reg = MembershipRegistry::new();
        let s = SessionId(1);
        for p in ["a", "b", "c"] {
            reg.join(s, CAP, &id(p)).unwrap();
        }
        let err = reg.join(s, CAP, &id("d")).unwrap_err();
        assert_eq!(
            err,
            KnockoutError::CapacityExceeded {
                session_id: s,
                max: 3
            }
        );
        assert_eq!(reg.size(s), 3);
        assert!(!reg.contains(s, &id("d")));
        // An existing member re-joining a full room is still fine.
        assert!(reg.join(s, CAP, &id("a")).is_ok());
    }

    #[test]
    fn leave_is_idempotent() {
        let reg = MembershipRegistry::new();
        let s = SessionId(1);
        reg.join(s, CAP, &id("a")).unwrap();
        reg.join(s, CAP, &id("b")).unwrap();

        let upd = reg.leave(s, &id("a")).unwrap();
        assert_eq!(upd.count, 1);
        assert_eq!(upd.min, 2);
        assert!(reg.leave(s, &id("a")).is_none());
        assert!(reg.leave(SessionId(99), &id("a")).is_none());
    }

    #[test]
    fn leave_all_reports_each_room() {
        let reg = MembershipRegistry::new();
        reg.join(SessionId(1), CAP, &id("a")).unwrap();
        reg.join(SessionId(2), CAP, &id("a")).unwrap();
        reg.join(SessionId(2), CAP, &id("b")).unwrap();

        let updates = reg.leave_all(&id("a"));
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].session_id, SessionId(1));
        assert_eq!(updates[0].count, 0);
        assert_eq!(updates[1].count, 1);
        assert!(reg.leave_all(&id("a")).is_empty());
    }

    #[test]
    fn reconcile_dedups_and_heals() {
        let reg = MembershipRegistry::new();
        let s = SessionId(1);
        reg.join(s, CAP, &id("a")).unwrap();
        reg.join(s, CAP, &id("c")).unwrap();

        let persisted = vec![id("a"), id("b"), id("a")];
        let report = reg.reconcile(s, &persisted);
        assert_eq!(report.roster, vec![id("a"), id("c")]);
        assert_eq!(report.dropped, vec![id("b")]);
        assert_eq!(report.duplicates, 1);
    }

    #[test]
    fn clear_returns_members() {
        let reg = MembershipRegistry::new();
        let s = SessionId(4);
        reg.join(s, CAP, &id("b")).unwrap();
        reg.join(s, CAP, &id("a")).unwrap();
        assert_eq!(reg.clear(s), vec![id("a"), id("b")]);
        assert_eq!(reg.size(s), 0);
        assert!(reg.current(s).is_none());
    }

    #[test]
    fn update_converts_to_event() {
        let reg = MembershipRegistry::new();
        let upd = reg.join(SessionId(1), CAP, &id("a")).unwrap();
        assert_eq!(
            upd.to_event(),
            ServerEvent::MembershipUpdate {
                count: 1,
                min: 2,
                max: 3
            }
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Join(u8),
        Leave(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u8..6).prop_map(Op::Join), (0u8..6).prop_map(Op::Leave)]
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity_nor_duplicates(ops in proptest::collection::vec(op(), 0..64)) {
            let reg = MembershipRegistry::new();
            let s = SessionId(1);
            let mut model: BTreeSet<u8> = BTreeSet::new();
            for op in ops {
                match op {
                    Op::Join(p) => {
                        let res = reg.join(s, CAP, &id(&p.to_string()));
                        if model.contains(&p) || (model.len() as u32) < CAP.max {
                            prop_assert!(res.is_ok());
                            model.insert(p);
                        } else {
                            prop_assert!(res.is_err());
                        }
                    }
                    Op::Leave(p) => {
                        let res = reg.leave(s, &id(&p.to_string()));
                        prop_assert_eq!(res.is_some(), model.remove(&p));
                    }
                }
                prop_assert!(reg.size(s) <= CAP.max);
                prop_assert_eq!(reg.size(s) as usize, model.len());
            }
        }
    }
}
