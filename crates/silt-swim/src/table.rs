//! The membership table.
//!
//! Maps UUID to member and derives two traversal orders from it: a
//! shuffled round-robin order for ping target selection (re-shuffled on
//! every full pass) and a stable rotation for anti-entropy, so every
//! member is eventually advertised.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::rngs::StdRng;
use uuid::Uuid;

use crate::member::{Member, MemberStatus};
use crate::{Result, SwimError};

/// UUID -> member mapping plus traversal cursors.
#[derive(Debug, Default)]
pub struct MembershipTable {
    members: HashMap<Uuid, Member>,
    /// Shuffled ping order; consumed from the front, rebuilt when empty.
    round_order: Vec<Uuid>,
    /// Anti-entropy rotation position over the sorted UUID list.
    ae_cursor: usize,
}

impl MembershipTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members, self included.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Insert a new member.
    ///
    /// # Errors
    ///
    /// Returns [`SwimError::IllegalParams`] when the UUID is already
    /// present; no two entries may share a UUID.
    pub fn insert(&mut self, member: Member) -> Result<()> {
        let uuid = member.uuid();
        if self.members.contains_key(&uuid) {
            return Err(SwimError::IllegalParams(format!(
                "member {uuid} already exists"
            )));
        }
        self.members.insert(uuid, member);
        Ok(())
    }

    /// Remove a member. Returns it when it was present.
    pub fn remove(&mut self, uuid: &Uuid) -> Option<Member> {
        self.round_order.retain(|u| u != uuid);
        self.members.remove(uuid)
    }

    /// Find a member by UUID.
    pub fn get(&self, uuid: &Uuid) -> Option<&Member> {
        self.members.get(uuid)
    }

    /// Find a member by UUID, mutably.
    pub(crate) fn get_mut(&mut self, uuid: &Uuid) -> Option<&mut Member> {
        self.members.get_mut(uuid)
    }

    /// Whether a member with this UUID exists.
    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.members.contains_key(uuid)
    }

    /// Iterate over all members in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// UUIDs in sorted order; the deterministic backbone for rotations.
    pub fn sorted_uuids(&self) -> Vec<Uuid> {
        let mut uuids: Vec<Uuid> = self.members.keys().copied().collect();
        uuids.sort();
        uuids
    }

    /// Pick the next ping target: a non-self member that is not dead
    /// and has not left.
    ///
    /// Targets come from a shuffled order consumed one per round; when
    /// the pass is over the order is rebuilt and re-shuffled. Members
    /// that died or disappeared after the shuffle are skipped lazily.
    pub(crate) fn next_round_target(&mut self, self_uuid: &Uuid, rng: &mut StdRng) -> Option<Uuid> {
        for _ in 0..2 {
            while let Some(uuid) = self.round_order.pop() {
                let Some(member) = self.members.get(&uuid) else {
                    continue;
                };
                if uuid != *self_uuid
                    && matches!(
                        member.status(),
                        MemberStatus::Alive | MemberStatus::Suspected
                    )
                {
                    return Some(uuid);
                }
            }
            // Re-shuffle for the next pass.
            self.round_order = self
                .members
                .iter()
                .filter(|(uuid, member)| {
                    *uuid != self_uuid
                        && matches!(
                            member.status(),
                            MemberStatus::Alive | MemberStatus::Suspected
                        )
                })
                .map(|(uuid, _)| *uuid)
                .collect();
            self.round_order.sort();
            self.round_order.shuffle(rng);
        }
        None
    }

    /// Next `max` members for an anti-entropy section, rotating over
    /// the whole table.
    pub(crate) fn anti_entropy_batch(&mut self, max: usize) -> Vec<Uuid> {
        let uuids = self.sorted_uuids();
        if uuids.is_empty() || max == 0 {
            return Vec::new();
        }
        let take = max.min(uuids.len());
        let mut batch = Vec::with_capacity(take);
        for i in 0..take {
            batch.push(uuids[(self.ae_cursor + i) % uuids.len()]);
        }
        self.ae_cursor = (self.ae_cursor + take) % uuids.len();
        batch
    }

    /// Drop members that died or left at least `gc_ttl` rounds ago and
    /// are not pinned. Returns the dropped UUIDs.
    pub(crate) fn sweep(&mut self, current_round: u64, gc_ttl: u64) -> Vec<Uuid> {
        let doomed: Vec<Uuid> = self
            .members
            .iter()
            .filter(|(_, m)| {
                matches!(m.status(), MemberStatus::Dead | MemberStatus::Left)
                    && !m.is_pinned()
                    && current_round >= m.death_round + gc_ttl
            })
            .map(|(uuid, _)| *uuid)
            .collect();
        for uuid in &doomed {
            self.remove(uuid);
        }
        doomed
    }
}
