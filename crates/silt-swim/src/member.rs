//! Cluster members and the incarnation rule.

use std::net::SocketAddrV4;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a member as seen from this node.
///
/// The derived order is the "more suspect" order used by the
/// incarnation rule: `Alive < Suspected < Dead < Left`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    /// Responds to requests.
    Alive = 0,
    /// Missed enough acks to be suspected dead. More failed pings turn
    /// it dead; a refutation turns it back alive.
    Suspected = 1,
    /// Considered dead. Disappears from the table unless pinned.
    Dead = 2,
    /// Voluntarily left the cluster.
    Left = 3,
}

impl MemberStatus {
    /// Decode from a wire status code.
    pub fn from_wire(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Alive),
            1 => Some(Self::Suspected),
            2 => Some(Self::Dead),
            3 => Some(Self::Left),
            _ => None,
        }
    }

    /// Encode for the wire.
    pub fn as_wire(self) -> u64 {
        self as u64
    }
}

/// One member of the cluster, self included.
///
/// Identified by UUID; the address may change across reconfigurations.
/// The TTL fields drive dissemination: a member with a positive TTL is
/// an undelivered event and rides outgoing packets until the TTL drains.
#[derive(Clone, Debug)]
pub struct Member {
    pub(crate) uuid: Uuid,
    pub(crate) addr: SocketAddrV4,
    pub(crate) status: MemberStatus,
    /// The member's logical clock; the single tiebreaker for
    /// conflicting observations. Monotonic non-decreasing.
    pub(crate) incarnation: u64,
    /// Opaque application payload attached by the member itself.
    pub(crate) payload: Vec<u8>,
    /// Pings sent since the last ack.
    pub(crate) unacknowledged_pings: u32,
    /// Remaining gossips of the latest status change.
    pub(crate) status_ttl: u32,
    /// Remaining gossips of the latest payload change.
    pub(crate) payload_ttl: u32,
    /// Previous UUID, gossiped for a while after a UUID change.
    pub(crate) old_uuid: Option<Uuid>,
    /// Remaining gossips of the old UUID.
    pub(crate) old_uuid_ttl: u32,
    /// A pinned member is never garbage collected.
    pub(crate) is_pinned: bool,
    /// Round in which this node last heard from the member.
    pub(crate) last_seen_round: u64,
    /// Round in which the member turned dead or left; GC input.
    pub(crate) death_round: u64,
}

impl Member {
    /// Create a fresh alive member at incarnation 0.
    pub(crate) fn new(uuid: Uuid, addr: SocketAddrV4) -> Self {
        Self {
            uuid,
            addr,
            status: MemberStatus::Alive,
            incarnation: 0,
            payload: Vec::new(),
            unacknowledged_pings: 0,
            status_ttl: 0,
            payload_ttl: 0,
            old_uuid: None,
            old_uuid_ttl: 0,
            is_pinned: false,
            last_seen_round: 0,
            death_round: 0,
        }
    }

    /// The member's UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The member's address.
    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    /// The member's status as seen from this node.
    pub fn status(&self) -> MemberStatus {
        self.status
    }

    /// The member's incarnation.
    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// The member's payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the member is pinned against garbage collection.
    pub fn is_pinned(&self) -> bool {
        self.is_pinned
    }

    /// Round in which this node last heard from the member.
    pub fn last_seen_round(&self) -> u64 {
        self.last_seen_round
    }

    /// Apply a remote observation `(status, incarnation)` under the
    /// incarnation rule. Returns whether anything was accepted.
    ///
    /// - A higher incarnation wins unconditionally.
    /// - At an equal incarnation only a more suspect status wins.
    /// - A lower incarnation is rejected silently.
    pub(crate) fn apply(&mut self, status: MemberStatus, incarnation: u64) -> bool {
        if incarnation > self.incarnation {
            self.incarnation = incarnation;
            self.status = status;
            true
        } else if incarnation == self.incarnation && status > self.status {
            self.status = status;
            true
        } else {
            false
        }
    }
}
