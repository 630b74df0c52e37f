//! The SWIM protocol core.
//!
//! [`Swim`] is a synchronous state machine. It never touches a socket
//! and never reads a clock: every entry point takes `now` in
//! milliseconds and returns the datagrams to send. A driver (the tokio
//! [`UdpNode`](crate::node::UdpNode) in production, a simulated network
//! in tests) owns the transport and the real time source.
//!
//! Three periodic duties run off [`Swim::tick`]:
//! - the round step: pick one member, ping it, piggyback gossip;
//! - ack timeouts: escalate unresponsive members through indirect
//!   pings to suspicion and death on a per-member retry timer that
//!   keeps firing until the member acks or dies;
//! - garbage collection of dead members.
//!
//! Inbound packets go through [`Swim::handle_packet`], which applies
//! the incarnation rule to every carried record before the next
//! outgoing packet is built.

use std::net::{Ipv4Addr, SocketAddrV4};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::member::{Member, MemberStatus};
use crate::proto::{
    FailureDetectionDef, FdMsgType, MemberRecord, MetaDef, Packet, PacketBody, RouteDef,
    MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};
use crate::table::MembershipTable;
use crate::{
    event_ttl, Result, SwimError, ACK_TIMEOUT_DIVISOR, DEFAULT_GC_TTL_ROUNDS,
    DEFAULT_HEARTBEAT_MS, DEFAULT_INDIRECT_PING_FANOUT, DEFAULT_SUSPECT_THRESHOLD,
    MAX_MEMBER_PAYLOAD, UNACKED_TO_SUSPECT,
};

/// Milliseconds on the driver-provided clock.
pub type Millis = u64;

/// Upper bound of anti-entropy records considered per packet; the
/// packet budget trims further.
const ANTI_ENTROPY_BATCH_MAX: usize = 16;

/// Whether dead members are garbage collected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GcMode {
    /// Dead members are dropped `gc_ttl` rounds after death.
    On,
    /// Dead members stay in the table forever.
    Off,
}

/// Resolved engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwimConfig {
    /// Protocol period in milliseconds.
    pub heartbeat: Millis,
    /// How long to wait for an ack before escalating.
    pub ack_timeout: Millis,
    /// Unacknowledged pings after which a suspected member is declared
    /// dead.
    pub suspect_threshold: u32,
    /// How many relays are asked to ping an unresponsive member.
    pub indirect_ping_fanout: usize,
    /// Garbage collection of dead members.
    pub gc_mode: GcMode,
    /// Rounds a dead member lingers before collection.
    pub gc_ttl: u64,
}

impl Default for SwimConfig {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT_MS,
            ack_timeout: DEFAULT_HEARTBEAT_MS / ACK_TIMEOUT_DIVISOR,
            suspect_threshold: DEFAULT_SUSPECT_THRESHOLD,
            indirect_ping_fanout: DEFAULT_INDIRECT_PING_FANOUT,
            gc_mode: GcMode::On,
            gc_ttl: DEFAULT_GC_TTL_ROUNDS,
        }
    }
}

/// One configuration call. Every field is optional, but the first call
/// must carry both the URI and the UUID.
#[derive(Clone, Debug, Default)]
pub struct SwimCfg {
    /// Listen URI, `a.b.c.d:port`. IPv4 only, no DNS.
    pub uri: Option<String>,
    /// Protocol period in milliseconds.
    pub heartbeat: Option<Millis>,
    /// Ack timeout; defaults to a third of the heartbeat.
    pub ack_timeout: Option<Millis>,
    /// Garbage collection mode.
    pub gc_mode: Option<GcMode>,
    /// Node UUID. Changing it later turns the old identity into a
    /// gossiped ghost.
    pub uuid: Option<Uuid>,
}

/// An outbound datagram.
#[derive(Clone, Debug)]
pub struct Datagram {
    pub to: SocketAddrV4,
    pub data: Vec<u8>,
}

/// A pending ack deadline for one pinged member.
#[derive(Clone, Copy, Debug)]
struct AckWait {
    uuid: Uuid,
    deadline: Millis,
}

/// Parse a SWIM URI: a literal IPv4 address and port.
pub fn parse_uri(uri: &str) -> Result<SocketAddrV4> {
    uri.parse::<SocketAddrV4>().map_err(|_| {
        SwimError::IllegalParams(format!(
            "invalid uri '{uri}': only IPv4 'a.b.c.d:port' is supported"
        ))
    })
}

/// The SWIM engine.
#[derive(Debug)]
pub struct Swim {
    cfg: SwimConfig,
    addr: SocketAddrV4,
    self_uuid: Uuid,
    configured: bool,
    /// Set after a voluntary quit; the engine goes silent.
    left: bool,
    table: MembershipTable,
    ack_waits: Vec<AckWait>,
    round_deadline: Option<Millis>,
    /// Completed round steps; the time base for GC and liveness marks.
    round: u64,
    rng: StdRng,
}

impl Swim {
    /// Create an unconfigured engine with a random shuffle seed.
    pub fn new() -> Self {
        Self::with_seed(rand::thread_rng().gen())
    }

    /// Create an unconfigured engine with a fixed shuffle seed, for
    /// deterministic tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            cfg: SwimConfig::default(),
            addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            self_uuid: Uuid::nil(),
            configured: false,
            left: false,
            table: MembershipTable::new(),
            ack_waits: Vec::new(),
            round_deadline: None,
            round: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Configure or reconfigure the engine.
    ///
    /// # Errors
    ///
    /// Returns [`SwimError::InvalidConfig`] when the first call omits
    /// the URI or the UUID, or when a UUID change collides with an
    /// existing member. Returns [`SwimError::IllegalParams`] for a
    /// malformed URI.
    pub fn cfg(&mut self, cfg: &SwimCfg, now: Millis) -> Result<()> {
        if !self.configured {
            let uri = cfg.uri.as_deref().ok_or_else(|| {
                SwimError::InvalidConfig("URI is mandatory on the first configuration".to_string())
            })?;
            let uuid = cfg.uuid.ok_or_else(|| {
                SwimError::InvalidConfig("UUID is mandatory on the first configuration".to_string())
            })?;
            if uuid.is_nil() {
                return Err(SwimError::InvalidConfig("UUID must not be nil".to_string()));
            }
            let addr = parse_uri(uri)?;
            self.apply_timing(cfg)?;
            self.addr = addr;
            self.self_uuid = uuid;
            self.table.insert(Member::new(uuid, addr))?;
            self.configured = true;
            self.emit_status_event(&uuid);
            self.round_deadline = Some(now + self.cfg.heartbeat);
            info!(%uuid, %addr, "SWIM node configured");
            return Ok(());
        }

        if let Some(uri) = cfg.uri.as_deref() {
            let addr = parse_uri(uri)?;
            if addr != self.addr {
                self.addr = addr;
                let self_uuid = self.self_uuid;
                if let Some(me) = self.table.get_mut(&self_uuid) {
                    me.addr = addr;
                }
                self.emit_status_event(&self_uuid);
                info!(%addr, "SWIM address changed");
            }
        }
        self.apply_timing(cfg)?;
        if let Some(uuid) = cfg.uuid {
            if uuid != self.self_uuid {
                self.update_uuid(uuid)?;
            }
        }
        Ok(())
    }

    /// Apply the timing and GC knobs of a configuration call.
    fn apply_timing(&mut self, cfg: &SwimCfg) -> Result<()> {
        if let Some(heartbeat) = cfg.heartbeat {
            if heartbeat == 0 {
                return Err(SwimError::InvalidConfig(
                    "heartbeat must be positive".to_string(),
                ));
            }
            self.cfg.heartbeat = heartbeat;
            self.cfg.ack_timeout = (heartbeat / ACK_TIMEOUT_DIVISOR).max(1);
        }
        if let Some(ack_timeout) = cfg.ack_timeout {
            if ack_timeout == 0 {
                return Err(SwimError::InvalidConfig(
                    "ack timeout must be positive".to_string(),
                ));
            }
            self.cfg.ack_timeout = ack_timeout;
        }
        if let Some(gc_mode) = cfg.gc_mode {
            self.cfg.gc_mode = gc_mode;
        }
        Ok(())
    }

    /// Change the node's UUID. The old identity stays in the table as a
    /// dead ghost and is gossiped as `old_uuid` for a bounded TTL so
    /// peers can reconcile.
    fn update_uuid(&mut self, new_uuid: Uuid) -> Result<()> {
        if new_uuid.is_nil() {
            return Err(SwimError::InvalidConfig("UUID must not be nil".to_string()));
        }
        if self.table.contains(&new_uuid) {
            return Err(SwimError::InvalidConfig(format!(
                "UUID {new_uuid} already exists in the member table"
            )));
        }
        let old_uuid = self.self_uuid;
        let Some(mut ghost) = self.table.remove(&old_uuid) else {
            return Err(SwimError::InvalidConfig(
                "self member is missing".to_string(),
            ));
        };
        let ttl = event_ttl(self.table.len() + 2);

        let mut me = ghost.clone();
        me.uuid = new_uuid;
        me.status = MemberStatus::Alive;
        me.old_uuid = Some(old_uuid);
        me.old_uuid_ttl = ttl;
        me.status_ttl = ttl;

        ghost.status = MemberStatus::Dead;
        ghost.status_ttl = ttl;
        ghost.death_round = self.round;
        ghost.old_uuid = None;
        ghost.old_uuid_ttl = 0;
        ghost.payload_ttl = 0;

        self.table.insert(ghost)?;
        self.table.insert(me)?;
        self.self_uuid = new_uuid;
        info!(%old_uuid, %new_uuid, "SWIM UUID changed, old identity kept as a ghost");
        Ok(())
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.configured {
            Ok(())
        } else {
            Err(SwimError::InvalidConfig(
                "the node is not configured".to_string(),
            ))
        }
    }

    /// The node's own UUID.
    pub fn self_uuid(&self) -> Uuid {
        self.self_uuid
    }

    /// The node's listen address.
    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    /// Whether the engine has been configured.
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// The member representing this node.
    pub fn self_member(&self) -> Option<&Member> {
        self.table.get(&self.self_uuid)
    }

    /// Find a member by UUID.
    pub fn member_by_uuid(&self, uuid: &Uuid) -> Option<&Member> {
        self.table.get(uuid)
    }

    /// Iterate over all known members.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.table.iter()
    }

    /// Number of known members, self included.
    pub fn member_count(&self) -> usize {
        self.table.len()
    }

    /// Add a member explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`SwimError::IllegalParams`] for a malformed URI or a
    /// UUID that is already known.
    pub fn add_member(&mut self, uri: &str, uuid: Uuid) -> Result<()> {
        self.ensure_configured()?;
        let addr = parse_uri(uri)?;
        self.table.insert(Member::new(uuid, addr))?;
        self.emit_status_event(&uuid);
        info!(%uuid, %addr, "member added");
        Ok(())
    }

    /// Remove a member. Removing an unknown member is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SwimError::IllegalParams`] on an attempt to remove
    /// self.
    pub fn remove_member(&mut self, uuid: &Uuid) -> Result<()> {
        self.ensure_configured()?;
        if *uuid == self.self_uuid {
            return Err(SwimError::IllegalParams(
                "can not remove self".to_string(),
            ));
        }
        if self.table.remove(uuid).is_some() {
            self.ack_waits.retain(|w| w.uuid != *uuid);
            info!(%uuid, "member removed");
        }
        Ok(())
    }

    /// Ping an address without any scheduling. The ack, when it comes,
    /// inserts the remote as alive.
    pub fn probe_member(&mut self, uri: &str, _now: Millis) -> Result<Vec<Datagram>> {
        self.ensure_configured()?;
        let addr = parse_uri(uri)?;
        let data = self.compose(Some(FdMsgType::Ping), None, None)?;
        debug!(%addr, "probing");
        Ok(vec![Datagram { to: addr, data }])
    }

    /// Attach an opaque payload to this node, disseminated to the
    /// cluster alongside membership gossip.
    ///
    /// # Errors
    ///
    /// Returns [`SwimError::IllegalParams`] when the payload exceeds
    /// [`MAX_MEMBER_PAYLOAD`](crate::MAX_MEMBER_PAYLOAD).
    pub fn set_payload(&mut self, payload: Vec<u8>) -> Result<()> {
        self.ensure_configured()?;
        if payload.len() > MAX_MEMBER_PAYLOAD {
            return Err(SwimError::IllegalParams(format!(
                "payload of {} bytes exceeds the {MAX_MEMBER_PAYLOAD} byte limit",
                payload.len()
            )));
        }
        let ttl = event_ttl(self.table.len());
        let self_uuid = self.self_uuid;
        if let Some(me) = self.table.get_mut(&self_uuid) {
            me.payload = payload;
            me.payload_ttl = ttl;
        }
        Ok(())
    }

    /// Pin a member: it will never be garbage collected.
    pub fn pin_member(&mut self, uuid: &Uuid) -> Result<()> {
        self.set_pinned(uuid, true)
    }

    /// Unpin a member.
    pub fn unpin_member(&mut self, uuid: &Uuid) -> Result<()> {
        self.set_pinned(uuid, false)
    }

    fn set_pinned(&mut self, uuid: &Uuid, pinned: bool) -> Result<()> {
        self.ensure_configured()?;
        match self.table.get_mut(uuid) {
            Some(member) => {
                member.is_pinned = pinned;
                Ok(())
            }
            None => Err(SwimError::IllegalParams(format!(
                "member {uuid} does not exist"
            ))),
        }
    }

    /// Leave the cluster voluntarily: notify every known member with a
    /// quit message and go silent.
    pub fn quit(&mut self, _now: Millis) -> Result<Vec<Datagram>> {
        self.ensure_configured()?;
        let incarnation = self.self_member().map(Member::incarnation).unwrap_or(0);
        let mut out = Vec::new();
        for member in self.table.iter() {
            if member.uuid() == self.self_uuid
                || !matches!(
                    member.status(),
                    MemberStatus::Alive | MemberStatus::Suspected
                )
            {
                continue;
            }
            let packet = Packet {
                meta: MetaDef {
                    version: PROTOCOL_VERSION,
                    src: self.addr,
                    route: None,
                },
                body: PacketBody {
                    quit: Some(incarnation),
                    ..PacketBody::new(self.self_uuid)
                },
            };
            out.push(Datagram {
                to: member.addr(),
                data: packet.encode()?,
            });
        }
        self.left = true;
        self.round_deadline = None;
        self.ack_waits.clear();
        info!(uuid = %self.self_uuid, "leaving the cluster");
        Ok(out)
    }

    /// The earliest timer deadline, for the driver's sleep.
    pub fn next_deadline(&self) -> Option<Millis> {
        let ack = self.ack_waits.iter().map(|w| w.deadline).min();
        match (self.round_deadline, ack) {
            (Some(r), Some(a)) => Some(r.min(a)),
            (r, a) => r.or(a),
        }
    }

    /// Fire every timer that is due at `now` and return the datagrams
    /// to send. Idempotent: firing with no due timers sends nothing.
    pub fn tick(&mut self, now: Millis) -> Result<Vec<Datagram>> {
        if !self.configured || self.left {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();

        // Ack timeouts first: a timed-out ack may emit events the round
        // packet below should already carry.
        let mut due = Vec::new();
        self.ack_waits.retain(|w| {
            if w.deadline <= now {
                due.push(w.uuid);
                false
            } else {
                true
            }
        });
        for uuid in due {
            self.on_ack_timeout(uuid, now, &mut out)?;
        }

        if let Some(deadline) = self.round_deadline {
            if deadline <= now {
                self.round_step(now, &mut out)?;
                let mut next = deadline + self.cfg.heartbeat;
                if next <= now {
                    next = now + self.cfg.heartbeat;
                }
                self.round_deadline = Some(next);
            }
        }
        Ok(out)
    }

    /// One round step: garbage collection, then ping the next target.
    fn round_step(&mut self, now: Millis, out: &mut Vec<Datagram>) -> Result<()> {
        self.round += 1;

        if self.cfg.gc_mode == GcMode::On {
            let dropped = self.table.sweep(self.round, self.cfg.gc_ttl);
            for uuid in &dropped {
                self.ack_waits.retain(|w| w.uuid != *uuid);
                debug!(%uuid, "dead member collected");
            }
        }

        let self_uuid = self.self_uuid;
        if let Some(target) = self.table.next_round_target(&self_uuid, &mut self.rng) {
            let Some(addr) = self.table.get(&target).map(Member::addr) else {
                return Ok(());
            };
            let data = self.compose(Some(FdMsgType::Ping), None, None)?;
            out.push(Datagram { to: addr, data });
            self.arm_ack_wait(target, now + self.cfg.ack_timeout);
            debug!(round = self.round, %target, "round step ping");
        }
        Ok(())
    }

    /// Arm an ack deadline for a member unless one is already pending.
    /// At most one wait exists per member, so a round-step ping and the
    /// escalation retry timer never double-count a single silence.
    fn arm_ack_wait(&mut self, uuid: Uuid, deadline: Millis) {
        if !self.ack_waits.iter().any(|w| w.uuid == uuid) {
            self.ack_waits.push(AckWait { uuid, deadline });
        }
    }

    /// Escalate a missed ack.
    ///
    /// Escalation runs on its own retry timer: every missed deadline
    /// below the death threshold probes the member again and re-arms
    /// the wait, so a silent member reaches suspicion and death in a
    /// fixed number of ack timeouts no matter which targets the round
    /// steps happen to pick meanwhile.
    fn on_ack_timeout(&mut self, uuid: Uuid, now: Millis, out: &mut Vec<Datagram>) -> Result<()> {
        let Some(member) = self.table.get_mut(&uuid) else {
            // Removed while the timer was pending; firing is harmless.
            return Ok(());
        };
        member.unacknowledged_pings += 1;
        let unacked = member.unacknowledged_pings;
        let target_addr = member.addr;
        debug!(%uuid, unacked, "ack timeout");

        if unacked >= self.cfg.suspect_threshold {
            self.declare(uuid, MemberStatus::Dead);
            return Ok(());
        }
        if unacked >= UNACKED_TO_SUSPECT {
            self.declare(uuid, MemberStatus::Suspected);
        }

        if unacked == 1 {
            // First miss: ask up to `fanout` relays to ping the member
            // on our behalf.
            let mut relays: Vec<SocketAddrV4> = self
                .table
                .iter()
                .filter(|m| {
                    m.status() == MemberStatus::Alive
                        && m.uuid() != self.self_uuid
                        && m.uuid() != uuid
                })
                .map(Member::addr)
                .collect();
            relays.sort();
            let fanout = self.cfg.indirect_ping_fanout;
            let chosen: Vec<SocketAddrV4> = relays
                .choose_multiple(&mut self.rng, fanout)
                .copied()
                .collect();
            let route = RouteDef {
                src: self.addr,
                dst: target_addr,
            };
            for relay in chosen {
                let data = self.compose(Some(FdMsgType::Ping), None, Some(route))?;
                out.push(Datagram { to: relay, data });
            }
        } else {
            // Still short of the death threshold: probe directly again.
            let data = self.compose(Some(FdMsgType::Ping), None, None)?;
            out.push(Datagram {
                to: target_addr,
                data,
            });
        }
        self.arm_ack_wait(uuid, now + self.cfg.ack_timeout);
        Ok(())
    }

    /// Locally transition a member at its current incarnation and emit
    /// a dissemination event.
    fn declare(&mut self, uuid: Uuid, status: MemberStatus) {
        let round = self.round;
        let Some(member) = self.table.get_mut(&uuid) else {
            return;
        };
        if member.status >= status {
            return;
        }
        member.status = status;
        if matches!(status, MemberStatus::Dead | MemberStatus::Left) {
            member.death_round = round;
        }
        info!(%uuid, ?status, incarnation = member.incarnation, "member declared");
        self.emit_status_event(&uuid);
    }

    /// Refresh the dissemination TTL of a member's status.
    fn emit_status_event(&mut self, uuid: &Uuid) {
        let ttl = event_ttl(self.table.len());
        if let Some(member) = self.table.get_mut(uuid) {
            member.status_ttl = ttl;
        }
    }

    /// Build one outgoing packet: failure detection plus as much gossip
    /// as the budget allows. Dissemination TTLs of the included events
    /// are decremented.
    fn compose(
        &mut self,
        fd: Option<FdMsgType>,
        quit: Option<u64>,
        route: Option<RouteDef>,
    ) -> Result<Vec<u8>> {
        let incarnation = self.self_member().map(Member::incarnation).unwrap_or(0);
        let failure_detection = fd.map(|msg_type| FailureDetectionDef {
            msg_type,
            incarnation,
        });

        // Events with the highest remaining TTL go first.
        let mut diss: Vec<Uuid> = self
            .table
            .iter()
            .filter(|m| m.status_ttl > 0 || m.payload_ttl > 0 || m.old_uuid_ttl > 0)
            .map(Member::uuid)
            .collect();
        diss.sort_by_key(|uuid| {
            let ttl = self
                .table
                .get(uuid)
                .map(|m| m.status_ttl.max(m.payload_ttl).max(m.old_uuid_ttl))
                .unwrap_or(0);
            (std::cmp::Reverse(ttl), *uuid)
        });

        let mut anti_entropy: Vec<Uuid> = self
            .table
            .anti_entropy_batch(ANTI_ENTROPY_BATCH_MAX)
            .into_iter()
            .filter(|uuid| !diss.contains(uuid))
            .collect();

        let bytes = loop {
            let packet = Packet {
                meta: MetaDef {
                    version: PROTOCOL_VERSION,
                    src: self.addr,
                    route,
                },
                body: PacketBody {
                    src_uuid: self.self_uuid,
                    failure_detection,
                    dissemination: self.records_for(&diss, true),
                    anti_entropy: self.records_for(&anti_entropy, false),
                    quit,
                },
            };
            let bytes = packet.encode()?;
            if bytes.len() <= MAX_PAYLOAD_SIZE {
                break bytes;
            }
            // Over budget: shed anti-entropy first, then the lowest-TTL
            // events.
            if anti_entropy.pop().is_none() && diss.pop().is_none() {
                warn!(size = bytes.len(), "base packet exceeds the budget");
                break bytes;
            }
        };

        for uuid in &diss {
            if let Some(member) = self.table.get_mut(uuid) {
                member.status_ttl = member.status_ttl.saturating_sub(1);
                member.payload_ttl = member.payload_ttl.saturating_sub(1);
                if member.old_uuid_ttl > 0 {
                    member.old_uuid_ttl -= 1;
                    if member.old_uuid_ttl == 0 {
                        member.old_uuid = None;
                    }
                }
            }
        }

        Ok(bytes)
    }

    /// Wire records for the given members. Dissemination records carry
    /// the old UUID and payload only while their TTLs last;
    /// anti-entropy records always carry the full state.
    fn records_for(&self, uuids: &[Uuid], dissemination: bool) -> Vec<MemberRecord> {
        uuids
            .iter()
            .filter_map(|uuid| self.table.get(uuid))
            .map(|m| MemberRecord {
                status: m.status(),
                addr: m.addr(),
                uuid: m.uuid(),
                incarnation: m.incarnation(),
                old_uuid: if !dissemination || m.old_uuid_ttl > 0 {
                    m.old_uuid
                } else {
                    None
                },
                payload: if m.payload.is_empty() {
                    None
                } else if !dissemination || m.payload_ttl > 0 {
                    Some(m.payload.clone())
                } else {
                    None
                },
            })
            .collect()
    }

    /// Ingest one datagram. Returns replies and forwards to send.
    ///
    /// # Errors
    ///
    /// Returns [`SwimError::ProtocolViolation`] for malformed or
    /// misrouted packets; the membership table is left untouched in
    /// that case.
    pub fn handle_packet(
        &mut self,
        sender: SocketAddrV4,
        data: &[u8],
        _now: Millis,
    ) -> Result<Vec<Datagram>> {
        if !self.configured || self.left {
            return Ok(Vec::new());
        }
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(%sender, error = %e, "dropping malformed packet");
                return Err(e);
            }
        };
        let mut out = Vec::new();

        // Proxy hop: forward a packet routed to somebody else, at most
        // one hop.
        if let Some(route) = packet.meta.route {
            if route.dst != self.addr {
                if sender != route.src {
                    warn!(%sender, "dropping packet with nested routing");
                    return Err(SwimError::ProtocolViolation(
                        "nested routing is not allowed".to_string(),
                    ));
                }
                let forward = Packet {
                    meta: MetaDef {
                        version: packet.meta.version,
                        src: self.addr,
                        route: Some(route),
                    },
                    body: packet.body,
                };
                debug!(dst = %route.dst, "forwarding a routed packet");
                out.push(Datagram {
                    to: route.dst,
                    data: forward.encode()?,
                });
                return Ok(out);
            }
        }

        // The true origin: the route source for a proxied packet, the
        // meta source otherwise.
        let origin = packet
            .meta
            .route
            .map(|r| r.src)
            .unwrap_or(packet.meta.src);
        // An ack to a routed ping travels back through the proxy.
        let (reply_to, reply_route) = match packet.meta.route {
            Some(route) => (
                sender,
                Some(RouteDef {
                    src: self.addr,
                    dst: route.src,
                }),
            ),
            None => (packet.meta.src, None),
        };

        // A packet from a member is a sign of life.
        self.note_sender(packet.body.src_uuid, origin);

        for record in &packet.body.anti_entropy {
            self.apply_record(record);
        }
        for record in &packet.body.dissemination {
            self.apply_record(record);
        }

        if let Some(fd) = packet.body.failure_detection {
            match fd.msg_type {
                FdMsgType::Ping => {
                    self.on_ping(packet.body.src_uuid, origin, fd.incarnation);
                    let data = self.compose(Some(FdMsgType::Ack), None, reply_route)?;
                    out.push(Datagram { to: reply_to, data });
                }
                FdMsgType::Ack => {
                    self.on_ack(packet.body.src_uuid, fd.incarnation);
                }
            }
        }

        if let Some(incarnation) = packet.body.quit {
            self.on_quit(packet.body.src_uuid, incarnation);
        }

        Ok(out)
    }

    /// Upsert the sender of a packet as alive-at-least-once.
    fn note_sender(&mut self, uuid: Uuid, addr: SocketAddrV4) {
        if uuid == self.self_uuid {
            return;
        }
        let round = self.round;
        if let Some(member) = self.table.get_mut(&uuid) {
            member.last_seen_round = round;
            return;
        }
        let mut member = Member::new(uuid, addr);
        member.last_seen_round = round;
        if self.table.insert(member).is_ok() {
            debug!(%uuid, %addr, "learned a member from a packet");
            self.emit_status_event(&uuid);
        }
    }

    /// Apply one anti-entropy or dissemination record.
    fn apply_record(&mut self, record: &MemberRecord) {
        if record.uuid == self.self_uuid {
            self.refute_about_self(record);
            return;
        }

        // A record carrying an old UUID renames the member: the old
        // identity dies in place.
        if let Some(old_uuid) = record.old_uuid {
            if old_uuid != self.self_uuid {
                self.declare(old_uuid, MemberStatus::Dead);
            }
        }

        let round = self.round;
        if let Some(member) = self.table.get_mut(&record.uuid) {
            if record.incarnation > member.incarnation {
                member.addr = record.addr;
                if let Some(payload) = &record.payload {
                    member.payload = payload.clone();
                }
            }
            let was = member.status;
            if member.apply(record.status, record.incarnation) {
                if matches!(member.status, MemberStatus::Dead | MemberStatus::Left)
                    && !matches!(was, MemberStatus::Dead | MemberStatus::Left)
                {
                    member.death_round = round;
                }
                if member.status == MemberStatus::Alive {
                    member.unacknowledged_pings = 0;
                }
                // Re-gossip what we accepted.
                self.emit_status_event(&record.uuid);
            }
            return;
        }

        let mut member = Member::new(record.uuid, record.addr);
        member.status = record.status;
        member.incarnation = record.incarnation;
        if let Some(payload) = &record.payload {
            member.payload = payload.clone();
        }
        if matches!(record.status, MemberStatus::Dead | MemberStatus::Left) {
            member.death_round = round;
        }
        if self.table.insert(member).is_ok() {
            debug!(uuid = %record.uuid, status = ?record.status, "learned a member from gossip");
            self.emit_status_event(&record.uuid);
        }
    }

    /// Somebody claims this node is suspected or dead: take a higher
    /// incarnation and gossip being alive. The single source of
    /// incarnation increments.
    fn refute_about_self(&mut self, record: &MemberRecord) {
        if !matches!(
            record.status,
            MemberStatus::Suspected | MemberStatus::Dead | MemberStatus::Left
        ) {
            return;
        }
        let self_uuid = self.self_uuid;
        let Some(me) = self.table.get_mut(&self_uuid) else {
            return;
        };
        if record.incarnation >= me.incarnation {
            me.incarnation = record.incarnation + 1;
            me.status = MemberStatus::Alive;
            info!(
                incarnation = me.incarnation,
                "refuting a rumor about this node"
            );
            self.emit_status_event(&self_uuid);
        }
    }

    /// A ping proves its sender alive at its carried incarnation.
    fn on_ping(&mut self, uuid: Uuid, addr: SocketAddrV4, incarnation: u64) {
        if uuid == self.self_uuid {
            return;
        }
        if let Some(member) = self.table.get_mut(&uuid) {
            if incarnation > member.incarnation {
                member.addr = addr;
            }
            if member.apply(MemberStatus::Alive, incarnation) {
                member.unacknowledged_pings = 0;
                self.emit_status_event(&uuid);
            }
        }
    }

    /// An ack clears the unacknowledged counter and refutes an equal-
    /// incarnation suspicion: the ack is firsthand proof of life.
    fn on_ack(&mut self, uuid: Uuid, incarnation: u64) {
        if uuid == self.self_uuid {
            return;
        }
        self.ack_waits.retain(|w| w.uuid != uuid);
        let Some(member) = self.table.get_mut(&uuid) else {
            return;
        };
        member.unacknowledged_pings = 0;
        let mut changed = member.apply(MemberStatus::Alive, incarnation);
        if !changed
            && member.status == MemberStatus::Suspected
            && incarnation == member.incarnation
        {
            member.status = MemberStatus::Alive;
            changed = true;
        }
        if changed {
            debug!(%uuid, incarnation, "ack refuted a suspicion");
            self.emit_status_event(&uuid);
        }
    }

    /// A voluntary quit goes through the same incarnation rule as any
    /// other update, so a delayed quit loses to a rejoin under a higher
    /// incarnation.
    fn on_quit(&mut self, uuid: Uuid, incarnation: u64) {
        if uuid == self.self_uuid {
            return;
        }
        let round = self.round;
        let Some(member) = self.table.get_mut(&uuid) else {
            return;
        };
        if member.apply(MemberStatus::Left, incarnation) {
            member.death_round = round;
            info!(%uuid, incarnation, "member left the cluster");
            self.emit_status_event(&uuid);
        }
    }
}

impl Default for Swim {
    fn default() -> Self {
        Self::new()
    }
}
