//! SWIM binary protocol: MessagePack packet layout.
//!
//! A packet is two consecutive MessagePack maps with small integer keys:
//!
//! ```text
//! +----------Meta section, handled by the transport level--------+
//! | {                                                            |
//! |     0 META_VERSION: uint,                                    |
//! |     1 META_SRC_ADDRESS: uint, ipv4 as u32,                   |
//! |     2 META_SRC_PORT: uint,                                   |
//! |     3 META_ROUTING: {                                        |
//! |         0 ROUTE_SRC_ADDRESS, 1 ROUTE_SRC_PORT,               |
//! |         2 ROUTE_DST_ADDRESS, 3 ROUTE_DST_PORT                |
//! |     }                                                        |
//! | }                                                            |
//! +-------------------Protocol logic section---------------------+
//! | {                                                            |
//! |     0 BODY_SRC_UUID: bin 16,                                 |
//! |     1 BODY_ANTI_ENTROPY: [ member record, ... ],             |
//! |     2 BODY_FAILURE_DETECTION: { 0 msg_type, 1 incarnation }, |
//! |     3 BODY_DISSEMINATION: [ member record, ... ],            |
//! |     4 BODY_QUIT: { 0 incarnation }                           |
//! | }                                                            |
//! +--------------------------------------------------------------+
//! ```
//!
//! A member record is a map with keys `0 status, 1 address, 2 port,
//! 3 uuid (bin 16), 4 incarnation, 5 old_uuid (bin 16, optional),
//! 6 payload (bin, optional)`.
//!
//! Decoding skips unknown keys (the version field leaves room for
//! extension) and reports any corrupted field as a protocol violation;
//! a violating packet never mutates the membership table.

use std::net::{Ipv4Addr, SocketAddrV4};

use rmpv::Value;
use uuid::Uuid;

use crate::member::MemberStatus;
use crate::{Result, SwimError};

/// Protocol version carried in the meta section.
pub const PROTOCOL_VERSION: u32 = 1;

/// Packet budget in bytes. Anti-entropy fills up to this limit.
pub const MAX_PAYLOAD_SIZE: usize = 1200;

const META_VERSION: u64 = 0;
const META_SRC_ADDRESS: u64 = 1;
const META_SRC_PORT: u64 = 2;
const META_ROUTING: u64 = 3;

const ROUTE_SRC_ADDRESS: u64 = 0;
const ROUTE_SRC_PORT: u64 = 1;
const ROUTE_DST_ADDRESS: u64 = 2;
const ROUTE_DST_PORT: u64 = 3;

const BODY_SRC_UUID: u64 = 0;
const BODY_ANTI_ENTROPY: u64 = 1;
const BODY_FAILURE_DETECTION: u64 = 2;
const BODY_DISSEMINATION: u64 = 3;
const BODY_QUIT: u64 = 4;

const MEMBER_STATUS: u64 = 0;
const MEMBER_ADDRESS: u64 = 1;
const MEMBER_PORT: u64 = 2;
const MEMBER_UUID: u64 = 3;
const MEMBER_INCARNATION: u64 = 4;
const MEMBER_OLD_UUID: u64 = 5;
const MEMBER_PAYLOAD: u64 = 6;

const FD_MSG_TYPE: u64 = 0;
const FD_INCARNATION: u64 = 1;

const QUIT_INCARNATION: u64 = 0;

/// Failure detection message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdMsgType {
    /// A liveness probe; the receiver must answer with an ack.
    Ping = 0,
    /// The answer to a ping.
    Ack = 1,
}

/// A one-hop proxy route: the true source and destination of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteDef {
    /// Where the answer should ultimately go.
    pub src: SocketAddrV4,
    /// Where the packet should ultimately arrive.
    pub dst: SocketAddrV4,
}

/// The decoded meta section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaDef {
    pub version: u32,
    /// Transport-level source; carried in the body because UDP headers
    /// are not trustworthy through NATs and filters.
    pub src: SocketAddrV4,
    pub route: Option<RouteDef>,
}

/// The failure detection sub-message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailureDetectionDef {
    pub msg_type: FdMsgType,
    /// Incarnation of the sender, refuting stale suspicions.
    pub incarnation: u64,
}

/// One member record in an anti-entropy or dissemination section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberRecord {
    pub status: MemberStatus,
    pub addr: SocketAddrV4,
    pub uuid: Uuid,
    pub incarnation: u64,
    pub old_uuid: Option<Uuid>,
    /// `None` means "not specified"; an empty payload is a valid value.
    pub payload: Option<Vec<u8>>,
}

/// The protocol logic section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketBody {
    pub src_uuid: Uuid,
    pub failure_detection: Option<FailureDetectionDef>,
    pub dissemination: Vec<MemberRecord>,
    pub anti_entropy: Vec<MemberRecord>,
    pub quit: Option<u64>,
}

impl PacketBody {
    /// An empty body from the given source.
    pub fn new(src_uuid: Uuid) -> Self {
        Self {
            src_uuid,
            failure_detection: None,
            dissemination: Vec::new(),
            anti_entropy: Vec::new(),
            quit: None,
        }
    }
}

/// A complete SWIM packet: meta section plus body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub meta: MetaDef,
    pub body: PacketBody,
}

fn enc<T>(result: std::result::Result<T, rmp::encode::ValueWriteError>) -> Result<T> {
    result.map_err(|e| SwimError::Io(format!("packet encode failed: {e}")))
}

fn write_addr(buf: &mut Vec<u8>, key: u64, port_key: u64, addr: &SocketAddrV4) -> Result<()> {
    enc(rmp::encode::write_uint(buf, key))?;
    enc(rmp::encode::write_uint(buf, u64::from(u32::from(*addr.ip()))))?;
    enc(rmp::encode::write_uint(buf, port_key))?;
    enc(rmp::encode::write_uint(buf, u64::from(addr.port())))?;
    Ok(())
}

impl Packet {
    /// Encode the packet to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(256);

        // Meta section.
        let meta_len = if self.meta.route.is_some() { 4 } else { 3 };
        enc(rmp::encode::write_map_len(&mut buf, meta_len))?;
        enc(rmp::encode::write_uint(&mut buf, META_VERSION))?;
        enc(rmp::encode::write_uint(&mut buf, u64::from(self.meta.version)))?;
        write_addr(&mut buf, META_SRC_ADDRESS, META_SRC_PORT, &self.meta.src)?;
        if let Some(route) = &self.meta.route {
            enc(rmp::encode::write_uint(&mut buf, META_ROUTING))?;
            enc(rmp::encode::write_map_len(&mut buf, 4))?;
            write_addr(&mut buf, ROUTE_SRC_ADDRESS, ROUTE_SRC_PORT, &route.src)?;
            write_addr(&mut buf, ROUTE_DST_ADDRESS, ROUTE_DST_PORT, &route.dst)?;
        }

        // Body section.
        let body = &self.body;
        let mut body_len = 1u32;
        body_len += u32::from(body.failure_detection.is_some());
        body_len += u32::from(!body.dissemination.is_empty());
        body_len += u32::from(!body.anti_entropy.is_empty());
        body_len += u32::from(body.quit.is_some());
        enc(rmp::encode::write_map_len(&mut buf, body_len))?;

        enc(rmp::encode::write_uint(&mut buf, BODY_SRC_UUID))?;
        enc(rmp::encode::write_bin(&mut buf, body.src_uuid.as_bytes()))?;

        if !body.anti_entropy.is_empty() {
            enc(rmp::encode::write_uint(&mut buf, BODY_ANTI_ENTROPY))?;
            enc(rmp::encode::write_array_len(
                &mut buf,
                body.anti_entropy.len() as u32,
            ))?;
            for record in &body.anti_entropy {
                encode_member_record(&mut buf, record)?;
            }
        }

        if let Some(fd) = &body.failure_detection {
            enc(rmp::encode::write_uint(&mut buf, BODY_FAILURE_DETECTION))?;
            enc(rmp::encode::write_map_len(&mut buf, 2))?;
            enc(rmp::encode::write_uint(&mut buf, FD_MSG_TYPE))?;
            enc(rmp::encode::write_uint(&mut buf, fd.msg_type as u64))?;
            enc(rmp::encode::write_uint(&mut buf, FD_INCARNATION))?;
            enc(rmp::encode::write_uint(&mut buf, fd.incarnation))?;
        }

        if !body.dissemination.is_empty() {
            enc(rmp::encode::write_uint(&mut buf, BODY_DISSEMINATION))?;
            enc(rmp::encode::write_array_len(
                &mut buf,
                body.dissemination.len() as u32,
            ))?;
            for record in &body.dissemination {
                encode_member_record(&mut buf, record)?;
            }
        }

        if let Some(incarnation) = body.quit {
            enc(rmp::encode::write_uint(&mut buf, BODY_QUIT))?;
            enc(rmp::encode::write_map_len(&mut buf, 1))?;
            enc(rmp::encode::write_uint(&mut buf, QUIT_INCARNATION))?;
            enc(rmp::encode::write_uint(&mut buf, incarnation))?;
        }

        Ok(buf)
    }

    /// Decode a packet from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SwimError::ProtocolViolation`] on any malformed or
    /// missing field.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut rd = data;
        let meta_value = rmpv::decode::read_value(&mut rd)
            .map_err(|e| violation("meta", &format!("not a MessagePack value: {e}")))?;
        let body_value = rmpv::decode::read_value(&mut rd)
            .map_err(|e| violation("body", &format!("not a MessagePack value: {e}")))?;

        let meta = decode_meta(&meta_value)?;
        let body = decode_body(&body_value)?;
        Ok(Self { meta, body })
    }
}

fn encode_member_record(buf: &mut Vec<u8>, record: &MemberRecord) -> Result<()> {
    let mut len = 5u32;
    len += u32::from(record.old_uuid.is_some());
    len += u32::from(record.payload.is_some());
    enc(rmp::encode::write_map_len(buf, len))?;
    enc(rmp::encode::write_uint(buf, MEMBER_STATUS))?;
    enc(rmp::encode::write_uint(buf, record.status.as_wire()))?;
    write_addr(buf, MEMBER_ADDRESS, MEMBER_PORT, &record.addr)?;
    enc(rmp::encode::write_uint(buf, MEMBER_UUID))?;
    enc(rmp::encode::write_bin(buf, record.uuid.as_bytes()))?;
    enc(rmp::encode::write_uint(buf, MEMBER_INCARNATION))?;
    enc(rmp::encode::write_uint(buf, record.incarnation))?;
    if let Some(old_uuid) = &record.old_uuid {
        enc(rmp::encode::write_uint(buf, MEMBER_OLD_UUID))?;
        enc(rmp::encode::write_bin(buf, old_uuid.as_bytes()))?;
    }
    if let Some(payload) = &record.payload {
        enc(rmp::encode::write_uint(buf, MEMBER_PAYLOAD))?;
        enc(rmp::encode::write_bin(buf, payload))?;
    }
    Ok(())
}

fn violation(prefix: &str, what: &str) -> SwimError {
    SwimError::ProtocolViolation(format!("invalid SWIM {prefix}: {what}"))
}

fn map_entries<'a>(value: &'a Value, prefix: &str) -> Result<&'a [(Value, Value)]> {
    match value {
        Value::Map(entries) => Ok(entries),
        _ => Err(violation(prefix, "expected a map")),
    }
}

fn as_uint(value: &Value, prefix: &str, name: &str) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| violation(prefix, &format!("{name} must be an unsigned int")))
}

fn as_uuid(value: &Value, prefix: &str, name: &str) -> Result<Uuid> {
    match value {
        Value::Binary(bytes) => Uuid::from_slice(bytes)
            .map_err(|_| violation(prefix, &format!("{name} must be a 16-byte blob"))),
        _ => Err(violation(prefix, &format!("{name} must be a 16-byte blob"))),
    }
}

/// Assemble an address from separately decoded u32/u16 halves.
fn addr_from(
    addr: Option<u64>,
    port: Option<u64>,
    prefix: &str,
) -> Result<SocketAddrV4> {
    let addr = addr.ok_or_else(|| violation(prefix, "address is missing"))?;
    let port = port.ok_or_else(|| violation(prefix, "port is missing"))?;
    let addr = u32::try_from(addr).map_err(|_| violation(prefix, "address out of range"))?;
    let port = u16::try_from(port).map_err(|_| violation(prefix, "port out of range"))?;
    Ok(SocketAddrV4::new(Ipv4Addr::from(addr), port))
}

fn decode_meta(value: &Value) -> Result<MetaDef> {
    let prefix = "meta";
    let mut version = None;
    let mut addr = None;
    let mut port = None;
    let mut route = None;

    for (key, value) in map_entries(value, prefix)? {
        let Some(key) = key.as_u64() else {
            return Err(violation(prefix, "keys must be unsigned ints"));
        };
        match key {
            META_VERSION => version = Some(as_uint(value, prefix, "version")?),
            META_SRC_ADDRESS => addr = Some(as_uint(value, prefix, "address")?),
            META_SRC_PORT => port = Some(as_uint(value, prefix, "port")?),
            META_ROUTING => route = Some(decode_route(value)?),
            _ => {}
        }
    }

    let version = version.ok_or_else(|| violation(prefix, "version is missing"))?;
    let version =
        u32::try_from(version).map_err(|_| violation(prefix, "version out of range"))?;
    Ok(MetaDef {
        version,
        src: addr_from(addr, port, prefix)?,
        route,
    })
}

fn decode_route(value: &Value) -> Result<RouteDef> {
    let prefix = "routing";
    let mut src_addr = None;
    let mut src_port = None;
    let mut dst_addr = None;
    let mut dst_port = None;

    for (key, value) in map_entries(value, prefix)? {
        let Some(key) = key.as_u64() else {
            return Err(violation(prefix, "keys must be unsigned ints"));
        };
        match key {
            ROUTE_SRC_ADDRESS => src_addr = Some(as_uint(value, prefix, "src address")?),
            ROUTE_SRC_PORT => src_port = Some(as_uint(value, prefix, "src port")?),
            ROUTE_DST_ADDRESS => dst_addr = Some(as_uint(value, prefix, "dst address")?),
            ROUTE_DST_PORT => dst_port = Some(as_uint(value, prefix, "dst port")?),
            _ => {}
        }
    }

    Ok(RouteDef {
        src: addr_from(src_addr, src_port, prefix)?,
        dst: addr_from(dst_addr, dst_port, prefix)?,
    })
}

fn decode_body(value: &Value) -> Result<PacketBody> {
    let prefix = "body";
    let mut src_uuid = None;
    let mut failure_detection = None;
    let mut dissemination = Vec::new();
    let mut anti_entropy = Vec::new();
    let mut quit = None;

    for (key, value) in map_entries(value, prefix)? {
        let Some(key) = key.as_u64() else {
            return Err(violation(prefix, "keys must be unsigned ints"));
        };
        match key {
            BODY_SRC_UUID => src_uuid = Some(as_uuid(value, prefix, "src uuid")?),
            BODY_ANTI_ENTROPY => {
                anti_entropy = decode_member_records(value, "anti-entropy record")?;
            }
            BODY_FAILURE_DETECTION => {
                failure_detection = Some(decode_failure_detection(value)?);
            }
            BODY_DISSEMINATION => {
                dissemination = decode_member_records(value, "dissemination record")?;
            }
            BODY_QUIT => quit = Some(decode_quit(value)?),
            _ => {}
        }
    }

    let src_uuid = src_uuid.ok_or_else(|| violation(prefix, "src uuid is missing"))?;
    Ok(PacketBody {
        src_uuid,
        failure_detection,
        dissemination,
        anti_entropy,
        quit,
    })
}

fn decode_failure_detection(value: &Value) -> Result<FailureDetectionDef> {
    let prefix = "failure detection";
    let mut msg_type = None;
    let mut incarnation = None;

    for (key, value) in map_entries(value, prefix)? {
        let Some(key) = key.as_u64() else {
            return Err(violation(prefix, "keys must be unsigned ints"));
        };
        match key {
            FD_MSG_TYPE => msg_type = Some(as_uint(value, prefix, "msg type")?),
            FD_INCARNATION => incarnation = Some(as_uint(value, prefix, "incarnation")?),
            _ => {}
        }
    }

    let msg_type = match msg_type {
        Some(0) => FdMsgType::Ping,
        Some(1) => FdMsgType::Ack,
        Some(other) => return Err(violation(prefix, &format!("unknown msg type {other}"))),
        None => return Err(violation(prefix, "msg type is missing")),
    };
    let incarnation =
        incarnation.ok_or_else(|| violation(prefix, "incarnation is missing"))?;
    Ok(FailureDetectionDef {
        msg_type,
        incarnation,
    })
}

fn decode_quit(value: &Value) -> Result<u64> {
    let prefix = "quit";
    for (key, value) in map_entries(value, prefix)? {
        if key.as_u64() == Some(QUIT_INCARNATION) {
            return as_uint(value, prefix, "incarnation");
        }
    }
    Err(violation(prefix, "incarnation is missing"))
}

fn decode_member_records(value: &Value, prefix: &str) -> Result<Vec<MemberRecord>> {
    let Value::Array(items) = value else {
        return Err(violation(prefix, "expected an array"));
    };
    items
        .iter()
        .map(|item| decode_member_record(item, prefix))
        .collect()
}

fn decode_member_record(value: &Value, prefix: &str) -> Result<MemberRecord> {
    let mut status = None;
    let mut addr = None;
    let mut port = None;
    let mut uuid = None;
    let mut incarnation = None;
    let mut old_uuid = None;
    let mut payload = None;

    for (key, value) in map_entries(value, prefix)? {
        let Some(key) = key.as_u64() else {
            return Err(violation(prefix, "keys must be unsigned ints"));
        };
        match key {
            MEMBER_STATUS => status = Some(as_uint(value, prefix, "status")?),
            MEMBER_ADDRESS => addr = Some(as_uint(value, prefix, "address")?),
            MEMBER_PORT => port = Some(as_uint(value, prefix, "port")?),
            MEMBER_UUID => uuid = Some(as_uuid(value, prefix, "uuid")?),
            MEMBER_INCARNATION => incarnation = Some(as_uint(value, prefix, "incarnation")?),
            MEMBER_OLD_UUID => old_uuid = Some(as_uuid(value, prefix, "old uuid")?),
            MEMBER_PAYLOAD => match value {
                Value::Binary(bytes) => payload = Some(bytes.clone()),
                _ => return Err(violation(prefix, "payload must be a blob")),
            },
            _ => {}
        }
    }

    let status_code = status.ok_or_else(|| violation(prefix, "status is missing"))?;
    let status = MemberStatus::from_wire(status_code)
        .ok_or_else(|| violation(prefix, &format!("unknown status {status_code}")))?;
    let uuid = uuid.ok_or_else(|| violation(prefix, "uuid is missing"))?;
    let incarnation =
        incarnation.ok_or_else(|| violation(prefix, "incarnation is missing"))?;
    Ok(MemberRecord {
        status,
        addr: addr_from(addr, port, prefix)?,
        uuid,
        incarnation,
        old_uuid,
        payload,
    })
}
