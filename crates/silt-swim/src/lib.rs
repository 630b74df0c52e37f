//! # silt-swim
//!
//! SWIM failure detection and membership gossip for Silt clusters.
//!
//! This crate implements:
//! - The SWIM failure detector with direct and indirect (proxied) pings
//! - Bounded-TTL dissemination of membership events
//! - Best-effort anti-entropy: full member records piggybacked on every
//!   packet, round-robin over the table
//! - The membership table with incarnation-ruled state transitions
//! - The MessagePack wire codec and the one-hop proxy route
//! - A tokio UDP driver around the synchronous protocol core
//!
//! The protocol core ([`engine::Swim`]) is a plain state machine: it takes
//! the current time as a parameter, never touches a socket, and returns
//! the datagrams to send. The [`node::UdpNode`] wraps a core with a tokio
//! UDP socket and timers; tests drive cores directly over a simulated
//! network with a virtual clock.
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Protocol period (heartbeat) | 1000 ms |
//! | Ack timeout | heartbeat / 3 |
//! | Unacked pings to suspect | 2 |
//! | Unacked pings to declare dead (suspect threshold) | 3 |
//! | Indirect ping fanout | 3 |
//! | GC delay after death | 1 round |
//! | Event TTL | ceil(log2(N + 1)) + 3 |
//! | Packet budget | 1200 bytes |
//! | Member payload limit | 1000 bytes |

pub mod engine;
pub mod member;
pub mod node;
pub mod proto;
pub mod table;

pub use engine::{Datagram, GcMode, Millis, Swim, SwimCfg, SwimConfig};
pub use member::{Member, MemberStatus};
pub use proto::MAX_PAYLOAD_SIZE;

/// Default protocol period in milliseconds.
pub const DEFAULT_HEARTBEAT_MS: u64 = 1000;

/// The ack timeout is this fraction of the protocol period.
pub const ACK_TIMEOUT_DIVISOR: u64 = 3;

/// Unacknowledged pings after which a member is suspected.
pub const UNACKED_TO_SUSPECT: u32 = 2;

/// Default number of unacknowledged pings after which a suspected
/// member is declared dead.
pub const DEFAULT_SUSPECT_THRESHOLD: u32 = 3;

/// Default number of relays asked to ping an unresponsive member.
pub const DEFAULT_INDIRECT_PING_FANOUT: usize = 3;

/// Rounds a dead member lingers before garbage collection.
pub const DEFAULT_GC_TTL_ROUNDS: u64 = 1;

/// Additive margin on top of the logarithmic event TTL.
pub const EVENT_TTL_MARGIN: u32 = 3;

/// Maximum size of a member payload in bytes. Leaves room in the packet
/// budget for the meta section and record headers.
pub const MAX_MEMBER_PAYLOAD: usize = 1000;

/// Error types for SWIM operations.
#[derive(Debug, thiserror::Error)]
pub enum SwimError {
    /// Invalid argument: malformed URI, duplicate member, oversized
    /// payload, an attempt to remove self.
    #[error("illegal params: {0}")]
    IllegalParams(String),

    /// Bad configuration: missing mandatory URI/UUID on the first
    /// configuration, bind failure, UUID collision.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A malformed or misrouted packet. The packet is dropped without
    /// touching the membership table.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Socket-level error from the UDP driver.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Convenience result type for SWIM operations.
pub type Result<T> = std::result::Result<T, SwimError>;

/// TTL of a freshly emitted dissemination event in a cluster of `n`
/// members: `ceil(log2(n + 1))` gossip steps plus a safety margin.
pub fn event_ttl(n: usize) -> u32 {
    let x = n as u64 + 1;
    let ceil_log2 = if x <= 1 {
        0
    } else {
        64 - (x - 1).leading_zeros() as u64
    };
    ceil_log2 as u32 + EVENT_TTL_MARGIN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ttl_grows_logarithmically() {
        assert_eq!(event_ttl(0), EVENT_TTL_MARGIN);
        assert_eq!(event_ttl(1), 1 + EVENT_TTL_MARGIN);
        assert_eq!(event_ttl(2), 2 + EVENT_TTL_MARGIN);
        assert_eq!(event_ttl(3), 2 + EVENT_TTL_MARGIN);
        assert_eq!(event_ttl(7), 3 + EVENT_TTL_MARGIN);
        assert_eq!(event_ttl(1000), 10 + EVENT_TTL_MARGIN);
    }

    #[test]
    fn test_error_display() {
        let err = SwimError::InvalidConfig("URI is mandatory".to_string());
        assert_eq!(err.to_string(), "invalid config: URI is mandatory");
    }
}
