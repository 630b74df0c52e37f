//! Tokio UDP driver around the protocol core.

use std::net::SocketAddrV4;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::{parse_uri, Datagram, Millis, Swim, SwimCfg};
use crate::proto::MAX_PAYLOAD_SIZE;
use crate::{Result, SwimError};

/// A SWIM node bound to a UDP socket.
///
/// Owns a [`Swim`] core plus the socket and the clock. The run loop
/// alternates between receiving datagrams and firing the core's timers;
/// the core itself never blocks, so the node suspends only inside the
/// socket primitives.
#[derive(Debug)]
pub struct UdpNode {
    swim: Swim,
    socket: UdpSocket,
    /// Zero point of the core's millisecond clock.
    epoch: Instant,
}

impl UdpNode {
    /// Bind a socket and configure a core behind it.
    ///
    /// The URI in `cfg` is mandatory here even though the core accepts
    /// a port of 0: the actually bound address (with the resolved
    /// ephemeral port) is what gets configured into the core.
    ///
    /// # Errors
    ///
    /// Returns [`SwimError::InvalidConfig`] when the bind fails, plus
    /// everything [`Swim::cfg`] can return.
    pub async fn bind(cfg: SwimCfg) -> Result<Self> {
        let uri = cfg.uri.as_deref().ok_or_else(|| {
            SwimError::InvalidConfig("URI is mandatory on the first configuration".to_string())
        })?;
        let requested = parse_uri(uri)?;
        let socket = UdpSocket::bind(requested)
            .await
            .map_err(|e| SwimError::InvalidConfig(format!("bind to {requested} failed: {e}")))?;
        let bound = match socket.local_addr() {
            Ok(std::net::SocketAddr::V4(addr)) => addr,
            Ok(addr) => {
                return Err(SwimError::InvalidConfig(format!(
                    "bound a non-IPv4 address {addr}"
                )))
            }
            Err(e) => return Err(SwimError::Io(format!("local_addr failed: {e}"))),
        };

        let mut swim = Swim::new();
        let cfg = SwimCfg {
            uri: Some(bound.to_string()),
            ..cfg
        };
        swim.cfg(&cfg, 0)?;
        info!(%bound, "SWIM node bound");
        Ok(Self {
            swim,
            socket,
            epoch: Instant::now(),
        })
    }

    /// The protocol core, for inspection and API calls.
    pub fn swim(&self) -> &Swim {
        &self.swim
    }

    /// The protocol core, mutably.
    pub fn swim_mut(&mut self) -> &mut Swim {
        &mut self.swim
    }

    /// The actually bound address.
    pub fn addr(&self) -> SocketAddrV4 {
        self.swim.addr()
    }

    /// Milliseconds since the node started; the core's clock.
    pub fn now(&self) -> Millis {
        self.epoch.elapsed().as_millis() as Millis
    }

    /// Send a batch of datagrams, best-effort.
    async fn send_all(&self, datagrams: Vec<Datagram>) {
        for dgram in datagrams {
            if let Err(e) = self.socket.send_to(&dgram.data, dgram.to).await {
                warn!(to = %dgram.to, error = %e, "datagram send failed");
            }
        }
    }

    /// Probe an address once; the ack will insert the remote member.
    pub async fn probe(&mut self, uri: &str) -> Result<()> {
        let now = self.now();
        let out = self.swim.probe_member(uri, now)?;
        self.send_all(out).await;
        Ok(())
    }

    /// Announce a voluntary quit to the cluster.
    pub async fn quit(&mut self) -> Result<()> {
        let now = self.now();
        let out = self.swim.quit(now)?;
        self.send_all(out).await;
        Ok(())
    }

    /// Drive the node until the future is dropped.
    pub async fn run(&mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_PAYLOAD_SIZE * 2];
        loop {
            let now = self.now();
            let out = self.swim.tick(now)?;
            self.send_all(out).await;

            let sleep_for = self
                .swim
                .next_deadline()
                .map(|deadline| Duration::from_millis(deadline.saturating_sub(self.now())))
                .unwrap_or(Duration::from_secs(3600));

            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received
                        .map_err(|e| SwimError::Io(format!("recv failed: {e}")))?;
                    let std::net::SocketAddr::V4(from) = from else {
                        continue;
                    };
                    let now = self.now();
                    match self.swim.handle_packet(from, &buf[..len], now) {
                        Ok(replies) => self.send_all(replies).await,
                        Err(e) => {
                            // Malformed packets are dropped, the node
                            // lives on.
                            debug!(%from, error = %e, "packet dropped");
                        }
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn cfg(port: u16, uuid_n: u128) -> SwimCfg {
        SwimCfg {
            uri: Some(format!("127.0.0.1:{port}")),
            uuid: Some(Uuid::from_u128(uuid_n)),
            ..SwimCfg::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let node = UdpNode::bind(cfg(0, 1)).await.expect("bind");
        assert_ne!(node.addr().port(), 0);
        assert!(node.swim().is_configured());
        assert_eq!(node.swim().self_uuid(), Uuid::from_u128(1));
    }

    #[tokio::test]
    async fn test_bind_occupied_port_fails() {
        let node = UdpNode::bind(cfg(0, 1)).await.expect("bind");
        let port = node.addr().port();
        let err = UdpNode::bind(cfg(port, 2)).await.expect_err("occupied");
        assert!(matches!(err, SwimError::InvalidConfig(_)));
        assert!(err.to_string().contains("bind"));
    }

    /// One bounded driver iteration: fire timers, drain the socket.
    async fn step(node: &mut UdpNode) {
        let now = node.now();
        let out = node.swim.tick(now).expect("tick");
        node.send_all(out).await;

        let mut buf = vec![0u8; MAX_PAYLOAD_SIZE * 2];
        while let Ok(received) =
            tokio::time::timeout(Duration::from_millis(5), node.socket.recv_from(&mut buf)).await
        {
            let (len, from) = received.expect("recv");
            let std::net::SocketAddr::V4(from) = from else {
                continue;
            };
            let now = node.now();
            if let Ok(replies) = node.swim.handle_packet(from, &buf[..len], now) {
                node.send_all(replies).await;
            }
        }
    }

    fn sees_alive(node: &UdpNode, uuid_n: u128) -> bool {
        node.swim()
            .member_by_uuid(&Uuid::from_u128(uuid_n))
            .map(|m| m.status() == crate::member::MemberStatus::Alive)
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_two_nodes_reach_fullmesh() {
        let mut a = UdpNode::bind(cfg(0, 1)).await.expect("bind a");
        let mut b = UdpNode::bind(cfg(0, 2)).await.expect("bind b");

        // Speed the protocol up for the test.
        let fast = SwimCfg {
            heartbeat: Some(50),
            ..SwimCfg::default()
        };
        a.swim_mut().cfg(&fast, 0).expect("cfg a");
        b.swim_mut().cfg(&fast, 0).expect("cfg b");

        let b_uri = b.addr().to_string();
        a.swim_mut()
            .add_member(&b_uri, Uuid::from_u128(2))
            .expect("add");

        let mut fullmesh = false;
        for _ in 0..400 {
            step(&mut a).await;
            step(&mut b).await;
            if sees_alive(&a, 2) && sees_alive(&b, 1) {
                fullmesh = true;
                break;
            }
        }
        assert!(fullmesh, "two UDP nodes did not reach fullmesh");
    }
}
