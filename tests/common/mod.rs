#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use chord_dht::core::{Config, Endpoint, NodeRef};
use chord_dht::node::{Node, NodeHandle};
use chord_dht::protocol::{MessageKind, Payload, Request, WIRE_SIZE};

/// Node settings with a shrunk cadence so ring scenarios finish quickly.
pub fn fast_config(id: u32) -> Config {
    Config {
        id: Some(id),
        update_interval: Duration::from_millis(100),
        check_interval: Duration::from_millis(200),
        lookup_ttl: Duration::from_millis(500),
        request_ttl: Duration::from_millis(400),
        join_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

/// Bind a node with a pinned identifier and start its background tasks.
pub async fn start_node(id: u32) -> Result<(Arc<Node>, NodeHandle)> {
    let node = Node::bind(fast_config(id)).await?;
    let handle = node.spawn();
    Ok((node, handle))
}

/// A stabilized two-node ring: ids `0x10` and `0xFFFF_FFF0`, so keys near
/// the top of the ring exercise the wrap-around arcs.
pub const RING_LOW_ID: u32 = 0x10;
pub const RING_HIGH_ID: u32 = 0xFFFF_FFF0;

pub async fn two_node_ring() -> Result<((Arc<Node>, NodeHandle), (Arc<Node>, NodeHandle))> {
    let (low, low_handle) = start_node(RING_LOW_ID).await?;

    let high = Node::bind(fast_config(RING_HIGH_ID)).await?;
    high.join(low.local().addr).await?;
    let high_handle = high.spawn();

    // A handful of stabilize rounds settles successor and predecessor on
    // both sides and populates the short fingers.
    sleep(Duration::from_millis(1500)).await;
    Ok(((low, low_handle), (high, high_handle)))
}

/// A bare UDP endpoint playing one peer's part in protocol exchanges.
pub struct TestPeer {
    socket: UdpSocket,
    pub local: NodeRef,
}

impl TestPeer {
    pub async fn bind(id: u32) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr.port(),
            SocketAddr::V6(addr) => return Err(anyhow!("unexpected ipv6 bind {addr}")),
        };
        Ok(Self {
            local: NodeRef::new(id, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
            socket,
        })
    }

    /// Forge a request originating from this peer.
    pub fn forge(&self, kind: MessageKind, id: u16, recipient: Endpoint) -> Request {
        let mut req = Request::new(kind);
        req.id = id;
        req.sender = self.local.addr;
        req.recipient = recipient;
        req.set_src(Payload::Node(self.local));
        req
    }

    pub async fn send(&self, req: &Request) -> Result<()> {
        self.socket
            .send_to(&req.encode(), SocketAddr::V4(req.recipient))
            .await?;
        Ok(())
    }

    /// The next decodable record, or an error after `patience`.
    pub async fn recv(&self, patience: Duration) -> Result<Request> {
        let mut buf = [0u8; WIRE_SIZE];
        let next = async {
            loop {
                let (len, _) = self.socket.recv_from(&mut buf).await?;
                if let Ok(req) = Request::decode(&buf[..len]) {
                    return Ok::<_, anyhow::Error>(req);
                }
            }
        };
        timeout(patience, next)
            .await
            .map_err(|_| anyhow!("no datagram within {patience:?}"))?
    }

    /// True when nothing arrives within `patience`.
    pub async fn silent_for(&self, patience: Duration) -> bool {
        self.recv(patience).await.is_err()
    }
}
