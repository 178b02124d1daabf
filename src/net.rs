//! Datagram transport: a UDP socket moving whole request records.
//!
//! The socket is bound once to the wildcard interface and kept for the
//! node's lifetime. Sends and receives operate on complete [`Request`]
//! records; datagrams of the wrong size or with an undecodable payload are
//! dropped here so the receive loop only ever sees valid records. Loss and
//! reordering are tolerated by the pending-request table upstream, not by
//! this layer.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::core::Endpoint;
use crate::protocol::{Request, WIRE_SIZE};

/// The node's UDP endpoint. Safe for concurrent sends from several tasks;
/// each datagram goes out atomically.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to the wildcard interface on `port` (0 lets the OS choose).
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("binding udp port {port}"))?;
        Ok(Self { socket })
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> Result<Endpoint> {
        match self.socket.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(addr) => bail!("bound to unexpected ipv6 address {addr}"),
        }
    }

    /// Send one record to `to`.
    pub async fn send(&self, req: &Request, to: Endpoint) -> Result<()> {
        let buf = req.encode();
        let written = self
            .socket
            .send_to(&buf, SocketAddr::V4(to))
            .await
            .with_context(|| format!("sending datagram to {to}"))?;
        if written != WIRE_SIZE {
            bail!("short datagram write: {written} of {WIRE_SIZE} bytes");
        }
        Ok(())
    }

    /// Receive the next valid record, blocking until one arrives.
    ///
    /// Partial and malformed datagrams are discarded silently (with a
    /// debug log); only socket failures surface as errors.
    pub async fn recv(&self) -> Result<(Request, Endpoint)> {
        // One extra byte so oversized datagrams are distinguishable from
        // exact-size ones.
        let mut buf = [0u8; WIRE_SIZE + 1];
        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut buf)
                .await
                .context("receiving datagram")?;

            let SocketAddr::V4(from) = from else {
                debug!(%from, "discarding non-ipv4 datagram");
                continue;
            };

            match Request::decode(&buf[..len]) {
                Ok(req) => return Ok((req, from)),
                Err(err) => {
                    debug!(%from, len, "discarding malformed datagram: {err:#}");
                }
            }
        }
    }
}
