//! TCP client service: lookup, upload, and retrieve on behalf of external
//! clients.
//!
//! The acceptor binds the node's own port number (on TCP, next to the UDP
//! routing socket) and spawns one worker per connection. Peers only ever
//! learn a node's single advertised endpoint, so the service has to answer
//! on that same number for client-side re-dispatch to find it. A worker
//! first writes the node's 32-bit identifier as a framing preamble, then
//! serves command codes until the client closes:
//!
//! | code | operation |
//! |------|-----------|
//! | 0 | lookup a `u32` key, answer with the responsible [`NodeRef`](crate::core::NodeRef) |
//! | 1 | upload: name + payload into the blob store |
//! | 2 | retrieve: name, answer with the payload (zero-length if absent) |
//! | 0xFFFFFFFF | close the session |
//!
//! The service has no forwarding responsibility for data: a client whose
//! key lands on another node looks the owner up here, then re-dispatches
//! the data operation to that owner itself.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::Endpoint;
use crate::framing;
use crate::node::Node;
use crate::store::FsStore;

/// Look up the owner of a key.
pub const CMD_LOOKUP: u32 = 0;
/// Store a named blob on this node.
pub const CMD_UPLOAD: u32 = 1;
/// Fetch a named blob from this node.
pub const CMD_RETRIEVE: u32 = 2;
/// End the session.
pub const CMD_CLOSE: u32 = 0xFFFF_FFFF;

/// Bind the service listener on the node's port number and start
/// accepting clients.
///
/// Returns the bound address and the acceptor task; workers are detached
/// and end when their client disconnects.
pub async fn serve(
    node: Arc<Node>,
    store: FsStore,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(Endpoint, JoinHandle<()>)> {
    let port = node.local().addr.port();
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .with_context(|| format!("binding client service on tcp port {port}"))?;
    let local = match listener.local_addr()? {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(addr) => bail!("client service bound to unexpected ipv6 address {addr}"),
    };

    info!(addr = %local, "client service listening");

    let task = tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.changed() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "client connected to service");
                    tokio::spawn(handle_client(node.clone(), store.clone(), stream));
                }
                Err(err) => warn!("accept failed: {err:#}"),
            }
        }
    });

    Ok((local, task))
}

async fn handle_client(node: Arc<Node>, store: FsStore, stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    if let Err(err) = serve_client(node, store, stream).await {
        debug!(peer = ?peer, "client session ended: {err:#}");
    }
}

/// Serve one client until it closes the session or the stream fails.
async fn serve_client(node: Arc<Node>, store: FsStore, stream: TcpStream) -> Result<()> {
    let mut stream = BufStream::new(stream);

    // Framing preamble: who the client is talking to.
    stream.write_u32_le(node.id()).await?;
    stream.flush().await?;

    loop {
        let command = match stream.read_u32_le().await {
            Ok(command) => command,
            // A client hanging up between commands is a normal end.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        match command {
            CMD_LOOKUP => {
                let key = stream.read_u32_le().await?;
                let target = node.lookup(key).await;
                framing::write_node_ref(&mut stream, &target).await?;
                stream.flush().await?;
                info!(key, target = %target, "served lookup");
            }
            CMD_UPLOAD => {
                let name = framing::read_string(&mut stream).await?;
                let payload = framing::read_frame(&mut stream).await?;
                store.put(&name, &payload).await?;
                info!(name = %name, len = payload.len(), "served upload");
            }
            CMD_RETRIEVE => {
                let name = framing::read_string(&mut stream).await?;
                // A missing blob answers with a zero-length payload.
                let payload = store.get(&name).await?.unwrap_or_default();
                framing::write_frame(&mut stream, &payload).await?;
                stream.flush().await?;
                info!(name = %name, len = payload.len(), "served retrieve");
            }
            CMD_CLOSE => return Ok(()),
            other => warn!(command = other, "unknown client command"),
        }
    }
}
