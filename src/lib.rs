//! # chord-dht
//!
//! This crate implements a node of a Chord distributed hash table (DHT).
//! Nodes organize themselves in a logical identifier ring of width 2^32;
//! each node owns the keys falling in the arc between its predecessor's
//! identifier (exclusive) and its own (inclusive), and lookups reach the
//! owner of any key in O(log N) hops through a per-node finger table.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: the transport-agnostic routing state, including the ring
//!   arithmetic, the finger table, and the pending-request table.
//! - [`protocol`]: the fixed 64-byte wire records exchanged between nodes
//!   over UDP.
//! - [`net`]: the datagram transport moving whole records.
//! - [`node`]: the [`Node`] state machine: request dispatch, the periodic
//!   stabilizer, and join/leave orchestration.
//! - [`framing`]: length-prefixed frames for the TCP client protocol.
//! - [`server`] / [`client`]: the TCP client service and its counterpart
//!   speaker, through which external programs look keys up and move blobs.
//! - [`store`]: the filesystem-backed blob store.
//!
//! ## Getting started
//!
//! The simplest way to embed a node is to bind it, join through a known
//! peer, and let the background tasks keep the ring stable:
//!
//! ```no_run
//! use chord_dht::core::Config;
//! use chord_dht::node::Node;
//!
//! # async fn launch(peer: chord_dht::core::Endpoint) -> anyhow::Result<()> {
//! let node = Node::bind(Config::default()).await?;
//! node.join(peer).await?;
//! let handle = node.spawn();
//! let owner = node.lookup(chord_dht::core::key_of("some-name")).await;
//! println!("owner: {owner}");
//! # handle.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces together with the TCP
//! client service and a small operator console.

pub mod client;
pub mod core;
pub mod framing;
pub mod net;
pub mod node;
pub mod protocol;
pub mod server;
pub mod store;

pub use self::core::{
    key_of, range_closed, range_closed_open, range_open, range_open_closed, Config, Endpoint, Key,
    NodeRef, RingSnapshot, RoutingState,
};
pub use self::net::UdpTransport;
pub use self::node::{Node, NodeHandle};
pub use self::protocol::{MessageKind, Payload, Request};
pub use self::store::FsStore;
pub use self::client::ServiceClient;
