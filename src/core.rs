//! Core routing state: identifiers, ring arithmetic, the finger table, and
//! the pending-request table.
//!
//! This module contains the transport-agnostic building blocks of the node:
//!
//! - **Identity & Hashing**: [`NodeRef`], [`Endpoint`], [`key_of`],
//!   [`endpoint_id`]
//! - **Ring Arithmetic**: the circular range predicates ([`range_open`] and
//!   friends) and [`msb_index`], the only correct way to test "does this key
//!   belong to that arc"
//! - **Routing**: [`RoutingState`] with the 32-entry finger table, the
//!   predecessor link, and [`find_successor`](RoutingState::find_successor)
//! - **Request Matching**: [`PendingTable`], mapping request ids to the
//!   continuations that resolve them (or time them out)
//! - **Scheduling**: [`Timer`], the fixed-interval tick accumulator driving
//!   the stabilizer
//! - **Settings**: [`Config`]

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tracing::debug;

use crate::protocol::Request;

// ============================================================================
// Type Aliases
// ============================================================================

/// A ring identifier: keys and node ids live in `[0, 2^32)` and all
/// arithmetic wraps modulo 2^32.
pub type Key = u32;

/// A node's network address: IPv4 plus UDP port. The wildcard address
/// `0.0.0.0:0` marks a nil [`NodeRef`].
pub type Endpoint = SocketAddrV4;

/// Number of finger-table slots. `finger[0]` is the successor; `finger[i]`
/// targets the node responsible for `self.id + 2^i`.
pub const FINGER_COUNT: usize = 32;

// ============================================================================
// Hashing Functions
// ============================================================================

/// Hash a name into its ring key: the leading 32 bits of the SHA-1 digest,
/// big-endian.
///
/// ```
/// use chord_dht::core::key_of;
///
/// // The same name always produces the same key
/// assert_eq!(key_of("hello"), key_of("hello"));
/// assert_ne!(key_of("hello"), key_of("world"));
/// ```
pub fn key_of(name: &str) -> Key {
    let digest = Sha1::digest(name.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Derive a node identifier from its public address, hashing the canonical
/// `A.B.C.D:P` rendering of the endpoint.
pub fn endpoint_id(addr: &Endpoint) -> Key {
    key_of(&addr.to_string())
}

// ============================================================================
// Node References
// ============================================================================

/// A ring member: its identifier and the UDP endpoint it answers on.
///
/// Unless the reference is nil, `id` is [`endpoint_id`] of `addr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRef {
    /// Ring identifier.
    pub id: Key,
    /// Public UDP address.
    pub addr: Endpoint,
}

impl NodeRef {
    /// Build a reference with an explicit identifier.
    pub fn new(id: Key, addr: Endpoint) -> Self {
        Self { id, addr }
    }

    /// Build a reference whose identifier is derived from the address.
    pub fn from_addr(addr: Endpoint) -> Self {
        Self {
            id: endpoint_id(&addr),
            addr,
        }
    }

    /// The nil reference: wildcard address, used to signal "no such node"
    /// (e.g. a lookup that timed out).
    pub fn nil() -> Self {
        Self {
            id: u32::MAX,
            addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }

    /// A reference is nil when its address is the wildcard `0.0.0.0:0`.
    pub fn is_nil(&self) -> bool {
        *self.addr.ip() == Ipv4Addr::UNSPECIFIED && self.addr.port() == 0
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:#010x}]", self.addr, self.id)
    }
}

// ============================================================================
// Ring Arithmetic
// ============================================================================

/// `n ∈ (a, b)` on the ring. The empty arc when `a == b`.
pub fn range_open(n: Key, a: Key, b: Key) -> bool {
    if a < b {
        n > a && n < b
    } else if a > b {
        n > a || n < b
    } else {
        false
    }
}

/// `n ∈ [a, b]` on the ring. The whole ring when `a == b`.
pub fn range_closed(n: Key, a: Key, b: Key) -> bool {
    if a < b {
        n >= a && n <= b
    } else if a > b {
        n >= a || n <= b
    } else {
        true
    }
}

/// `n ∈ (a, b]` on the ring. The whole ring when `a == b`.
pub fn range_open_closed(n: Key, a: Key, b: Key) -> bool {
    if a < b {
        n > a && n <= b
    } else if a > b {
        n > a || n <= b
    } else {
        true
    }
}

/// `n ∈ [a, b)` on the ring. The whole ring when `a == b`.
pub fn range_closed_open(n: Key, a: Key, b: Key) -> bool {
    if a < b {
        n >= a && n < b
    } else if a > b {
        n >= a || n < b
    } else {
        true
    }
}

/// Index of the most-significant set bit of `x`.
///
/// [`RoutingState::find_successor`] uses this to start its finger scan at
/// the longest finger that could precede the key.
///
/// # Panics
///
/// Debug-asserts that `x != 0`; the caller handles the zero-offset case.
pub fn msb_index(x: u32) -> u32 {
    debug_assert!(x != 0, "msb_index of zero offset");
    31 - x.leading_zeros()
}

// ============================================================================
// Routing State
// ============================================================================

/// Outcome of [`RoutingState::forget_peer`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForgetOutcome {
    /// The forgotten peer was our successor; the caller must start
    /// successor recovery.
    pub lost_successor: bool,
    /// The forgotten peer was our predecessor.
    pub lost_predecessor: bool,
}

/// Per-node routing view: the local reference, the predecessor link, and
/// the 32-slot finger table.
///
/// Every slot has a dedicated lock, so writers update one finger at a time
/// and readers take a cheap consistent snapshot of each slot independently.
/// Locks are never held across await points. A finger whose id equals the
/// local id means "unknown/self".
#[derive(Debug)]
pub struct RoutingState {
    /// This node's reference.
    local: NodeRef,
    /// The finger table; `fingers[0]` is the successor.
    fingers: [RwLock<NodeRef>; FINGER_COUNT],
    /// The node immediately preceding us on the ring (initially self).
    predecessor: RwLock<NodeRef>,
}

impl RoutingState {
    /// Create the initial view: predecessor and every finger point at the
    /// local node.
    pub fn new(local: NodeRef) -> Self {
        Self {
            local,
            fingers: std::array::from_fn(|_| RwLock::new(local)),
            predecessor: RwLock::new(local),
        }
    }

    /// The local node's reference.
    pub fn local(&self) -> NodeRef {
        self.local
    }

    /// The local node's identifier.
    pub fn id(&self) -> Key {
        self.local.id
    }

    /// Read finger `i`.
    ///
    /// # Panics
    ///
    /// Panics when `i >= 32`; a finger index out of range is a programming
    /// error.
    pub fn finger(&self, i: usize) -> NodeRef {
        *self.fingers[i].read().expect("finger lock poisoned")
    }

    /// Overwrite finger `i` atomically with respect to readers of the same
    /// slot.
    ///
    /// # Panics
    ///
    /// Panics when `i >= 32`.
    pub fn set_finger(&self, i: usize, node: NodeRef) {
        *self.fingers[i].write().expect("finger lock poisoned") = node;
    }

    /// The successor, a.k.a. finger 0.
    pub fn successor(&self) -> NodeRef {
        self.finger(0)
    }

    /// Replace the successor.
    pub fn set_successor(&self, node: NodeRef) {
        self.set_finger(0, node);
    }

    /// The current predecessor.
    pub fn predecessor(&self) -> NodeRef {
        *self.predecessor.read().expect("predecessor lock poisoned")
    }

    /// Replace the predecessor.
    pub fn set_predecessor(&self, node: NodeRef) {
        *self.predecessor.write().expect("predecessor lock poisoned") = node;
    }

    /// Closest preceding node we know for `key`.
    ///
    /// Scans `fingers[msb_index(key - id)] .. fingers[1]` for the first
    /// entry inside the open arc `(self.id, key)` and falls back to the
    /// successor when no finger qualifies. When `key` equals the local id
    /// the successor is returned directly.
    pub fn find_successor(&self, key: Key) -> NodeRef {
        let offset = key.wrapping_sub(self.local.id);
        if offset == 0 {
            return self.successor();
        }

        for i in (1..=msb_index(offset) as usize).rev() {
            let finger = self.finger(i);
            if range_open(finger.id, self.local.id, key) {
                return finger;
            }
        }

        self.successor()
    }

    /// Erase a peer from the local view: reset the predecessor and/or
    /// successor to self if they match, and clear every longer finger
    /// pointing at it. Reports what was lost so the caller can run
    /// successor recovery.
    pub fn forget_peer(&self, peer: &NodeRef) -> ForgetOutcome {
        let mut outcome = ForgetOutcome::default();

        if self.predecessor().id == peer.id {
            self.set_predecessor(self.local);
            outcome.lost_predecessor = true;
        }

        if self.successor().id == peer.id {
            self.set_successor(self.local);
            outcome.lost_successor = true;
        }

        for i in 1..FINGER_COUNT {
            if self.finger(i).id == peer.id {
                self.set_finger(i, self.local);
            }
        }

        outcome
    }

    /// Capture the whole view for diagnostics.
    pub fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            local: self.local,
            predecessor: self.predecessor(),
            fingers: (0..FINGER_COUNT).map(|i| self.finger(i)).collect(),
        }
    }
}

/// A point-in-time copy of a node's routing view, for diagnostics and
/// tests.
#[derive(Clone, Debug)]
pub struct RingSnapshot {
    /// The local node.
    pub local: NodeRef,
    /// Predecessor at capture time.
    pub predecessor: NodeRef,
    /// All 32 finger slots at capture time.
    pub fingers: Vec<NodeRef>,
}

impl RingSnapshot {
    /// True when some routing slot (predecessor, successor or any finger)
    /// still references `id`.
    pub fn references(&self, id: Key) -> bool {
        self.predecessor.id == id || self.fingers.iter().any(|f| f.id == id)
    }
}

impl fmt::Display for RingSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = |node: &NodeRef| {
            if node.id == self.local.id {
                "self".to_string()
            } else {
                node.to_string()
            }
        };

        writeln!(f, "# -----------------")?;
        writeln!(f, "# node {}", self.local)?;
        writeln!(f, "# ---- | ----------")?;
        writeln!(f, "# pred | {}", label(&self.predecessor))?;
        writeln!(f, "# succ | {}", label(&self.fingers[0]))?;
        for (i, finger) in self.fingers.iter().enumerate().skip(1) {
            writeln!(f, "#   {i:02} | {}", label(finger))?;
        }
        Ok(())
    }
}

// ============================================================================
// Pending Requests
// ============================================================================

/// Continuation invoked with the reply that completes a request.
pub type SuccessCallback = Box<dyn FnOnce(&Request) + Send>;

/// Continuation invoked when a request times out.
pub type ErrorCallback = Box<dyn FnOnce() + Send>;

/// A registered continuation waiting for its reply.
pub struct PendingEntry {
    /// Runs with the matching reply.
    pub on_success: Option<SuccessCallback>,
    /// Runs when `age` exceeds `ttl` without a reply.
    pub on_error: Option<ErrorCallback>,
    /// How long to wait before giving up.
    pub ttl: Duration,
    /// Time waited so far, advanced by [`PendingTable::sweep`].
    pub age: Duration,
}

/// Request-id to continuation map.
///
/// The table itself is not synchronized; the node wraps it in a single
/// mutex covering both map mutations and the timeout sweep. Callbacks run
/// while that mutex is held, so they must never touch the table again:
/// they resolve oneshot channels, update routing slots through shared
/// handles, or push follow-up actions onto the node's effect queue.
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<u16, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests still waiting for a reply.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Track a request that expects a reply within `ttl`.
    pub fn register(
        &mut self,
        id: u16,
        on_success: Option<SuccessCallback>,
        on_error: Option<ErrorCallback>,
        ttl: Duration,
    ) {
        self.entries.insert(
            id,
            PendingEntry {
                on_success,
                on_error,
                ttl,
                age: Duration::ZERO,
            },
        );
    }

    /// Resolve the entry registered under `id` with the reply `req`.
    ///
    /// Returns false when no entry matches; a reply with an unknown id is
    /// discarded silently. Each id completes at most once.
    pub fn complete(&mut self, id: u16, req: &Request) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                if let Some(on_success) = entry.on_success {
                    on_success(req);
                }
                true
            }
            None => false,
        }
    }

    /// Age every entry by `dt` and fire the error continuation of those
    /// whose TTL elapsed, removing them.
    pub fn sweep(&mut self, dt: Duration) {
        let mut expired = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            entry.age += dt;
            if entry.age > entry.ttl {
                expired.push(*id);
            }
        }

        for id in expired {
            if let Some(entry) = self.entries.remove(&id) {
                debug!(id, "no reply received for request");
                if let Some(on_error) = entry.on_error {
                    on_error();
                }
            }
        }
    }
}

// ============================================================================
// Timers
// ============================================================================

/// Fixed-interval tick accumulator.
///
/// Feed it measured delta times; it fires once per elapsed interval,
/// carrying the remainder over so the cadence stays steady even when the
/// driving loop jitters.
#[derive(Clone, Copy, Debug)]
pub struct Timer {
    interval: Duration,
    elapsed: Duration,
    delta: Duration,
}

impl Timer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            elapsed: Duration::ZERO,
            delta: Duration::ZERO,
        }
    }

    /// Total time this timer has been ticked.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Advance by `dt`; true when the interval elapsed (the overshoot is
    /// retained for the next round).
    pub fn tick(&mut self, dt: Duration) -> bool {
        self.elapsed += dt;
        self.delta += dt;
        if self.delta > self.interval {
            self.delta -= self.interval;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Node settings. [`Default`] gives the production cadence; tests shrink
/// the intervals to keep scenarios fast.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address advertised to peers (combined with the bound port).
    pub host: Ipv4Addr,
    /// Port for the UDP routing protocol and the TCP client service; 0
    /// lets the OS pick. Both protocols share one number because peers
    /// only ever learn a node's single advertised endpoint, and clients
    /// re-dispatch data operations to it.
    pub port: u16,
    /// Root directory of the blob store.
    pub store_dir: PathBuf,
    /// Cadence of `stabilize` + `fix_fingers`.
    pub update_interval: Duration,
    /// Cadence of `check_predecessor` + the pending-request sweep.
    pub check_interval: Duration,
    /// Patience for client-facing lookups.
    pub lookup_ttl: Duration,
    /// Patience for protocol housekeeping requests (notify, check, finger
    /// refresh).
    pub request_ttl: Duration,
    /// Bound on the synchronous wait inside `join`.
    pub join_timeout: Duration,
    /// Pin the node identifier instead of deriving it from the public
    /// address. Diagnostics and ring tests only; when set, the id/address
    /// invariant no longer holds.
    pub id: Option<Key>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST,
            port: 0,
            store_dir: PathBuf::from("chord-store"),
            update_interval: Duration::from_secs(1),
            check_interval: Duration::from_secs(2),
            lookup_ttl: Duration::from_secs(3),
            request_ttl: Duration::from_secs(5),
            join_timeout: Duration::from_secs(5),
            id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;

    fn node(id: Key) -> NodeRef {
        NodeRef::new(id, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000))
    }

    #[test]
    fn key_of_is_deterministic_and_big_endian() {
        assert_eq!(key_of("hello"), key_of("hello"));
        // Leading 32 bits of SHA-1("hello") = aaf4c61d...
        assert_eq!(key_of("hello"), 0xaaf4_c61d);
    }

    #[test]
    fn endpoint_id_hashes_the_printed_address() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4242);
        assert_eq!(endpoint_id(&addr), key_of("10.0.0.1:4242"));
    }

    #[test]
    fn nil_node_ref_is_detected_by_address() {
        assert!(NodeRef::nil().is_nil());
        assert!(!node(7).is_nil());
    }

    #[test]
    fn open_range_handles_wrap_and_degenerate_arcs() {
        assert!(range_open(5, 1, 10));
        assert!(!range_open(1, 1, 10));
        assert!(!range_open(10, 1, 10));
        // Wrapping arc
        assert!(range_open(0xFFFF_FFFF, 0xF000_0000, 0x10));
        assert!(range_open(0x05, 0xF000_0000, 0x10));
        assert!(!range_open(0x80_0000, 0xF000_0000, 0x10));
        // Empty arc: false for every n
        for n in [0u32, 1, 42, u32::MAX] {
            assert!(!range_open(n, 42, 42), "open arc (a, a) must be empty");
        }
    }

    #[test]
    fn closed_range_covers_whole_ring_when_degenerate() {
        for n in [0u32, 1, 42, u32::MAX] {
            assert!(range_closed(n, 42, 42));
            assert!(range_open_closed(n, 42, 42));
            assert!(range_closed_open(n, 42, 42));
        }
    }

    #[test]
    fn closed_open_range_includes_lower_bound() {
        assert!(range_closed_open(1, 1, 10));
        assert!(!range_closed_open(10, 1, 10));
        assert!(range_closed_open(0xF000_0000, 0xF000_0000, 0x10));
    }

    #[test]
    fn open_closed_partitions_the_ring() {
        // For n distinct from both bounds, exactly one of (a, b] and (b, a]
        // contains n.
        let cases = [(1u32, 10u32), (10, 1), (0xF000_0000, 0x10)];
        for (a, b) in cases {
            for n in [0u32, 5, 0x20, 0x8000_0000, 0xFFFF_FFFE] {
                if n == a || n == b {
                    continue;
                }
                assert_ne!(
                    range_open_closed(n, a, b),
                    range_open_closed(n, b, a),
                    "exactly one of (a, b] and (b, a] must contain {n:#x}"
                );
            }
        }
    }

    #[test]
    fn msb_index_finds_highest_set_bit() {
        assert_eq!(msb_index(1), 0);
        assert_eq!(msb_index(2), 1);
        assert_eq!(msb_index(0x80), 7);
        assert_eq!(msb_index(0x8000_0000), 31);
        assert_eq!(msb_index(u32::MAX), 31);
    }

    #[test]
    fn find_successor_on_lone_node_returns_successor() {
        let state = RoutingState::new(node(0x1000_0000));
        for key in [0x1u32, 0x1000_0000, 0xF000_0000] {
            assert_eq!(state.find_successor(key).id, 0x1000_0000);
        }
    }

    #[test]
    fn find_successor_prefers_closest_preceding_finger() {
        // Stabilized three-node ring 0x20 / 0x80 / 0xC0, viewed from 0x20.
        let state = RoutingState::new(node(0x20));
        state.set_successor(node(0x80));
        for i in 1..7 {
            // Fingers covering 0x22..=0x60 all resolve to 0x80.
            state.set_finger(i, node(0x80));
        }
        state.set_finger(7, node(0xC0)); // covers 0xA0

        // 0xB0 is past finger 7's node, so the scan settles on 0x80: the
        // closest node known to precede the key.
        assert_eq!(state.find_successor(0xB0).id, 0x80);
        // 0xF0 is preceded by 0xC0 itself.
        assert_eq!(state.find_successor(0xF0).id, 0xC0);
    }

    #[test]
    fn forget_peer_clears_every_slot() {
        let state = RoutingState::new(node(0x10));
        let peer = node(0x90);
        state.set_predecessor(peer);
        state.set_successor(peer);
        state.set_finger(5, peer);
        state.set_finger(31, peer);

        let outcome = state.forget_peer(&peer);
        assert!(outcome.lost_successor);
        assert!(outcome.lost_predecessor);
        assert!(
            !state.snapshot().references(peer.id),
            "no slot may keep a forgotten peer"
        );
    }

    #[test]
    fn pending_entry_completes_exactly_once() {
        let mut table = PendingTable::new();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter = fired.clone();
        table.register(
            7,
            Some(Box::new(move |_req| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
            None,
            Duration::from_secs(5),
        );

        let reply = Request::new(MessageKind::Reply);
        assert!(table.complete(7, &reply));
        assert!(!table.complete(7, &reply), "an id completes at most once");
        assert!(!table.complete(99, &reply), "unknown ids are discarded");
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn sweep_fires_error_continuations_after_ttl() {
        let mut table = PendingTable::new();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter = fired.clone();
        table.register(
            1,
            None,
            Some(Box::new(move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
            Duration::from_secs(2),
        );
        table.register(2, None, None, Duration::from_secs(10));

        table.sweep(Duration::from_secs(1));
        assert_eq!(table.len(), 2, "nothing expires before its ttl");

        table.sweep(Duration::from_secs(1));
        assert_eq!(
            fired.load(std::sync::atomic::Ordering::SeqCst),
            0,
            "an age equal to the ttl has not yet exceeded it"
        );
        assert_eq!(table.len(), 2);

        table.sweep(Duration::from_secs(1));
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1, "expired entries are removed");
    }

    #[test]
    fn timer_fires_once_per_interval_and_keeps_remainder() {
        let mut timer = Timer::new(Duration::from_secs(1));
        assert!(!timer.tick(Duration::from_millis(600)));
        assert!(timer.tick(Duration::from_millis(600)));
        // 200ms carried over
        assert!(!timer.tick(Duration::from_millis(700)));
        assert!(timer.tick(Duration::from_millis(200)));
        assert_eq!(timer.elapsed(), Duration::from_millis(2100));
    }
}
