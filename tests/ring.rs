#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{start_node, two_node_ring, TestPeer, RING_HIGH_ID, RING_LOW_ID};
use tokio::time::sleep;

use chord_dht::protocol::MessageKind;

#[tokio::test]
async fn single_node_owns_the_whole_ring() {
    let (node, handle) = start_node(0x1000_0000).await.expect("start node");

    for key in [0x0000_0001u32, 0x1000_0000, 0xF000_0000] {
        let owner = node.lookup(key).await;
        assert_eq!(
            owner.id, 0x1000_0000,
            "a lone node owns every key, including {key:#010x}"
        );
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn two_node_ring_resolves_lookups_across_the_wrap() {
    let ((low, low_handle), (high, high_handle)) = two_node_ring().await.expect("ring");

    // Ring converged: each node is the other's successor and predecessor.
    let low_view = low.snapshot();
    let high_view = high.snapshot();
    assert_eq!(low_view.fingers[0].id, RING_HIGH_ID, "low's successor");
    assert_eq!(low_view.predecessor.id, RING_HIGH_ID, "low's predecessor");
    assert_eq!(high_view.fingers[0].id, RING_LOW_ID, "high's successor");
    assert_eq!(high_view.predecessor.id, RING_LOW_ID, "high's predecessor");

    // Keys in (low, high] belong to the high node.
    assert_eq!(low.lookup(0x8000_0000).await.id, RING_HIGH_ID);
    assert_eq!(high.lookup(0x8000_0000).await.id, RING_HIGH_ID);

    // Keys in (high, low] wrap past the top of the ring to the low node.
    assert_eq!(low.lookup(0xFFFF_FFFF).await.id, RING_LOW_ID);
    assert_eq!(high.lookup(0xFFFF_FFFF).await.id, RING_LOW_ID);
    assert_eq!(low.lookup(0x0000_0005).await.id, RING_LOW_ID);
    assert_eq!(high.lookup(0x0000_0005).await.id, RING_LOW_ID);

    low_handle.shutdown().await;
    high_handle.shutdown().await;
}

#[tokio::test]
async fn lookup_requests_are_forwarded_and_answered_to_the_originator() {
    let ((low, low_handle), (_high, high_handle)) = two_node_ring().await.expect("ring");

    // An outside observer asks the low node about a key the high side must
    // route back: the reply has to come to the originator, not the hop.
    let peer = TestPeer::bind(0x4242_4242).await.expect("peer");
    let mut req = peer.forge(MessageKind::Lookup, 77, low.local().addr);
    req.set_dst(chord_dht::protocol::Payload::Key(0x0000_0005));
    peer.send(&req).await.expect("send");

    let reply = peer.recv(Duration::from_secs(2)).await.expect("reply");
    assert_eq!(reply.kind, MessageKind::Reply);
    assert_eq!(reply.id, 77, "reply matches the originating request id");
    assert_eq!(reply.dst_node().id, RING_LOW_ID, "owner of a wrapped key");
    assert_eq!(reply.hop_count, 0, "replies start a fresh route");

    low_handle.shutdown().await;
    high_handle.shutdown().await;
}

#[tokio::test]
async fn three_node_ring_routes_keys_to_their_owner() {
    let (a, a_handle) = start_node(0x2000_0000).await.expect("node a");

    let b = chord_dht::node::Node::bind(common::fast_config(0x8000_0000))
        .await
        .expect("bind b");
    b.join(a.local().addr).await.expect("join b");
    let b_handle = b.spawn();

    let c = chord_dht::node::Node::bind(common::fast_config(0xC000_0000))
        .await
        .expect("bind c");
    c.join(a.local().addr).await.expect("join c");
    let c_handle = c.spawn();

    // Let successor/predecessor links and the short fingers settle.
    tokio::time::sleep(Duration::from_millis(3000)).await;

    for node in [&a, &b, &c] {
        // (a, b] belongs to b, (b, c] to c, and the wrapping arc (c, a]
        // back to a, no matter where the lookup starts.
        assert_eq!(node.lookup(0x5000_0000).await.id, 0x8000_0000);
        assert_eq!(node.lookup(0xB000_0000).await.id, 0xC000_0000);
        assert_eq!(node.lookup(0xF000_0000).await.id, 0x2000_0000);
        assert_eq!(node.lookup(0x0000_0001).await.id, 0x2000_0000);
    }

    a_handle.shutdown().await;
    b_handle.shutdown().await;
    c_handle.shutdown().await;
}

#[tokio::test]
async fn ping_is_diagnostic_only() {
    let (node, handle) = start_node(0x1000_0000).await.expect("start node");
    let peer = TestPeer::bind(0x0555_0000).await.expect("peer");

    let ping = peer.forge(MessageKind::Ping, 9, node.local().addr);
    peer.send(&ping).await.expect("send");
    assert!(
        peer.silent_for(Duration::from_millis(300)).await,
        "pings are logged, never answered"
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn leave_request_purges_the_sender() {
    let (node, handle) = start_node(0x1000).await.expect("start node");
    let peer = TestPeer::bind(0x0800).await.expect("peer");

    // Become the node's predecessor, then announce departure.
    let notify = peer.forge(MessageKind::Notify, 1, node.local().addr);
    peer.send(&notify).await.expect("send");
    peer.recv(Duration::from_secs(1)).await.expect("notify reply");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(node.snapshot().predecessor.id, 0x0800);

    let leave = peer.forge(MessageKind::Leave, 2, node.local().addr);
    peer.send(&leave).await.expect("send");
    sleep(Duration::from_millis(200)).await;

    let view = node.snapshot();
    assert!(
        !view.references(0x0800),
        "a leaver must vanish from the ring view: {view}"
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn graceful_leave_purges_the_leaver_from_the_ring_view() {
    let ((low, low_handle), (high, high_handle)) = two_node_ring().await.expect("ring");

    // Stop the leaver's background tasks first, as process exit would,
    // then announce the departure.
    high_handle.shutdown().await;
    high.leave().await;
    sleep(Duration::from_millis(400)).await;

    let view = low.snapshot();
    assert!(
        !view.references(RING_HIGH_ID),
        "no slot may keep the departed node: {view}"
    );
    assert_eq!(view.predecessor.id, RING_LOW_ID, "predecessor reset to self");
    assert_eq!(view.fingers[0].id, RING_LOW_ID, "successor reset to self");

    low_handle.shutdown().await;
}

#[tokio::test]
async fn silent_peer_failure_is_detected_and_purged() {
    let ((low, low_handle), (_high, high_handle)) = two_node_ring().await.expect("ring");

    // Kill the high node without a LEAVE: its socket stays open but nothing
    // answers anymore.
    high_handle.shutdown().await;

    // An in-flight lookup routed toward the dead node resolves to nil.
    let owner = low.lookup(0x0000_0005).await;
    assert!(owner.is_nil(), "lookup toward a dead peer resolves to nil");

    // Within a couple of check cycles the dead peer vanishes from every
    // routing slot.
    sleep(Duration::from_millis(2500)).await;
    let view = low.snapshot();
    assert!(
        !view.references(RING_HIGH_ID),
        "failure detection must purge the dead peer: {view}"
    );

    low_handle.shutdown().await;
}

#[tokio::test]
async fn notify_replies_predecessor_and_adopts_closer_claimants() {
    let (node, handle) = start_node(0x1000).await.expect("start node");

    // First claimant: adopted, since the predecessor is still self.
    let first = TestPeer::bind(0x0800).await.expect("peer");
    let req = first.forge(MessageKind::Notify, 1, node.local().addr);
    first.send(&req).await.expect("send");
    let reply = first.recv(Duration::from_secs(1)).await.expect("reply");
    assert_eq!(reply.kind, MessageKind::Reply);
    assert_eq!(
        reply.dst_node().id,
        0x1000,
        "notify reply carries the previous predecessor (self at first)"
    );
    sleep(Duration::from_millis(100)).await;
    assert_eq!(node.snapshot().predecessor.id, 0x0800);

    // A claimant between the current predecessor and us: adopted.
    let closer = TestPeer::bind(0x0900).await.expect("peer");
    let req = closer.forge(MessageKind::Notify, 2, node.local().addr);
    closer.send(&req).await.expect("send");
    let reply = closer.recv(Duration::from_secs(1)).await.expect("reply");
    assert_eq!(reply.dst_node().id, 0x0800, "reply names the predecessor it is replacing");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(node.snapshot().predecessor.id, 0x0900);

    // A claimant behind the current predecessor: ignored.
    let farther = TestPeer::bind(0x0700).await.expect("peer");
    let req = farther.forge(MessageKind::Notify, 3, node.local().addr);
    farther.send(&req).await.expect("send");
    farther.recv(Duration::from_secs(1)).await.expect("reply");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        node.snapshot().predecessor.id,
        0x0900,
        "a farther claimant must not displace a closer predecessor"
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn exhausted_ttl_drops_a_request_before_dispatch() {
    let (node, handle) = start_node(0x1000_0000).await.expect("start node");
    let peer = TestPeer::bind(0x0777_0000).await.expect("peer");

    // ttl 1 is consumed by the first hop: the receiver drops the request
    // without answering.
    let mut req = peer.forge(MessageKind::Lookup, 5, node.local().addr);
    req.set_dst(chord_dht::protocol::Payload::Key(0x1));
    req.ttl = 1;
    peer.send(&req).await.expect("send");
    assert!(
        peer.silent_for(Duration::from_millis(400)).await,
        "a ttl-1 request must be dropped on its first hop"
    );

    // The same request with an unlimited ttl is answered.
    let mut req = peer.forge(MessageKind::Lookup, 6, node.local().addr);
    req.set_dst(chord_dht::protocol::Payload::Key(0x1));
    peer.send(&req).await.expect("send");
    let reply = peer.recv(Duration::from_secs(1)).await.expect("reply");
    assert_eq!(reply.id, 6);
    assert_eq!(reply.dst_node().id, 0x1000_0000);

    handle.shutdown().await;
}

#[tokio::test]
async fn stray_replies_are_discarded_without_side_effects() {
    let (node, handle) = start_node(0x1000_0000).await.expect("start node");
    let peer = TestPeer::bind(0x0666_0000).await.expect("peer");

    // A reply nobody asked for: silently discarded.
    let stray = peer.forge(MessageKind::Reply, 0x4242, node.local().addr);
    peer.send(&stray).await.expect("send");

    // The node keeps serving: a liveness check still gets its reply.
    let check = peer.forge(MessageKind::Check, 7, node.local().addr);
    peer.send(&check).await.expect("send");
    let reply = peer.recv(Duration::from_secs(1)).await.expect("reply");
    assert_eq!(reply.kind, MessageKind::Reply);
    assert_eq!(reply.id, 7);

    handle.shutdown().await;
}
