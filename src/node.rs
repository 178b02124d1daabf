//! The local node: request dispatch, the stabilizer, and ring membership.
//!
//! A [`Node`] owns the routing state, the UDP transport, and the
//! pending-request table. It is `Arc`-shared between a small fixed set of
//! tasks:
//!
//! - the **receiver** drives the receive loop (decode, hop, drop expired,
//!   dispatch) and is the only task mutating the ring view in response to
//!   peer traffic;
//! - the **updater** runs `stabilize`, `fix_fingers`, `check_predecessor`
//!   and the pending-request sweep on a steady cadence;
//! - the **effect worker** executes follow-up actions (peer checks, peer
//!   removal) queued by timeout continuations.
//!
//! Continuations stored in the pending table never capture the node
//! itself: they hold the shared routing state, oneshot senders, or the
//! effect queue, because they run on the receiver while other tasks may
//! hold node locks.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::core::{
    endpoint_id, range_open, range_open_closed, Config, Endpoint, ErrorCallback, Key, NodeRef,
    PendingTable, RingSnapshot, RoutingState, SuccessCallback, Timer,
};
use crate::net::UdpTransport;
use crate::protocol::{MessageKind, Payload, Request};

/// Follow-up action queued by a continuation for the effect worker.
enum Effect {
    /// Probe a peer's liveness; removal follows if it stays silent.
    CheckPeer(NodeRef),
    /// Erase a peer from the ring view and start successor recovery.
    RemovePeer(NodeRef),
}

/// A running Chord node.
pub struct Node {
    config: Config,
    routing: Arc<RoutingState>,
    transport: UdpTransport,
    pending: Mutex<PendingTable>,
    /// Per-sender monotonic request id, randomly seeded so ids from a
    /// restarted node don't collide with its previous incarnation.
    next_request_id: AtomicU16,
    /// Finger-refresh cursor, cycling 1..=31.
    next_finger: AtomicUsize,
    effects: mpsc::UnboundedSender<Effect>,
    effects_rx: StdMutex<Option<mpsc::UnboundedReceiver<Effect>>>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Bind the UDP transport and create the node's initial view (every
    /// routing slot pointing at self).
    ///
    /// The identifier is derived from the advertised public address unless
    /// `config.id` pins it.
    pub async fn bind(config: Config) -> Result<Arc<Self>> {
        let transport = UdpTransport::bind(config.port)
            .await
            .context("binding node transport")?;
        let port = transport.local_addr()?.port();

        let addr = Endpoint::new(config.host, port);
        let id = config.id.unwrap_or_else(|| endpoint_id(&addr));
        let local = NodeRef::new(id, addr);

        let (effects, effects_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        info!(node = %local, "created node");

        Ok(Arc::new(Self {
            config,
            routing: Arc::new(RoutingState::new(local)),
            transport,
            pending: Mutex::new(PendingTable::new()),
            next_request_id: AtomicU16::new(rand::random()),
            next_finger: AtomicUsize::new(1),
            effects,
            effects_rx: StdMutex::new(Some(effects_rx)),
            shutdown,
        }))
    }

    /// The local reference (id + public address).
    pub fn local(&self) -> NodeRef {
        self.routing.local()
    }

    /// The local identifier.
    pub fn id(&self) -> Key {
        self.routing.id()
    }

    /// The node's routing view.
    pub fn routing(&self) -> &RoutingState {
        &self.routing
    }

    /// The node's settings.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Capture the ring view for diagnostics.
    pub fn snapshot(&self) -> RingSnapshot {
        self.routing.snapshot()
    }

    /// A receiver on the node-wide shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Request plumbing
    // ─────────────────────────────────────────────────────────────────────

    fn fresh_request_id(&self) -> u16 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Forge a request spawning from this node.
    fn forge(&self, kind: MessageKind, recipient: Endpoint) -> Request {
        let mut req = Request::new(kind);
        req.id = self.fresh_request_id();
        req.sender = self.local().addr;
        req.recipient = recipient;
        req
    }

    /// Send `req` to its recipient. UDP loss is not an error here: a lost
    /// datagram surfaces later as a pending-entry timeout.
    async fn send(&self, req: &Request) {
        if let Err(err) = self.transport.send(req, req.recipient).await {
            warn!(to = %req.recipient, "failed to send datagram: {err:#}");
        }
    }

    /// Register continuations for `req` and send it.
    ///
    /// When the caller supplies no error continuation, the default is to
    /// probe the peer the request was addressed to. The pending-table lock
    /// is held only across the insert, never across the send.
    async fn issue(
        &self,
        req: Request,
        peer: NodeRef,
        on_success: Option<SuccessCallback>,
        on_error: Option<ErrorCallback>,
        ttl: Duration,
    ) {
        if on_success.is_some() || on_error.is_some() {
            let on_error = on_error.or_else(|| {
                let effects = self.effects.clone();
                Some(Box::new(move || {
                    let _ = effects.send(Effect::CheckPeer(peer));
                }) as ErrorCallback)
            });

            let mut pending = self.pending.lock().await;
            pending.register(req.id, on_success, on_error, ttl);
        }

        self.send(&req).await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Chord API
    // ─────────────────────────────────────────────────────────────────────

    /// Join the ring through a known peer.
    ///
    /// This is the node's only synchronous protocol exchange: it sends a
    /// lookup for the local id straight to `peer` and spin-reads the
    /// socket until the matching reply names our successor. Call it before
    /// [`spawn`](Self::spawn); afterwards the receiver task owns the
    /// socket's read side.
    pub async fn join(&self, peer: Endpoint) -> Result<()> {
        let mut req = self.forge(MessageKind::Lookup, peer);
        req.set_src(Payload::Node(self.local()));
        req.set_dst(Payload::Key(self.id()));
        self.transport
            .send(&req, peer)
            .await
            .context("sending join lookup")?;

        let successor = timeout(self.config.join_timeout, async {
            loop {
                let (res, _from) = self.transport.recv().await?;
                if res.kind == MessageKind::Reply && res.id == req.id {
                    return Ok::<NodeRef, anyhow::Error>(res.dst_node());
                }
            }
        })
        .await
        .map_err(|_| anyhow!("no join reply from {peer} within {:?}", self.config.join_timeout))?
        .context("waiting for join reply")?;

        self.routing.set_successor(successor);
        info!(successor = %successor, "connected to ring");
        Ok(())
    }

    /// Leave the ring: best-effort LEAVE notifications to the successor
    /// and predecessor, no acknowledgement expected. In-flight lookups are
    /// left to complete or time out.
    pub async fn leave(&self) {
        for target in [self.routing.successor(), self.routing.predecessor()] {
            if target.id == self.id() || target.is_nil() {
                continue;
            }
            let mut req = self.forge(MessageKind::Leave, target.addr);
            req.set_src(Payload::Node(self.local()));
            self.send(&req).await;
        }
        info!("left the ring");
    }

    /// Find the node responsible for `key`.
    ///
    /// Resolves immediately when the key falls into our successor's arc;
    /// otherwise a lookup is routed through the ring and the returned
    /// future completes with the reply. On timeout the result is the nil
    /// reference and the finger we consulted gets probed.
    pub async fn lookup(&self, key: Key) -> NodeRef {
        let successor = self.routing.successor();
        if range_open_closed(key, self.id(), successor.id) {
            return successor;
        }

        // Closest preceding node we know
        let next = self.routing.find_successor(key);

        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(StdMutex::new(Some(tx)));

        let on_success: SuccessCallback = {
            let tx = tx.clone();
            Box::new(move |res: &Request| {
                if let Some(tx) = tx.lock().expect("lookup sender poisoned").take() {
                    let _ = tx.send(res.dst_node());
                }
            })
        };
        let on_error: ErrorCallback = {
            let effects = self.effects.clone();
            Box::new(move || {
                if let Some(tx) = tx.lock().expect("lookup sender poisoned").take() {
                    let _ = tx.send(NodeRef::nil());
                }
                let _ = effects.send(Effect::CheckPeer(next));
            })
        };

        let mut req = self.forge(MessageKind::Lookup, next.addr);
        req.set_src(Payload::Node(self.local()));
        req.set_dst(Payload::Key(key));
        self.issue(req, next, Some(on_success), Some(on_error), self.config.lookup_ttl)
            .await;

        rx.await.unwrap_or_else(|_| NodeRef::nil())
    }

    /// Probe `peer`; if it stays silent past the request TTL it is removed
    /// from the local view.
    pub async fn check_peer(&self, peer: NodeRef) {
        if peer.is_nil() || peer.id == self.id() {
            return;
        }

        let on_error: ErrorCallback = {
            let effects = self.effects.clone();
            Box::new(move || {
                let _ = effects.send(Effect::RemovePeer(peer));
            })
        };

        let mut req = self.forge(MessageKind::Check, peer.addr);
        req.set_src(Payload::Node(self.local()));
        self.issue(req, peer, None, Some(on_error), self.config.request_ttl)
            .await;
    }

    /// Erase a dead or departed peer and, when it was our successor, ask
    /// the predecessor who follows us now.
    pub async fn remove_peer(&self, peer: NodeRef) {
        let outcome = self.routing.forget_peer(&peer);

        if outcome.lost_successor {
            let predecessor = self.routing.predecessor();
            // In an unhealthy ring the predecessor may be gone too; when it
            // has already collapsed to self there is nobody to ask, and the
            // successor heals through the next stabilize round instead.
            if predecessor.id != self.id() && !predecessor.is_nil() {
                let routing = self.routing.clone();
                let on_success: SuccessCallback = Box::new(move |res: &Request| {
                    let node = res.dst_node();
                    if !node.is_nil() {
                        routing.set_successor(node);
                        info!(successor = %node, "recovered successor");
                    }
                });

                let mut req = self.forge(MessageKind::Lookup, predecessor.addr);
                req.set_src(Payload::Node(self.local()));
                req.set_dst(Payload::Key(self.id().wrapping_add(1)));
                self.issue(req, predecessor, Some(on_success), None, self.config.request_ttl)
                    .await;
            }
        }

        info!(peer = %peer, "removed peer from local view");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stabilization
    // ─────────────────────────────────────────────────────────────────────

    /// Notify the successor that we believe we precede it. The reply
    /// carries the successor's current predecessor; when that node sits
    /// between us and the successor we adopt it as the new successor.
    async fn stabilize(&self) {
        let successor = self.routing.successor();

        let on_success: SuccessCallback = {
            let routing = self.routing.clone();
            Box::new(move |res: &Request| {
                let target = res.dst_node();
                let local_id = routing.id();
                let successor = routing.successor();
                if successor.id == local_id || range_open(target.id, local_id, successor.id) {
                    routing.set_successor(target);
                    info!(successor = %target, "new successor");
                }
            })
        };

        let mut req = self.forge(MessageKind::Notify, successor.addr);
        req.set_src(Payload::Node(self.local()));
        self.issue(req, successor, Some(on_success), None, self.config.request_ttl)
            .await;
    }

    /// Refresh one finger per round: compute the slot's target key and
    /// look up the node responsible for it.
    async fn fix_fingers(&self) {
        let i = self.next_finger.load(Ordering::Relaxed);
        let key = self.id().wrapping_add(1u32 << i);
        let successor = self.routing.successor();

        if range_open_closed(key, self.id(), successor.id) {
            self.routing.set_finger(i, successor);
            debug!(finger = i, node = %successor, "updated finger");
        } else {
            let next = self.routing.find_successor(key);

            let on_success: SuccessCallback = {
                let routing = self.routing.clone();
                Box::new(move |res: &Request| {
                    let node = res.dst_node();
                    routing.set_finger(i, node);
                    debug!(finger = i, node = %node, "updated finger");
                })
            };

            let mut req = self.forge(MessageKind::Lookup, next.addr);
            req.set_src(Payload::Node(self.local()));
            req.set_dst(Payload::Key(key));
            self.issue(req, next, Some(on_success), None, self.config.request_ttl)
                .await;
        }

        // Cursor cycles 1..=31; the successor (slot 0) is maintained by
        // stabilize, not here.
        self.next_finger.store((i % 31) + 1, Ordering::Relaxed);
    }

    /// Probe the predecessor's liveness.
    async fn check_predecessor(&self) {
        self.check_peer(self.routing.predecessor()).await;
    }

    /// Age pending requests by `dt`, firing timeout continuations.
    async fn sweep_pending(&self, dt: Duration) {
        let mut pending = self.pending.lock().await;
        pending.sweep(dt);
        debug!(pending = pending.len(), "pending requests");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────

    /// Handle one received record. Runs on the receiver task, after the
    /// hop increment and expiry check.
    pub async fn dispatch(&self, req: Request) {
        match req.kind {
            MessageKind::Ping => {
                debug!(from = %req.sender, id = req.id, "received PING");
            }
            MessageKind::Reply => {
                debug!(from = %req.sender, id = req.id, "received REPLY");
                self.handle_reply(req).await;
            }
            MessageKind::Lookup => {
                debug!(from = %req.sender, id = req.id, hops = req.hop_count, "received LOOKUP");
                self.handle_lookup(req).await;
            }
            MessageKind::Notify => {
                debug!(from = %req.sender, id = req.id, "received NOTIFY");
                self.handle_notify(req).await;
            }
            MessageKind::Leave => {
                debug!(from = %req.sender, id = req.id, "received LEAVE");
                self.handle_leave(req).await;
            }
            MessageKind::Check => {
                debug!(from = %req.sender, id = req.id, "received CHECK");
                self.handle_check(req).await;
            }
        }
    }

    async fn handle_reply(&self, req: Request) {
        let mut pending = self.pending.lock().await;
        if !pending.complete(req.id, &req) {
            debug!(id = req.id, "reply with unknown id discarded");
        }
    }

    async fn handle_lookup(&self, req: Request) {
        let src = req.src_node();
        let key = req.dst_key();
        let successor = self.routing.successor();

        if range_open_closed(key, self.id(), successor.id) {
            // Our successor owns the key: answer the originator. The src
            // slot keeps the originator reference for the whole round trip.
            let mut res = req.clone();
            res.kind = MessageKind::Reply;
            res.sender = self.local().addr;
            res.recipient = src.addr;
            res.set_dst(Payload::Node(successor));
            res.reset();
            self.send(&res).await;
            return;
        }

        let next = self.routing.find_successor(key);
        if next.id == self.id() {
            // Nothing better than ourselves: claim responsibility rather
            // than routing in a circle.
            let mut res = req.clone();
            res.kind = MessageKind::Reply;
            res.sender = self.local().addr;
            res.recipient = src.addr;
            res.set_dst(Payload::Node(self.local()));
            res.reset();
            self.send(&res).await;
        } else {
            // Forward along the ring, keeping the originator intact.
            let mut fwd = req.clone();
            fwd.sender = self.local().addr;
            fwd.recipient = next.addr;
            self.send(&fwd).await;
        }
    }

    async fn handle_notify(&self, req: Request) {
        let src = req.src_node();
        let predecessor = self.routing.predecessor();

        // Reply with our current predecessor first so the notifier can run
        // its stabilize round against it.
        let mut res = req.clone();
        res.kind = MessageKind::Reply;
        res.sender = self.local().addr;
        res.recipient = src.addr;
        res.set_src(Payload::Node(self.local()));
        res.set_dst(Payload::Node(predecessor));
        res.reset();
        self.send(&res).await;

        if predecessor.id == self.id() || range_open(src.id, predecessor.id, self.id()) {
            self.routing.set_predecessor(src);
            info!(predecessor = %src, "new predecessor");
        }
    }

    async fn handle_leave(&self, req: Request) {
        self.remove_peer(req.src_node()).await;
    }

    async fn handle_check(&self, req: Request) {
        // Any reply proves we are alive.
        let src = req.src_node();
        let mut res = req.clone();
        res.kind = MessageKind::Reply;
        res.sender = self.local().addr;
        res.recipient = src.addr;
        res.set_src(Payload::Node(self.local()));
        res.set_dst(Payload::None);
        res.reset();
        self.send(&res).await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Background tasks
    // ─────────────────────────────────────────────────────────────────────

    /// Spawn the receiver, updater, and effect worker.
    ///
    /// # Panics
    ///
    /// Panics when called twice; the effect queue has a single consumer.
    pub fn spawn(self: &Arc<Self>) -> NodeHandle {
        let effects_rx = self
            .effects_rx
            .lock()
            .expect("effect receiver lock poisoned")
            .take()
            .expect("node tasks already spawned");

        let tasks = vec![
            tokio::spawn(self.clone().run_receiver(self.shutdown_signal())),
            tokio::spawn(self.clone().run_updater(self.shutdown_signal())),
            tokio::spawn(self.clone().run_effects(effects_rx, self.shutdown_signal())),
        ];

        NodeHandle {
            node: self.clone(),
            tasks,
        }
    }

    /// The receive loop: enforce the hop increment and TTL rule, then
    /// dispatch. All per-kind logic lives in the handlers above.
    async fn run_receiver(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let received = tokio::select! {
                received = self.transport.recv() => received,
                _ = shutdown.changed() => break,
            };

            let (mut req, _from) = match received {
                Ok(received) => received,
                Err(err) => {
                    warn!("receive loop stopping: {err:#}");
                    break;
                }
            };

            req.hop();
            if req.is_expired() {
                debug!(id = req.id, hops = req.hop_count, ttl = req.ttl, "dropping expired request");
                continue;
            }

            self.dispatch(req).await;
        }
    }

    /// The stabilizer: two timers driven by measured delta times.
    async fn run_updater(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut update_timer = Timer::new(self.config.update_interval);
        let mut check_timer = Timer::new(self.config.check_interval);

        // Tick well below the shorter interval so firings stay on cadence.
        let tick = (self.config.update_interval.min(self.config.check_interval) / 4)
            .clamp(Duration::from_millis(10), Duration::from_millis(250));

        let mut last = Instant::now();
        let mut since_sweep = Duration::ZERO;

        loop {
            tokio::select! {
                _ = sleep(tick) => {}
                _ = shutdown.changed() => break,
            }

            let now = Instant::now();
            let dt = now - last;
            last = now;
            since_sweep += dt;

            if update_timer.tick(dt) {
                self.stabilize().await;
                self.fix_fingers().await;
            }

            if check_timer.tick(dt) {
                self.check_predecessor().await;
                self.sweep_pending(since_sweep).await;
                since_sweep = Duration::ZERO;
            }
        }
    }

    /// Drain follow-up actions queued by timeout continuations.
    async fn run_effects(
        self: Arc<Self>,
        mut effects: mpsc::UnboundedReceiver<Effect>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let effect = tokio::select! {
                effect = effects.recv() => effect,
                _ = shutdown.changed() => break,
            };
            match effect {
                Some(Effect::CheckPeer(peer)) => self.check_peer(peer).await,
                Some(Effect::RemovePeer(peer)) => self.remove_peer(peer).await,
                None => break,
            }
        }
    }
}

/// Handle on a node's background tasks.
pub struct NodeHandle {
    node: Arc<Node>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// Signal shutdown and wait for the receiver, updater, and effect
    /// worker to stop. The UDP socket closes with the node's last
    /// reference; TCP workers end when their client disconnects.
    pub async fn shutdown(self) {
        let _ = self.node.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
