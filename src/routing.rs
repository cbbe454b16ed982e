//! # Routing Table Manager (RUT)
//!
//! Stores known DHT peers in log-distance buckets and answers
//! nearest-neighbor lookups for the query manager.
//!
//! ## Layout
//!
//! The table is an ordered sequence of buckets, initially one. Bucket `i`
//! (except the tail) holds exactly the peers at log-distance `i` from the
//! local hash; the tail holds everything at or beyond its own index. Each
//! bucket keeps its entries in LRU order with the most recently seen peer
//! at the front. Only the tail may split: when it overflows, entries
//! farther than the tail index migrate into a new appended bucket, the
//! remainder is trimmed from the LRU end, and the new tail splits again
//! if still over capacity.
//!
//! ## Latency gate
//!
//! A companion metric table keeps an EWMA of observed latency per peer
//! (weight 0.125, seeded from the first sample). Peers whose EWMA exceeds
//! the configured maximum are rejected on insert.
//!
//! ## Notifications
//!
//! Up to 64 subscribers register a `(token, target, max)` triple; after
//! every update batch the nearest set for each target is recomputed and
//! pushed to the subscriber when it changed. Registration beyond the cap
//! fails with `Errno::Resource`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::DhtConfig;
use crate::errno::Errno;
use crate::identity::{log2_dist, Node, NodeHash, NodeId};
use crate::messages::DsKey;

/// Mailbox bound of the routing manager.
const RUT_MAILBOX: usize = 256;

/// One table entry: the peer record plus its cached hash and distance to
/// the local node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketEntry {
    pub node: Node,
    pub hash: NodeHash,
    pub dist: usize,
}

/// Nearest-neighbor response.
#[derive(Clone, Debug)]
pub struct NearestRsp {
    pub eno: Errno,
    pub target: DsKey,
    /// Closest first; ties keep table scan order.
    pub peers: Vec<BucketEntry>,
    /// Log-distance of each peer to the target.
    pub dists: Vec<usize>,
}

/// Pushed to a subscriber when the nearest set for its target changed.
#[derive(Clone, Debug)]
pub struct RouteNotification {
    pub token: u64,
    pub target: DsKey,
    pub peers: Vec<BucketEntry>,
    pub dists: Vec<usize>,
}

enum RouteCmd {
    Nearest {
        target: DsKey,
        max: usize,
        reply: oneshot::Sender<NearestRsp>,
    },
    Update {
        seens: Vec<Node>,
        durations: Vec<Duration>,
    },
    Subscribe {
        token: u64,
        target: DsKey,
        max: usize,
        tx: mpsc::Sender<RouteNotification>,
        reply: oneshot::Sender<Errno>,
    },
    Unsubscribe {
        token: u64,
        target: DsKey,
    },
    PowerOff,
}

/// Clone-able handle to the routing manager task.
#[derive(Clone)]
pub struct RouteHandle {
    tx: mpsc::Sender<RouteCmd>,
}

impl RouteHandle {
    /// Up to `min(max, max_nearest)` peers closest to `target`, closest
    /// first.
    pub async fn nearest(&self, target: DsKey, max: usize) -> NearestRsp {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(RouteCmd::Nearest { target, max, reply: tx })
            .await
            .is_err()
        {
            return NearestRsp { eno: Errno::Scheduler, target, peers: Vec::new(), dists: Vec::new() };
        }
        rx.await.unwrap_or(NearestRsp {
            eno: Errno::Scheduler,
            target,
            peers: Vec::new(),
            dists: Vec::new(),
        })
    }

    /// Record seen peers with their observed latencies. Fire and forget.
    pub async fn update(&self, seens: Vec<Node>, durations: Vec<Duration>) {
        let _ = self.tx.send(RouteCmd::Update { seens, durations }).await;
    }

    /// Register for nearest-set notifications on `target`.
    pub async fn subscribe(
        &self,
        token: u64,
        target: DsKey,
        max: usize,
        tx: mpsc::Sender<RouteNotification>,
    ) -> Errno {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RouteCmd::Subscribe { token, target, max, tx, reply })
            .await
            .is_err()
        {
            return Errno::Scheduler;
        }
        rx.await.unwrap_or(Errno::Scheduler)
    }

    pub async fn unsubscribe(&self, token: u64, target: DsKey) {
        let _ = self.tx.send(RouteCmd::Unsubscribe { token, target }).await;
    }

    pub async fn power_off(&self) {
        let _ = self.tx.send(RouteCmd::PowerOff).await;
    }
}

/// Latency metric for one peer.
struct PeerMetric {
    samples: u64,
    ewma: Duration,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct NotifeeKey {
    token: u64,
    target: DsKey,
}

struct Notifee {
    max: usize,
    tx: mpsc::Sender<RouteNotification>,
    /// Ids of the last pushed set, for change detection.
    last: Vec<NodeId>,
}

/// The routing manager actor. Owns the bucket table, the latency metric
/// table, and the notifee registry; mutated only from its own task.
pub struct RouteMgr {
    cfg: DhtConfig,
    local_hash: NodeHash,
    local_id: NodeId,
    buckets: Vec<VecDeque<BucketEntry>>,
    metrics: HashMap<NodeId, PeerMetric>,
    notifees: HashMap<NotifeeKey, Notifee>,
    cmd_rx: mpsc::Receiver<RouteCmd>,
    /// Bootstrap targets are handed to the node assembly, which starts
    /// FIND_NODE queries for them.
    bootstrap_tx: Option<mpsc::Sender<NodeId>>,
}

impl RouteMgr {
    /// Spawn the routing manager task and return its handle.
    pub fn spawn(
        cfg: DhtConfig,
        local_id: NodeId,
        bootstrap_tx: Option<mpsc::Sender<NodeId>>,
    ) -> RouteHandle {
        let (tx, rx) = mpsc::channel(RUT_MAILBOX);
        let mgr = RouteMgr {
            local_hash: local_id.hash(),
            local_id,
            cfg,
            buckets: vec![VecDeque::new()],
            metrics: HashMap::new(),
            notifees: HashMap::new(),
            cmd_rx: rx,
            bootstrap_tx,
        };
        tokio::spawn(mgr.run());
        RouteHandle { tx }
    }

    async fn run(mut self) {
        let mut bootstrap = tokio::time::interval(self.cfg.bootstrap_period);
        bootstrap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; swallow it so
        // the first bootstrap round happens one period after start.
        bootstrap.tick().await;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(RouteCmd::Nearest { target, max, reply }) => {
                            let _ = reply.send(self.nearest(&target, max));
                        }
                        Some(RouteCmd::Update { seens, durations }) => {
                            self.update(seens, durations).await;
                        }
                        Some(RouteCmd::Subscribe { token, target, max, tx, reply }) => {
                            let _ = reply.send(self.subscribe(token, target, max, tx));
                        }
                        Some(RouteCmd::Unsubscribe { token, target }) => {
                            self.notifees.remove(&NotifeeKey { token, target });
                        }
                        Some(RouteCmd::PowerOff) | None => {
                            debug!("route manager: power off");
                            break;
                        }
                    }
                }
                _ = bootstrap.tick() => {
                    self.bootstrap_tick().await;
                }
            }
        }
    }

    /// Emit random lookup targets to self-seed the table.
    async fn bootstrap_tick(&mut self) {
        let Some(tx) = &self.bootstrap_tx else { return };
        for _ in 0..self.cfg.random_qry_num {
            let target = NodeId::random();
            trace!(target = %target, "bootstrap lookup");
            if tx.try_send(target).is_err() {
                debug!("bootstrap query channel full, tick skipped");
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Nearest
    // ------------------------------------------------------------------

    fn nearest(&self, target: &DsKey, max: usize) -> NearestRsp {
        if max == 0 || max > self.cfg.max_nearest {
            warn!(max, cap = self.cfg.max_nearest, "nearest: invalid size");
            return NearestRsp {
                eno: Errno::Parameter,
                target: *target,
                peers: Vec::new(),
                dists: Vec::new(),
            };
        }

        let tail = self.buckets.len() - 1;
        let dt = log2_dist(&self.local_hash, target).min(tail);

        let mut picked: Vec<BucketEntry> = Vec::with_capacity(max);
        let fill = |bucket: &VecDeque<BucketEntry>, picked: &mut Vec<BucketEntry>| {
            for entry in bucket {
                if picked.len() >= max {
                    return true;
                }
                picked.push(entry.clone());
            }
            picked.len() >= max
        };

        // Closest bucket first, then outward above, then below.
        let mut done = fill(&self.buckets[dt], &mut picked);
        if !done {
            for idx in dt + 1..self.buckets.len() {
                if fill(&self.buckets[idx], &mut picked) {
                    done = true;
                    break;
                }
            }
        }
        if !done {
            for idx in (0..dt).rev() {
                if fill(&self.buckets[idx], &mut picked) {
                    break;
                }
            }
        }

        // Order by closeness to the target; larger log-distance means
        // closer. The sort is stable, so ties keep scan order.
        let mut with_dist: Vec<(BucketEntry, usize)> = picked
            .into_iter()
            .map(|e| {
                let d = log2_dist(target, &e.hash);
                (e, d)
            })
            .collect();
        with_dist.sort_by(|a, b| b.1.cmp(&a.1));

        let (peers, dists): (Vec<_>, Vec<_>) = with_dist.into_iter().unzip();
        NearestRsp { eno: Errno::None, target: *target, peers, dists }
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    async fn update(&mut self, seens: Vec<Node>, durations: Vec<Duration>) {
        if seens.is_empty() || seens.len() != durations.len() {
            warn!(
                seens = seens.len(),
                durations = durations.len(),
                "update: invalid batch"
            );
            return;
        }

        for (node, dura) in seens.into_iter().zip(durations) {
            if node.id == self.local_id {
                continue;
            }
            self.metric_sample(node.id, dura);
            let hash = node.id.hash();
            let dist = log2_dist(&self.local_hash, &hash);
            self.insert(BucketEntry { node, hash, dist });
        }

        self.notify().await;
    }

    /// Fold a latency sample into the peer's EWMA, seeding from the first
    /// sample.
    fn metric_sample(&mut self, id: NodeId, latency: Duration) {
        match self.metrics.get_mut(&id) {
            Some(m) => {
                let w = self.cfg.ewma_weight;
                let next =
                    m.ewma.as_secs_f64() * (1.0 - w) + latency.as_secs_f64() * w;
                m.ewma = Duration::from_secs_f64(next.max(0.0));
                m.samples += 1;
            }
            None => {
                self.metrics.insert(id, PeerMetric { samples: 1, ewma: latency });
            }
        }
    }

    fn insert(&mut self, entry: BucketEntry) {
        // Already present somewhere: refresh the record and move it to
        // the front of its bucket. Entries at or beyond the tail index
        // share the tail, so the scan covers every bucket.
        for bucket in &mut self.buckets {
            if let Some(pos) = bucket.iter().position(|e| e.node.id == entry.node.id) {
                bucket.remove(pos);
                bucket.push_front(entry);
                return;
            }
        }

        let ewma = self
            .metrics
            .get(&entry.node.id)
            .map(|m| m.ewma)
            .unwrap_or_default();
        if ewma > self.cfg.max_latency {
            debug!(peer = %entry.node.id, ewma = ?ewma, "insert rejected: latency over limit");
            return;
        }

        let tail = self.buckets.len() - 1;
        self.buckets[tail].push_back(entry);
        if self.buckets[tail].len() > self.cfg.bucket_size {
            self.split(tail);
        }
    }

    /// Split the tail bucket: entries farther than the tail index move to
    /// a new appended bucket, the remainder is trimmed from the LRU end,
    /// and the new tail splits recursively while over capacity.
    fn split(&mut self, tail: usize) {
        debug_assert_eq!(tail, self.buckets.len() - 1, "only the tail bucket may split");

        let mut moved: VecDeque<BucketEntry> = VecDeque::new();
        let mut kept: VecDeque<BucketEntry> = VecDeque::new();
        for entry in self.buckets[tail].drain(..) {
            if entry.dist > tail {
                moved.push_back(entry);
            } else {
                kept.push_back(entry);
            }
        }
        while kept.len() > self.cfg.bucket_size {
            kept.pop_back();
        }
        self.buckets[tail] = kept;

        if !moved.is_empty() {
            let over = moved.len() > self.cfg.bucket_size;
            self.buckets.push(moved);
            if over {
                self.split(tail + 1);
            }
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn subscribe(
        &mut self,
        token: u64,
        target: DsKey,
        max: usize,
        tx: mpsc::Sender<RouteNotification>,
    ) -> Errno {
        let key = NotifeeKey { token, target };
        if !self.notifees.contains_key(&key) && self.notifees.len() >= self.cfg.max_notifees {
            warn!(cap = self.cfg.max_notifees, "subscribe rejected: notifee table full");
            return Errno::Resource;
        }
        self.notifees.insert(key, Notifee { max, tx, last: Vec::new() });
        Errno::None
    }

    async fn notify(&mut self) {
        // Collect first: recomputing nearest borrows the table immutably
        // while the notifee map is updated below.
        let keys: Vec<NotifeeKey> = self.notifees.keys().cloned().collect();
        for key in keys {
            let max = self.notifees[&key].max;
            let rsp = self.nearest(&key.target, max);
            if rsp.eno.is_err() {
                continue;
            }
            let ids: Vec<NodeId> = rsp.peers.iter().map(|e| e.node.id).collect();
            let ntf = self.notifees.get_mut(&key).expect("key collected above");
            if ids == ntf.last {
                continue;
            }
            ntf.last = ids;
            let note = RouteNotification {
                token: key.token,
                target: key.target,
                peers: rsp.peers,
                dists: rsp.dists,
            };
            if ntf.tx.try_send(note).is_err() {
                trace!(token = key.token, "notification dropped: subscriber queue full");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_cfg() -> DhtConfig {
        DhtConfig::default()
    }

    fn node(seed: u64) -> Node {
        let mut bytes = [0u8; 64];
        bytes[..8].copy_from_slice(&seed.to_be_bytes());
        bytes[63] = 1;
        Node::new(
            NodeId::from_bytes(bytes),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            (seed & 0xffff) as u16,
            (seed & 0xffff) as u16,
        )
    }

    async fn filled_table(count: u64) -> (RouteHandle, NodeId) {
        let local = NodeId::random();
        let handle = RouteMgr::spawn(test_cfg(), local, None);
        let seens: Vec<Node> = (1..=count).map(node).collect();
        let durs = vec![Duration::from_millis(20); seens.len()];
        handle.update(seens, durs).await;
        (handle, local)
    }

    #[tokio::test]
    async fn nearest_is_sorted_closest_first_without_duplicates() {
        let (handle, _) = filled_table(1000).await;
        let target = NodeId::random().hash();
        let rsp = handle.nearest(target, 16).await;
        assert_eq!(rsp.eno, Errno::None);
        assert_eq!(rsp.peers.len(), 16);
        assert_eq!(rsp.peers.len(), rsp.dists.len());

        // Larger log-distance means closer; the list must not get closer
        // as it goes on.
        for pair in rsp.dists.windows(2) {
            assert!(pair[0] >= pair[1], "results out of order: {:?}", rsp.dists);
        }

        let mut ids: Vec<NodeId> = rsp.peers.iter().map(|e| e.node.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 16, "duplicate peers in nearest set");
    }

    #[tokio::test]
    async fn nearest_first_result_is_globally_closest() {
        // Few enough peers that nothing is evicted and the request width
        // covers the whole table, so the optimum can be recomputed
        // exactly.
        let (handle, _) = filled_table(20).await;
        let target = NodeId::random().hash();
        let rsp = handle.nearest(target, 32).await;
        assert_eq!(rsp.peers.len(), 20);

        let best = (1..=20u64)
            .map(|s| log2_dist(&target, &node(s).id.hash()))
            .max()
            .unwrap();
        assert_eq!(rsp.dists[0], best, "first result is not the closest peer");
    }

    #[tokio::test]
    async fn nearest_size_is_bounded() {
        let (handle, _) = filled_table(100).await;
        let target = NodeId::random().hash();
        assert_eq!(handle.nearest(target, 64).await.eno, Errno::Parameter);
        assert_eq!(handle.nearest(target, 0).await.eno, Errno::Parameter);
        let rsp = handle.nearest(target, 32).await;
        assert!(rsp.peers.len() <= 32);
    }

    #[tokio::test]
    async fn high_latency_peers_are_rejected() {
        let mut cfg = test_cfg();
        cfg.max_latency = Duration::from_millis(100);
        let local = NodeId::random();
        let handle = RouteMgr::spawn(cfg, local, None);

        let slow = node(1);
        // Two samples keep the EWMA far above the limit.
        handle
            .update(vec![slow, slow], vec![Duration::from_secs(30); 2])
            .await;
        let rsp = handle.nearest(NodeId::random().hash(), 8).await;
        assert!(rsp.peers.is_empty(), "slow peer must not be inserted");
    }

    #[tokio::test]
    async fn reseen_peer_moves_to_front() {
        let local = NodeId::random();
        let handle = RouteMgr::spawn(test_cfg(), local, None);
        let a = node(1);
        let b = node(2);
        handle
            .update(vec![a, b], vec![Duration::from_millis(5); 2])
            .await;
        // Re-seeing `a` must not duplicate it.
        handle.update(vec![a], vec![Duration::from_millis(5)]).await;
        let rsp = handle.nearest(a.id.hash(), 8).await;
        let count = rsp.peers.iter().filter(|e| e.node.id == a.id).count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn notifee_cap_is_enforced() {
        let local = NodeId::random();
        let handle = RouteMgr::spawn(test_cfg(), local, None);
        let (tx, _rx) = mpsc::channel(64);
        for token in 0..64u64 {
            let eno = handle
                .subscribe(token, NodeId::random().hash(), 4, tx.clone())
                .await;
            assert_eq!(eno, Errno::None, "subscription {token} should fit");
        }
        let eno = handle
            .subscribe(64, NodeId::random().hash(), 4, tx.clone())
            .await;
        assert_eq!(eno, Errno::Resource);

        // Dropping one slot frees capacity.
        handle.unsubscribe(0, NodeId::random().hash()).await; // wrong target: no-op
        let eno = handle.subscribe(64, NodeId::random().hash(), 4, tx).await;
        assert_eq!(eno, Errno::Resource);
    }

    #[tokio::test]
    async fn notifications_fire_on_change_only() {
        let local = NodeId::random();
        let handle = RouteMgr::spawn(test_cfg(), local, None);
        let target = NodeId::random().hash();
        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(handle.subscribe(7, target, 4, tx).await, Errno::None);

        handle.update(vec![node(1)], vec![Duration::from_millis(1)]).await;
        let note = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("first update must notify")
            .unwrap();
        assert_eq!(note.token, 7);
        assert_eq!(note.peers.len(), 1);

        // Same peer again: nearest set unchanged, no second notification.
        handle.update(vec![node(1)], vec![Duration::from_millis(1)]).await;
        handle.update(vec![node(2)], vec![Duration::from_millis(1)]).await;
        let note = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("second peer must notify")
            .unwrap();
        assert_eq!(note.peers.len(), 2);
        assert!(rx.try_recv().is_err(), "unchanged set must not notify");
    }

    #[tokio::test]
    async fn bootstrap_tick_emits_random_targets() {
        let mut cfg = test_cfg();
        cfg.bootstrap_period = Duration::from_millis(50);
        cfg.random_qry_num = 2;
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = RouteMgr::spawn(cfg, NodeId::random(), Some(tx));

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("bootstrap tick must fire")
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("two targets per tick")
            .unwrap();
        assert_ne!(first, second, "targets must be random");
    }
}
