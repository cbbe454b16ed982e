//! # Query Manager (QRY)
//!
//! Drives iterative Kademlia lookups. One query control block (QCB) per
//! outstanding target; per contacted peer a short-lived probe instance
//! task connects through the connection manager, sends the per-kind
//! request and awaits the response under the instance expiry.
//!
//! ## Lifecycle
//!
//! ```text
//! Start ── Preparing ──(nearest from RUT)──> Inited ──┬── target found ──> success
//!                                                     ├── pending+active drained ──> NotFound / None
//!                                                     ├── depth or width bound hit ──> NotFound
//!                                                     ├── query expiry ──> Timeout
//!                                                     └── NAT address switch ──> NatMapping
//! ```
//!
//! Duplicated starts for a target still in flight fail with
//! `Errno::Duplicated`. Route-manager notifications feed newly discovered
//! peers into the pending queue of a stalled query. A public-address
//! switch reported by the NAT manager terminates every outstanding query
//! with `NatMapping`, switches the advertised record and notifies the
//! DHT façade.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::DhtConfig;
use crate::conn::ConnHandle;
use crate::errno::Errno;
use crate::identity::{log2_dist, Node, NodeId};
use crate::messages::{DhtMessage, DsKey, Provider};
use crate::nat::{NatEvent, NatHandle, NatProto, NatStatus};
use crate::routing::{RouteHandle, RouteNotification};

/// Mailbox bound of the query manager.
const QRY_MAILBOX: usize = 1024;

/// Notifee token the query manager registers with under the route
/// manager; notifee identity is (token, target).
const QRY_NOTIFEE_TOKEN: u64 = 1;

/// What a query is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForWhat {
    FindNode,
    GetValue,
    GetProvider,
    PutValue,
    PutProvider,
}

impl ForWhat {
    /// PUT queries succeed by replication; drained read queries report
    /// NotFound instead.
    pub fn is_put(self) -> bool {
        matches!(self, ForWhat::PutValue | ForWhat::PutProvider)
    }
}

/// Value or provider payload pushed by PUT queries.
#[derive(Clone, Debug, Default)]
pub struct QueryPayload {
    pub value: Option<Vec<u8>>,
    pub provider: Option<Provider>,
}

/// Final result delivered to the query owner. A non-`None` errno means
/// the lookup gave up; partial nearest peers may still be included.
#[derive(Clone, Debug)]
pub struct QueryResultInd {
    pub eno: Errno,
    pub for_what: ForWhat,
    pub target: DsKey,
    pub peers: Vec<Node>,
    pub value: Option<Vec<u8>>,
    pub providers: Vec<Node>,
}

/// Emitted to the DHT façade after a NAT-driven address switch.
#[derive(Clone, Debug)]
pub struct PubAddrSwitchInd {
    pub ip: IpAddr,
    pub tcp: u16,
}

/// Query control block status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QcbStatus {
    Preparing,
    Inited,
}

/// Probe instance states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcbState {
    Null,
    Inited,
    WaitConnect,
    WaitResponse,
    DoneOk,
    Done,
}

/// A peer queued for probing.
#[derive(Clone, Debug)]
struct PendingInfo {
    node: Node,
    dist: usize,
    depth: usize,
}

/// A peer already reported, kept distance-ordered.
#[derive(Clone, Debug)]
struct ResultInfo {
    node: Node,
    dist: usize,
}

/// Per-probe control block.
struct Icb {
    state: IcbState,
    depth: usize,
    task: JoinHandle<()>,
}

struct Qcb {
    seq: u64,
    for_what: ForWhat,
    target: DsKey,
    payload: QueryPayload,
    owner: mpsc::Sender<QueryResultInd>,
    status: QcbStatus,
    history: HashMap<NodeId, usize>,
    pending: VecDeque<PendingInfo>,
    actived: HashMap<NodeId, Icb>,
    result: Vec<ResultInfo>,
    expire: Option<JoinHandle<()>>,
    ntf_flag: bool,
    width: usize,
    depth: usize,
}

/// Outcome of one probe instance.
struct InstOutcome {
    eno: Errno,
    from: Node,
    latency: Duration,
    peers: Vec<Node>,
    value: Option<Vec<u8>>,
    provider: Option<Provider>,
}

enum QryCmd {
    Start {
        for_what: ForWhat,
        target: DsKey,
        payload: QueryPayload,
        owner: mpsc::Sender<QueryResultInd>,
        reply: oneshot::Sender<Errno>,
    },
    Stop {
        target: DsKey,
        reply: oneshot::Sender<Errno>,
    },
    NearestArrived {
        target: DsKey,
        rsp: crate::routing::NearestRsp,
    },
    RouteNote(RouteNotification),
    InstStatus {
        target: DsKey,
        peer: NodeId,
        state: IcbState,
    },
    InstResult {
        target: DsKey,
        outcome: InstOutcome,
    },
    QcbExpired {
        target: DsKey,
        seq: u64,
    },
    Nat(NatEvent),
    PowerOff,
}

/// Clone-able handle to the query manager task.
#[derive(Clone)]
pub struct QueryHandle {
    tx: mpsc::Sender<QryCmd>,
}

impl QueryHandle {
    /// Start a query. Results arrive on `owner` as a single
    /// [`QueryResultInd`]. A target already in flight is rejected with
    /// `Errno::Duplicated`.
    pub async fn start(
        &self,
        for_what: ForWhat,
        target: DsKey,
        payload: QueryPayload,
        owner: mpsc::Sender<QueryResultInd>,
    ) -> Errno {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(QryCmd::Start { for_what, target, payload, owner, reply })
            .await
            .is_err()
        {
            return Errno::Scheduler;
        }
        rx.await.unwrap_or(Errno::Scheduler)
    }

    /// Cancel a query; its probe instances are powered off.
    pub async fn stop(&self, target: DsKey) -> Errno {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(QryCmd::Stop { target, reply }).await.is_err() {
            return Errno::Scheduler;
        }
        rx.await.unwrap_or(Errno::Scheduler)
    }

    /// Deliver a NAT manager event.
    pub async fn nat_event(&self, ev: NatEvent) {
        let _ = self.tx.send(QryCmd::Nat(ev)).await;
    }

    pub async fn power_off(&self) {
        let _ = self.tx.send(QryCmd::PowerOff).await;
    }
}

/// The query manager actor.
pub struct QueryMgr {
    cfg: DhtConfig,
    local: Node,
    rut: RouteHandle,
    con: ConnHandle,
    nat: Option<NatHandle>,
    addr_switch_tx: mpsc::Sender<PubAddrSwitchInd>,
    qcb_tab: HashMap<DsKey, Qcb>,
    qcb_seq: u64,
    inst_seq: u64,
    nat_tcp_ok: bool,
    pub_tcp: Option<(IpAddr, u16)>,
    cmd_rx: mpsc::Receiver<QryCmd>,
    cmd_tx: mpsc::Sender<QryCmd>,
    note_rx: mpsc::Receiver<RouteNotification>,
    note_tx: mpsc::Sender<RouteNotification>,
}

impl QueryMgr {
    pub fn spawn(
        cfg: DhtConfig,
        local: Node,
        rut: RouteHandle,
        con: ConnHandle,
        nat: Option<NatHandle>,
        addr_switch_tx: mpsc::Sender<PubAddrSwitchInd>,
    ) -> QueryHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(QRY_MAILBOX);
        let (note_tx, note_rx) = mpsc::channel(QRY_MAILBOX);
        let mgr = QueryMgr {
            cfg,
            local,
            rut,
            con,
            nat,
            addr_switch_tx,
            qcb_tab: HashMap::new(),
            qcb_seq: 0,
            inst_seq: 0,
            nat_tcp_ok: false,
            pub_tcp: None,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            note_rx,
            note_tx,
        };
        tokio::spawn(mgr.run());
        QueryHandle { tx: cmd_tx }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle(cmd).await {
                        break;
                    }
                }
                note = self.note_rx.recv() => {
                    if let Some(note) = note {
                        self.route_note(note).await;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, cmd: QryCmd) -> bool {
        match cmd {
            QryCmd::Start { for_what, target, payload, owner, reply } => {
                let eno = self.start(for_what, target, payload, owner).await;
                let _ = reply.send(eno);
            }
            QryCmd::Stop { target, reply } => {
                let eno = self.delete_qcb(&target, "stop request").await;
                let _ = reply.send(eno);
            }
            QryCmd::NearestArrived { target, rsp } => {
                self.nearest_arrived(target, rsp).await;
            }
            QryCmd::RouteNote(note) => self.route_note(note).await,
            QryCmd::InstStatus { target, peer, state } => {
                if let Some(qcb) = self.qcb_tab.get_mut(&target) {
                    if let Some(icb) = qcb.actived.get_mut(&peer) {
                        icb.state = state;
                    }
                }
            }
            QryCmd::InstResult { target, outcome } => {
                self.inst_result(target, outcome).await;
            }
            QryCmd::QcbExpired { target, seq } => {
                let expired = self.qcb_tab.get(&target).map(|q| q.seq) == Some(seq);
                if expired {
                    debug!(target = ?target, "query expired");
                    self.report(&target, Errno::Timeout, None, Vec::new()).await;
                    self.delete_qcb(&target, "expiry").await;
                }
            }
            QryCmd::Nat(ev) => self.nat_event(ev).await,
            QryCmd::PowerOff => {
                debug!("query manager: power off");
                let targets: Vec<DsKey> = self.qcb_tab.keys().cloned().collect();
                for target in targets {
                    self.delete_qcb(&target, "power off").await;
                }
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Start protocol
    // ------------------------------------------------------------------

    async fn start(
        &mut self,
        for_what: ForWhat,
        target: DsKey,
        payload: QueryPayload,
        owner: mpsc::Sender<QueryResultInd>,
    ) -> Errno {
        if self.qcb_tab.contains_key(&target) {
            debug!(target = ?target, "start rejected: duplicated target");
            return Errno::Duplicated;
        }

        self.qcb_seq += 1;
        let qcb = Qcb {
            seq: self.qcb_seq,
            for_what,
            target,
            payload,
            owner,
            status: QcbStatus::Preparing,
            history: HashMap::new(),
            pending: VecDeque::new(),
            actived: HashMap::new(),
            result: Vec::new(),
            expire: None,
            ntf_flag: true,
            width: 0,
            depth: 0,
        };
        self.qcb_tab.insert(target, qcb);

        // Ask the route manager for seeds and register for notifications
        // on the same target, off the actor loop.
        let rut = self.rut.clone();
        let cmd_tx = self.cmd_tx.clone();
        let note_tx = self.note_tx.clone();
        let max = self.cfg.max_nearest;
        tokio::spawn(async move {
            let _ = rut
                .subscribe(QRY_NOTIFEE_TOKEN, target, max, note_tx)
                .await;
            let rsp = rut.nearest(target, max).await;
            let _ = cmd_tx.send(QryCmd::NearestArrived { target, rsp }).await;
        });
        Errno::None
    }

    async fn nearest_arrived(&mut self, target: DsKey, rsp: crate::routing::NearestRsp) {
        let Some(qcb) = self.qcb_tab.get_mut(&target) else {
            trace!(target = ?target, "nearest response for unknown target");
            return;
        };
        if qcb.status != QcbStatus::Preparing {
            warn!(target = ?target, status = ?qcb.status, "nearest response in wrong status");
            return;
        }

        if rsp.eno.is_err() || rsp.peers.is_empty() {
            debug!(target = ?target, eno = %rsp.eno, "no seeds for query");
            self.report(&target, Errno::Route, None, Vec::new()).await;
            self.delete_qcb(&target, "no seeds").await;
            return;
        }

        // Target already known locally: done without any probes.
        if !qcb.for_what.is_put() {
            if let Some(hit) = rsp.peers.iter().find(|e| e.hash == target) {
                let ind = QueryResultInd {
                    eno: Errno::None,
                    for_what: qcb.for_what,
                    target,
                    peers: vec![hit.node],
                    value: None,
                    providers: Vec::new(),
                };
                let _ = qcb.owner.send(ind).await;
                self.delete_qcb(&target, "target in local table").await;
                return;
            }
        }

        for (entry, dist) in rsp.peers.iter().zip(rsp.dists.iter()) {
            Self::update_result(&mut qcb.result, ResultInfo { node: entry.node, dist: *dist });
        }

        let seeds: Vec<PendingInfo> = rsp
            .peers
            .iter()
            .zip(rsp.dists.iter())
            .map(|(entry, dist)| PendingInfo { node: entry.node, dist: *dist, depth: 0 })
            .collect();
        Self::put_pending(qcb, seeds, self.cfg.max_pendings);

        // Arm the whole-query expiry.
        let seq = qcb.seq;
        let cmd_tx = self.cmd_tx.clone();
        let expired = self.cfg.qry_expired;
        qcb.expire = Some(tokio::spawn(async move {
            tokio::time::sleep(expired).await;
            let _ = cmd_tx.send(QryCmd::QcbExpired { target, seq }).await;
        }));
        qcb.status = QcbStatus::Inited;

        self.put_actived(&target);
    }

    // ------------------------------------------------------------------
    // Queue maintenance
    // ------------------------------------------------------------------

    /// Insert pending candidates ordered by closeness (closest first),
    /// skipping peers already probed or queued, and trim to `cap` from
    /// the far end.
    fn put_pending(qcb: &mut Qcb, nodes: Vec<PendingInfo>, cap: usize) {
        for n in nodes {
            if qcb.history.contains_key(&n.node.id) {
                continue;
            }
            if qcb.pending.iter().any(|p| p.node.id == n.node.id) {
                continue;
            }
            // Larger log-distance means closer; keep the closest at the
            // front.
            let pos = qcb
                .pending
                .iter()
                .position(|p| n.dist > p.dist)
                .unwrap_or(qcb.pending.len());
            qcb.pending.insert(pos, n);
        }
        while qcb.pending.len() > cap {
            qcb.pending.pop_back();
        }
    }

    fn update_result(result: &mut Vec<ResultInfo>, info: ResultInfo) {
        if result.iter().any(|r| r.node.id == info.node.id) {
            return;
        }
        let pos = result
            .iter()
            .position(|r| info.dist > r.dist)
            .unwrap_or(result.len());
        result.insert(pos, info);
    }

    /// Move pending peers into active probe instances until the
    /// concurrency cap is reached.
    fn put_actived(&mut self, target: &DsKey) {
        let max_insts = self.cfg.max_act_insts;
        let inst_expired = self.cfg.qry_inst_expired;
        let local = self.local;
        let Some(qcb) = self.qcb_tab.get_mut(target) else { return };

        while qcb.actived.len() < max_insts {
            let Some(pi) = qcb.pending.pop_front() else { break };
            if qcb.actived.contains_key(&pi.node.id) {
                trace!(peer = %pi.node.id, "already actived, skipped");
                continue;
            }

            self.inst_seq += 1;
            let id = self.inst_seq;
            let task = spawn_probe(ProbeCtx {
                id,
                local,
                target: *target,
                for_what: qcb.for_what,
                payload: qcb.payload.clone(),
                peer: pi.node,
                expired: inst_expired,
                con: self.con.clone(),
                qry_tx: self.cmd_tx.clone(),
            });
            qcb.history.insert(pi.node.id, pi.depth);
            qcb.width = qcb.history.len();
            qcb.actived.insert(
                pi.node.id,
                Icb { state: IcbState::Inited, depth: pi.depth, task },
            );
        }
    }

    // ------------------------------------------------------------------
    // Instance completion
    // ------------------------------------------------------------------

    async fn inst_result(&mut self, target: DsKey, mut outcome: InstOutcome) {
        let local_id = self.local.id;
        let Some(qcb) = self.qcb_tab.get_mut(&target) else {
            trace!(target = ?target, "instance result for unknown target");
            return;
        };
        let Some(icb) = qcb.actived.get(&outcome.from.id) else {
            trace!(peer = %outcome.from.id, "instance result from unknown peer");
            return;
        };
        let inst_depth = icb.depth;

        if outcome.eno.is_ok() {
            // Record the responder's observed latency.
            self.rut
                .update(vec![outcome.from], vec![outcome.latency])
                .await;
        }

        let Some(qcb) = self.qcb_tab.get_mut(&target) else { return };

        // Self-filter: never chase our own identity.
        outcome.peers.retain(|p| p.id != local_id);

        let mut dists = Vec::with_capacity(outcome.peers.len());
        for peer in &outcome.peers {
            let dist = log2_dist(&target, &peer.id.hash());
            dists.push(dist);
            Self::update_result(&mut qcb.result, ResultInfo { node: *peer, dist });
        }

        // Terminal conditions.
        let terminal = match qcb.for_what {
            ForWhat::FindNode => outcome.peers.iter().any(|p| p.id.hash() == target),
            ForWhat::GetValue => outcome.value.as_ref().is_some_and(|v| !v.is_empty()),
            ForWhat::GetProvider => outcome.provider.is_some(),
            ForWhat::PutValue | ForWhat::PutProvider => false,
        };
        if terminal {
            let value = outcome.value.take();
            let providers = outcome
                .provider
                .take()
                .map(|p| p.nodes)
                .unwrap_or_default();
            self.report(&target, Errno::None, value, providers).await;
            self.delete_qcb(&target, "target found").await;
            return;
        }

        // Retire the instance and extend the walk.
        if let Some(icb) = qcb.actived.remove(&outcome.from.id) {
            trace!(peer = %outcome.from.id, state = ?icb.state, "probe instance retired");
            icb.task.abort();
        }
        if inst_depth > qcb.depth {
            qcb.depth = inst_depth;
        }

        if outcome.eno.is_ok() && !qcb.for_what.is_put() {
            if qcb.depth > self.cfg.max_depth || qcb.width >= self.cfg.max_width {
                debug!(
                    target = ?target,
                    depth = qcb.depth,
                    width = qcb.history.len(),
                    "query bounds hit"
                );
                self.report(&target, Errno::NotFound, None, Vec::new()).await;
                self.delete_qcb(&target, "bounds").await;
                return;
            }

            let next: Vec<PendingInfo> = outcome
                .peers
                .iter()
                .zip(dists.iter())
                .map(|(node, dist)| PendingInfo {
                    node: *node,
                    dist: *dist,
                    depth: inst_depth + 1,
                })
                .collect();
            let Some(qcb) = self.qcb_tab.get_mut(&target) else { return };
            Self::put_pending(qcb, next, self.cfg.max_pendings);
        }

        self.put_actived(&target);
        self.finish_if_drained(&target).await;
    }

    /// A query with nothing pending and nothing active is over: read
    /// paths report NotFound, PUT paths report success.
    async fn finish_if_drained(&mut self, target: &DsKey) {
        let Some(qcb) = self.qcb_tab.get(target) else { return };
        if !qcb.pending.is_empty() || !qcb.actived.is_empty() {
            return;
        }
        let eno = if qcb.for_what.is_put() { Errno::None } else { Errno::NotFound };
        self.report(target, eno, None, Vec::new()).await;
        self.delete_qcb(target, "drained").await;
    }

    async fn route_note(&mut self, note: RouteNotification) {
        let target = note.target;
        let Some(qcb) = self.qcb_tab.get_mut(&target) else {
            trace!(target = ?target, "route notification for unknown target");
            return;
        };
        if qcb.status != QcbStatus::Inited {
            return;
        }
        let fresh: Vec<PendingInfo> = note
            .peers
            .iter()
            .zip(note.dists.iter())
            .map(|(entry, dist)| PendingInfo { node: entry.node, dist: *dist, depth: 0 })
            .collect();
        Self::put_pending(qcb, fresh, self.cfg.max_pendings);
        self.put_actived(&target);
        self.finish_if_drained(&target).await;
    }

    // ------------------------------------------------------------------
    // Reporting and teardown
    // ------------------------------------------------------------------

    async fn report(
        &mut self,
        target: &DsKey,
        eno: Errno,
        value: Option<Vec<u8>>,
        providers: Vec<Node>,
    ) {
        let Some(qcb) = self.qcb_tab.get(target) else { return };
        let ind = QueryResultInd {
            eno,
            for_what: qcb.for_what,
            target: qcb.target,
            peers: qcb.result.iter().map(|r| r.node).collect(),
            value,
            providers,
        };
        if qcb.owner.send(ind).await.is_err() {
            trace!(target = ?target, "query owner gone");
        }
    }

    async fn delete_qcb(&mut self, target: &DsKey, why: &str) -> Errno {
        let Some(qcb) = self.qcb_tab.remove(target) else {
            return Errno::NotFound;
        };
        trace!(target = ?target, why, "query control block deleted");
        if let Some(expire) = qcb.expire {
            expire.abort();
        }
        for (_, icb) in qcb.actived {
            icb.task.abort();
        }
        if qcb.ntf_flag {
            self.rut.unsubscribe(QRY_NOTIFEE_TOKEN, *target).await;
        }
        Errno::None
    }

    // ------------------------------------------------------------------
    // NAT interaction
    // ------------------------------------------------------------------

    async fn nat_event(&mut self, ev: NatEvent) {
        match ev {
            NatEvent::Ready { nat_type } => {
                if nat_type == crate::nat::NatType::None {
                    self.pub_tcp = Some((self.local.ip, self.local.tcp));
                    return;
                }
                if let Some(nat) = &self.nat {
                    nat.make_map(NatProto::Tcp, self.local.tcp).await;
                }
            }
            NatEvent::MakeMapRsp { proto, pub_ip, pub_port, status } => {
                if proto != NatProto::Tcp {
                    return;
                }
                self.nat_tcp_ok = status == NatStatus::Ok;
                if self.nat_tcp_ok {
                    debug!(%pub_ip, pub_port, "public dht address mapped");
                    self.pub_tcp = Some((pub_ip, pub_port));
                    self.local.ip = pub_ip;
                    self.local.tcp = pub_port;
                    self.con.set_local(self.local).await;
                } else {
                    self.pub_tcp = None;
                }
            }
            NatEvent::PubAddrUpdate { proto, pub_ip, pub_port, status } => {
                if proto != NatProto::Tcp {
                    return;
                }
                let old_ok = self.nat_tcp_ok;
                self.nat_tcp_ok = status == NatStatus::Ok;
                if !self.nat_tcp_ok {
                    debug!("public address update with bad status, kept");
                    return;
                }
                let changed = self.pub_tcp != Some((pub_ip, pub_port));
                self.pub_tcp = Some((pub_ip, pub_port));
                if !old_ok || changed {
                    self.nat_map_switch(pub_ip, pub_port).await;
                }
            }
        }
    }

    /// The mapped public address changed: every outstanding query is
    /// terminated with `NatMapping`, the advertised record switches, and
    /// the DHT façade is told.
    async fn nat_map_switch(&mut self, ip: IpAddr, port: u16) {
        let targets: Vec<DsKey> = self.qcb_tab.keys().cloned().collect();
        debug!(count = targets.len(), %ip, port, "nat switch: failing outstanding queries");
        for target in targets {
            self.report(&target, Errno::NatMapping, None, Vec::new()).await;
            self.delete_qcb(&target, "public address switch").await;
        }
        self.local.ip = ip;
        self.local.tcp = port;
        self.con.set_local(self.local).await;
        if self
            .addr_switch_tx
            .send(PubAddrSwitchInd { ip, tcp: port })
            .await
            .is_err()
        {
            trace!("address switch indication dropped: facade gone");
        }
    }
}

// ============================================================================
// Probe instances
// ============================================================================

struct ProbeCtx {
    id: u64,
    local: Node,
    target: DsKey,
    for_what: ForWhat,
    payload: QueryPayload,
    peer: Node,
    expired: Duration,
    con: ConnHandle,
    qry_tx: mpsc::Sender<QryCmd>,
}

/// Run one probe: connect through the connection manager, issue the
/// per-kind request, await the response under the instance expiry, and
/// report the outcome back to the query manager.
fn spawn_probe(ctx: ProbeCtx) -> JoinHandle<()> {
    tokio::spawn(async move {
        let begin = Instant::now();
        let _ = ctx
            .qry_tx
            .send(QryCmd::InstStatus {
                target: ctx.target,
                peer: ctx.peer.id,
                state: IcbState::WaitConnect,
            })
            .await;

        let outcome = match ctx.for_what {
            ForWhat::FindNode => {
                let req = DhtMessage::FindNode {
                    from: ctx.local,
                    to: ctx.peer,
                    id: ctx.id,
                    target: ctx.target,
                };
                probe_request(&ctx, req, begin).await
            }
            ForWhat::GetValue => {
                let req = DhtMessage::GetValueReq {
                    from: ctx.local,
                    to: ctx.peer,
                    id: ctx.id,
                    key: ctx.target,
                };
                probe_request(&ctx, req, begin).await
            }
            ForWhat::GetProvider => {
                let req = DhtMessage::GetProviderReq {
                    from: ctx.local,
                    to: ctx.peer,
                    id: ctx.id,
                    key: ctx.target,
                };
                probe_request(&ctx, req, begin).await
            }
            ForWhat::PutValue => {
                let msg = DhtMessage::PutValue {
                    from: ctx.local,
                    to: ctx.peer,
                    id: ctx.id,
                    key: ctx.target,
                    value: ctx.payload.value.clone().unwrap_or_default(),
                };
                let eno = ctx.con.send(ctx.peer, msg).await;
                InstOutcome {
                    eno,
                    from: ctx.peer,
                    latency: begin.elapsed(),
                    peers: Vec::new(),
                    value: None,
                    provider: None,
                }
            }
            ForWhat::PutProvider => {
                let provider = ctx.payload.provider.clone().unwrap_or(Provider {
                    key: ctx.target,
                    nodes: Vec::new(),
                });
                let msg = DhtMessage::PutProvider {
                    from: ctx.local,
                    to: ctx.peer,
                    id: ctx.id,
                    provider,
                };
                let eno = ctx.con.send(ctx.peer, msg).await;
                InstOutcome {
                    eno,
                    from: ctx.peer,
                    latency: begin.elapsed(),
                    peers: Vec::new(),
                    value: None,
                    provider: None,
                }
            }
        };

        let _ = ctx
            .qry_tx
            .send(QryCmd::InstStatus {
                target: ctx.target,
                peer: ctx.peer.id,
                state: if outcome.eno.is_ok() { IcbState::DoneOk } else { IcbState::Done },
            })
            .await;
        let _ = ctx
            .qry_tx
            .send(QryCmd::InstResult { target: ctx.target, outcome })
            .await;
    })
}

async fn probe_request(ctx: &ProbeCtx, req: DhtMessage, begin: Instant) -> InstOutcome {
    let _ = ctx
        .qry_tx
        .send(QryCmd::InstStatus {
            target: ctx.target,
            peer: ctx.peer.id,
            state: IcbState::WaitResponse,
        })
        .await;

    let rsp = ctx.con.request(ctx.peer, req, ctx.expired).await;
    let latency = begin.elapsed();
    match rsp {
        Ok(DhtMessage::Neighbors { nodes, .. }) => InstOutcome {
            eno: Errno::None,
            from: ctx.peer,
            latency,
            peers: nodes,
            value: None,
            provider: None,
        },
        Ok(DhtMessage::GetValueRsp { value, nodes, .. }) => InstOutcome {
            eno: Errno::None,
            from: ctx.peer,
            latency,
            peers: nodes,
            value,
            provider: None,
        },
        Ok(DhtMessage::GetProviderRsp { provider, nodes, .. }) => InstOutcome {
            eno: Errno::None,
            from: ctx.peer,
            latency,
            peers: nodes,
            value: None,
            provider,
        },
        Ok(other) => {
            debug!(peer = %ctx.peer.id, msg = ?other, "mismatched probe response");
            InstOutcome {
                eno: Errno::Mismatched,
                from: ctx.peer,
                latency,
                peers: Vec::new(),
                value: None,
                provider: None,
            }
        }
        Err(eno) => InstOutcome {
            eno,
            from: ctx.peer,
            latency,
            peers: Vec::new(),
            value: None,
            provider: None,
        },
    }
}
