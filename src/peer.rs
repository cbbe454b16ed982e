//! # Peer Manager (PEM) and Peer Instance (PI)
//!
//! The node's application-level TCP session fabric, separate from the
//! DHT overlay. The manager is partitioned by sub-network identity:
//! every sub-network has its own admission caps and worker table, and a
//! peer handshakes against exactly one sub-network.
//!
//! ## Instance lifecycle
//!
//! ```text
//! outbound: ConnOut ──dial──> Connected ──handshake──> Handshook ──admit──> Activated
//! inbound:  Accepted ─────────handshake──────────────> Handshook ──admit──> Activated
//! any:      ... ──CloseReq/CloseInd──> Killing ──> Killed
//! ```
//!
//! Admission enforces per-sub-network caps and resolves inbound/outbound
//! duplicates by comparing instance states; ties fall to a seeded coin
//! toss so tests can pin the outcome. An activated instance runs two
//! dedicated I/O workers (RX and TX) plus a heartbeat: a ping is sent
//! every cycle, and a counter cleared by incoming pings (or matching
//! pongs) closes the session with `PingpongThreshold` after eight silent
//! cycles.
//!
//! Consumers observe sessions through a bounded indication channel.
//! Overflowing it means indications would be lost, which the design
//! treats as fatal: the producer panics.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::errno::Errno;
use crate::identity::{Direction, Node, NodeId, SubNetId, STATIC_SUBNET};
use crate::messages::{
    recv_message, send_message, Handshake, P2pMessage, P2pPackage, PeerPid, Protocol,
};
use crate::nat::{NatEvent, NatHandle, NatProto, NatStatus, NatType};
use crate::routing::RouteHandle;

/// Mailbox bound of the peer manager.
const PEM_MAILBOX: usize = 1024;

/// Mailbox bound of one peer instance.
const PI_MAILBOX: usize = 32;

// ============================================================================
// Public surface
// ============================================================================

/// Session peer description delivered with `Activated`.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub snid: SubNetId,
    pub node: Node,
    pub dir: Direction,
    pub proto_num: u32,
    pub protocols: Vec<Protocol>,
}

/// Indications delivered to the session consumer. `Activated` carries
/// the per-peer receive channel for EXT packages.
#[derive(Debug)]
pub enum PeerIndication {
    Activated {
        info: PeerInfo,
        rx: mpsc::Receiver<P2pPackage>,
    },
    Closed {
        snid: SubNetId,
        id: NodeId,
    },
}

/// Candidate source for dynamic sub-networks.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Up to `count` dial candidates for `snid`.
    async fn find_node(&self, snid: SubNetId, count: usize) -> Vec<Node>;
}

/// Discovery that never finds anyone; static-only and test setups.
pub struct NoDiscovery;

#[async_trait]
impl Discovery for NoDiscovery {
    async fn find_node(&self, _snid: SubNetId, _count: usize) -> Vec<Node> {
        Vec::new()
    }
}

/// Per-sub-network counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubnetCounters {
    pub wrk_num: usize,
    pub obp_num: usize,
    pub ibp_num: usize,
}

/// Point-in-time view of the manager's tables.
#[derive(Clone, Debug, Default)]
pub struct PemSnapshot {
    pub per_subnet: Vec<(SubNetId, SubnetCounters)>,
    pub ibp_total: usize,
    pub workers: Vec<(SubNetId, NodeId, Direction)>,
    /// Establish history per peer: (ok, failed).
    pub stats: Vec<(NodeId, u32, u32)>,
}

/// Peer instance states, ordered for duplicate resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PiState {
    Null,
    ConnOut,
    Accepted,
    Connected,
    Handshook,
    Activated,
    Killing,
    Killed,
}

/// Static-node dialing status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StaticStatus {
    Idle,
    ConnectOutInited,
    Activated,
    Killing,
}

// ============================================================================
// Manager commands and handle
// ============================================================================

enum PemCmd {
    Start,
    OutboundReq {
        snid: Option<SubNetId>,
    },
    Accepted {
        stream: TcpStream,
        remote: SocketAddr,
    },
    ConnOutRsp {
        result: Errno,
        inst: u64,
    },
    HandshakeRsp {
        result: Errno,
        inst: u64,
        hs: Option<Handshake>,
    },
    CloseReq {
        snid: SubNetId,
        id: NodeId,
        reply: oneshot::Sender<Errno>,
    },
    CloseCfm {
        result: Errno,
        inst: u64,
    },
    CloseInd {
        cause: Errno,
        inst: u64,
    },
    DcvNodes {
        snid: SubNetId,
        nodes: Vec<Node>,
    },
    DcvTimer {
        snid: SubNetId,
    },
    SendPackage {
        snid: SubNetId,
        ids: Vec<NodeId>,
        payload: Vec<u8>,
        reply: oneshot::Sender<(Errno, Vec<NodeId>)>,
    },
    Nat(NatEvent),
    Snapshot {
        reply: oneshot::Sender<PemSnapshot>,
    },
    PowerOff {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-able handle to the peer manager task.
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<PemCmd>,
}

impl PeerHandle {
    /// Begin serving: start the accepter and drive the first outbound
    /// round.
    pub async fn start(&self) {
        let _ = self.tx.send(PemCmd::Start).await;
    }

    /// Enqueue an EXT package to each named worker of `snid`. Returns
    /// the ids whose queue was missing or full.
    pub async fn send_package(
        &self,
        snid: SubNetId,
        ids: Vec<NodeId>,
        payload: Vec<u8>,
    ) -> (Errno, Vec<NodeId>) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PemCmd::SendPackage { snid, ids, payload, reply })
            .await
            .is_err()
        {
            return (Errno::Scheduler, Vec::new());
        }
        rx.await.unwrap_or((Errno::Scheduler, Vec::new()))
    }

    /// Close an activated session.
    pub async fn close_peer(&self, snid: SubNetId, id: NodeId) -> Errno {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PemCmd::CloseReq { snid, id, reply })
            .await
            .is_err()
        {
            return Errno::Scheduler;
        }
        rx.await.unwrap_or(Errno::Scheduler)
    }

    /// Deliver a NAT manager event.
    pub async fn nat_event(&self, ev: NatEvent) {
        let _ = self.tx.send(PemCmd::Nat(ev)).await;
    }

    /// Current counters and worker tables.
    pub async fn snapshot(&self) -> PemSnapshot {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PemCmd::Snapshot { reply }).await.is_err() {
            return PemSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Broadcast power-off to every instance and stop the manager.
    pub async fn power_off(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PemCmd::PowerOff { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// Instance commands
// ============================================================================

enum PiCmd {
    ConnOutReq,
    HandshakeReq,
    EstablishedInd {
        data_rx: mpsc::Receiver<P2pPackage>,
        consumer_tx: mpsc::Sender<P2pPackage>,
    },
    CloseReq,
    PowerOff,
}

/// Events from the RX/TX workers back to their instance task.
enum PiEvent {
    Message(P2pMessage),
    RxError(Errno),
    TxError(Errno),
}

/// Establish history per peer identity.
#[derive(Clone, Copy, Debug)]
struct PeerHistory {
    ok: u32,
    failed: u32,
}

struct PiRef {
    tx: mpsc::Sender<PiCmd>,
    state: PiState,
    dir: Direction,
    snid: Option<SubNetId>,
    node: Option<Node>,
    killing: bool,
    created: Instant,
    /// Sender of the per-peer outbound queue, present once activated.
    data_tx: Option<mpsc::Sender<P2pPackage>>,
    task: JoinHandle<()>,
}

// ============================================================================
// Peer manager actor
// ============================================================================

/// The peer manager actor. Owns every table keyed by sub-network and
/// mutates them only from its own task.
pub struct PeerMgr {
    cfg: Config,
    /// Local record used in future handshakes; NAT updates it.
    local: Node,
    subnet_ids: Vec<SubNetId>,
    discovery: std::sync::Arc<dyn Discovery>,
    rut: Option<RouteHandle>,
    nat: Option<NatHandle>,
    inst_seq: u64,
    peers: HashMap<u64, PiRef>,
    nodes: HashMap<(SubNetId, NodeId, Direction), u64>,
    workers: HashMap<(SubNetId, NodeId, Direction), u64>,
    counters: HashMap<SubNetId, SubnetCounters>,
    ibp_total: usize,
    randoms: HashMap<SubNetId, Vec<Node>>,
    statics_status: HashMap<NodeId, StaticStatus>,
    stats: HashMap<NodeId, PeerHistory>,
    dcv_timers: HashMap<SubNetId, JoinHandle<()>>,
    accept_paused: watch::Sender<bool>,
    ind_tx: mpsc::Sender<PeerIndication>,
    cmd_rx: mpsc::Receiver<PemCmd>,
    cmd_tx: mpsc::Sender<PemCmd>,
    rng: StdRng,
}

impl PeerMgr {
    /// Spawn the peer manager and its accepter over `listener`. The
    /// returned receiver carries `Activated`/`Closed` indications.
    pub fn spawn(
        cfg: Config,
        listener: TcpListener,
        discovery: std::sync::Arc<dyn Discovery>,
        rut: Option<RouteHandle>,
        nat: Option<NatHandle>,
    ) -> (PeerHandle, mpsc::Receiver<PeerIndication>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(PEM_MAILBOX);
        let (ind_tx, ind_rx) = mpsc::channel(cfg.peer.ind_queue_len);
        let (pause_tx, pause_rx) = watch::channel(false);

        // Accepter task: hands accepted sockets to the manager and
        // parks while paused.
        {
            let accept_tx = cmd_tx.clone();
            let mut paused = pause_rx;
            tokio::spawn(async move {
                loop {
                    while *paused.borrow() {
                        if paused.changed().await.is_err() {
                            return;
                        }
                    }
                    match listener.accept().await {
                        Ok((stream, remote)) => {
                            if accept_tx
                                .send(PemCmd::Accepted { stream, remote })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "session accept failed");
                            return;
                        }
                    }
                }
            });
        }

        let mut statics_status = HashMap::new();
        for sn in &cfg.static_nodes {
            statics_status.insert(sn.id, StaticStatus::Idle);
        }

        let mgr = PeerMgr {
            local: cfg.local,
            subnet_ids: cfg.subnet_ids(),
            rng: StdRng::seed_from_u64(cfg.tiebreak_seed),
            cfg,
            discovery,
            rut,
            nat,
            inst_seq: 0,
            peers: HashMap::new(),
            nodes: HashMap::new(),
            workers: HashMap::new(),
            counters: HashMap::new(),
            ibp_total: 0,
            randoms: HashMap::new(),
            statics_status,
            stats: HashMap::new(),
            dcv_timers: HashMap::new(),
            accept_paused: pause_tx,
            ind_tx,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(mgr.run());
        (PeerHandle { tx: cmd_tx }, ind_rx)
    }

    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                PemCmd::Start => {
                    info!(name = %self.cfg.name, "peer manager started");
                    self.outbound_req(None).await;
                }
                PemCmd::OutboundReq { snid } => self.outbound_req(snid).await,
                PemCmd::Accepted { stream, remote } => self.accepted(stream, remote).await,
                PemCmd::ConnOutRsp { result, inst } => self.conn_out_rsp(result, inst).await,
                PemCmd::HandshakeRsp { result, inst, hs } => {
                    self.handshake_rsp(result, inst, hs).await;
                }
                PemCmd::CloseReq { snid, id, reply } => {
                    let _ = reply.send(self.close_req(snid, id).await);
                }
                PemCmd::CloseCfm { result, inst } => {
                    if result.is_err() {
                        debug!(inst, %result, "close confirm with error");
                    }
                    self.kill_inst(inst, true).await;
                }
                PemCmd::CloseInd { cause, inst } => {
                    debug!(inst, %cause, "session closed by peer or io failure");
                    self.kill_inst(inst, true).await;
                }
                PemCmd::DcvNodes { snid, nodes } => self.dcv_nodes(snid, nodes).await,
                PemCmd::DcvTimer { snid } => {
                    self.dcv_timers.remove(&snid);
                    self.outbound_req(Some(snid)).await;
                }
                PemCmd::SendPackage { snid, ids, payload, reply } => {
                    let _ = reply.send(self.send_package(snid, ids, payload));
                }
                PemCmd::Nat(ev) => self.nat_event(ev).await,
                PemCmd::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                PemCmd::PowerOff { reply } => {
                    debug!("peer manager: power off");
                    for (_, piref) in self.peers.drain() {
                        let _ = piref.tx.try_send(PiCmd::PowerOff);
                    }
                    for (_, timer) in self.dcv_timers.drain() {
                        timer.abort();
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    fn counters_mut(&mut self, snid: SubNetId) -> &mut SubnetCounters {
        self.counters.entry(snid).or_default()
    }

    fn snapshot(&self) -> PemSnapshot {
        let mut per_subnet: Vec<(SubNetId, SubnetCounters)> =
            self.counters.iter().map(|(k, v)| (*k, *v)).collect();
        per_subnet.sort_by_key(|(snid, _)| *snid);
        PemSnapshot {
            per_subnet,
            ibp_total: self.ibp_total,
            workers: self.workers.keys().cloned().collect(),
            stats: self
                .stats
                .iter()
                .map(|(id, h)| (*id, h.ok, h.failed))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Outbound driver
    // ------------------------------------------------------------------

    async fn outbound_req(&mut self, snid: Option<SubNetId>) {
        if self.cfg.no_dial || self.cfg.bootstrap_node {
            trace!("outbound abandoned: dialing disabled");
            return;
        }

        let targets: Vec<SubNetId> = match snid {
            Some(snid) => vec![snid],
            None => self.subnet_ids.clone(),
        };

        for snid in targets {
            let caps = self.cfg.caps_for(snid);
            let counters = *self.counters_mut(snid);
            if counters.wrk_num >= caps.max_peers {
                trace!(%snid, "outbound skipped: peers full");
                continue;
            }
            if counters.obp_num >= caps.max_outbounds {
                trace!(%snid, "outbound skipped: outbounds full");
                continue;
            }

            let mut candidates: Vec<Node> = if snid == STATIC_SUBNET {
                let mut cands: Vec<Node> = self
                    .cfg
                    .static_nodes
                    .iter()
                    .filter(|n| {
                        self.statics_status.get(&n.id) == Some(&StaticStatus::Idle)
                            && !self.nodes.contains_key(&(snid, n.id, Direction::Outbound))
                    })
                    .copied()
                    .collect();
                cands.shuffle(&mut self.rng);
                cands
            } else {
                self.randoms.remove(&snid).unwrap_or_default()
            };

            candidates.retain(|n| n.id != self.local.id);
            trace!(%snid, count = candidates.len(), "outbound candidates");

            for candidate in candidates {
                if self.nodes.contains_key(&(snid, candidate.id, Direction::Outbound)) {
                    continue;
                }
                self.create_outbound_inst(snid, candidate).await;
                if self.statics_status.contains_key(&candidate.id) {
                    self.statics_status
                        .insert(candidate.id, StaticStatus::ConnectOutInited);
                }
                if self.counters_mut(snid).obp_num >= caps.max_outbounds {
                    trace!(%snid, "outbound round full, remains discarded");
                    break;
                }
            }

            let obp = self.counters_mut(snid).obp_num;
            if obp < caps.max_outbounds {
                self.ask_for_more(snid, caps.max_outbounds - obp);
            }
        }
    }

    /// Ask discovery for more candidates (dynamic) or pace a retry
    /// (static), then re-enter the outbound driver for the sub-network.
    fn ask_for_more(&mut self, snid: SubNetId, more: usize) {
        if let Some(old) = self.dcv_timers.remove(&snid) {
            old.abort();
        }

        let delay = if snid == STATIC_SUBNET {
            self.cfg.peer.static_retry_timer
        } else {
            let discovery = self.discovery.clone();
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let nodes = discovery.find_node(snid, more).await;
                if !nodes.is_empty() {
                    let _ = cmd_tx.send(PemCmd::DcvNodes { snid, nodes }).await;
                }
            });
            self.cfg.peer.dcv_find_node_timer
        };

        let cmd_tx = self.cmd_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(PemCmd::DcvTimer { snid }).await;
        });
        self.dcv_timers.insert(snid, timer);
    }

    /// Discovery results: deduplicate against live instances, queued
    /// randoms and statics, cap the backlog, and re-drive dialing.
    async fn dcv_nodes(&mut self, snid: SubNetId, nodes: Vec<Node>) {
        let caps = self.cfg.caps_for(snid);
        let mut appended = 0usize;
        let randoms = self.randoms.entry(snid).or_default();
        for n in nodes {
            if n.id == self.cfg.local.id {
                continue;
            }
            let live = self.nodes.contains_key(&(snid, n.id, Direction::Outbound))
                || self.nodes.contains_key(&(snid, n.id, Direction::Inbound));
            if live
                || randoms.iter().any(|r| r.id == n.id)
                || self.cfg.static_nodes.iter().any(|s| s.id == n.id)
            {
                continue;
            }
            randoms.push(n);
            appended += 1;
            if randoms.len() >= caps.max_peers {
                debug!(%snid, "discovery backlog full, remains truncated");
                break;
            }
        }
        if appended > 0 {
            self.outbound_req(Some(snid)).await;
        }
    }

    async fn create_outbound_inst(&mut self, snid: SubNetId, node: Node) {
        self.inst_seq += 1;
        let inst = self.inst_seq;
        let (pi_tx, pi_rx) = mpsc::channel(PI_MAILBOX);

        let pi = PeerInst {
            inst,
            dir: Direction::Outbound,
            snid: Some(snid),
            local: self.local,
            node: Some(node),
            allowed_snids: self.subnet_ids.clone(),
            proto_num: self.cfg.proto_num,
            protocols: self.cfg.protocols.clone(),
            peer_cfg: self.cfg.peer.clone(),
            mgr_tx: self.cmd_tx.clone(),
        };
        let task = tokio::spawn(pi.run(pi_rx, None));

        self.peers.insert(
            inst,
            PiRef {
                tx: pi_tx.clone(),
                state: PiState::ConnOut,
                dir: Direction::Outbound,
                snid: Some(snid),
                node: Some(node),
                killing: false,
                created: Instant::now(),
                data_tx: None,
                task,
            },
        );
        self.nodes.insert((snid, node.id, Direction::Outbound), inst);
        self.counters_mut(snid).obp_num += 1;

        let _ = pi_tx.send(PiCmd::ConnOutReq).await;
        trace!(%snid, peer = %node.id, inst, "outbound instance created");
    }

    // ------------------------------------------------------------------
    // Inbound driver
    // ------------------------------------------------------------------

    async fn accepted(&mut self, stream: TcpStream, remote: SocketAddr) {
        if self.ibp_total >= self.cfg.peer.max_inbounds_total {
            debug!(%remote, "inbound rejected: global cap reached");
            drop(stream);
            self.pause_accept(true);
            return;
        }

        self.inst_seq += 1;
        let inst = self.inst_seq;
        let (pi_tx, pi_rx) = mpsc::channel(PI_MAILBOX);

        let pi = PeerInst {
            inst,
            dir: Direction::Inbound,
            snid: None,
            local: self.local,
            node: None,
            allowed_snids: self.subnet_ids.clone(),
            proto_num: self.cfg.proto_num,
            protocols: self.cfg.protocols.clone(),
            peer_cfg: self.cfg.peer.clone(),
            mgr_tx: self.cmd_tx.clone(),
        };
        let task = tokio::spawn(pi.run(pi_rx, Some(stream)));

        self.peers.insert(
            inst,
            PiRef {
                tx: pi_tx.clone(),
                state: PiState::Accepted,
                dir: Direction::Inbound,
                snid: None,
                node: None,
                killing: false,
                created: Instant::now(),
                data_tx: None,
                task,
            },
        );

        self.ibp_total += 1;
        if self.ibp_total >= self.cfg.peer.max_inbounds_total {
            debug!("inbound cap reached, pausing accepter");
            self.pause_accept(true);
        }

        let _ = pi_tx.send(PiCmd::HandshakeReq).await;
        trace!(%remote, inst, "inbound instance accepted");
    }

    fn pause_accept(&mut self, paused: bool) {
        let _ = self.accept_paused.send(paused);
    }

    // ------------------------------------------------------------------
    // Dial and handshake results
    // ------------------------------------------------------------------

    async fn conn_out_rsp(&mut self, result: Errno, inst: u64) {
        if result.is_ok() {
            if let Some(piref) = self.peers.get_mut(&inst) {
                piref.state = PiState::Connected;
                let _ = piref.tx.send(PiCmd::HandshakeReq).await;
            }
            return;
        }

        // Dial failed; the instance may already be gone from a duplicate
        // resolution round.
        let Some(node) = self.peers.get(&inst).map(|p| p.node) else {
            return;
        };
        if let Some(node) = node {
            self.record_fail(node.id);
        }
        debug!(inst, %result, "outbound connect failed");
        self.kill_inst(inst, false).await;
    }

    async fn handshake_rsp(&mut self, result: Errno, inst: u64, hs: Option<Handshake>) {
        // The instance may have been killed while the response was in
        // flight; discard the stale answer.
        let Some((dir, prev_node)) = self.peers.get(&inst).map(|p| (p.dir, p.node)) else {
            trace!(inst, "handshake response for dead instance");
            return;
        };

        if result.is_err() {
            debug!(inst, %result, "handshake failed");
            if let Some(node) = prev_node {
                self.record_fail(node.id);
                self.update_static_status(node.id, StaticStatus::Killing);
            }
            self.kill_inst(inst, false).await;
            return;
        }

        let Some(hs) = hs else {
            warn!(inst, "handshake ok without peer record");
            self.kill_inst(inst, false).await;
            return;
        };
        let snid = hs.snid;
        let node = hs.node();

        if let Some(piref) = self.peers.get_mut(&inst) {
            piref.state = PiState::Handshook;
            piref.snid = Some(snid);
            piref.node = Some(node);
        }

        // Per-sub-network inbound accounting becomes possible only now
        // that the handshake named the sub-network.
        if dir == Direction::Inbound {
            self.counters_mut(snid).ibp_num += 1;
        }

        // Admission: resolve caps for the sub-network.
        let caps = self.cfg.caps_for(snid);
        if self.counters_mut(snid).wrk_num >= caps.max_peers {
            debug!(%snid, peer = %node.id, "admission rejected: peers full");
            self.kill_inst(inst, false).await;
            return;
        }

        // A live same-direction twin for the identity: the newcomer
        // loses. Only inbound can hit this; outbound identities are
        // registered at creation.
        if dir == Direction::Inbound {
            if let Some(&twin) = self.nodes.get(&(snid, node.id, Direction::Inbound)) {
                if twin != inst {
                    debug!(%snid, peer = %node.id, "duplicated inbound instance");
                    self.kill_inst(inst, false).await;
                    return;
                }
            }
        }

        // An opposite-direction instance for the same identity:
        // state-compare kill, coin toss on ties. Whichever handshake
        // finishes second runs the resolution, so both the in-then-out
        // and out-then-in races end with exactly one survivor.
        if let Some(&other) = self.nodes.get(&(snid, node.id, dir.flip())) {
            let this_state = PiState::Handshook;
            let other_state = self.peers.get(&other).map(|p| p.state).unwrap_or(PiState::Null);
            let kill_this = match this_state.cmp(&other_state) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => self.rng.gen::<bool>(),
            };
            debug!(
                %snid,
                peer = %node.id,
                ?dir,
                ?this_state,
                ?other_state,
                kill_this,
                "duplicate session resolution"
            );
            let outbound_killed = (kill_this && dir == Direction::Outbound)
                || (!kill_this && dir == Direction::Inbound);
            if kill_this {
                self.kill_inst(inst, false).await;
            } else {
                self.kill_inst(other, false).await;
            }
            if outbound_killed {
                // The outbound side lost; give dialing another chance.
                self.drive_outbound_later(snid);
            }
            if kill_this {
                return;
            }
        }

        if dir == Direction::Inbound {
            self.nodes.insert((snid, node.id, Direction::Inbound), inst);
        }

        self.admit(inst, snid, node, dir).await;
    }

    /// Admit a handshook instance into the worker table and start its
    /// service machinery.
    async fn admit(&mut self, inst: u64, snid: SubNetId, node: Node, dir: Direction) {
        let (data_tx, data_rx) = mpsc::channel(self.cfg.peer.tx_queue_len);
        let (consumer_tx, consumer_rx) = mpsc::channel(self.cfg.peer.rx_queue_len);

        {
            let Some(piref) = self.peers.get_mut(&inst) else { return };
            piref.state = PiState::Activated;
            piref.data_tx = Some(data_tx);
            if piref
                .tx
                .send(PiCmd::EstablishedInd { data_rx, consumer_tx })
                .await
                .is_err()
            {
                warn!(inst, "established indication lost, killing instance");
                self.kill_inst(inst, false).await;
                return;
            }
        }

        self.workers.insert((snid, node.id, dir), inst);
        self.counters_mut(snid).wrk_num += 1;
        self.update_static_status(node.id, StaticStatus::Activated);
        self.stats
            .entry(node.id)
            .or_insert(PeerHistory { ok: 0, failed: 0 })
            .ok += 1;

        let info = PeerInfo {
            snid,
            node,
            dir,
            proto_num: self.cfg.proto_num,
            protocols: self.cfg.protocols.clone(),
        };
        info!(%snid, peer = %node.id, ?dir, "peer activated");

        // Indication loss means the consumer misses session lifecycle
        // events entirely; that is a contract violation, not a transient.
        self.indicate(PeerIndication::Activated { info, rx: consumer_rx });

        // Push the fresh worker into the routing table, except for the
        // static sub-network, which is not discovered.
        if snid != STATIC_SUBNET {
            if let Some(rut) = &self.rut {
                let latency = self
                    .peers
                    .get(&inst)
                    .map(|p| p.created.elapsed())
                    .unwrap_or_default();
                rut.update(vec![node], vec![latency]).await;
            }
        }
    }

    fn drive_outbound_later(&self, snid: SubNetId) {
        let _ = self.cmd_tx.try_send(PemCmd::OutboundReq { snid: Some(snid) });
    }

    // ------------------------------------------------------------------
    // Close paths
    // ------------------------------------------------------------------

    async fn close_req(&mut self, snid: SubNetId, id: NodeId) -> Errno {
        let inst = [Direction::Outbound, Direction::Inbound]
            .into_iter()
            .find_map(|dir| self.workers.get(&(snid, id, dir)).copied());
        let Some(inst) = inst else {
            return Errno::NotFound;
        };
        let Some(piref) = self.peers.get_mut(&inst) else {
            return Errno::NotFound;
        };
        if piref.killing {
            return Errno::Duplicated;
        }
        piref.killing = true;
        piref.state = PiState::Killing;
        let tx = piref.tx.clone();
        self.update_static_status(id, StaticStatus::Killing);
        let _ = tx.send(PiCmd::CloseReq).await;
        Errno::None
    }

    /// Remove an instance from every table, fix the counters, emit
    /// `Closed` when it had been activated, and resume the accepter if
    /// room opened up.
    async fn kill_inst(&mut self, inst: u64, redrive: bool) {
        let Some(piref) = self.peers.remove(&inst) else { return };
        let _ = piref.tx.try_send(PiCmd::PowerOff);

        let was_worker = piref.state >= PiState::Activated;
        let snid = piref.snid;
        let id = piref.node.map(|n| n.id);

        if let (Some(snid), Some(id)) = (snid, id) {
            self.nodes.remove(&(snid, id, piref.dir));
            if self.workers.remove(&(snid, id, piref.dir)).is_some() {
                let counters = self.counters_mut(snid);
                counters.wrk_num = counters.wrk_num.saturating_sub(1);
            }
        }

        match piref.dir {
            Direction::Outbound => {
                if let Some(snid) = snid {
                    let counters = self.counters_mut(snid);
                    counters.obp_num = counters.obp_num.saturating_sub(1);
                }
            }
            Direction::Inbound => {
                self.ibp_total = self.ibp_total.saturating_sub(1);
                if let Some(snid) = snid {
                    let counters = self.counters_mut(snid);
                    counters.ibp_num = counters.ibp_num.saturating_sub(1);
                }
            }
        }

        if let Some(id) = id {
            self.update_static_status(id, StaticStatus::Idle);
        }

        if was_worker {
            if let (Some(snid), Some(id)) = (snid, id) {
                self.indicate(PeerIndication::Closed { snid, id });
            }
        }

        if self.ibp_total < self.cfg.peer.max_inbounds_total {
            self.pause_accept(false);
        }

        if redrive && !self.cfg.no_dial && !self.cfg.bootstrap_node {
            if let Some(snid) = snid {
                self.drive_outbound_later(snid);
            }
        }
    }

    /// Queue overflow means the consumer is losing lifecycle events,
    /// which the design treats as fatal; a dropped receiver just means
    /// nobody is listening.
    fn indicate(&mut self, ind: PeerIndication) {
        match self.ind_tx.try_send(ind) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                panic!("peer indication queue overflow");
            }
        }
    }

    fn update_static_status(&mut self, id: NodeId, status: StaticStatus) {
        if let std::collections::hash_map::Entry::Occupied(mut e) = self.statics_status.entry(id) {
            e.insert(status);
        }
    }

    fn record_fail(&mut self, id: NodeId) {
        self.stats
            .entry(id)
            .or_insert(PeerHistory { ok: 0, failed: 0 })
            .failed += 1;
    }

    // ------------------------------------------------------------------
    // Data path and NAT
    // ------------------------------------------------------------------

    fn send_package(
        &mut self,
        snid: SubNetId,
        ids: Vec<NodeId>,
        payload: Vec<u8>,
    ) -> (Errno, Vec<NodeId>) {
        if ids.is_empty() {
            return (Errno::Parameter, Vec::new());
        }
        let mut failed = Vec::new();
        for id in ids {
            let inst = [Direction::Outbound, Direction::Inbound]
                .into_iter()
                .find_map(|dir| self.workers.get(&(snid, id, dir)).copied());
            let sent = inst
                .and_then(|inst| self.peers.get(&inst))
                .and_then(|piref| piref.data_tx.as_ref())
                .map(|tx| tx.try_send(P2pPackage::external(payload.clone())).is_ok())
                .unwrap_or(false);
            if !sent {
                trace!(%snid, peer = %id, "send failed: no worker or queue full");
                failed.push(id);
            }
        }
        if failed.is_empty() {
            (Errno::None, Vec::new())
        } else {
            (Errno::Unknown, failed)
        }
    }

    /// NAT updates apply to the local record used in future handshakes;
    /// established sessions stay up.
    async fn nat_event(&mut self, ev: NatEvent) {
        match ev {
            NatEvent::Ready { nat_type } => {
                if nat_type != NatType::None {
                    if let Some(nat) = &self.nat {
                        nat.make_map(NatProto::Tcp, self.local.tcp).await;
                    }
                }
            }
            NatEvent::MakeMapRsp { proto, pub_ip, pub_port, status }
            | NatEvent::PubAddrUpdate { proto, pub_ip, pub_port, status } => {
                if proto == NatProto::Tcp && status == NatStatus::Ok {
                    debug!(%pub_ip, pub_port, "local session record switched to public address");
                    self.local.ip = pub_ip;
                    self.local.tcp = pub_port;
                }
            }
        }
    }
}

// ============================================================================
// Peer instance
// ============================================================================

struct PeerInst {
    inst: u64,
    dir: Direction,
    snid: Option<SubNetId>,
    local: Node,
    node: Option<Node>,
    allowed_snids: Vec<SubNetId>,
    proto_num: u32,
    protocols: Vec<Protocol>,
    peer_cfg: crate::config::PeerConfig,
    mgr_tx: mpsc::Sender<PemCmd>,
}

impl PeerInst {
    /// Instance task body. Outbound instances dial on request; inbound
    /// ones arrive with their socket.
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PiCmd>, stream: Option<TcpStream>) {
        let mut stream = stream;

        // Phase 1 (outbound only): dial.
        if self.dir == Direction::Outbound {
            match self.wait_cmd(&mut cmd_rx).await {
                Some(PiCmd::ConnOutReq) => {}
                Some(PiCmd::CloseReq) => {
                    self.close_cfm(Errno::None).await;
                    return;
                }
                _ => return,
            }
            let peer = self.node.expect("outbound instance has a peer");
            let dial = timeout(self.peer_cfg.dial_timeout, TcpStream::connect(peer.tcp_addr())).await;
            match dial {
                Ok(Ok(s)) => {
                    stream = Some(s);
                    self.report(PemCmd::ConnOutRsp { result: Errno::None, inst: self.inst })
                        .await;
                }
                Ok(Err(err)) => {
                    debug!(peer = %peer.id, error = %err, "dial failed");
                    self.report(PemCmd::ConnOutRsp { result: Errno::Os, inst: self.inst })
                        .await;
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer.id, "dial timeout");
                    self.report(PemCmd::ConnOutRsp { result: Errno::Timeout, inst: self.inst })
                        .await;
                    return;
                }
            }
        }

        // Phase 2: handshake on request.
        match self.wait_cmd(&mut cmd_rx).await {
            Some(PiCmd::HandshakeReq) => {}
            Some(PiCmd::CloseReq) => {
                self.close_cfm(Errno::None).await;
                return;
            }
            _ => return,
        }
        let mut tcp = match stream.take() {
            Some(tcp) => tcp,
            None => {
                self.report(PemCmd::HandshakeRsp {
                    result: Errno::Internal,
                    inst: self.inst,
                    hs: None,
                })
                .await;
                return;
            }
        };

        let hs_result = timeout(self.peer_cfg.handshake_timeout, self.handshake(&mut tcp)).await;
        match hs_result {
            Ok(Ok(hs)) => {
                self.report(PemCmd::HandshakeRsp {
                    result: Errno::None,
                    inst: self.inst,
                    hs: Some(hs),
                })
                .await;
            }
            Ok(Err(eno)) => {
                self.report(PemCmd::HandshakeRsp { result: eno, inst: self.inst, hs: None })
                    .await;
                return;
            }
            Err(_) => {
                self.report(PemCmd::HandshakeRsp {
                    result: Errno::Timeout,
                    inst: self.inst,
                    hs: None,
                })
                .await;
                return;
            }
        };

        // Phase 3: wait for admission; the manager may instead kill us
        // during duplicate resolution.
        let (data_rx, consumer_tx) = match self.wait_cmd(&mut cmd_rx).await {
            Some(PiCmd::EstablishedInd { data_rx, consumer_tx }) => (data_rx, consumer_tx),
            Some(PiCmd::CloseReq) => {
                self.close_cfm(Errno::None).await;
                return;
            }
            _ => return,
        };

        self.serve(tcp, cmd_rx, data_rx, consumer_tx).await;
    }

    /// Next command, treating PowerOff as end-of-life.
    async fn wait_cmd(&self, cmd_rx: &mut mpsc::Receiver<PiCmd>) -> Option<PiCmd> {
        match cmd_rx.recv().await {
            Some(PiCmd::PowerOff) | None => None,
            other => other,
        }
    }

    async fn report(&self, cmd: PemCmd) {
        let _ = self.mgr_tx.send(cmd).await;
    }

    async fn close_cfm(&self, result: Errno) {
        self.report(PemCmd::CloseCfm { result, inst: self.inst }).await;
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Outbound writes first and verifies the answer; inbound reads
    /// first, checks the sub-network, then answers.
    async fn handshake(&mut self, tcp: &mut TcpStream) -> Result<Handshake, Errno> {
        match self.dir {
            Direction::Outbound => {
                let snid = self.snid.expect("outbound instance has a sub-network");
                let dialed = self.node.expect("outbound instance has a peer");
                let local_hs =
                    Handshake::from_local(snid, &self.local, self.proto_num, &self.protocols);
                send_p2p(tcp, &P2pMessage::Handshake(local_hs)).await?;

                let peer_hs = recv_handshake(tcp).await?;
                if peer_hs.node_id != dialed.id {
                    debug!(expected = %dialed.id, got = %peer_hs.node_id, "handshake identity mismatch");
                    return Err(Errno::Mismatched);
                }
                if peer_hs.snid != snid {
                    debug!(%snid, got = %peer_hs.snid, "handshake sub-network mismatch");
                    return Err(Errno::Mismatched);
                }
                // Adopt the responder's advertised endpoint.
                self.node = Some(peer_hs.node());
                Ok(peer_hs)
            }
            Direction::Inbound => {
                let peer_hs = recv_handshake(tcp).await?;
                if !self.allowed_snids.contains(&peer_hs.snid) {
                    debug!(got = %peer_hs.snid, "handshake against unknown sub-network");
                    return Err(Errno::Mismatched);
                }
                self.snid = Some(peer_hs.snid);
                self.node = Some(peer_hs.node());

                let local_hs = Handshake::from_local(
                    peer_hs.snid,
                    &self.local,
                    self.proto_num,
                    &self.protocols,
                );
                send_p2p(tcp, &P2pMessage::Handshake(local_hs)).await?;
                Ok(peer_hs)
            }
        }
    }

    // ------------------------------------------------------------------
    // Active session
    // ------------------------------------------------------------------

    /// Activated service: two I/O workers plus the heartbeat loop.
    async fn serve(
        self,
        tcp: TcpStream,
        mut cmd_rx: mpsc::Receiver<PiCmd>,
        data_rx: mpsc::Receiver<P2pPackage>,
        consumer_tx: mpsc::Sender<P2pPackage>,
    ) {
        let (read_half, write_half) = tcp.into_split();
        let (event_tx, mut event_rx) = mpsc::channel::<PiEvent>(PI_MAILBOX);
        let (tx_done, tx_done_rx) = oneshot::channel::<()>();

        // Heartbeats go through a dedicated queue merged by the TX
        // worker, so a full consumer data queue cannot starve liveness.
        let (hb_tx, hb_rx) = mpsc::channel::<P2pPackage>(8);

        let rx_task = tokio::spawn(rx_worker(read_half, event_tx.clone(), consumer_tx));
        let tx_task = tokio::spawn(tx_worker(write_half, data_rx, hb_rx, event_tx, tx_done_rx));

        let mut pingpong = tokio::time::interval(self.peer_cfg.pingpong_cycle);
        pingpong.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        pingpong.tick().await;

        let mut pp_seq: u64 = 0;
        let mut pp_cnt: u32 = 0;
        let mut tx_done = Some(tx_done);

        let close_cause = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(PiCmd::CloseReq) => break None,
                        Some(PiCmd::PowerOff) | None => break Some(Errno::None),
                        Some(_) => {}
                    }
                }
                ev = event_rx.recv() => {
                    match ev {
                        Some(PiEvent::Message(P2pMessage::Ping { seq })) => {
                            pp_cnt = 0;
                            let pong = P2pMessage::Pong { seq };
                            if let Ok(pkg) = P2pPackage::internal(&pong) {
                                let _ = hb_tx.try_send(pkg);
                            }
                        }
                        Some(PiEvent::Message(P2pMessage::Pong { seq })) => {
                            // A pong for any ping we actually sent clears
                            // the silence counter.
                            if seq < pp_seq {
                                pp_cnt = 0;
                            } else {
                                trace!(inst = self.inst, seq, pp_seq, "pong with unknown sequence");
                            }
                        }
                        Some(PiEvent::Message(P2pMessage::Handshake(_))) => {
                            // Renegotiation is not supported.
                            trace!(inst = self.inst, "handshake after activation discarded");
                        }
                        Some(PiEvent::RxError(eno)) | Some(PiEvent::TxError(eno)) => {
                            break Some(eno);
                        }
                        None => break Some(Errno::Internal),
                    }
                }
                _ = pingpong.tick() => {
                    pp_cnt += 1;
                    if pp_cnt > self.peer_cfg.pingpong_threshold {
                        debug!(inst = self.inst, pp_cnt, "pingpong threshold reached");
                        break Some(Errno::PingpongThreshold);
                    }
                    let ping = P2pMessage::Ping { seq: pp_seq };
                    pp_seq += 1;
                    if let Ok(pkg) = P2pPackage::internal(&ping) {
                        let _ = hb_tx.try_send(pkg);
                    }
                }
            }
        };

        // Drain and stop the TX worker, then the RX worker; dropping the
        // halves closes the socket.
        if let Some(done) = tx_done.take() {
            let _ = done.send(());
        }
        let _ = tx_task.await;
        rx_task.abort();

        match close_cause {
            // Local close request: confirm to the manager.
            None => self.close_cfm(Errno::None).await,
            // Power-off: the manager already forgot us.
            Some(Errno::None) => {}
            Some(cause) => {
                self.report(PemCmd::CloseInd { cause, inst: self.inst }).await;
            }
        }
    }
}

async fn send_p2p(tcp: &mut TcpStream, msg: &P2pMessage) -> Result<(), Errno> {
    let pkg = P2pPackage::internal(msg)?;
    send_message(tcp, &pkg).await
}

async fn recv_handshake(tcp: &mut TcpStream) -> Result<Handshake, Errno> {
    let pkg: P2pPackage = recv_message(tcp).await?;
    match pkg.to_message()? {
        P2pMessage::Handshake(hs) => Ok(hs),
        other => {
            debug!(msg = ?other, "expected handshake");
            Err(Errno::Message)
        }
    }
}

/// RX worker: reads frames for the life of the session. Internal
/// packages go to the instance task; EXT packages go to the consumer's
/// bounded channel, dropped with a log line when it is full.
async fn rx_worker(
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<PiEvent>,
    consumer_tx: mpsc::Sender<P2pPackage>,
) {
    loop {
        match recv_message::<_, P2pPackage>(&mut reader).await {
            Ok(pkg) => match pkg.pid {
                PeerPid::P2p => match pkg.to_message() {
                    Ok(msg) => {
                        if events.send(PiEvent::Message(msg)).await.is_err() {
                            return;
                        }
                    }
                    Err(eno) => {
                        let _ = events.send(PiEvent::RxError(eno)).await;
                        return;
                    }
                },
                PeerPid::Ext => {
                    if consumer_tx.try_send(pkg).is_err() {
                        debug!("consumer queue full, inbound package dropped");
                    }
                }
            },
            Err(eno) => {
                let _ = events.send(PiEvent::RxError(eno)).await;
                return;
            }
        }
    }
}

/// TX worker: drains the per-peer outbound queue and the heartbeat
/// queue. On the done signal it flushes whatever is already queued and
/// exits.
async fn tx_worker(
    mut writer: OwnedWriteHalf,
    mut data_rx: mpsc::Receiver<P2pPackage>,
    mut hb_rx: mpsc::Receiver<P2pPackage>,
    events: mpsc::Sender<PiEvent>,
    mut done: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut done => {
                while let Ok(pkg) = data_rx.try_recv() {
                    if send_message(&mut writer, &pkg).await.is_err() {
                        break;
                    }
                }
                return;
            }
            pkg = hb_rx.recv() => {
                let Some(pkg) = pkg else { return };
                if let Err(eno) = send_message(&mut writer, &pkg).await {
                    let _ = events.send(PiEvent::TxError(eno)).await;
                    return;
                }
            }
            pkg = data_rx.recv() => {
                let Some(pkg) = pkg else { return };
                if let Err(eno) = send_message(&mut writer, &pkg).await {
                    let _ = events.send(PiEvent::TxError(eno)).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_states_are_ordered_for_comparison() {
        assert!(PiState::Null < PiState::ConnOut);
        assert!(PiState::ConnOut < PiState::Accepted);
        assert!(PiState::Accepted < PiState::Connected);
        assert!(PiState::Connected < PiState::Handshook);
        assert!(PiState::Handshook < PiState::Activated);
        assert!(PiState::Activated < PiState::Killing);
    }

    #[test]
    fn seeded_coin_is_reproducible() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let flips_a: Vec<bool> = (0..32).map(|_| a.gen()).collect();
        let flips_b: Vec<bool> = (0..32).map(|_| b.gen()).collect();
        assert_eq!(flips_a, flips_b);
    }
}
