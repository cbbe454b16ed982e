//! # Connection Manager (CON)
//!
//! Maintains the physical TCP connections of the DHT overlay, one
//! instance per (peer, direction), and transmits framed [`DhtPackage`]s
//! on behalf of the query manager.
//!
//! Each instance is a spawned task owning its socket. Outbound instances
//! dial, exchange the DHT handshake, and then serve: outgoing requests
//! are correlated to responses by message id, while incoming requests on
//! the same connection are forwarded to the DHT manager for answering.
//! Inbound instances learn the peer identity from the handshake and then
//! serve identically.
//!
//! Status transitions are published as [`ConInstStatusInd`] on a bounded
//! channel. Inbound/outbound duplicates for the same peer are resolved by
//! instance-state comparison with a seeded coin toss on ties, the same
//! rule the peer manager applies to sessions.

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::DhtConfig;
use crate::errno::Errno;
use crate::identity::{Direction, Node, NodeId};
use crate::messages::{recv_message, send_message, DhtMessage, DhtPackage};

/// Mailbox bound of the connection manager.
const CON_MAILBOX: usize = 512;

/// Mailbox bound of one connection instance.
const INST_MAILBOX: usize = 32;

/// Connection instance states, ordered for duplicate resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConInstStatus {
    Null,
    Connecting,
    Connected,
    Accepted,
    InHandshaking,
    Handshaked,
    InService,
    Closed,
}

/// Status indication published to the DHT façade's status channel.
#[derive(Clone, Debug)]
pub struct ConInstStatusInd {
    pub peer: Option<NodeId>,
    pub dir: Direction,
    pub status: ConInstStatus,
}

/// An inbound DHT request handed to the DHT manager for answering.
/// `None` replies mean no response is sent.
pub struct InboundDhtRequest {
    pub msg: DhtMessage,
    pub reply: oneshot::Sender<Option<DhtMessage>>,
}

enum InstCmd {
    /// Send a request and resolve the matching response by id.
    Request {
        msg: DhtMessage,
        reply: oneshot::Sender<Result<DhtMessage, Errno>>,
    },
    /// Send without expecting a response.
    Send {
        msg: DhtMessage,
        reply: oneshot::Sender<Errno>,
    },
    /// Resolve once the instance reaches service state.
    AwaitReady { reply: oneshot::Sender<Errno> },
    Close,
}

enum InstEvent {
    Status {
        seq: u64,
        status: ConInstStatus,
        peer: Option<NodeId>,
    },
    Down {
        seq: u64,
    },
}

enum ConnCmd {
    Request {
        peer: Node,
        msg: DhtMessage,
        reply: oneshot::Sender<Result<DhtMessage, Errno>>,
    },
    Send {
        peer: Node,
        msg: DhtMessage,
        reply: oneshot::Sender<Errno>,
    },
    BlindConnect {
        peer: Node,
        reply: oneshot::Sender<Errno>,
    },
    Close {
        peer: NodeId,
        reply: oneshot::Sender<Errno>,
    },
    Accepted {
        stream: TcpStream,
        remote: SocketAddr,
    },
    /// Switch the local record used by future handshakes.
    SetLocal(Node),
    Inst(InstEvent),
    PowerOff,
}

/// Clone-able handle to the connection manager task.
#[derive(Clone)]
pub struct ConnHandle {
    tx: mpsc::Sender<ConnCmd>,
}

impl ConnHandle {
    /// Send a request to `peer`, creating an outbound instance when
    /// needed, and await the response bounded by `deadline`.
    pub async fn request(
        &self,
        peer: Node,
        msg: DhtMessage,
        deadline: std::time::Duration,
    ) -> Result<DhtMessage, Errno> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ConnCmd::Request { peer, msg, reply })
            .await
            .map_err(|_| Errno::Scheduler)?;
        match timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Errno::Os),
            Err(_) => Err(Errno::Timeout),
        }
    }

    /// Send a message without waiting for any response.
    pub async fn send(&self, peer: Node, msg: DhtMessage) -> Errno {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ConnCmd::Send { peer, msg, reply }).await.is_err() {
            return Errno::Scheduler;
        }
        rx.await.unwrap_or(Errno::Scheduler)
    }

    /// Establish a connection without sending anything.
    pub async fn blind_connect(&self, peer: Node) -> Errno {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ConnCmd::BlindConnect { peer, reply })
            .await
            .is_err()
        {
            return Errno::Scheduler;
        }
        rx.await.unwrap_or(Errno::Scheduler)
    }

    /// Switch the advertised local record; existing connections are
    /// untouched.
    pub async fn set_local(&self, local: Node) {
        let _ = self.tx.send(ConnCmd::SetLocal(local)).await;
    }

    /// Close all instances for `peer`.
    pub async fn close(&self, peer: NodeId) -> Errno {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ConnCmd::Close { peer, reply }).await.is_err() {
            return Errno::Scheduler;
        }
        rx.await.unwrap_or(Errno::Scheduler)
    }

    pub async fn power_off(&self) {
        let _ = self.tx.send(ConnCmd::PowerOff).await;
    }
}

struct InstInfo {
    key: Option<(NodeId, Direction)>,
    tx: mpsc::Sender<InstCmd>,
    status: ConInstStatus,
    dir: Direction,
}

/// The connection manager actor.
pub struct ConnMgr {
    cfg: DhtConfig,
    local: Node,
    seq: u64,
    instances: HashMap<u64, InstInfo>,
    by_key: HashMap<(NodeId, Direction), u64>,
    cmd_rx: mpsc::Receiver<ConnCmd>,
    cmd_tx: mpsc::Sender<ConnCmd>,
    server_tx: mpsc::Sender<InboundDhtRequest>,
    status_tx: mpsc::Sender<ConInstStatusInd>,
    rng: StdRng,
}

impl ConnMgr {
    /// Spawn the manager, and the accepter when a listener is given.
    pub fn spawn(
        cfg: DhtConfig,
        local: Node,
        tiebreak_seed: u64,
        server_tx: mpsc::Sender<InboundDhtRequest>,
        status_tx: mpsc::Sender<ConInstStatusInd>,
        listener: Option<TcpListener>,
    ) -> ConnHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(CON_MAILBOX);
        let mgr = ConnMgr {
            cfg,
            local,
            seq: 0,
            instances: HashMap::new(),
            by_key: HashMap::new(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            server_tx,
            status_tx,
            rng: StdRng::seed_from_u64(tiebreak_seed),
        };
        let handle = ConnHandle { tx: cmd_tx.clone() };

        if let Some(listener) = listener {
            let accept_tx = cmd_tx;
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, remote)) => {
                            if accept_tx
                                .send(ConnCmd::Accepted { stream, remote })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "dht accept failed");
                            break;
                        }
                    }
                }
            });
        }

        tokio::spawn(mgr.run());
        handle
    }

    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                // Instance mailboxes are drained from blocking I/O, so
                // the manager never awaits on them; a full or dead
                // mailbox fails the call instead.
                ConnCmd::Request { peer, msg, reply } => {
                    let tx = self.outbound_for(peer);
                    if let Err(err) = tx.try_send(InstCmd::Request { msg, reply }) {
                        debug!(peer = %peer.id, "request not deliverable to instance");
                        if let mpsc::error::TrySendError::Full(InstCmd::Request { reply, .. }) =
                            err
                        {
                            let _ = reply.send(Err(Errno::Resource));
                        }
                    }
                }
                ConnCmd::Send { peer, msg, reply } => {
                    let tx = self.outbound_for(peer);
                    if let Err(err) = tx.try_send(InstCmd::Send { msg, reply }) {
                        debug!(peer = %peer.id, "send not deliverable to instance");
                        if let mpsc::error::TrySendError::Full(InstCmd::Send { reply, .. }) = err {
                            let _ = reply.send(Errno::Resource);
                        }
                    }
                }
                ConnCmd::BlindConnect { peer, reply } => {
                    let tx = self.outbound_for(peer);
                    if let Err(err) = tx.try_send(InstCmd::AwaitReady { reply }) {
                        debug!(peer = %peer.id, "blind connect not deliverable to instance");
                        if let mpsc::error::TrySendError::Full(InstCmd::AwaitReady { reply }) = err
                        {
                            let _ = reply.send(Errno::Resource);
                        }
                    }
                }
                ConnCmd::Close { peer, reply } => {
                    let eno = self.close_peer(peer).await;
                    let _ = reply.send(eno);
                }
                ConnCmd::Accepted { stream, remote } => {
                    self.accept_inbound(stream, remote);
                }
                ConnCmd::SetLocal(local) => {
                    self.local = local;
                }
                ConnCmd::Inst(event) => self.inst_event(event).await,
                ConnCmd::PowerOff => {
                    debug!("connection manager: power off");
                    for info in self.instances.values() {
                        let _ = info.tx.try_send(InstCmd::Close);
                    }
                    break;
                }
            }
        }
    }

    /// Existing outbound instance for the peer, or a fresh one.
    fn outbound_for(&mut self, peer: Node) -> mpsc::Sender<InstCmd> {
        let key = (peer.id, Direction::Outbound);
        if let Some(seq) = self.by_key.get(&key) {
            if let Some(info) = self.instances.get(seq) {
                return info.tx.clone();
            }
        }

        self.seq += 1;
        let seq = self.seq;
        let (inst_tx, inst_rx) = mpsc::channel(INST_MAILBOX);
        self.instances.insert(
            seq,
            InstInfo {
                key: Some(key),
                tx: inst_tx.clone(),
                status: ConInstStatus::Connecting,
                dir: Direction::Outbound,
            },
        );
        self.by_key.insert(key, seq);

        let inst = ConnInst {
            seq,
            local: self.local,
            peer: Some(peer),
            dir: Direction::Outbound,
            dial_timeout: self.cfg.dial_timeout,
            hs_timeout: self.cfg.handshake_timeout,
            mgr_tx: self.cmd_tx.clone(),
            server_tx: self.server_tx.clone(),
        };
        tokio::spawn(inst.run_outbound(inst_rx));
        inst_tx
    }

    fn accept_inbound(&mut self, stream: TcpStream, remote: SocketAddr) {
        self.seq += 1;
        let seq = self.seq;
        let (inst_tx, inst_rx) = mpsc::channel(INST_MAILBOX);
        self.instances.insert(
            seq,
            InstInfo {
                key: None,
                tx: inst_tx,
                status: ConInstStatus::Accepted,
                dir: Direction::Inbound,
            },
        );
        trace!(%remote, seq, "dht connection accepted");

        let inst = ConnInst {
            seq,
            local: self.local,
            peer: None,
            dir: Direction::Inbound,
            dial_timeout: self.cfg.dial_timeout,
            hs_timeout: self.cfg.handshake_timeout,
            mgr_tx: self.cmd_tx.clone(),
            server_tx: self.server_tx.clone(),
        };
        tokio::spawn(inst.run_inbound(stream, inst_rx));
    }

    async fn close_peer(&mut self, peer: NodeId) -> Errno {
        let mut found = false;
        for dir in [Direction::Outbound, Direction::Inbound] {
            if let Some(seq) = self.by_key.get(&(peer, dir)).copied() {
                if let Some(info) = self.instances.get(&seq) {
                    let _ = info.tx.try_send(InstCmd::Close);
                    found = true;
                }
            }
        }
        if found {
            Errno::None
        } else {
            Errno::NotFound
        }
    }

    async fn inst_event(&mut self, event: InstEvent) {
        match event {
            InstEvent::Status { seq, status, peer } => {
                let Some(info) = self.instances.get_mut(&seq) else { return };
                info.status = status;
                let dir = info.dir;

                // An inbound instance identifies its peer at handshake
                // time; bind the key and resolve duplicates now.
                if let (Some(id), None) = (peer, info.key) {
                    info.key = Some((id, dir));
                    self.resolve_duplicate(seq, id, dir).await;
                }

                let peer_id = self.instances.get(&seq).and_then(|i| i.key.map(|k| k.0));
                self.publish_status(ConInstStatusInd { peer: peer_id, dir, status });
            }
            InstEvent::Down { seq } => {
                if let Some(info) = self.instances.remove(&seq) {
                    if let Some(key) = info.key {
                        // Only unbind when this seq still owns the key;
                        // a duplicate may have taken it over.
                        if self.by_key.get(&key) == Some(&seq) {
                            self.by_key.remove(&key);
                        }
                    }
                    self.publish_status(ConInstStatusInd {
                        peer: info.key.map(|k| k.0),
                        dir: info.dir,
                        status: ConInstStatus::Closed,
                    });
                }
            }
        }
    }

    /// At most one instance per (peer, direction): a same-direction clash
    /// keeps the higher-state instance, ties broken by a seeded coin.
    async fn resolve_duplicate(&mut self, seq: u64, id: NodeId, dir: Direction) {
        let key = (id, dir);
        let Some(&existing) = self.by_key.get(&key) else {
            self.by_key.insert(key, seq);
            return;
        };
        if existing == seq {
            return;
        }

        let new_state = self.instances.get(&seq).map(|i| i.status).unwrap_or(ConInstStatus::Null);
        let old_state = self
            .instances
            .get(&existing)
            .map(|i| i.status)
            .unwrap_or(ConInstStatus::Null);

        let kill_new = match new_state.cmp(&old_state) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => self.rng.gen::<bool>(),
        };

        let victim = if kill_new { seq } else { existing };
        let survivor = if kill_new { existing } else { seq };
        debug!(peer = %id, ?dir, victim, survivor, "duplicate dht instance resolved");

        if let Some(info) = self.instances.get(&victim) {
            let _ = info.tx.try_send(InstCmd::Close);
        }
        self.by_key.insert(key, survivor);
    }

    fn publish_status(&mut self, ind: ConInstStatusInd) {
        if self.status_tx.try_send(ind).is_err() {
            trace!("status indication dropped: channel full");
        }
    }
}

// ============================================================================
// Connection instance
// ============================================================================

struct ConnInst {
    seq: u64,
    local: Node,
    peer: Option<Node>,
    dir: Direction,
    dial_timeout: std::time::Duration,
    hs_timeout: std::time::Duration,
    mgr_tx: mpsc::Sender<ConnCmd>,
    server_tx: mpsc::Sender<InboundDhtRequest>,
}

impl ConnInst {
    async fn status(&self, status: ConInstStatus, peer: Option<NodeId>) {
        let _ = self
            .mgr_tx
            .send(ConnCmd::Inst(InstEvent::Status { seq: self.seq, status, peer }))
            .await;
    }

    async fn down(&self) {
        let _ = self
            .mgr_tx
            .send(ConnCmd::Inst(InstEvent::Down { seq: self.seq }))
            .await;
    }

    async fn run_outbound(self, mut cmd_rx: mpsc::Receiver<InstCmd>) {
        let peer = self.peer.expect("outbound instance has a peer");
        self.status(ConInstStatus::Connecting, Some(peer.id)).await;

        let stream = match timeout(self.dial_timeout, TcpStream::connect(peer.tcp_addr())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(peer = %peer.id, error = %err, "dht dial failed");
                self.fail_pending(&mut cmd_rx, Errno::Os).await;
                self.down().await;
                return;
            }
            Err(_) => {
                debug!(peer = %peer.id, "dht dial timeout");
                self.fail_pending(&mut cmd_rx, Errno::Timeout).await;
                self.down().await;
                return;
            }
        };
        self.status(ConInstStatus::Connected, Some(peer.id)).await;

        let mut stream = stream;
        self.status(ConInstStatus::InHandshaking, Some(peer.id)).await;
        let hs = DhtMessage::Handshake { from: self.local, to: peer, id: self.seq };
        let hs_result = timeout(self.hs_timeout, async {
            send_message(&mut stream, &DhtPackage::from_message(&hs)?).await?;
            let pkg: DhtPackage = recv_message(&mut stream).await?;
            pkg.to_message()
        })
        .await;
        match hs_result {
            Ok(Ok(DhtMessage::Handshake { .. })) => {}
            Ok(Ok(other)) => {
                debug!(peer = %peer.id, msg = ?other, "unexpected dht handshake reply");
                self.fail_pending(&mut cmd_rx, Errno::Message).await;
                self.down().await;
                return;
            }
            Ok(Err(eno)) => {
                debug!(peer = %peer.id, %eno, "dht handshake failed");
                self.fail_pending(&mut cmd_rx, eno).await;
                self.down().await;
                return;
            }
            Err(_) => {
                debug!(peer = %peer.id, "dht handshake timeout");
                self.fail_pending(&mut cmd_rx, Errno::Timeout).await;
                self.down().await;
                return;
            }
        }
        self.status(ConInstStatus::Handshaked, Some(peer.id)).await;
        self.status(ConInstStatus::InService, Some(peer.id)).await;

        self.serve(stream, cmd_rx).await;
        self.down().await;
    }

    async fn run_inbound(self, mut stream: TcpStream, cmd_rx: mpsc::Receiver<InstCmd>) {
        self.status(ConInstStatus::Accepted, None).await;
        self.status(ConInstStatus::InHandshaking, None).await;

        let local = self.local;
        let seq = self.seq;
        let hs_result = timeout(self.hs_timeout, async {
            let pkg: DhtPackage = recv_message(&mut stream).await?;
            let msg = pkg.to_message()?;
            let DhtMessage::Handshake { from, .. } = msg else {
                return Err(Errno::Message);
            };
            let reply = DhtMessage::Handshake { from: local, to: from, id: seq };
            send_message(&mut stream, &DhtPackage::from_message(&reply)?).await?;
            Ok(from)
        })
        .await;

        let peer = match hs_result {
            Ok(Ok(peer)) => peer,
            Ok(Err(eno)) => {
                debug!(%eno, "inbound dht handshake failed");
                self.down().await;
                return;
            }
            Err(_) => {
                debug!("inbound dht handshake timeout");
                self.down().await;
                return;
            }
        };

        self.status(ConInstStatus::Handshaked, Some(peer.id)).await;
        self.status(ConInstStatus::InService, Some(peer.id)).await;

        self.serve(stream, cmd_rx).await;
        self.down().await;
    }

    /// Service loop: interleave outgoing commands with incoming frames.
    /// Responses resolve pending requests by id; requests are answered by
    /// the DHT manager. The read half lives in its own worker task so a
    /// cancelled select arm can never tear a frame.
    async fn serve(&self, stream: TcpStream, mut cmd_rx: mpsc::Receiver<InstCmd>) {
        let (reader, mut writer) = stream.into_split();
        let mut pending: HashMap<u64, oneshot::Sender<Result<DhtMessage, Errno>>> = HashMap::new();

        let (in_tx, mut in_rx) = mpsc::channel::<DhtMessage>(INST_MAILBOX);
        let reader_task = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                let msg = match recv_message::<_, DhtPackage>(&mut reader).await {
                    Ok(pkg) => pkg.to_message(),
                    Err(eno) => Err(eno),
                };
                match msg {
                    Ok(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(InstCmd::Request { msg, reply }) => {
                            let id = msg.id();
                            match Self::write_msg(&mut writer, &msg).await {
                                Ok(()) => { pending.insert(id, reply); }
                                Err(eno) => { let _ = reply.send(Err(eno)); break; }
                            }
                        }
                        Some(InstCmd::Send { msg, reply }) => {
                            let eno = Self::write_msg(&mut writer, &msg)
                                .await
                                .err()
                                .unwrap_or(Errno::None);
                            let _ = reply.send(eno);
                            if eno.is_err() {
                                break;
                            }
                        }
                        Some(InstCmd::AwaitReady { reply }) => {
                            let _ = reply.send(Errno::None);
                        }
                        Some(InstCmd::Close) | None => break,
                    }
                }
                msg = in_rx.recv() => {
                    let Some(msg) = msg else {
                        trace!(seq = self.seq, "dht connection read ended");
                        break;
                    };
                    if let Some(reply) = pending.remove(&msg.id()) {
                        let _ = reply.send(Ok(msg));
                        continue;
                    }
                    if let Some(rsp) = self.answer(msg).await {
                        if Self::write_msg(&mut writer, &rsp).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        reader_task.abort();
        for (_, reply) in pending {
            let _ = reply.send(Err(Errno::Os));
        }
    }

    async fn write_msg<W: AsyncWrite + Unpin>(writer: &mut W, msg: &DhtMessage) -> Result<(), Errno> {
        let pkg = DhtPackage::from_message(msg)?;
        send_message(writer, &pkg).await
    }

    /// Forward an incoming request to the DHT manager and relay its
    /// answer.
    async fn answer(&self, msg: DhtMessage) -> Option<DhtMessage> {
        let (reply, rx) = oneshot::channel();
        if self
            .server_tx
            .send(InboundDhtRequest { msg, reply })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Fail whatever was queued before the connection came up.
    async fn fail_pending(&self, cmd_rx: &mut mpsc::Receiver<InstCmd>, eno: Errno) {
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                InstCmd::Request { reply, .. } => {
                    let _ = reply.send(Err(eno));
                }
                InstCmd::Send { reply, .. } => {
                    let _ = reply.send(eno);
                }
                InstCmd::AwaitReady { reply } => {
                    let _ = reply.send(eno);
                }
                InstCmd::Close => {}
            }
        }
    }
}
