//! # DHT Façade (DHT)
//!
//! The external face of the DHT subsystem. Translates `FindPeer`,
//! `GetValue`, `PutValue`, `GetProvider` and `PutProvider` into query
//! starts, owns the local value and provider stores, answers the
//! server side of inbound DHT connections, and delivers indications to
//! the consumer over two bounded channels:
//!
//! | Channel | Content | Bound |
//! |---------|---------|-------|
//! | events | [`DhtEvent`] (query results, address switches) | 64 |
//! | conn status | [`ConInstStatusInd`] from the connection manager | 64 |
//!
//! Events that the dispatcher does not recognize as consumer-relevant
//! are dropped rather than queued.
//!
//! The stores are bounded LRU caches with a TTL; values are consulted
//! before any query is started, so a locally known key never touches the
//! network.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::DhtConfig;
use crate::conn::{ConInstStatusInd, InboundDhtRequest};
use crate::errno::Errno;
use crate::identity::{Node, NodeId};
use crate::messages::{DhtMessage, DsKey, Provider};
use crate::query::{ForWhat, PubAddrSwitchInd, QueryHandle, QueryPayload, QueryResultInd};
use crate::routing::RouteHandle;

/// Bound of the event indication channel.
const EVENT_QUEUE: usize = 64;

/// Mailbox bound of the DHT manager.
const DHT_MAILBOX: usize = 256;

/// Indications delivered to the DHT consumer.
#[derive(Clone, Debug)]
pub enum DhtEvent {
    FindPeerRsp(QueryResultInd),
    GetValueRsp(QueryResultInd),
    PutValueRsp(QueryResultInd),
    GetProviderRsp(QueryResultInd),
    PutProviderRsp(QueryResultInd),
    PubAddrSwitch(PubAddrSwitchInd),
}

/// Receivers handed to the consumer at spawn time.
pub struct DhtChannels {
    pub events: mpsc::Receiver<DhtEvent>,
    pub conn_status: mpsc::Receiver<ConInstStatusInd>,
}

struct StoredValue {
    value: Vec<u8>,
    expires: Instant,
}

struct StoredProvider {
    nodes: Vec<Node>,
    expires: Instant,
}

enum DhtCmd {
    FindPeer {
        id: NodeId,
        reply: oneshot::Sender<QueryResultInd>,
    },
    GetValue {
        key: DsKey,
        reply: oneshot::Sender<QueryResultInd>,
    },
    PutValue {
        key: DsKey,
        value: Vec<u8>,
        reply: oneshot::Sender<QueryResultInd>,
    },
    GetProvider {
        key: DsKey,
        reply: oneshot::Sender<QueryResultInd>,
    },
    PutProvider {
        key: DsKey,
        nodes: Vec<Node>,
        reply: oneshot::Sender<QueryResultInd>,
    },
    PowerOff,
}

/// Clone-able handle to the DHT manager task.
#[derive(Clone)]
pub struct DhtHandle {
    tx: mpsc::Sender<DhtCmd>,
}

macro_rules! facade_op {
    ($self:ident, $variant:ident { $($field:ident : $value:expr),* }, $for_what:expr, $target:expr) => {{
        let (reply, rx) = oneshot::channel();
        if $self.tx.send(DhtCmd::$variant { $($field: $value,)* reply }).await.is_err() {
            return QueryResultInd {
                eno: Errno::Scheduler,
                for_what: $for_what,
                target: $target,
                peers: Vec::new(),
                value: None,
                providers: Vec::new(),
            };
        }
        rx.await.unwrap_or(QueryResultInd {
            eno: Errno::Scheduler,
            for_what: $for_what,
            target: $target,
            peers: Vec::new(),
            value: None,
            providers: Vec::new(),
        })
    }};
}

impl DhtHandle {
    /// Locate a peer by identity.
    pub async fn find_peer(&self, id: NodeId) -> QueryResultInd {
        let target = id.hash();
        facade_op!(self, FindPeer { id: id }, ForWhat::FindNode, target)
    }

    /// Look up a value, local store first.
    pub async fn get_value(&self, key: DsKey) -> QueryResultInd {
        facade_op!(self, GetValue { key: key }, ForWhat::GetValue, key)
    }

    /// Store a value locally and replicate it to the nearest peers
    /// encountered.
    pub async fn put_value(&self, key: DsKey, value: Vec<u8>) -> QueryResultInd {
        facade_op!(self, PutValue { key: key, value: value }, ForWhat::PutValue, key)
    }

    /// Look up the providers of a key, local store first.
    pub async fn get_provider(&self, key: DsKey) -> QueryResultInd {
        facade_op!(self, GetProvider { key: key }, ForWhat::GetProvider, key)
    }

    /// Record providers for a key and replicate the record.
    pub async fn put_provider(&self, key: DsKey, nodes: Vec<Node>) -> QueryResultInd {
        facade_op!(self, PutProvider { key: key, nodes: nodes }, ForWhat::PutProvider, key)
    }

    pub async fn power_off(&self) {
        let _ = self.tx.send(DhtCmd::PowerOff).await;
    }
}

/// The DHT manager actor.
pub struct DhtMgr {
    cfg: DhtConfig,
    local: Node,
    qry: QueryHandle,
    rut: RouteHandle,
    values: LruCache<DsKey, StoredValue>,
    providers: LruCache<DsKey, StoredProvider>,
    waiters: HashMap<DsKey, oneshot::Sender<QueryResultInd>>,
    cmd_rx: mpsc::Receiver<DhtCmd>,
    server_rx: mpsc::Receiver<InboundDhtRequest>,
    result_rx: mpsc::Receiver<QueryResultInd>,
    result_tx: mpsc::Sender<QueryResultInd>,
    addr_switch_rx: mpsc::Receiver<PubAddrSwitchInd>,
    event_tx: mpsc::Sender<DhtEvent>,
}

impl DhtMgr {
    /// Spawn the DHT manager. `server_rx` carries inbound requests from
    /// the connection manager; `addr_switch_rx` carries address-switch
    /// indications from the query manager; `conn_status` is handed
    /// through to the consumer untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        cfg: DhtConfig,
        local: Node,
        qry: QueryHandle,
        rut: RouteHandle,
        server_rx: mpsc::Receiver<InboundDhtRequest>,
        addr_switch_rx: mpsc::Receiver<PubAddrSwitchInd>,
        conn_status: mpsc::Receiver<ConInstStatusInd>,
    ) -> (DhtHandle, DhtChannels) {
        let (cmd_tx, cmd_rx) = mpsc::channel(DHT_MAILBOX);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (result_tx, result_rx) = mpsc::channel(DHT_MAILBOX);

        let values_cap = NonZeroUsize::new(cfg.store_entries.max(1)).expect("max(1) is non-zero");
        let providers_cap =
            NonZeroUsize::new(cfg.provider_entries.max(1)).expect("max(1) is non-zero");
        let mgr = DhtMgr {
            cfg,
            local,
            qry,
            rut,
            values: LruCache::new(values_cap),
            providers: LruCache::new(providers_cap),
            waiters: HashMap::new(),
            cmd_rx,
            server_rx,
            result_rx,
            result_tx,
            addr_switch_rx,
            event_tx,
        };
        tokio::spawn(mgr.run());
        (
            DhtHandle { tx: cmd_tx },
            DhtChannels { events: event_rx, conn_status },
        )
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(std::time::Duration::from_secs(60));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(DhtCmd::PowerOff) | None => {
                            debug!("dht manager: power off");
                            break;
                        }
                        Some(cmd) => self.command(cmd).await,
                    }
                }
                req = self.server_rx.recv() => {
                    if let Some(req) = req {
                        self.serve(req).await;
                    }
                }
                ind = self.result_rx.recv() => {
                    if let Some(ind) = ind {
                        self.query_done(ind);
                    }
                }
                ind = self.addr_switch_rx.recv() => {
                    if let Some(ind) = ind {
                        // Server-side responses advertise the switched
                        // record from now on.
                        self.local.ip = ind.ip;
                        self.local.tcp = ind.tcp;
                        self.dispatch_event(DhtEvent::PubAddrSwitch(ind));
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_stores();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Consumer operations
    // ------------------------------------------------------------------

    async fn command(&mut self, cmd: DhtCmd) {
        match cmd {
            DhtCmd::FindPeer { id, reply } => {
                let target = id.hash();
                if id == self.local.id {
                    let _ = reply.send(done(ForWhat::FindNode, target, vec![self.local], None));
                    return;
                }
                self.start_query(ForWhat::FindNode, target, QueryPayload::default(), reply)
                    .await;
            }
            DhtCmd::GetValue { key, reply } => {
                if let Some(entry) = self.values.get(&key) {
                    if entry.expires > Instant::now() {
                        let mut ind = done(ForWhat::GetValue, key, Vec::new(), None);
                        ind.value = Some(entry.value.clone());
                        let _ = reply.send(ind);
                        return;
                    }
                    self.values.pop(&key);
                }
                self.start_query(ForWhat::GetValue, key, QueryPayload::default(), reply)
                    .await;
            }
            DhtCmd::PutValue { key, value, reply } => {
                self.store_value(key, value.clone());
                let payload = QueryPayload { value: Some(value), provider: None };
                self.start_query(ForWhat::PutValue, key, payload, reply).await;
            }
            DhtCmd::GetProvider { key, reply } => {
                if let Some(entry) = self.providers.get(&key) {
                    if entry.expires > Instant::now() {
                        let mut ind = done(ForWhat::GetProvider, key, Vec::new(), None);
                        ind.providers = entry.nodes.clone();
                        let _ = reply.send(ind);
                        return;
                    }
                    self.providers.pop(&key);
                }
                self.start_query(ForWhat::GetProvider, key, QueryPayload::default(), reply)
                    .await;
            }
            DhtCmd::PutProvider { key, nodes, reply } => {
                self.store_provider(key, nodes.clone());
                let payload = QueryPayload {
                    value: None,
                    provider: Some(Provider { key, nodes }),
                };
                self.start_query(ForWhat::PutProvider, key, payload, reply).await;
            }
            DhtCmd::PowerOff => unreachable!("handled by the run loop"),
        }
    }

    async fn start_query(
        &mut self,
        for_what: ForWhat,
        target: DsKey,
        payload: QueryPayload,
        reply: oneshot::Sender<QueryResultInd>,
    ) {
        if self.waiters.contains_key(&target) {
            let mut ind = done(for_what, target, Vec::new(), None);
            ind.eno = Errno::Duplicated;
            let _ = reply.send(ind);
            return;
        }
        let eno = self
            .qry
            .start(for_what, target, payload, self.result_tx.clone())
            .await;
        if eno.is_err() {
            let mut ind = done(for_what, target, Vec::new(), None);
            ind.eno = eno;
            let _ = reply.send(ind);
            return;
        }
        self.waiters.insert(target, reply);
    }

    /// Route a finished query to its waiter and mirror it onto the event
    /// channel.
    fn query_done(&mut self, ind: QueryResultInd) {
        if let Some(waiter) = self.waiters.remove(&ind.target) {
            let _ = waiter.send(ind.clone());
        } else {
            trace!(target = ?ind.target, "query result without waiter");
        }

        let event = match ind.for_what {
            ForWhat::FindNode => DhtEvent::FindPeerRsp(ind),
            ForWhat::GetValue => DhtEvent::GetValueRsp(ind),
            ForWhat::PutValue => DhtEvent::PutValueRsp(ind),
            ForWhat::GetProvider => DhtEvent::GetProviderRsp(ind),
            ForWhat::PutProvider => DhtEvent::PutProviderRsp(ind),
        };
        self.dispatch_event(event);
    }

    fn dispatch_event(&mut self, event: DhtEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("dht event dropped: consumer queue full");
        }
    }

    // ------------------------------------------------------------------
    // Server side of inbound connections
    // ------------------------------------------------------------------

    async fn serve(&mut self, req: InboundDhtRequest) {
        let rsp = match req.msg {
            DhtMessage::FindNode { from, id, target, .. } => {
                let nearest = self.rut.nearest(target, self.cfg.max_nearest).await;
                Some(DhtMessage::Neighbors {
                    from: self.local,
                    to: from,
                    id,
                    nodes: nearest.peers.into_iter().map(|e| e.node).collect(),
                })
            }
            DhtMessage::GetValueReq { from, id, key, .. } => {
                let value = self.fresh_value(&key);
                let nodes = if value.is_some() {
                    Vec::new()
                } else {
                    let nearest = self.rut.nearest(key, self.cfg.max_nearest).await;
                    nearest.peers.into_iter().map(|e| e.node).collect()
                };
                Some(DhtMessage::GetValueRsp { from: self.local, to: from, id, key, value, nodes })
            }
            DhtMessage::GetProviderReq { from, id, key, .. } => {
                let provider = self.fresh_provider(&key).map(|nodes| Provider { key, nodes });
                let nodes = if provider.is_some() {
                    Vec::new()
                } else {
                    let nearest = self.rut.nearest(key, self.cfg.max_nearest).await;
                    nearest.peers.into_iter().map(|e| e.node).collect()
                };
                Some(DhtMessage::GetProviderRsp {
                    from: self.local,
                    to: from,
                    id,
                    key,
                    provider,
                    nodes,
                })
            }
            DhtMessage::PutValue { key, value, .. } => {
                self.store_value(key, value);
                None
            }
            DhtMessage::PutProvider { provider, .. } => {
                self.store_provider(provider.key, provider.nodes);
                None
            }
            DhtMessage::Ping { from, id, .. } => {
                Some(DhtMessage::Pong { from: self.local, to: from, id })
            }
            other => {
                trace!(msg = ?other, "inbound dht message ignored");
                None
            }
        };
        let _ = req.reply.send(rsp);
    }

    // ------------------------------------------------------------------
    // Stores
    // ------------------------------------------------------------------

    fn store_value(&mut self, key: DsKey, value: Vec<u8>) {
        let expires = Instant::now() + self.cfg.store_ttl;
        self.values.put(key, StoredValue { value, expires });
    }

    fn store_provider(&mut self, key: DsKey, mut nodes: Vec<Node>) {
        let expires = Instant::now() + self.cfg.store_ttl;
        if let Some(existing) = self.providers.get(&key) {
            for node in &existing.nodes {
                if !nodes.iter().any(|n| n.id == node.id) {
                    nodes.push(*node);
                }
            }
        }
        self.providers.put(key, StoredProvider { nodes, expires });
    }

    fn fresh_value(&mut self, key: &DsKey) -> Option<Vec<u8>> {
        match self.values.get(key) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                self.values.pop(key);
                None
            }
            None => None,
        }
    }

    fn fresh_provider(&mut self, key: &DsKey) -> Option<Vec<Node>> {
        match self.providers.get(key) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.nodes.clone()),
            Some(_) => {
                self.providers.pop(key);
                None
            }
            None => None,
        }
    }

    fn sweep_stores(&mut self) {
        let now = Instant::now();
        let expired: Vec<DsKey> = self
            .values
            .iter()
            .filter(|(_, v)| v.expires <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.values.pop(key);
        }
        let expired_p: Vec<DsKey> = self
            .providers
            .iter()
            .filter(|(_, v)| v.expires <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired_p {
            self.providers.pop(key);
        }
        if !expired.is_empty() || !expired_p.is_empty() {
            debug!(
                values = expired.len(),
                providers = expired_p.len(),
                "expired store entries removed"
            );
        }
    }
}

fn done(for_what: ForWhat, target: DsKey, peers: Vec<Node>, value: Option<Vec<u8>>) -> QueryResultInd {
    QueryResultInd {
        eno: Errno::None,
        for_what,
        target,
        peers,
        value,
        providers: Vec::new(),
    }
}
