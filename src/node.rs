//! # Node Assembly
//!
//! Wires the managers into a running node and exposes the public API.
//!
//! ## Component graph
//!
//! ```text
//!               bootstrap targets            events / conn status
//!       RUT ────────────────────> DHT <──────────────────────────── consumer
//!        ^  nearest / update       ^ ^                 server side
//!        |                         | └───────────────────────────── CON
//!       QRY ── requests ──> CON    └── addr switch ──── QRY
//!        ^                                               ^
//!        └──────────── NAT events ──────────┬────────────┘
//!                                          PEM ── indications ──> consumer
//! ```
//!
//! [`NodeService::create`] binds the two TCP listeners (sessions and DHT
//! overlay), spawns every manager task and returns the service plus the
//! consumer-facing channels; [`NodeService::start`] then opens the
//! session fabric. Power-off fans out to every manager in reverse
//! dependency order.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::Config;
use crate::conn::{ConnHandle, ConnMgr};
use crate::dht::{DhtChannels, DhtHandle, DhtMgr};
use crate::errno::Errno;
use crate::identity::{Node, NodeId, SubNetId};
use crate::nat::{NatHandle, NatMgr, NoNat, PortMapper};
use crate::peer::{Discovery, PeerHandle, PeerIndication, PeerMgr, PemSnapshot};
use crate::query::{QueryHandle, QueryMgr, QueryResultInd};
use crate::routing::{RouteHandle, RouteMgr};

/// Consumer-facing receivers produced at creation time.
pub struct NodeChannels {
    /// DHT events and connection status indications.
    pub dht: DhtChannels,
    /// Session lifecycle indications with per-peer receive channels.
    pub peer: mpsc::Receiver<PeerIndication>,
}

/// A running node: every manager spawned and wired.
pub struct NodeService {
    config: Config,
    rut: RouteHandle,
    con: ConnHandle,
    qry: QueryHandle,
    dht: DhtHandle,
    nat: NatHandle,
    pem: PeerHandle,
}

/// Dial-candidate source backed by the node's own DHT: a random-target
/// peer lookup per request.
struct DhtDiscovery {
    dht: DhtHandle,
}

#[async_trait]
impl Discovery for DhtDiscovery {
    async fn find_node(&self, _snid: SubNetId, count: usize) -> Vec<Node> {
        if count == 0 {
            return Vec::new();
        }
        let result = self.dht.find_peer(NodeId::random()).await;
        let mut peers = result.peers;
        peers.truncate(count);
        peers
    }
}

impl NodeService {
    /// Bind listeners and spawn every manager. The mapper defaults to
    /// [`NoNat`] when not given.
    pub async fn create(
        mut config: Config,
        mapper: Option<Box<dyn PortMapper>>,
    ) -> Result<(NodeService, NodeChannels)> {
        // Bind both listeners first; an ephemeral port 0 is resolved
        // into the advertised records before anything else sees them.
        let peer_listener = TcpListener::bind(config.local.tcp_addr())
            .await
            .with_context(|| format!("binding session listener on {}", config.local.tcp_addr()))?;
        config.local.tcp = peer_listener.local_addr()?.port();
        if config.local.udp == 0 {
            config.local.udp = config.local.tcp;
        }

        let dht_listener = TcpListener::bind(config.local_dht.tcp_addr())
            .await
            .with_context(|| format!("binding dht listener on {}", config.local_dht.tcp_addr()))?;
        config.local_dht.tcp = dht_listener.local_addr()?.port();
        if config.local_dht.udp == 0 {
            config.local_dht.udp = config.local_dht.tcp;
        }

        // NAT events fan out to the query and peer managers.
        let (qry_nat_tx, mut qry_nat_rx) = mpsc::channel(64);
        let (pem_nat_tx, mut pem_nat_rx) = mpsc::channel(64);
        let nat = NatMgr::spawn(
            mapper.unwrap_or_else(|| Box::new(NoNat)),
            vec![qry_nat_tx, pem_nat_tx],
        );

        let (bootstrap_tx, mut bootstrap_rx) = mpsc::channel(16);
        let rut = RouteMgr::spawn(config.dht.clone(), config.local_dht.id, Some(bootstrap_tx));

        let (server_tx, server_rx) = mpsc::channel(256);
        let (status_tx, status_rx) = mpsc::channel(64);
        let con = ConnMgr::spawn(
            config.dht.clone(),
            config.local_dht,
            config.tiebreak_seed,
            server_tx,
            status_tx,
            Some(dht_listener),
        );

        let (addr_switch_tx, addr_switch_rx) = mpsc::channel(16);
        let qry = QueryMgr::spawn(
            config.dht.clone(),
            config.local_dht,
            rut.clone(),
            con.clone(),
            Some(nat.clone()),
            addr_switch_tx,
        );

        let (dht, dht_channels) = DhtMgr::spawn(
            config.dht.clone(),
            config.local_dht,
            qry.clone(),
            rut.clone(),
            server_rx,
            addr_switch_rx,
            status_rx,
        );

        let discovery = Arc::new(DhtDiscovery { dht: dht.clone() });
        let (pem, peer_rx) = PeerMgr::spawn(
            config.clone(),
            peer_listener,
            discovery,
            Some(rut.clone()),
            Some(nat.clone()),
        );

        // Forward NAT events into the consumers' mailboxes.
        {
            let qry = qry.clone();
            tokio::spawn(async move {
                while let Some(ev) = qry_nat_rx.recv().await {
                    qry.nat_event(ev).await;
                }
            });
            let pem = pem.clone();
            tokio::spawn(async move {
                while let Some(ev) = pem_nat_rx.recv().await {
                    pem.nat_event(ev).await;
                }
            });
        }

        // Bootstrap targets from the routing table become peer lookups.
        {
            let dht = dht.clone();
            tokio::spawn(async move {
                while let Some(target) = bootstrap_rx.recv().await {
                    let dht = dht.clone();
                    tokio::spawn(async move {
                        let result = dht.find_peer(target).await;
                        debug!(eno = %result.eno, found = result.peers.len(), "bootstrap lookup done");
                    });
                }
            });
        }

        info!(
            name = %config.name,
            session = %config.local.tcp_addr(),
            dht = %config.local_dht.tcp_addr(),
            "node created"
        );

        let service = NodeService { config, rut, con, qry, dht, nat, pem };
        let channels = NodeChannels { dht: dht_channels, peer: peer_rx };
        Ok((service, channels))
    }

    /// Open the session fabric: start accepting and dialing.
    pub async fn start(&self) {
        self.pem.start().await;
    }

    /// The configuration with resolved listen ports.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The local session record (NAT-unaware initial value).
    pub fn local(&self) -> Node {
        self.config.local
    }

    /// The local DHT record (NAT-unaware initial value).
    pub fn local_dht(&self) -> Node {
        self.config.local_dht
    }

    // ------------------------------------------------------------------
    // DHT operations
    // ------------------------------------------------------------------

    /// Seed the routing table with a known peer, e.g. a configured
    /// bootstrap node.
    pub async fn add_dht_peer(&self, node: Node) {
        self.rut
            .update(vec![node], vec![std::time::Duration::from_millis(1)])
            .await;
    }

    pub async fn find_peer(&self, id: NodeId) -> QueryResultInd {
        self.dht.find_peer(id).await
    }

    pub async fn get_value(&self, key: crate::messages::DsKey) -> QueryResultInd {
        self.dht.get_value(key).await
    }

    pub async fn put_value(&self, key: crate::messages::DsKey, value: Vec<u8>) -> QueryResultInd {
        self.dht.put_value(key, value).await
    }

    pub async fn get_provider(&self, key: crate::messages::DsKey) -> QueryResultInd {
        self.dht.get_provider(key).await
    }

    pub async fn put_provider(
        &self,
        key: crate::messages::DsKey,
        nodes: Vec<Node>,
    ) -> QueryResultInd {
        self.dht.put_provider(key, nodes).await
    }

    // ------------------------------------------------------------------
    // Session operations
    // ------------------------------------------------------------------

    /// Enqueue an application payload to the named workers; returns the
    /// ids that could not be served.
    pub async fn send_package(
        &self,
        snid: SubNetId,
        ids: Vec<NodeId>,
        payload: Vec<u8>,
    ) -> (Errno, Vec<NodeId>) {
        self.pem.send_package(snid, ids, payload).await
    }

    pub async fn close_peer(&self, snid: SubNetId, id: NodeId) -> Errno {
        self.pem.close_peer(snid, id).await
    }

    pub async fn peer_snapshot(&self) -> PemSnapshot {
        self.pem.snapshot().await
    }

    /// Handle to the NAT manager, for mapper implementations that learn
    /// address changes asynchronously.
    pub fn nat(&self) -> NatHandle {
        self.nat.clone()
    }

    /// Power off every manager, sessions first.
    pub async fn stop(&self) {
        self.pem.power_off().await;
        self.dht.power_off().await;
        self.qry.power_off().await;
        self.con.power_off().await;
        self.rut.power_off().await;
        self.nat.power_off().await;
        info!(name = %self.config.name, "node stopped");
    }
}
