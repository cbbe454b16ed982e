//! Node configuration.
//!
//! One [`Config`] describes a whole node: its local records, networking
//! mode, per-sub-network admission caps, and every timeout and table bound
//! used by the managers. Defaults mirror the production constants; tests
//! compress the timing fields.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::{Node, NodeId, SubNetId, ANY_SUBNET};
use crate::messages::Protocol;

/// Admission caps for one sub-network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetCaps {
    pub max_peers: usize,
    pub max_outbounds: usize,
    pub max_inbounds: usize,
}

impl Default for SubnetCaps {
    fn default() -> Self {
        Self {
            max_peers: 32,
            max_outbounds: 8,
            max_inbounds: 24,
        }
    }
}

/// How the peer manager selects dial candidates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// Only the configured static nodes, under the static sub-network.
    Static,
    /// Only dynamic sub-networks fed by discovery.
    Dynamic,
    /// Both; static nodes are admitted under the static sub-network.
    StaticAndDynamic,
}

/// Parameters of the DHT subsystem (routing table and query manager).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Bucket capacity B.
    pub bucket_size: usize,
    /// Upper bound on peers returned by a nearest lookup.
    pub max_nearest: usize,
    /// Peers whose latency EWMA exceeds this are rejected on insert.
    pub max_latency: Duration,
    /// EWMA weight applied to new latency samples.
    pub ewma_weight: f64,
    /// Hard cap on routing-table notification subscriptions.
    pub max_notifees: usize,
    /// Bootstrap timer period.
    pub bootstrap_period: Duration,
    /// Random FIND_NODE queries emitted per bootstrap tick.
    pub random_qry_num: usize,
    /// Pending-queue capacity per query.
    pub max_pendings: usize,
    /// Concurrent active instances per query.
    pub max_act_insts: usize,
    /// Width bound: peers queried per lookup.
    pub max_width: usize,
    /// Depth bound per lookup.
    pub max_depth: usize,
    /// Whole-query expiry.
    pub qry_expired: Duration,
    /// Per-instance expiry.
    pub qry_inst_expired: Duration,
    /// Dial timeout for DHT connections.
    pub dial_timeout: Duration,
    /// Bound over the DHT connection handshake.
    pub handshake_timeout: Duration,
    /// Entries held by the local value store.
    pub store_entries: usize,
    /// Entries held by the provider store.
    pub provider_entries: usize,
    /// Time-to-live of stored values and provider records.
    pub store_ttl: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bucket_size: 32,
            max_nearest: 32,
            max_latency: Duration::from_secs(60),
            ewma_weight: 0.125,
            max_notifees: 64,
            bootstrap_period: Duration::from_secs(60),
            random_qry_num: 2,
            max_pendings: 64,
            max_act_insts: 8,
            max_width: 64,
            max_depth: 8,
            qry_expired: Duration::from_secs(60),
            qry_inst_expired: Duration::from_secs(16),
            dial_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(8),
            store_entries: 4096,
            provider_entries: 4096,
            store_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Parameters of the peer manager and its session instances.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Dial timeout for outbound connections.
    pub dial_timeout: Duration,
    /// Bound over the whole handshake exchange, both directions.
    pub handshake_timeout: Duration,
    /// Nominal read/write timeout; liveness after activation is covered
    /// by the pingpong cycle instead.
    pub active_timeout: Duration,
    /// Heartbeat period.
    pub pingpong_cycle: Duration,
    /// Unanswered cycles tolerated before the session is closed.
    pub pingpong_threshold: u32,
    /// Wait before re-asking discovery for dial candidates.
    pub dcv_find_node_timer: Duration,
    /// Retry pacing for static-node dialing.
    pub static_retry_timer: Duration,
    /// Per-peer outbound queue bound.
    pub tx_queue_len: usize,
    /// Per-peer inbound (consumer) queue bound; overflow drops and logs.
    pub rx_queue_len: usize,
    /// Peer indication channel bound; overflow is fatal.
    pub ind_queue_len: usize,
    /// Global cap across all sub-networks' inbound instances.
    pub max_inbounds_total: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(8),
            active_timeout: Duration::from_secs(15),
            pingpong_cycle: Duration::from_secs(16),
            pingpong_threshold: 8,
            dcv_find_node_timer: Duration::from_secs(20),
            static_retry_timer: Duration::from_secs(4),
            tx_queue_len: 128,
            rx_queue_len: 128,
            ind_queue_len: 512,
            max_inbounds_total: 64,
        }
    }
}

/// Full node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Human-readable node name, used in logs only.
    pub name: String,
    /// Local record advertised in peer-session handshakes.
    pub local: Node,
    /// Local record advertised on the DHT overlay.
    pub local_dht: Node,
    /// Candidate selection mode.
    pub mode: NetworkMode,
    /// Dynamic sub-networks with their caps.
    pub subnets: Vec<(SubNetId, SubnetCaps)>,
    /// Static peers, admitted under the static sub-network.
    pub static_nodes: Vec<Node>,
    /// Caps applied to the static sub-network.
    pub static_caps: SubnetCaps,
    /// Never dial outbound when set.
    pub no_dial: bool,
    /// This node serves bootstrap only; no outbound either.
    pub bootstrap_node: bool,
    /// Announced protocol count.
    pub proto_num: u32,
    /// Announced protocol table.
    pub protocols: Vec<Protocol>,
    /// Seed for the duplicate-resolution coin toss. Fixed seeds make the
    /// outcome reproducible in tests.
    pub tiebreak_seed: u64,
    pub dht: DhtConfig,
    pub peer: PeerConfig,
}

impl Config {
    /// A configuration listening on the given ports of localhost with a
    /// fresh random identity. The starting point for tests and tools.
    pub fn local_on(id: NodeId, tcp_port: u16, dht_port: u16) -> Self {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            name: String::new(),
            local: Node::new(id, ip, tcp_port, tcp_port),
            local_dht: Node::new(id, ip, dht_port, dht_port),
            mode: NetworkMode::Dynamic,
            subnets: vec![(ANY_SUBNET, SubnetCaps::default())],
            static_nodes: Vec::new(),
            static_caps: SubnetCaps::default(),
            no_dial: false,
            bootstrap_node: false,
            proto_num: 1,
            protocols: vec![Protocol { pid: 0xff, ver: [0, 1, 0, 0] }],
            tiebreak_seed: 0x67797265,
            dht: DhtConfig::default(),
            peer: PeerConfig::default(),
        }
    }

    /// Caps for a sub-network, static or dynamic.
    pub fn caps_for(&self, snid: SubNetId) -> SubnetCaps {
        if snid == crate::identity::STATIC_SUBNET {
            return self.static_caps;
        }
        self.subnets
            .iter()
            .find(|(s, _)| *s == snid)
            .map(|(_, caps)| *caps)
            .unwrap_or_default()
    }

    /// The sub-network identities this node serves, including the static
    /// one whenever static nodes are configured.
    pub fn subnet_ids(&self) -> Vec<SubNetId> {
        let mut ids: Vec<SubNetId> = match self.mode {
            NetworkMode::Static => Vec::new(),
            NetworkMode::Dynamic | NetworkMode::StaticAndDynamic => {
                self.subnets.iter().map(|(s, _)| *s).collect()
            }
        };
        if !self.static_nodes.is_empty() || matches!(self.mode, NetworkMode::Static) {
            ids.push(crate::identity::STATIC_SUBNET);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::STATIC_SUBNET;

    #[test]
    fn static_subnet_listed_when_statics_present() {
        let mut cfg = Config::local_on(NodeId::random(), 0, 0);
        assert!(!cfg.subnet_ids().contains(&STATIC_SUBNET));

        cfg.static_nodes.push(Node::unspecified(NodeId::random()));
        assert!(cfg.subnet_ids().contains(&STATIC_SUBNET));
        assert!(cfg.subnet_ids().contains(&ANY_SUBNET));
    }

    #[test]
    fn caps_resolve_per_subnet() {
        let mut cfg = Config::local_on(NodeId::random(), 0, 0);
        cfg.static_caps = SubnetCaps { max_peers: 4, max_outbounds: 2, max_inbounds: 2 };
        assert_eq!(cfg.caps_for(STATIC_SUBNET).max_peers, 4);
        assert_eq!(cfg.caps_for(ANY_SUBNET), SubnetCaps::default());
    }
}
