//! # Node Identity and the XOR Metric
//!
//! This module defines the identity types used throughout gyre:
//!
//! - [`NodeId`]: 64-byte public key serving as the peer's unique identifier
//! - [`NodeHash`]: 32-byte SHA-256 digest of a [`NodeId`], the coordinate
//!   used by the routing metric
//! - [`Node`]: a peer record (id, address, UDP and TCP ports)
//! - [`SubNetId`]: the two-byte logical sub-network identity peers
//!   handshake against
//!
//! ## Distance
//!
//! Peers are ordered by *log-distance* over hashes: walk the bytes of
//! `h1 XOR h2` left to right; every equal byte contributes 8, and the
//! first differing byte `b` contributes `7 - floor(log2 b)` through a
//! precomputed 256-entry table. A **larger** value means **closer** — the
//! opposite of the plain XOR integer ordering.
//!
//! ## Invariants
//!
//! - `log2_dist(a, b) == log2_dist(b, a)` for all hashes
//! - `NodeId -> NodeHash` is deterministic given the identity bytes
//! - Conversions between [`Node`] and its wire form are bijective

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a node identity in bytes (an uncompressed public key).
pub const NODE_ID_LEN: usize = 64;

/// Length of a metric hash in bytes.
pub const HASH_LEN: usize = 32;

/// Number of bits in a metric hash.
pub const HASH_BITS: usize = HASH_LEN * 8;

// ============================================================================
// NodeId
// ============================================================================

/// A peer's identity: its 64-byte public key.
///
/// Key generation and signing live outside this crate; gyre treats the
/// bytes opaquely and only ever hashes them for the routing metric.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(#[serde(with = "serde_bytes64")] pub [u8; NODE_ID_LEN]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// A fresh random identity, used for bootstrap lookups and by the
    /// bootnode key generator.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        // getrandom failure means the OS entropy source is gone; there is
        // no sensible fallback for an identity.
        getrandom::getrandom(&mut bytes).expect("os entropy source unavailable");
        Self(bytes)
    }

    /// SHA-256 of the identity bytes, the coordinate in the XOR metric.
    pub fn hash(&self) -> NodeHash {
        let digest = Sha256::digest(self.0);
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&digest);
        NodeHash(out)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim())?;
        if bytes.len() != NODE_ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; NODE_ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// Fixed-size 64-byte arrays lack a serde impl that keeps the wire form a
// plain byte sequence, so spell it out once here.
mod serde_bytes64 {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 64], D::Error> {
        let v: Vec<u8> = Deserialize::deserialize(de)?;
        v.try_into()
            .map_err(|_| D::Error::custom("node id must be exactly 64 bytes"))
    }
}

// ============================================================================
// NodeHash and log-distance
// ============================================================================

/// 32-byte SHA-256 digest of a [`NodeId`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeHash(pub [u8; HASH_LEN]);

impl NodeHash {
    #[inline]
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// A uniformly random hash, used as a lookup target during bootstrap.
    pub fn random() -> Self {
        let mut bytes = [0u8; HASH_LEN];
        getrandom::getrandom(&mut bytes).expect("os entropy source unavailable");
        Self(bytes)
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHash({}..)", hex::encode(&self.0[..8]))
    }
}

/// Per-byte log2 contribution table: `LOOKUP[0] = 8`, and for `b > 0`
/// `LOOKUP[b] = 7 - floor(log2 b)`.
const fn build_log2_lookup() -> [u8; 256] {
    let mut lkt = [0u8; 256];
    lkt[0] = 8;
    let mut n = 0u32;
    while n < 8 {
        let mut b = 1usize << n;
        let end = 1usize << (n + 1);
        while b < end {
            lkt[b] = (8 - n - 1) as u8;
            b += 1;
        }
        n += 1;
    }
    lkt
}

/// 256-entry lookup accelerating [`log2_dist`].
pub(crate) const LOG2_LOOKUP: [u8; 256] = build_log2_lookup();

/// Log-distance between two hashes. Accumulates 8 per equal leading byte
/// and stops at the first differing byte, adding its lookup value. Larger
/// result means closer. Fully equal hashes report 0.
pub fn log2_dist(h1: &NodeHash, h2: &NodeHash) -> usize {
    let mut d = 0usize;
    for i in 0..HASH_LEN {
        let delta = LOG2_LOOKUP[(h1.0[i] ^ h2.0[i]) as usize] as usize;
        d += delta;
        if delta != 8 {
            return d;
        }
    }
    // No differing byte found.
    0
}

// ============================================================================
// Peer records
// ============================================================================

/// Logical sub-network identity. Peers handshake against one sub-network
/// and per-sub-network admission caps apply independently.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubNetId(pub [u8; 2]);

/// The sub-network identity all static peers are admitted under.
pub const STATIC_SUBNET: SubNetId = SubNetId([0xff, 0xff]);

/// The catch-all sub-network used when no masking is configured.
pub const ANY_SUBNET: SubNetId = SubNetId([0x00, 0x00]);

impl fmt::Debug for SubNetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snid:{:02x}{:02x}", self.0[0], self.0[1])
    }
}

impl fmt::Display for SubNetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}", self.0[0], self.0[1])
    }
}

/// A peer record: identity plus reachability information. Conversions to
/// and from the wire `Node` message preserve every field.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
}

impl Node {
    pub fn new(id: NodeId, ip: IpAddr, udp: u16, tcp: u16) -> Self {
        Self { id, ip, udp, tcp }
    }

    /// Placeholder record for an identity whose endpoint is not yet known.
    pub fn unspecified(id: NodeId) -> Self {
        Self {
            id,
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp: 0,
            tcp: 0,
        }
    }

    /// TCP endpoint of this peer.
    pub fn tcp_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.tcp)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({} {}:{}/u{})", self.id, self.ip, self.tcp, self.udp)
    }
}

/// Connection direction of a session or instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(byte: u8) -> NodeHash {
        NodeHash([byte; HASH_LEN])
    }

    #[test]
    fn lookup_table_matches_definition() {
        assert_eq!(LOG2_LOOKUP[0], 8);
        assert_eq!(LOG2_LOOKUP[1], 7);
        assert_eq!(LOG2_LOOKUP[2], 6);
        assert_eq!(LOG2_LOOKUP[3], 6);
        assert_eq!(LOG2_LOOKUP[4], 5);
        assert_eq!(LOG2_LOOKUP[0x80], 0);
        assert_eq!(LOG2_LOOKUP[0xff], 0);
        for b in 1..=255usize {
            assert_eq!(LOG2_LOOKUP[b] as u32, 7 - (b as u32).ilog2());
        }
    }

    #[test]
    fn distance_is_symmetric() {
        let a = NodeId::random().hash();
        let b = NodeId::random().hash();
        assert_eq!(log2_dist(&a, &b), log2_dist(&b, &a));
    }

    #[test]
    fn distance_of_equal_hashes_is_zero() {
        let h = hash_of(0x5a);
        assert_eq!(log2_dist(&h, &h), 0);
    }

    #[test]
    fn distance_orders_by_shared_prefix() {
        let zero = hash_of(0);
        let mut close = [0u8; HASH_LEN];
        close[31] = 1; // differs only in the last bit
        let mut far = [0u8; HASH_LEN];
        far[0] = 0x80; // differs in the first bit
        // Larger distance value means closer.
        assert!(log2_dist(&zero, &NodeHash(close)) > log2_dist(&zero, &NodeHash(far)));
        assert_eq!(log2_dist(&zero, &NodeHash(far)), 0);
        assert_eq!(log2_dist(&zero, &NodeHash(close)), 8 * 31 + 7);
    }

    #[test]
    fn id_to_hash_is_deterministic() {
        let id = NodeId::from_bytes([7u8; NODE_ID_LEN]);
        assert_eq!(id.hash(), id.hash());
        let other = NodeId::from_bytes([8u8; NODE_ID_LEN]);
        assert_ne!(id.hash(), other.hash());
    }

    #[test]
    fn node_id_hex_round_trip() {
        let id = NodeId::random();
        let hex = id.to_hex();
        assert_eq!(NodeId::from_hex(&hex).unwrap(), id);
        assert!(NodeId::from_hex("deadbeef").is_err());
    }

    #[test]
    fn node_record_serde_round_trip() {
        let n = Node::new(
            NodeId::random(),
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            30303,
            30304,
        );
        let bytes = bincode::serialize(&n).unwrap();
        let back: Node = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, n);
    }
}
