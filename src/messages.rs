//! # Wire Protocol Messages
//!
//! All serializable message types used on gyre's wire protocols. Messages
//! are serde structs encoded with bincode behind a u32 length prefix, with
//! size limits enforced on decode to prevent memory exhaustion.
//!
//! ## Protocol families
//!
//! | Family | Envelope | Carried over |
//! |--------|----------|--------------|
//! | DHT | [`DhtPackage`] / [`DhtMessage`] | DHT TCP connections |
//! | Peer | [`P2pPackage`] / [`P2pMessage`] | Peer-manager TCP sessions |
//! | Discovery | [`UdpMessage`] | UDP (external collaborator) |
//! | Block envelope | [`Block`] / [`Transaction`] | opaque to this crate |
//!
//! Both TCP families share the same framing: a big-endian u32 length
//! followed by the bincode body, capped at [`MAX_PACKAGE_SIZE`]. A frame
//! that exceeds the cap or fails to decode closes the offending
//! connection only.

use bincode::Options;
use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errno::Errno;
use crate::identity::{Node, NodeHash, NodeId, SubNetId};

/// Max size of a framed package, either family (4 MiB).
pub const MAX_PACKAGE_SIZE: usize = 4 * 1024 * 1024;

/// Storage key type for DHT values and provider records.
pub type DsKey = NodeHash;

// ============================================================================
// Bounded bincode
// ============================================================================

/// Bincode options with the frame size limit enforced.
/// Always use this for decoding network input.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PACKAGE_SIZE as u64)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Encode a message body for framing.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Decode with the size bound enforced.
pub fn decode_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// Framing
// ============================================================================

/// Read one length-prefixed frame. Oversized or truncated frames are
/// reported as `Errno::Message`; a cleanly closed stream as `Errno::Os`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes, Errno> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(_) => return Err(Errno::Os),
    };
    if len == 0 || len > MAX_PACKAGE_SIZE {
        return Err(Errno::Message);
    }
    let mut buf = BytesMut::zeroed(len);
    if reader.read_exact(&mut buf).await.is_err() {
        return Err(Errno::Os);
    }
    Ok(buf.freeze())
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), Errno> {
    if body.is_empty() || body.len() > MAX_PACKAGE_SIZE {
        return Err(Errno::Message);
    }
    if writer.write_u32(body.len() as u32).await.is_err() {
        return Err(Errno::Os);
    }
    if writer.write_all(body).await.is_err() {
        return Err(Errno::Os);
    }
    writer.flush().await.map_err(|_| Errno::Os)
}

/// Encode and send a message as a single frame.
pub async fn send_message<W, T>(writer: &mut W, value: &T) -> Result<(), Errno>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = encode(value).map_err(|_| Errno::Message)?;
    write_frame(writer, &body).await
}

/// Receive and decode one message frame.
pub async fn recv_message<R, T>(reader: &mut R) -> Result<T, Errno>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let frame = read_frame(reader).await?;
    decode_bounded(&frame).map_err(|_| Errno::Message)
}

// ============================================================================
// DHT wire protocol
// ============================================================================

/// Protocol identity carried in package envelopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Internal protocol traffic.
    Dht = 0,
    /// Opaque application payloads routed to the consumer.
    Ext = 0xff,
}

/// Outer envelope for DHT connections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DhtPackage {
    pub pid: Pid,
    pub payload: Vec<u8>,
}

impl DhtPackage {
    pub fn from_message(msg: &DhtMessage) -> Result<Self, Errno> {
        Ok(Self {
            pid: Pid::Dht,
            payload: encode(msg).map_err(|_| Errno::Message)?,
        })
    }

    pub fn to_message(&self) -> Result<DhtMessage, Errno> {
        if self.pid != Pid::Dht {
            return Err(Errno::Mismatched);
        }
        decode_bounded(&self.payload).map_err(|_| Errno::Message)
    }
}

/// Provider record: the key plus the nodes providing it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub key: DsKey,
    pub nodes: Vec<Node>,
}

/// DHT protocol messages. Every variant carries the sender and receiver
/// records plus a correlation id so responses can be routed back to the
/// query instance that asked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DhtMessage {
    Handshake {
        from: Node,
        to: Node,
        id: u64,
    },
    FindNode {
        from: Node,
        to: Node,
        id: u64,
        target: DsKey,
    },
    Neighbors {
        from: Node,
        to: Node,
        id: u64,
        nodes: Vec<Node>,
    },
    PutValue {
        from: Node,
        to: Node,
        id: u64,
        key: DsKey,
        value: Vec<u8>,
    },
    GetValueReq {
        from: Node,
        to: Node,
        id: u64,
        key: DsKey,
    },
    GetValueRsp {
        from: Node,
        to: Node,
        id: u64,
        key: DsKey,
        value: Option<Vec<u8>>,
        nodes: Vec<Node>,
    },
    PutProvider {
        from: Node,
        to: Node,
        id: u64,
        provider: Provider,
    },
    GetProviderReq {
        from: Node,
        to: Node,
        id: u64,
        key: DsKey,
    },
    GetProviderRsp {
        from: Node,
        to: Node,
        id: u64,
        key: DsKey,
        provider: Option<Provider>,
        nodes: Vec<Node>,
    },
    Ping {
        from: Node,
        to: Node,
        id: u64,
    },
    Pong {
        from: Node,
        to: Node,
        id: u64,
    },
}

impl DhtMessage {
    /// Correlation id shared by a request and its response.
    pub fn id(&self) -> u64 {
        match self {
            DhtMessage::Handshake { id, .. }
            | DhtMessage::FindNode { id, .. }
            | DhtMessage::Neighbors { id, .. }
            | DhtMessage::PutValue { id, .. }
            | DhtMessage::GetValueReq { id, .. }
            | DhtMessage::GetValueRsp { id, .. }
            | DhtMessage::PutProvider { id, .. }
            | DhtMessage::GetProviderReq { id, .. }
            | DhtMessage::GetProviderRsp { id, .. }
            | DhtMessage::Ping { id, .. }
            | DhtMessage::Pong { id, .. } => *id,
        }
    }

    /// The sender record carried in the message.
    pub fn from_node(&self) -> &Node {
        match self {
            DhtMessage::Handshake { from, .. }
            | DhtMessage::FindNode { from, .. }
            | DhtMessage::Neighbors { from, .. }
            | DhtMessage::PutValue { from, .. }
            | DhtMessage::GetValueReq { from, .. }
            | DhtMessage::GetValueRsp { from, .. }
            | DhtMessage::PutProvider { from, .. }
            | DhtMessage::GetProviderReq { from, .. }
            | DhtMessage::GetProviderRsp { from, .. }
            | DhtMessage::Ping { from, .. }
            | DhtMessage::Pong { from, .. } => from,
        }
    }
}

// ============================================================================
// Peer wire protocol
// ============================================================================

/// A protocol announced during the peer handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    pub pid: u32,
    pub ver: [u8; 4],
}

/// Protocol identity on peer-manager sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PeerPid {
    /// Internal session traffic (handshake, ping, pong).
    P2p = 0,
    /// Opaque application payloads forwarded to the consumer.
    Ext = 0xff,
}

/// Outer envelope for peer-manager sessions. `PeerPid::Ext` packages carry
/// opaque payloads plus optional application routing hints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct P2pPackage {
    pub pid: PeerPid,
    pub ext_mid: Option<u32>,
    pub ext_key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl P2pPackage {
    pub fn internal(msg: &P2pMessage) -> Result<Self, Errno> {
        Ok(Self {
            pid: PeerPid::P2p,
            ext_mid: None,
            ext_key: None,
            payload: encode(msg).map_err(|_| Errno::Message)?,
        })
    }

    pub fn external(payload: Vec<u8>) -> Self {
        Self {
            pid: PeerPid::Ext,
            ext_mid: None,
            ext_key: None,
            payload,
        }
    }

    pub fn to_message(&self) -> Result<P2pMessage, Errno> {
        if self.pid != PeerPid::P2p {
            return Err(Errno::Mismatched);
        }
        if self.payload.is_empty() {
            return Err(Errno::Message);
        }
        decode_bounded(&self.payload).map_err(|_| Errno::Message)
    }
}

/// Session handshake. The signature fields are produced and checked by the
/// external crypto capability; gyre carries them opaquely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub snid: SubNetId,
    pub node_id: NodeId,
    pub ip: std::net::IpAddr,
    pub udp: u16,
    pub tcp: u16,
    pub proto_num: u32,
    pub protocols: Vec<Protocol>,
    pub sign_r: Vec<u8>,
    pub r: Vec<u8>,
    pub sign_s: Vec<u8>,
    pub s: Vec<u8>,
}

impl Handshake {
    /// Handshake advertising the given local record.
    pub fn from_local(snid: SubNetId, local: &Node, proto_num: u32, protocols: &[Protocol]) -> Self {
        Self {
            snid,
            node_id: local.id,
            ip: local.ip,
            udp: local.udp,
            tcp: local.tcp,
            proto_num,
            protocols: protocols.to_vec(),
            sign_r: Vec::new(),
            r: Vec::new(),
            sign_s: Vec::new(),
            s: Vec::new(),
        }
    }

    /// The peer record advertised by this handshake.
    pub fn node(&self) -> Node {
        Node::new(self.node_id, self.ip, self.udp, self.tcp)
    }
}

/// Internal peer-session messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum P2pMessage {
    Handshake(Handshake),
    Ping { seq: u64 },
    Pong { seq: u64 },
}

// ============================================================================
// UDP discovery wire protocol (external collaborator)
// ============================================================================

/// Messages of the UDP discovery protocol. The discovery service itself
/// is an external collaborator; these types pin the wire contract.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum UdpMessage {
    Ping {
        from: Node,
        to: Node,
        expiration: u64,
    },
    Pong {
        from: Node,
        to: Node,
        expiration: u64,
    },
    FindNode {
        from: Node,
        to: Node,
        target: NodeId,
        expiration: u64,
    },
    Neighbors {
        from: Node,
        to: Node,
        nodes: Vec<Node>,
        expiration: u64,
    },
    StaleAddress {
        from: Node,
        to: Node,
        seen_ip: std::net::IpAddr,
        seen_port: u16,
    },
}

// ============================================================================
// Block envelope (consumed, not interpreted)
// ============================================================================

/// Storage key prefix for block headers.
pub const KEY_PREFIX_HEADER: &str = "bh";

/// Storage key prefix for transactions.
pub const KEY_PREFIX_TX: &str = "tx";

/// Storage key holding the big-endian u32 chain id.
pub const KEY_CHAIN_ID: &str = "ChainID";

/// A signed transaction, opaque to the node core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub raw: Vec<u8>,
}

/// Signed block header: RLP header bytes, bloom, validator signatures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlockHeader {
    pub header_rlp: Vec<u8>,
    pub bloom: Vec<u8>,
    pub signatures: Vec<Vec<u8>>,
}

/// Block body: raw transaction bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    pub raw_transactions: Vec<Vec<u8>>,
}

/// The block envelope gossiped between nodes. Carried through the EXT
/// path of the peer protocol without interpretation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: SignedBlockHeader,
    pub body: BlockBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{NodeId, ANY_SUBNET};
    use std::net::{IpAddr, Ipv4Addr};

    fn make_node(seed: u8) -> Node {
        Node::new(
            NodeId::from_bytes([seed; 64]),
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, seed)),
            30303,
            30304,
        )
    }

    #[test]
    fn handshake_round_trip() {
        let hs = Handshake {
            snid: ANY_SUBNET,
            node_id: NodeId::from_bytes([3; 64]),
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            udp: 1000,
            tcp: 1001,
            proto_num: 2,
            protocols: vec![
                Protocol { pid: 0, ver: [1, 0, 0, 0] },
                Protocol { pid: 0xff, ver: [2, 1, 0, 0] },
            ],
            sign_r: vec![1, 2, 3],
            r: vec![4, 5],
            sign_s: vec![6],
            s: vec![7, 8, 9],
        };
        let bytes = encode(&P2pMessage::Handshake(hs.clone())).unwrap();
        let back: P2pMessage = decode_bounded(&bytes).unwrap();
        assert_eq!(back, P2pMessage::Handshake(hs));
    }

    #[test]
    fn dht_message_round_trip() {
        let msgs = vec![
            DhtMessage::FindNode {
                from: make_node(1),
                to: make_node(2),
                id: 42,
                target: NodeId::from_bytes([9; 64]).hash(),
            },
            DhtMessage::Neighbors {
                from: make_node(1),
                to: make_node(2),
                id: 42,
                nodes: vec![make_node(3), make_node(4)],
            },
            DhtMessage::GetValueRsp {
                from: make_node(1),
                to: make_node(2),
                id: 7,
                key: NodeId::from_bytes([9; 64]).hash(),
                value: Some(b"payload".to_vec()),
                nodes: vec![],
            },
            DhtMessage::PutProvider {
                from: make_node(1),
                to: make_node(2),
                id: 8,
                provider: Provider {
                    key: NodeId::from_bytes([5; 64]).hash(),
                    nodes: vec![make_node(6)],
                },
            },
        ];
        for msg in msgs {
            let pkg = DhtPackage::from_message(&msg).unwrap();
            let bytes = encode(&pkg).unwrap();
            let back: DhtPackage = decode_bounded(&bytes).unwrap();
            assert_eq!(back.to_message().unwrap(), msg);
        }
    }

    #[test]
    fn p2p_package_round_trip() {
        let pkg = P2pPackage::external(b"block bytes".to_vec());
        let bytes = encode(&pkg).unwrap();
        let back: P2pPackage = decode_bounded(&bytes).unwrap();
        assert_eq!(back, pkg);
        // External packages must not parse as internal messages.
        assert_eq!(back.to_message().unwrap_err(), Errno::Mismatched);
    }

    #[test]
    fn transaction_and_block_round_trip() {
        let tx = Transaction { raw: vec![0xde, 0xad, 0xbe, 0xef] };
        let bytes = encode(&tx).unwrap();
        let back: Transaction = decode_bounded(&bytes).unwrap();
        assert_eq!(back, tx);

        let block = Block {
            header: SignedBlockHeader {
                header_rlp: vec![1, 2, 3],
                bloom: vec![0; 8],
                signatures: vec![vec![9; 65], vec![8; 65]],
            },
            body: BlockBody {
                raw_transactions: vec![tx.raw.clone()],
            },
        };
        let bytes = encode(&block).unwrap();
        let back: Block = decode_bounded(&bytes).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn malformed_frames_rejected() {
        let garbage = [0xff, 0xfe, 0xfd, 0xfc, 0xfb];
        assert!(decode_bounded::<DhtPackage>(&garbage).is_err());

        let msg = DhtMessage::Ping { from: make_node(1), to: make_node(2), id: 1 };
        let bytes = encode(&msg).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(decode_bounded::<DhtMessage>(truncated).is_err());
    }

    #[tokio::test]
    async fn framing_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = UdpMessage::FindNode {
            from: make_node(1),
            to: make_node(2),
            target: NodeId::from_bytes([7; 64]),
            expiration: 12345,
        };
        send_message(&mut a, &msg).await.unwrap();
        let back: UdpMessage = recv_message(&mut b).await.unwrap();
        assert_eq!(back, msg);
    }

    #[tokio::test]
    async fn oversized_frame_is_a_message_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            // Advertise a body larger than the cap; never send it.
            let _ = a.write_u32((MAX_PACKAGE_SIZE + 1) as u32).await;
        });
        assert_eq!(read_frame(&mut b).await.unwrap_err(), Errno::Message);
    }
}
