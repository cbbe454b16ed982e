//! # Gyre — peer-to-peer blockchain node core
//!
//! Gyre implements the networking core of a blockchain node: a
//! Kademlia-style DHT that discovers peers, routes lookups and stores
//! key-value and provider records, and a TCP peer manager that maintains
//! authenticated, heart-beated sessions across logical sub-networks.
//!
//! ## Architecture
//!
//! The crate is a set of cooperating actors, each a tokio task owning
//! its state and driven by a bounded command mailbox, with a cheap
//! clone-able handle as its public face:
//!
//! | Module | Actor | Purpose |
//! |--------|-------|---------|
//! | `routing` | RUT | log-distance buckets, nearest lookups, notifications |
//! | `conn` | CON | DHT-side TCP connections and request framing |
//! | `query` | QRY | iterative lookups, one control block per target |
//! | `dht` | DHT | façade, local stores, consumer event channels |
//! | `nat` | NAT | public-address learning behind a mapper trait |
//! | `peer` | PEM/PI | sub-networked session fabric, handshake, heartbeat |
//! | `node` | — | assembly and the public service API |
//!
//! Blockchain data structures, consensus, signing and storage live in
//! collaborating crates; gyre carries their wire envelopes opaquely.
//!
//! ## Quick start
//!
//! ```ignore
//! let cfg = Config::local_on(NodeId::random(), 30303, 30304);
//! let (node, mut channels) = NodeService::create(cfg, None).await?;
//! node.start().await;
//!
//! while let Some(ind) = channels.peer.recv().await {
//!     match ind {
//!         PeerIndication::Activated { info, rx } => { /* serve rx */ }
//!         PeerIndication::Closed { snid, id } => { /* forget peer */ }
//!     }
//! }
//! ```

pub mod config;
pub mod conn;
pub mod dht;
pub mod errno;
pub mod identity;
pub mod messages;
pub mod nat;
pub mod node;
pub mod peer;
pub mod query;
pub mod routing;

pub use config::{Config, DhtConfig, NetworkMode, PeerConfig, SubnetCaps};
pub use errno::Errno;
pub use identity::{log2_dist, Direction, Node, NodeHash, NodeId, SubNetId, ANY_SUBNET, STATIC_SUBNET};
pub use nat::{NatEvent, NatProto, NatStatus, NatType, NoNat, PortMapper};
pub use node::{NodeChannels, NodeService};
pub use peer::{Discovery, NoDiscovery, PeerIndication, PeerInfo, PemSnapshot};
pub use query::{ForWhat, QueryResultInd};
