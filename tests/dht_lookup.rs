//! DHT integration: lookups, value and provider replication, drained
//! and duplicated queries, and the NAT address switch, over real
//! sockets on localhost with compressed timers.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use gyre::dht::DhtEvent;
use gyre::messages::{decode_bounded, DhtMessage, DhtPackage, DsKey};
use gyre::{Config, Errno, NatProto, NatStatus, Node, NodeHash, NodeId, NodeService};

/// Compressed-timer configuration for a localhost DHT node; sessions
/// are kept quiet so only the overlay talks.
fn test_config(id: NodeId) -> Config {
    let mut cfg = Config::local_on(id, 0, 0);
    cfg.no_dial = true;
    cfg.dht.dial_timeout = Duration::from_secs(2);
    cfg.dht.handshake_timeout = Duration::from_secs(2);
    cfg.dht.qry_expired = Duration::from_secs(10);
    cfg.dht.qry_inst_expired = Duration::from_secs(2);
    cfg.dht.bootstrap_period = Duration::from_secs(600);
    cfg
}

async fn make_node() -> (NodeService, gyre::NodeChannels) {
    let (node, channels) = NodeService::create(test_config(NodeId::random()), None)
        .await
        .unwrap();
    node.start().await;
    (node, channels)
}

/// A hub-and-spoke overlay: every spoke knows the hub, the hub knows
/// everyone. The channels ride along so the indication queues stay
/// serviceable for the duration of a test.
async fn hub_and_spokes(
    spokes: usize,
) -> (NodeService, Vec<NodeService>, Vec<gyre::NodeChannels>) {
    let (hub, hub_ch) = make_node().await;
    let mut channels = vec![hub_ch];

    let mut nodes = Vec::with_capacity(spokes);
    for _ in 0..spokes {
        let (node, ch) = make_node().await;
        channels.push(ch);
        node.add_dht_peer(hub.local_dht()).await;
        hub.add_dht_peer(node.local_dht()).await;
        nodes.push(node);
    }
    (hub, nodes, channels)
}

#[tokio::test]
async fn find_peer_converges_through_the_hub() {
    let (_hub, nodes, _channels) = hub_and_spokes(3).await;
    let wanted = nodes[2].local_dht();

    let result = timeout(Duration::from_secs(15), nodes[0].find_peer(wanted.id))
        .await
        .expect("lookup must finish");
    assert_eq!(result.eno, Errno::None, "peer must be found");
    assert!(
        result.peers.iter().any(|p| p.id == wanted.id),
        "result must contain the wanted peer"
    );
}

#[tokio::test]
async fn values_replicate_and_resolve_across_nodes() {
    let (_hub, nodes, _channels) = hub_and_spokes(2).await;
    let key: DsKey = NodeHash::random();
    let value = b"signed transaction bytes".to_vec();

    let put = timeout(Duration::from_secs(15), nodes[0].put_value(key, value.clone()))
        .await
        .expect("put must finish");
    assert_eq!(put.eno, Errno::None, "put is successful by replication");

    // The publisher answers from its local store without a query.
    let local = timeout(Duration::from_secs(5), nodes[0].get_value(key))
        .await
        .expect("local get must finish");
    assert_eq!(local.value.as_deref(), Some(value.as_slice()));

    // The other spoke resolves through the hub.
    let remote = timeout(Duration::from_secs(15), nodes[1].get_value(key))
        .await
        .expect("remote get must finish");
    assert_eq!(remote.eno, Errno::None);
    assert_eq!(remote.value.as_deref(), Some(value.as_slice()));
}

#[tokio::test]
async fn providers_replicate_and_resolve_across_nodes() {
    let (_hub, nodes, _channels) = hub_and_spokes(2).await;
    let key: DsKey = NodeHash::random();
    let provider = nodes[0].local_dht();

    let put = timeout(
        Duration::from_secs(15),
        nodes[0].put_provider(key, vec![provider]),
    )
    .await
    .expect("put provider must finish");
    assert_eq!(put.eno, Errno::None);

    let got = timeout(Duration::from_secs(15), nodes[1].get_provider(key))
        .await
        .expect("get provider must finish");
    assert_eq!(got.eno, Errno::None);
    assert!(
        got.providers.iter().any(|p| p.id == provider.id),
        "provider record must name the announcer"
    );
}

#[tokio::test]
async fn missing_value_reports_not_found() {
    let (_hub, nodes, _channels) = hub_and_spokes(2).await;
    let key: DsKey = NodeHash::random();

    let result = timeout(Duration::from_secs(15), nodes[0].get_value(key))
        .await
        .expect("lookup must finish");
    assert_eq!(result.eno, Errno::NotFound, "nobody holds the key");
    assert!(result.value.is_none());
}

/// Accepts DHT connections, forwards every decoded message to the test,
/// and never answers anything.
async fn stalling_dht_peer() -> (Node, mpsc::Receiver<DhtMessage>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    let Ok(len) = stream.read_u32().await else { return };
                    let mut buf = vec![0u8; len as usize];
                    if stream.read_exact(&mut buf).await.is_err() {
                        return;
                    }
                    if let Ok(pkg) = decode_bounded::<DhtPackage>(&buf) {
                        if let Ok(msg) = pkg.to_message() {
                            let _ = tx.send(msg).await;
                        }
                    }
                }
            });
        }
    });
    let record = Node::new(NodeId::random(), addr.ip(), addr.port(), addr.port());
    (record, rx)
}

#[tokio::test]
async fn duplicated_target_is_rejected_while_in_flight() {
    let (node, _channels) = make_node().await;
    let (stall, _msgs) = stalling_dht_peer().await;
    node.add_dht_peer(stall).await;

    let key: DsKey = NodeHash::random();
    let node = std::sync::Arc::new(node);
    let first = {
        let node = node.clone();
        tokio::spawn(async move { node.get_value(key).await })
    };
    sleep(Duration::from_millis(300)).await;

    // The first lookup is still waiting on the stalling peer.
    let second = node.get_value(key).await;
    assert_eq!(second.eno, Errno::Duplicated);

    let first = timeout(Duration::from_secs(15), first)
        .await
        .expect("first lookup must finish")
        .unwrap();
    assert_ne!(first.eno, Errno::Duplicated);
}

#[tokio::test]
async fn nat_switch_fails_outstanding_queries_and_rebinds_the_record() {
    let (node, mut channels) = make_node().await;
    let (stall, mut msgs) = stalling_dht_peer().await;
    node.add_dht_peer(stall).await;

    let node = std::sync::Arc::new(node);
    let keys: Vec<DsKey> = (0..3).map(|_| NodeHash::random()).collect();
    let mut lookups = Vec::new();
    for key in &keys {
        let node = node.clone();
        let key = *key;
        lookups.push(tokio::spawn(async move { node.get_value(key).await }));
    }
    sleep(Duration::from_millis(300)).await;

    // The mapper observed a new public endpoint.
    let new_ip: std::net::IpAddr = "203.0.113.7".parse().unwrap();
    let new_port = 4567;
    node.nat()
        .announce_public_addr(NatProto::Tcp, new_ip, new_port, NatStatus::Ok)
        .await;

    // Every in-flight query gives up with NatMapping.
    for lookup in lookups {
        let result = timeout(Duration::from_secs(10), lookup)
            .await
            .expect("query must be terminated by the switch")
            .unwrap();
        assert_eq!(result.eno, Errno::NatMapping);
    }

    // The façade is told about the switch.
    let switched = timeout(Duration::from_secs(5), async {
        loop {
            match channels.dht.events.recv().await {
                Some(DhtEvent::PubAddrSwitch(ind)) => return ind,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("address switch event must arrive");
    assert_eq!(switched.ip, new_ip);
    assert_eq!(switched.tcp, new_port);

    // Subsequent outbound handshakes advertise the switched record. Let
    // the pre-switch connection attempt run out first so the next query
    // opens a fresh one.
    sleep(Duration::from_secs(3)).await;
    let key: DsKey = NodeHash::random();
    {
        let node = node.clone();
        tokio::spawn(async move {
            let _ = node.get_value(key).await;
        });
    }
    let hello = timeout(Duration::from_secs(10), async {
        loop {
            match msgs.recv().await {
                Some(msg) if msg.from_node().ip == new_ip => return msg,
                Some(_) => continue,
                None => panic!("stall peer gone"),
            }
        }
    })
    .await
    .expect("a handshake with the switched address must arrive");
    assert_eq!(hello.from_node().tcp, new_port);
}
