//! Session fabric integration: simultaneous-dial duplicate resolution,
//! heartbeat timeout, data path and admission caps, all over real
//! sockets on localhost with compressed timers.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use gyre::messages::{
    decode_bounded, encode, Handshake, P2pMessage, P2pPackage, Protocol,
};
use gyre::{
    Config, Direction, Errno, Node, NodeId, NodeService, PeerIndication, STATIC_SUBNET,
};

/// Compressed-timer configuration for a localhost node.
fn test_config(id: NodeId, seed: u64) -> Config {
    let mut cfg = Config::local_on(id, 0, 0);
    cfg.tiebreak_seed = seed;
    cfg.peer.dial_timeout = Duration::from_secs(2);
    cfg.peer.handshake_timeout = Duration::from_secs(2);
    cfg.peer.pingpong_cycle = Duration::from_millis(150);
    cfg.peer.pingpong_threshold = 3;
    cfg.peer.static_retry_timer = Duration::from_millis(200);
    cfg.peer.dcv_find_node_timer = Duration::from_millis(500);
    cfg
}

async fn write_pkg(stream: &mut TcpStream, pkg: &P2pPackage) {
    let body = encode(pkg).unwrap();
    stream.write_u32(body.len() as u32).await.unwrap();
    stream.write_all(&body).await.unwrap();
}

async fn read_pkg(stream: &mut TcpStream) -> P2pPackage {
    let len = stream.read_u32().await.unwrap() as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    decode_bounded(&buf).unwrap()
}

/// Dial a node's session port and complete an inbound handshake under
/// the given identity; returns the open stream.
async fn raw_session(target: Node, me: Node) -> TcpStream {
    let mut stream = TcpStream::connect(target.tcp_addr()).await.unwrap();
    let hs = Handshake {
        snid: gyre::ANY_SUBNET,
        node_id: me.id,
        ip: me.ip,
        udp: me.udp,
        tcp: me.tcp,
        proto_num: 1,
        protocols: vec![Protocol { pid: 0xff, ver: [0, 1, 0, 0] }],
        sign_r: Vec::new(),
        r: Vec::new(),
        sign_s: Vec::new(),
        s: Vec::new(),
    };
    write_pkg(&mut stream, &P2pPackage::internal(&P2pMessage::Handshake(hs)).unwrap()).await;
    let answer = read_pkg(&mut stream).await;
    match answer.to_message().unwrap() {
        P2pMessage::Handshake(_) => {}
        other => panic!("expected handshake answer, got {other:?}"),
    }
    stream
}

/// Reserve a localhost port by binding and immediately releasing it.
/// Static configurations need both endpoints known up front.
async fn reserve_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn simultaneous_dial_leaves_one_worker_per_side() {
    let id_a = NodeId::random();
    let id_b = NodeId::random();
    let port_a = reserve_port().await;
    let port_b = reserve_port().await;
    let rec_a = Node::new(id_a, "127.0.0.1".parse().unwrap(), port_a, port_a);
    let rec_b = Node::new(id_b, "127.0.0.1".parse().unwrap(), port_b, port_b);

    let mut cfg_a = test_config(id_a, 11);
    cfg_a.local.tcp = port_a;
    cfg_a.local.udp = port_a;
    cfg_a.mode = gyre::NetworkMode::Static;
    cfg_a.static_nodes = vec![rec_b];

    let mut cfg_b = test_config(id_b, 22);
    cfg_b.local.tcp = port_b;
    cfg_b.local.udp = port_b;
    cfg_b.mode = gyre::NetworkMode::Static;
    cfg_b.static_nodes = vec![rec_a];

    let (node_a, mut ch_a) = NodeService::create(cfg_a, None).await.unwrap();
    let (node_b, mut ch_b) = NodeService::create(cfg_b, None).await.unwrap();

    // Both dial each other while both accept: each side briefly holds
    // one inbound and one outbound instance for the same identity.
    node_a.start().await;
    node_b.start().await;

    // Wait until both sides have exactly one worker, with complementary
    // directions.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let snap_a = node_a.peer_snapshot().await;
        let snap_b = node_b.peer_snapshot().await;
        let wrk_a = snap_a.workers.len();
        let wrk_b = snap_b.workers.len();
        if wrk_a == 1 && wrk_b == 1 {
            let (snid_a, peer_of_a, dir_a) = snap_a.workers[0];
            let (_, peer_of_b, dir_b) = snap_b.workers[0];
            assert_eq!(snid_a, STATIC_SUBNET);
            assert_eq!(peer_of_a, id_b);
            assert_eq!(peer_of_b, id_a);
            assert_ne!(dir_a, dir_b, "directions must be complementary");

            // Counter reconciliation: worker counters match table sizes.
            for snap in [&snap_a, &snap_b] {
                let total: usize = snap.per_subnet.iter().map(|(_, c)| c.wrk_num).sum();
                assert_eq!(total, snap.workers.len());
            }
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("no stable worker pair, a={wrk_a} b={wrk_b}");
        }
        sleep(Duration::from_millis(100)).await;
    }

    // Both consumers saw an activation.
    let act_a = timeout(Duration::from_secs(5), wait_activated(&mut ch_a.peer)).await;
    let act_b = timeout(Duration::from_secs(5), wait_activated(&mut ch_b.peer)).await;
    assert!(act_a.is_ok() && act_b.is_ok(), "activation indications missing");

    node_a.stop().await;
    node_b.stop().await;
}

async fn wait_activated(
    rx: &mut tokio::sync::mpsc::Receiver<PeerIndication>,
) -> gyre::PeerInfo {
    loop {
        match rx.recv().await {
            Some(PeerIndication::Activated { info, .. }) => return info,
            Some(PeerIndication::Closed { .. }) => continue,
            None => panic!("indication channel closed"),
        }
    }
}

#[tokio::test]
async fn silent_session_closes_on_pingpong_threshold() {
    let id = NodeId::random();
    let cfg = test_config(id, 33);
    let (node, mut channels) = NodeService::create(cfg, None).await.unwrap();
    node.start().await;

    let me = Node::unspecified(NodeId::random());
    let stream = raw_session(node.local(), me).await;

    // The session activates, then we stay silent: no pings, no pongs.
    let info = timeout(Duration::from_secs(5), wait_activated(&mut channels.peer))
        .await
        .expect("session must activate");
    assert_eq!(info.node.id, me.id);
    assert_eq!(info.dir, Direction::Inbound);

    // threshold(3) + 1 cycles of 150 ms, plus slack.
    let closed = timeout(Duration::from_secs(10), async {
        loop {
            match channels.peer.recv().await {
                Some(PeerIndication::Closed { id, .. }) => return id,
                Some(_) => continue,
                None => panic!("indication channel closed"),
            }
        }
    })
    .await
    .expect("silent session must be closed");
    assert_eq!(closed, me.id);

    drop(stream);
    node.stop().await;
}

#[tokio::test]
async fn answered_pings_keep_the_session_alive() {
    let id = NodeId::random();
    let cfg = test_config(id, 44);
    let (node, mut channels) = NodeService::create(cfg, None).await.unwrap();
    node.start().await;

    let me = Node::unspecified(NodeId::random());
    let mut stream = raw_session(node.local(), me).await;

    timeout(Duration::from_secs(5), wait_activated(&mut channels.peer))
        .await
        .expect("session must activate");

    // Answer every ping with the matching pong for well past the
    // silence threshold.
    let horizon = tokio::time::Instant::now() + Duration::from_millis(150 * 10);
    while tokio::time::Instant::now() < horizon {
        let pkg = match timeout(Duration::from_secs(2), read_pkg(&mut stream)).await {
            Ok(pkg) => pkg,
            Err(_) => continue,
        };
        if let Ok(P2pMessage::Ping { seq }) = pkg.to_message() {
            let pong = P2pMessage::Pong { seq };
            write_pkg(&mut stream, &P2pPackage::internal(&pong).unwrap()).await;
        }
    }

    assert!(
        channels.peer.try_recv().is_err(),
        "session must stay up while pings are answered"
    );
    node.stop().await;
}

/// Build a pair of nodes that list each other as static peers.
async fn static_pair(
    seed_a: u64,
    seed_b: u64,
) -> (NodeService, gyre::NodeChannels, NodeService, gyre::NodeChannels, NodeId, NodeId) {
    let id_a = NodeId::random();
    let id_b = NodeId::random();
    let port_a = reserve_port().await;
    let port_b = reserve_port().await;
    let rec_a = Node::new(id_a, "127.0.0.1".parse().unwrap(), port_a, port_a);
    let rec_b = Node::new(id_b, "127.0.0.1".parse().unwrap(), port_b, port_b);

    let mut cfg_a = test_config(id_a, seed_a);
    cfg_a.local.tcp = port_a;
    cfg_a.local.udp = port_a;
    cfg_a.mode = gyre::NetworkMode::Static;
    cfg_a.static_nodes = vec![rec_b];

    let mut cfg_b = test_config(id_b, seed_b);
    cfg_b.local.tcp = port_b;
    cfg_b.local.udp = port_b;
    cfg_b.mode = gyre::NetworkMode::Static;
    cfg_b.static_nodes = vec![rec_a];

    let (node_a, ch_a) = NodeService::create(cfg_a, None).await.unwrap();
    let (node_b, ch_b) = NodeService::create(cfg_b, None).await.unwrap();
    node_a.start().await;
    node_b.start().await;
    (node_a, ch_a, node_b, ch_b, id_a, id_b)
}

/// Drain indications until exactly one session is stably up and return
/// its info and consumer receiver. Tolerates duplicate-resolution churn:
/// a kill always emits `Closed` before any replacement activates, so the
/// last surviving `Activated` is the live one.
async fn settle_one_session(
    node: &NodeService,
    rx: &mut tokio::sync::mpsc::Receiver<PeerIndication>,
) -> (gyre::PeerInfo, tokio::sync::mpsc::Receiver<P2pPackage>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    let mut live: Option<(gyre::PeerInfo, tokio::sync::mpsc::Receiver<P2pPackage>)> = None;
    loop {
        while let Ok(ind) = rx.try_recv() {
            match ind {
                PeerIndication::Activated { info, rx } => live = Some((info, rx)),
                PeerIndication::Closed { id, .. } => {
                    if live.as_ref().is_some_and(|(i, _)| i.node.id == id) {
                        live = None;
                    }
                }
            }
        }
        let snap = node.peer_snapshot().await;
        if snap.workers.len() == 1 {
            if let Some((info, _)) = &live {
                let (_, worker_id, _) = snap.workers[0];
                if info.node.id == worker_id {
                    return live.unwrap();
                }
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("no stable session came up");
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn packages_reach_the_remote_consumer_and_failures_are_listed() {
    let (node_a, mut ch_a, node_b, mut ch_b, id_a, _id_b) = static_pair(55, 66).await;

    let (info_b, _rx_b) = settle_one_session(&node_b, &mut ch_b.peer).await;
    let (_info_a, mut rx_a) = settle_one_session(&node_a, &mut ch_a.peer).await;

    // B sends an application payload to A through its worker.
    let payload = b"tx gossip bytes".to_vec();
    let (eno, failed) = node_b
        .send_package(info_b.snid, vec![id_a], payload.clone())
        .await;
    assert_eq!(eno, Errno::None);
    assert!(failed.is_empty());

    let pkg = timeout(Duration::from_secs(5), rx_a.recv())
        .await
        .expect("package must arrive")
        .expect("channel open");
    assert_eq!(pkg.payload, payload);

    // An unknown worker lands on the failure list.
    let ghost = NodeId::random();
    let (eno, failed) = node_b
        .send_package(info_b.snid, vec![ghost], b"x".to_vec())
        .await;
    assert_eq!(eno, Errno::Unknown);
    assert_eq!(failed, vec![ghost]);

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn close_peer_tears_down_both_sides() {
    let (node_a, mut ch_a, node_b, mut ch_b, id_a, id_b) = static_pair(77, 88).await;

    let (info_b, _rx_b) = settle_one_session(&node_b, &mut ch_b.peer).await;
    let (_info_a, _rx_a) = settle_one_session(&node_a, &mut ch_a.peer).await;

    let eno = node_b.close_peer(info_b.snid, id_a).await;
    assert_eq!(eno, Errno::None);

    // A second close while the first is in flight is a duplicate unless
    // the teardown already completed.
    let eno = node_b.close_peer(info_b.snid, id_a).await;
    assert!(
        eno == Errno::Duplicated || eno == Errno::NotFound,
        "unexpected double-close answer: {eno:?}"
    );

    let closed_b = timeout(Duration::from_secs(5), async {
        loop {
            match ch_b.peer.recv().await {
                Some(PeerIndication::Closed { id, .. }) => return id,
                Some(_) => continue,
                None => panic!("indication channel closed"),
            }
        }
    })
    .await
    .expect("closer must observe the teardown");
    assert_eq!(closed_b, id_a);

    let closed_a = timeout(Duration::from_secs(10), async {
        loop {
            match ch_a.peer.recv().await {
                Some(PeerIndication::Closed { id, .. }) => return id,
                Some(_) => continue,
                None => panic!("indication channel closed"),
            }
        }
    })
    .await
    .expect("remote must observe the teardown");
    assert_eq!(closed_a, id_b);

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn inbound_total_cap_pauses_the_accepter() {
    let id = NodeId::random();
    let mut cfg = test_config(id, 99);
    cfg.peer.max_inbounds_total = 1;
    let (node, mut channels) = NodeService::create(cfg, None).await.unwrap();
    node.start().await;

    let first = raw_session(node.local(), Node::unspecified(NodeId::random())).await;
    timeout(Duration::from_secs(5), wait_activated(&mut channels.peer))
        .await
        .expect("first inbound session must activate");

    // A second dial connects at the TCP level (backlog) but is never
    // admitted while the cap holds.
    let second = TcpStream::connect(node.local().tcp_addr()).await.unwrap();
    sleep(Duration::from_millis(600)).await;

    let snap = node.peer_snapshot().await;
    assert_eq!(snap.ibp_total, 1, "cap must hold");
    assert_eq!(snap.workers.len(), 1);

    drop(first);
    drop(second);
    node.stop().await;
}
