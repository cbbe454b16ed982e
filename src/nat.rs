//! # NAT Mapper (NAT)
//!
//! Learns the node's public address through a pluggable [`PortMapper`]
//! and keeps interested managers informed.
//!
//! The mapper implementation (UPnP, NAT-PMP, static) lives outside this
//! crate; gyre only defines the seam. On startup the manager probes the
//! NAT type and announces `Ready` to every subscriber. Consumers behind a
//! NAT then ask for a TCP mapping with [`NatHandle::make_map`]; the reply
//! arrives as a `MakeMapRsp` event, and the mapping is refreshed
//! periodically for its keep duration. When a refresh observes a changed
//! public endpoint, a `PubAddrUpdate` event is pushed, which the query
//! and peer managers react to.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How long a requested mapping is kept alive at the gateway.
pub const MAP_KEEP_DURATION: Duration = Duration::from_secs(20 * 60);

/// Refresh ahead of expiry.
pub const MAP_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// NAT type reported by the mapper probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatType {
    /// Publicly reachable, no mapping needed.
    None,
    /// Mapping obtained via UPnP.
    Upnp,
    /// Mapping obtained via NAT-PMP.
    Pmp,
    /// Unknown gateway; mapping attempts may still succeed.
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatProto {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatStatus {
    Ok,
    Failed,
}

/// Events fanned out to subscribers (query manager, peer manager).
#[derive(Clone, Debug)]
pub enum NatEvent {
    Ready {
        nat_type: NatType,
    },
    MakeMapRsp {
        proto: NatProto,
        pub_ip: IpAddr,
        pub_port: u16,
        status: NatStatus,
    },
    PubAddrUpdate {
        proto: NatProto,
        pub_ip: IpAddr,
        pub_port: u16,
        status: NatStatus,
    },
}

/// The port-mapping provider seam.
#[async_trait]
pub trait PortMapper: Send + Sync + 'static {
    /// Probe the NAT type once at startup.
    async fn probe(&self) -> NatType;

    /// Map `port` for `proto`, keeping the lease for `keep`. Returns the
    /// public endpoint.
    async fn map(&self, proto: NatProto, port: u16, keep: Duration) -> Result<(IpAddr, u16), ()>;
}

/// Mapper for nodes with a public address: probes to `NatType::None` and
/// never maps.
pub struct NoNat;

#[async_trait]
impl PortMapper for NoNat {
    async fn probe(&self) -> NatType {
        NatType::None
    }

    async fn map(&self, _proto: NatProto, port: u16, _keep: Duration) -> Result<(IpAddr, u16), ()> {
        let _ = port;
        Err(())
    }
}

enum NatCmd {
    MakeMap {
        proto: NatProto,
        port: u16,
    },
    /// Mapper implementations push asynchronous address observations
    /// here; tests use it to inject address changes.
    Announce {
        proto: NatProto,
        pub_ip: IpAddr,
        pub_port: u16,
        status: NatStatus,
    },
    PowerOff,
}

/// Clone-able handle to the NAT manager task.
#[derive(Clone)]
pub struct NatHandle {
    tx: mpsc::Sender<NatCmd>,
}

impl NatHandle {
    /// Request a mapping; the result arrives as a `MakeMapRsp` event.
    pub async fn make_map(&self, proto: NatProto, port: u16) {
        let _ = self.tx.send(NatCmd::MakeMap { proto, port }).await;
    }

    /// Announce a public-address observation, pushed to subscribers as a
    /// `PubAddrUpdate` event.
    pub async fn announce_public_addr(
        &self,
        proto: NatProto,
        pub_ip: IpAddr,
        pub_port: u16,
        status: NatStatus,
    ) {
        let _ = self
            .tx
            .send(NatCmd::Announce { proto, pub_ip, pub_port, status })
            .await;
    }

    pub async fn power_off(&self) {
        let _ = self.tx.send(NatCmd::PowerOff).await;
    }
}

/// The NAT manager actor.
pub struct NatMgr {
    mapper: Box<dyn PortMapper>,
    subscribers: Vec<mpsc::Sender<NatEvent>>,
    /// Active mappings, refreshed periodically.
    mappings: Vec<(NatProto, u16, (IpAddr, u16))>,
    cmd_rx: mpsc::Receiver<NatCmd>,
}

impl NatMgr {
    /// Spawn the NAT manager. Subscribers receive every event, starting
    /// with `Ready` once the probe completes.
    pub fn spawn(mapper: Box<dyn PortMapper>, subscribers: Vec<mpsc::Sender<NatEvent>>) -> NatHandle {
        let (tx, rx) = mpsc::channel(64);
        let mgr = NatMgr {
            mapper,
            subscribers,
            mappings: Vec::new(),
            cmd_rx: rx,
        };
        tokio::spawn(mgr.run());
        NatHandle { tx }
    }

    async fn run(mut self) {
        let nat_type = self.mapper.probe().await;
        debug!(?nat_type, "nat probe complete");
        self.publish(NatEvent::Ready { nat_type }).await;

        let mut refresh = tokio::time::interval(MAP_REFRESH_INTERVAL);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(NatCmd::MakeMap { proto, port }) => {
                            self.make_map(proto, port).await;
                        }
                        Some(NatCmd::Announce { proto, pub_ip, pub_port, status }) => {
                            self.publish(NatEvent::PubAddrUpdate {
                                proto,
                                pub_ip,
                                pub_port,
                                status,
                            })
                            .await;
                        }
                        Some(NatCmd::PowerOff) | None => {
                            debug!("nat manager: power off");
                            break;
                        }
                    }
                }
                _ = refresh.tick() => {
                    self.refresh_mappings().await;
                }
            }
        }
    }

    async fn make_map(&mut self, proto: NatProto, port: u16) {
        match self.mapper.map(proto, port, MAP_KEEP_DURATION).await {
            Ok((pub_ip, pub_port)) => {
                self.mappings.retain(|(p, lp, _)| !(*p == proto && *lp == port));
                self.mappings.push((proto, port, (pub_ip, pub_port)));
                self.publish(NatEvent::MakeMapRsp {
                    proto,
                    pub_ip,
                    pub_port,
                    status: NatStatus::Ok,
                })
                .await;
            }
            Err(()) => {
                warn!(?proto, port, "port mapping failed");
                self.publish(NatEvent::MakeMapRsp {
                    proto,
                    pub_ip: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                    pub_port: 0,
                    status: NatStatus::Failed,
                })
                .await;
            }
        }
    }

    /// Renew each lease; a changed public endpoint is pushed as an
    /// update.
    async fn refresh_mappings(&mut self) {
        let current = self.mappings.clone();
        for (proto, port, old_pub) in current {
            match self.mapper.map(proto, port, MAP_KEEP_DURATION).await {
                Ok(new_pub) => {
                    if new_pub != old_pub {
                        debug!(?proto, ?old_pub, ?new_pub, "public address changed");
                        self.mappings.retain(|(p, lp, _)| !(*p == proto && *lp == port));
                        self.mappings.push((proto, port, new_pub));
                        self.publish(NatEvent::PubAddrUpdate {
                            proto,
                            pub_ip: new_pub.0,
                            pub_port: new_pub.1,
                            status: NatStatus::Ok,
                        })
                        .await;
                    }
                }
                Err(()) => {
                    self.publish(NatEvent::PubAddrUpdate {
                        proto,
                        pub_ip: old_pub.0,
                        pub_port: old_pub.1,
                        status: NatStatus::Failed,
                    })
                    .await;
                }
            }
        }
    }

    async fn publish(&self, ev: NatEvent) {
        for sub in &self.subscribers {
            if sub.send(ev.clone()).await.is_err() {
                // Subscriber gone; harmless during shutdown.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn no_nat_announces_ready_none() {
        let (tx, mut rx) = mpsc::channel(8);
        let _nat = NatMgr::spawn(Box::new(NoNat), vec![tx]);
        let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("ready event")
            .unwrap();
        match ev {
            NatEvent::Ready { nat_type } => assert_eq!(nat_type, NatType::None),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn announced_addresses_reach_all_subscribers() {
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let nat = NatMgr::spawn(Box::new(NoNat), vec![tx1, tx2]);

        // Skip the Ready events.
        let _ = rx1.recv().await;
        let _ = rx2.recv().await;

        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        nat.announce_public_addr(NatProto::Tcp, ip, 4040, NatStatus::Ok).await;

        for rx in [&mut rx1, &mut rx2] {
            let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("update event")
                .unwrap();
            match ev {
                NatEvent::PubAddrUpdate { proto, pub_ip, pub_port, status } => {
                    assert_eq!(proto, NatProto::Tcp);
                    assert_eq!(pub_ip, ip);
                    assert_eq!(pub_port, 4040);
                    assert_eq!(status, NatStatus::Ok);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
