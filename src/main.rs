//! Bootnode tool: runs a bare node that serves bootstrap traffic only,
//! and manages the on-disk node key.
//!
//! Key generation and signing proper are an external capability; the
//! bootnode key file holds the node's identity bytes, hex-encoded.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use gyre::{Config, NodeId, NodeService};

/// File under `<nodeDataDir>/<nodeName>/` holding the hex node key.
const KEY_FILE_NAME: &str = "nodekey";

/// Default session (chain) port.
const DEFAULT_CHAIN_PORT: u16 = 30303;

/// Default DHT port.
const DEFAULT_DHT_PORT: u16 = 30866;

#[derive(Parser, Debug)]
#[command(name = "gyre-bootnode")]
#[command(version, about = "bootstrap node for the gyre network")]
struct Args {
    /// Generate a node key file and exit.
    #[arg(long = "genkey")]
    genkey: bool,

    /// Print the node id derived from the key file and exit.
    #[arg(long = "writenodeid")]
    writenodeid: bool,

    /// Node data directory.
    #[arg(long = "nodeDataDir", default_value = "")]
    node_data_dir: String,

    /// Node name, a subdirectory of the data directory.
    #[arg(long = "nodeName", default_value = "")]
    node_name: String,

    /// Chain (session) listen address.
    #[arg(long = "cip", default_value = "0.0.0.0")]
    cip: IpAddr,

    /// Chain (session) listen port.
    #[arg(long = "cport", default_value_t = DEFAULT_CHAIN_PORT)]
    cport: u16,

    /// DHT listen address.
    #[arg(long = "dip", default_value = "0.0.0.0")]
    dip: IpAddr,

    /// DHT listen port.
    #[arg(long = "dport", default_value_t = DEFAULT_DHT_PORT)]
    dport: u16,
}

fn key_file(args: &Args) -> PathBuf {
    PathBuf::from(&args.node_data_dir)
        .join(&args.node_name)
        .join(KEY_FILE_NAME)
}

fn gen_key(args: &Args) -> Result<()> {
    let kf = key_file(args);
    if let Some(dir) = kf.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating key directory {}", dir.display()))?;
    }
    let id = NodeId::random();
    std::fs::write(&kf, id.to_hex())
        .with_context(|| format!("writing key file {}", kf.display()))?;
    println!("key saved ok to {}", kf.display());
    Ok(())
}

fn load_key(args: &Args) -> Result<NodeId> {
    let kf = key_file(args);
    let hex = std::fs::read_to_string(&kf)
        .with_context(|| format!("reading key file {}", kf.display()))?;
    NodeId::from_hex(&hex).with_context(|| format!("parsing key file {}", kf.display()))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    if args.genkey {
        if args.node_data_dir.is_empty() || args.node_name.is_empty() {
            error!("nodeDataDir and nodeName must not be empty");
            std::process::exit(-1);
        }
        if let Err(err) = gen_key(&args) {
            error!(error = %err, "failed to generate node key");
            std::process::exit(-1);
        }
        std::process::exit(0);
    }

    if args.writenodeid {
        if args.node_data_dir.is_empty() || args.node_name.is_empty() {
            error!("nodeDataDir and nodeName must not be empty");
            std::process::exit(-1);
        }
        match load_key(&args) {
            Ok(id) => {
                println!("\n\t{}", id.to_hex());
                std::process::exit(0);
            }
            Err(err) => {
                error!(error = %err, "failed to load node key");
                std::process::exit(-1);
            }
        }
    }

    if args.node_data_dir.is_empty() != args.node_name.is_empty() {
        error!("nodeDataDir and nodeName must all be empty or all be not empty");
        std::process::exit(-1);
    }

    let id = if args.node_data_dir.is_empty() {
        NodeId::random()
    } else {
        match load_key(&args) {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "failed to load node key");
                std::process::exit(-1);
            }
        }
    };

    let mut cfg = Config::local_on(id, args.cport, args.dport);
    cfg.name = if args.node_name.is_empty() { "bootnode".into() } else { args.node_name.clone() };
    cfg.local.ip = args.cip;
    cfg.local.udp = args.cport;
    cfg.local_dht.ip = args.dip;
    cfg.local_dht.udp = args.dport;
    cfg.bootstrap_node = true;

    let (service, mut channels) = match NodeService::create(cfg, None).await {
        Ok(pair) => pair,
        Err(err) => {
            error!(error = %err, "failed to create bootnode");
            std::process::exit(-2);
        }
    };
    service.start().await;
    info!(id = %id, "bootnode serving");

    // A bootnode has no application on top; drain the indications so
    // the bounded channels never back up.
    tokio::spawn(async move {
        loop {
            tokio::select! {
                ind = channels.peer.recv() => {
                    match ind {
                        Some(gyre::PeerIndication::Activated { info, .. }) => {
                            info!(snid = %info.snid, peer = %info.node.id, "session up");
                        }
                        Some(gyre::PeerIndication::Closed { snid, id }) => {
                            info!(%snid, peer = %id, "session down");
                        }
                        None => return,
                    }
                }
                ev = channels.dht.events.recv() => {
                    if ev.is_none() {
                        return;
                    }
                }
                st = channels.dht.conn_status.recv() => {
                    if st.is_none() {
                        return;
                    }
                }
            }
        }
    });

    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to wait for interrupt");
        std::process::exit(-3);
    }
    service.stop().await;
    std::process::exit(0);
}
