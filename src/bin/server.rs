//! Replica server binary
//!
//! Runs a single cluster member with separate ports for the replica RPC
//! surface and the client API.
//!
//! Example for a 3-node cluster:
//!   repliq-server --id 1 --raft-port 8001 --api-port 9001 --data-dir /tmp/repliq1 \
//!       --peer 2=127.0.0.1:8002 --peer 3=127.0.0.1:8003
//!   repliq-server --id 2 --raft-port 8002 --api-port 9002 --data-dir /tmp/repliq2 \
//!       --peer 1=127.0.0.1:8001 --peer 3=127.0.0.1:8003
//!   repliq-server --id 3 --raft-port 8003 --api-port 9003 --data-dir /tmp/repliq3 \
//!       --peer 1=127.0.0.1:8001 --peer 2=127.0.0.1:8002

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::info;

use repliq::api::client_http::client_router;
use repliq::cluster::{ClusterConfig, MemberConfig, MemberId};
use repliq::core::config::ReplicaConfig;
use repliq::core::replica::Replica;
use repliq::core::server::ReplicaServer;
use repliq::state_machine::kv::{KeyValueStore, SharedKvStore};
use repliq::storage::FileStorage;
use repliq::transport::http::{rpc_router, HttpTransport};

#[derive(Parser, Debug)]
#[command(name = "repliq-server", about = "Run a single replica of a repliq cluster")]
struct Args {
    /// Unique member id of this replica
    #[arg(long)]
    id: MemberId,

    /// Port for replica RPC between members (/raft/* endpoints)
    #[arg(long)]
    raft_port: u16,

    /// Port for client requests (/client/* endpoints)
    #[arg(long)]
    api_port: u16,

    /// Directory for persistent state
    #[arg(long)]
    data_dir: String,

    /// Peer member, as id=host:port (repeat per peer)
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(MemberId, String)>,

    /// Address other members reach this replica at
    #[arg(long)]
    advertise: Option<String>,

    /// Applied entries between automatic snapshots (0 disables)
    #[arg(long, default_value_t = 1000)]
    snapshot_threshold: u64,
}

fn parse_peer(spec: &str) -> Result<(MemberId, String), String> {
    let (id, addr) = spec
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {:?}", spec))?;
    let id = id.parse().map_err(|e| format!("invalid peer id: {}", e))?;
    Ok((id, addr.to_string()))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let advertise = args
        .advertise
        .clone()
        .unwrap_or_else(|| format!("127.0.0.1:{}", args.raft_port));

    let mut members = vec![MemberConfig::new(args.id, advertise)];
    members.extend(
        args.peers
            .iter()
            .map(|(id, addr)| MemberConfig::new(*id, addr.clone())),
    );
    let cluster = ClusterConfig::new(members);

    info!(id = args.id, raft_port = args.raft_port, api_port = args.api_port, "starting replica");

    let storage = FileStorage::new(&args.data_dir).expect("failed to open storage");
    let kv: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));
    let transport = HttpTransport::new(Duration::from_secs(5));

    let replica = Replica::new(args.id, cluster, Box::new(storage), Box::new(kv.clone()));

    let config = ReplicaConfig::default().with_snapshot_threshold(args.snapshot_threshold);
    let (server, shared) = ReplicaServer::with_config(replica, transport, config);
    let handle = server.start();

    let raft_app = rpc_router(shared.clone(), handle.clone());
    let client_app = client_router(handle, shared, kv);

    let raft_addr: SocketAddr = format!("0.0.0.0:{}", args.raft_port).parse().unwrap();
    let raft_listener = tokio::net::TcpListener::bind(raft_addr)
        .await
        .expect("failed to bind raft port");
    info!(%raft_addr, "replica RPC listening");
    tokio::spawn(async move {
        axum::serve(raft_listener, raft_app).await.unwrap();
    });

    let api_addr: SocketAddr = format!("0.0.0.0:{}", args.api_port).parse().unwrap();
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .expect("failed to bind api port");
    info!(%api_addr, "client API listening");
    axum::serve(api_listener, client_app).await.unwrap();
}
