//! Testing utilities for cluster integration tests
//!
//! `TestCluster` spins up an in-process cluster of replicas speaking real
//! HTTP: every node binds one listener serving both the RPC router and the
//! client API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::api::client_http::{client_router, StatusReply};
use crate::cluster::{ClusterConfig, MemberConfig, MemberId};
use crate::core::config::ReplicaConfig;
use crate::core::node::SharedReplica;
use crate::core::replica::Replica;
use crate::core::server::{ReplicaHandle, ReplicaServer};
use crate::state_machine::kv::{KeyValueStore, SharedKvStore};
use crate::storage::MemoryStorage;
use crate::transport::http::{rpc_router, HttpTransport};

/// A single test node in the cluster
pub struct TestNode {
    pub id: MemberId,
    /// Address serving both RPC and client endpoints
    pub addr: SocketAddr,
    /// HTTP server shutdown channel
    http_shutdown_tx: Option<oneshot::Sender<()>>,
    /// Server handle for submissions and membership changes
    pub handle: ReplicaHandle,
    /// Shared KV store
    pub kv: SharedKvStore,
    /// Shared replica
    pub replica: SharedReplica,
}

impl TestNode {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// A test cluster of replicas
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Create and start a 3-node cluster.
    pub async fn new() -> Self {
        Self::with_nodes(3).await
    }

    /// Create and start a cluster with the given number of nodes.
    pub async fn with_nodes(count: usize) -> Self {
        Self::with_nodes_and_config(count, None).await
    }

    /// Create and start a cluster with the given number of nodes and
    /// config.
    pub async fn with_nodes_and_config(count: usize, config: Option<ReplicaConfig>) -> Self {
        let ids: Vec<MemberId> = (1..=count as MemberId).collect();

        // Bind all listeners first so every node knows every address.
        let mut listeners = Vec::new();
        let mut addrs = HashMap::new();
        for &id in &ids {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            addrs.insert(id, addr);
            listeners.push((id, listener, addr));
        }

        // Faster timeouts for testing.
        let config = config.unwrap_or_else(|| {
            ReplicaConfig::default()
                .with_heartbeat_interval(Duration::from_millis(50))
                .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
        });

        let cluster_config = ClusterConfig::new(
            ids.iter().map(|&id| MemberConfig::new(id, addrs[&id].to_string())),
        );

        let mut nodes = Vec::new();
        for (id, listener, addr) in listeners {
            let kv: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));

            let transport = HttpTransport::new(Duration::from_secs(2));
            let replica = Replica::new(
                id,
                cluster_config.clone(),
                Box::new(MemoryStorage::new()),
                Box::new(kv.clone()),
            );

            let (server, shared) = ReplicaServer::with_config(replica, transport, config.clone());
            let handle = server.start();

            let app = rpc_router(shared.clone(), handle.clone())
                .merge(client_router(handle.clone(), shared.clone(), kv.clone()));

            let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = http_shutdown_rx.await;
                    })
                    .await
                    .unwrap();
            });

            nodes.push(TestNode {
                id,
                addr,
                http_shutdown_tx: Some(http_shutdown_tx),
                handle,
                kv,
                replica: shared,
            });
        }

        // Give the servers time to start.
        tokio::time::sleep(Duration::from_millis(50)).await;

        TestCluster { nodes }
    }

    /// Shut down every node.
    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            if let Some(tx) = node.http_shutdown_tx.take() {
                let _ = tx.send(());
            }
            node.handle.shutdown().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Shut down a single node (simulates a crash).
    pub async fn shutdown_node(&mut self, index: usize) {
        if let Some(tx) = self.nodes[index].http_shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.nodes[index].handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pub fn node_addr(&self, index: usize) -> SocketAddr {
        self.nodes[index].addr()
    }

    pub fn all_addrs(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|n| n.addr()).collect()
    }

    pub fn kv(&self, index: usize) -> SharedKvStore {
        self.nodes[index].kv.clone()
    }

    async fn status_of(client: &reqwest::Client, addr: SocketAddr) -> Option<StatusReply> {
        let response = client
            .get(format!("http://{}/client/status", addr))
            .send()
            .await
            .ok()?;
        response.json::<StatusReply>().await.ok()
    }

    /// Wait for a leader to be elected, with timeout.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<SocketAddr> {
        let start = std::time::Instant::now();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();

        while start.elapsed() < timeout {
            for node in &self.nodes {
                if node.http_shutdown_tx.is_none() {
                    continue;
                }
                if let Some(status) = Self::status_of(&client, node.addr).await {
                    if status.role == "Leader" {
                        return Some(node.addr);
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        None
    }

    /// Find the current leader's address.
    pub async fn find_leader(&self) -> Option<SocketAddr> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        for node in &self.nodes {
            if node.http_shutdown_tx.is_none() {
                continue;
            }
            if let Some(status) = Self::status_of(&client, node.addr).await {
                if status.role == "Leader" {
                    return Some(node.addr);
                }
            }
        }
        None
    }

    /// Find a follower's address.
    pub async fn find_follower(&self) -> Option<SocketAddr> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        for node in &self.nodes {
            if node.http_shutdown_tx.is_none() {
                continue;
            }
            if let Some(status) = Self::status_of(&client, node.addr).await {
                if status.role == "Follower" {
                    return Some(node.addr);
                }
            }
        }
        None
    }
}
