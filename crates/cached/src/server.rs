//! cached server - wires the cache node to the cluster and the HTTP API

use crate::api;
use crate::config::Config;
use crate::node::CacheNode;
use gossip_cache_net::{fresh_incarnation, Cluster, MemberCount, TransportError};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::info;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cluster error: {0}")]
    Cluster(#[from] TransportError),
    #[error("Join failed: {0}")]
    Join(TransportError),
    #[error("Task failed: {0}")]
    Task(#[from] JoinError),
}

/// What ended the serve loop
enum Stop {
    Requested,
    Cluster(Result<Result<(), TransportError>, JoinError>),
    Http(Result<std::io::Result<()>, JoinError>),
}

/// A bound node: gossip listener, HTTP listener and the replica
pub struct Server {
    config: Config,
    node: Arc<CacheNode>,
    cluster: Arc<Cluster>,
    http: TcpListener,
}

impl Server {
    /// Bind both listeners. Nothing is served until [`Server::run`].
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        let name = config.node_name();
        let incarnation = fresh_incarnation();
        let members = MemberCount::new();
        let node = Arc::new(CacheNode::new(
            name.clone(),
            incarnation,
            config.node_settings(),
            members.clone(),
        ));
        let cluster = Cluster::create(
            config.cluster_config(&name, incarnation),
            node.clone(),
            node.clone(),
            members,
        )
        .await?;
        let http = TcpListener::bind(config.listen).await?;

        info!(
            "Node {} created (incarnation {})",
            cluster.local_identity(),
            incarnation
        );
        Ok(Self {
            config,
            node,
            cluster,
            http,
        })
    }

    pub fn node(&self) -> &Arc<CacheNode> {
        &self.node
    }

    pub fn gossip_addr(&self) -> SocketAddr {
        self.cluster.local_node().addr
    }

    /// Serve until Ctrl-C, then leave the cluster
    pub async fn run(self) -> Result<(), ServerError> {
        self.serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await
    }

    /// Join through the configured peers, then serve until `shutdown`
    /// resolves or the cluster stops on its own.
    ///
    /// Gossip connections are accepted before the join starts. A join that
    /// reaches no peer stops the cluster and fails with [`ServerError::Join`].
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            config,
            node,
            cluster,
            http,
        } = self;

        let mut cluster_task = tokio::spawn(cluster.clone().run());
        if let Err(e) = join(&cluster, &config.peers).await {
            cluster.shutdown();
            let _ = cluster_task.await;
            return Err(e);
        }

        info!("Serving clients on {}", http.local_addr()?);
        let (http_stop_tx, http_stop_rx) = oneshot::channel::<()>();
        let mut http_task = tokio::spawn(async move {
            axum::serve(http, api::router(node))
                .with_graceful_shutdown(async {
                    let _ = http_stop_rx.await;
                })
                .await
        });

        let stop = tokio::select! {
            _ = shutdown => Stop::Requested,
            joined = &mut cluster_task => Stop::Cluster(joined),
            served = &mut http_task => Stop::Http(served),
        };

        let result = match stop {
            Stop::Requested => {
                cluster.leave().await;
                match cluster_task.await? {
                    Ok(()) => Ok(()),
                    Err(e) => Err(ServerError::Cluster(e)),
                }
            }
            Stop::Cluster(joined) => match joined? {
                Ok(()) => Ok(()),
                Err(e) => Err(ServerError::Cluster(e)),
            },
            Stop::Http(served) => {
                cluster.leave().await;
                served?.map_err(ServerError::Io)
            }
        };

        let _ = http_stop_tx.send(());
        let _ = http_task.await;
        info!("Server stopped");
        result
    }
}

/// Join through `peers`. No peers starts a new cluster.
async fn join(cluster: &Cluster, peers: &[SocketAddr]) -> Result<(), ServerError> {
    if peers.is_empty() {
        info!("No peers configured, starting a new cluster");
        return Ok(());
    }
    cluster.join(peers).await.map_err(ServerError::Join)?;
    Ok(())
}
