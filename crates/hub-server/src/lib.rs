mod cluster_routes;
mod convert;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use hub_cluster::{ClusterContext, LocalEngine};
use hub_store::CoordinationStore;

pub use cluster_routes::{router, ProjectStateEntry, ProjectStatesResponse};
pub use convert::{hub_to_status, ApiError};

/// Serve the read-only cluster status API until `shutdown` flips.
pub async fn serve_status<S: CoordinationStore, E: LocalEngine>(
    addr: SocketAddr,
    ctx: Arc<ClusterContext<S, E>>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "status HTTP server starting");
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(Into::into)
}
