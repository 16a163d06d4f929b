//! Trivial liveness HTTP endpoint

use crate::config::BrokerError;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve `OK` for any request on the given port until cancelled
pub(crate) async fn serve(port: u16, cancel: CancellationToken) -> Result<(), BrokerError> {
    let app = Router::new().fallback(|| async { "OK" });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("[health] liveness endpoint listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}
