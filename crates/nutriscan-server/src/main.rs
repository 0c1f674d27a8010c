//! Nutriscan server binary

use nutriscan_server::{serve, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,nutriscan_server=debug".into()),
        )
        .compact()
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(
        host = %config.host,
        port = config.port,
        db = %config.db_path,
        blob_root = %config.blob_root,
        "starting nutriscan control plane v{}",
        env!("CARGO_PKG_VERSION")
    );

    serve(config).await
}
