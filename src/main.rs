use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mesh_node::{
    cli::Cli,
    logging,
    mesh::{ChangeLogger, Fixtures, MeshNode, SyncCollections},
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config().await?;
    let _log_guard = logging::init_logging(&config.logging)?;

    let (collections, stores) = SyncCollections::in_memory();
    if let Some(path) = &config.fixtures {
        let fixtures = Fixtures::load(path).await?;
        let rows = fixtures.len();
        let changed = fixtures.apply(&stores)?;
        info!(path = %path.display(), rows, changed, "Seeded stores from fixtures");
    }

    let node = MeshNode::new(config.mesh.clone(), collections)
        .context("failed to build mesh node")?;
    node.notifier().register(Arc::new(ChangeLogger::default()));

    let addr = node.start().await.context("failed to start mesh node")?;
    info!(%addr, "mesh-node running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C, shutting down");
    node.shutdown().await;
    Ok(())
}
