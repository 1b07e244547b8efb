//! Headless scuttle peer.
//!
//! Usage:
//!
//!   scuttle-node [REPO_PATH]
//!
//! REPO_PATH defaults to `~/.scuttle` (or `./.scuttle` without a home
//! directory). The key pair is created on first run. The process runs
//! until interrupted with Ctrl+C.

use std::path::PathBuf;

use scuttle_node::Node;
use scuttle_types::config::NodeConfig;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let repo_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_repo_path);

    if let Err(e) = run(repo_path).await {
        tracing::error!("node error: {e}");
        std::process::exit(1);
    }
}

async fn run(repo_path: PathBuf) -> scuttle_types::Result<()> {
    let config = NodeConfig::default();
    let mut node = Node::open(&repo_path, config)?;
    node.start()?;

    tracing::info!(
        id = %node.whoami(),
        repo = %repo_path.display(),
        "peer running, press Ctrl+C to stop"
    );

    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("signal listener failed, shutting down");
    }
    tracing::info!("received Ctrl+C, shutting down");
    node.shutdown().await?;
    Ok(())
}

fn default_repo_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".scuttle"),
        None => PathBuf::from(".scuttle"),
    }
}
