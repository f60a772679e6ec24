//! imgated - imgate gateway daemon.

use imgate::{Config, Node, metrics};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; IMGATE_LOG_JSON switches to one JSON object per line
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if std::env::var_os("IMGATE_LOG_JSON").is_some() {
        builder.json().init();
    } else {
        builder.init();
    }

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        return Err(anyhow::anyhow!(
            "{} configuration error(s) in {config_path}",
            errors.len()
        ));
    }

    info!(
        server = %config.server.name,
        node_id = %config.server.node_id,
        listen = %config.listen.address,
        "Starting imgated"
    );

    metrics::init();

    let node = Node::start(&config).await?;
    info!(client = %node.client_addr(), rpc = ?node.rpc_addr(), "Accepting clients");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    node.shutdown().await;

    Ok(())
}
