use log::info;

use portal_collab::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting collaboration gateway on {} (storage: {})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string())
    );

    let server = CollabServer::new(config)?;
    server.run().await
}
