use anyhow::Result;
use reverse_relay::{config::DEFAULT_CONFIG_FILE, load_config_from, server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_file = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let config = load_config_from(&config_file)?;
    info!(
        config_file = %config_file,
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        tls_enabled = config.listen.tls.is_some(),
        routes = config.routes.len(),
        "Configuration loaded"
    );

    server::run(config).await
}
