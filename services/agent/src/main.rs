use agent::AgentConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server_url = %config.server_url,
        local = %format!("{}:{}", config.local_host, config.local_port),
        "agent starting"
    );

    let code = agent::uplink::run(config).await;
    std::process::exit(code);
}
