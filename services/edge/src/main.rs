use edge::{AppState, EdgeConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = match EdgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    let tls = match &config.tls {
        Some(paths) => match edge::serve::tls_acceptor(paths) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                eprintln!("FATAL: failed to load TLS material: {}", e);
                std::process::exit(1);
            }
        },
        None => None,
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let state = AppState::new(config);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind");
    info!(addr = %addr, tls = tls.is_some(), "edge listening");

    edge::serve::serve(listener, tls, state, edge::serve::interrupt()).await;
    info!("edge shut down gracefully");
}
