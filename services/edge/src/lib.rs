pub mod auth;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod registry;
pub mod serve;
pub mod streams;

pub use config::EdgeConfig;
pub use registry::AgentRegistry;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tunnel_protocol::handshake;

#[derive(Clone)]
pub struct AppState {
    pub registry: AgentRegistry,
    pub config: Arc<EdgeConfig>,
}

impl AppState {
    pub fn new(config: EdgeConfig) -> Self {
        AppState { registry: AgentRegistry::default(), config: Arc::new(config) }
    }
}

/// The edge's public surface: the token issuer, the reserved control
/// channel path, and the dispatch fallback that tunnels everything else.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(handshake::CONTROL_PATH, get(channel::ws_tunnel_handler))
        .route("/tunnel_jwt_generator", get(auth::jwt_generator_handler))
        .fallback(dispatch::dispatch_handler)
        .with_state(state)
}
