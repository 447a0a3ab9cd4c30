//! Shared harness for the end-to-end suites: an in-process edge, an
//! in-process agent, and helpers to wire them to a mock origin.
#![allow(dead_code)] // each [[test]] binary uses its own subset

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::watch;

pub const SECRET_KEY: &str = "e2e-secret-key";
pub const VERIFY_TOKEN: &str = "e2e-verify-claim";

pub struct TestEdge {
    pub addr: SocketAddr,
    pub state: edge::AppState,
    _task: tokio::task::JoinHandle<()>,
}

impl TestEdge {
    /// The host string both the agent registration and public requests use.
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.host(), path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.host(), path)
    }
}

/// Start an in-process edge on a random port, plain TCP.
pub async fn start_edge() -> TestEdge {
    let vars: HashMap<String, String> = [
        ("SECRET_KEY", SECRET_KEY),
        ("VERIFY_TOKEN", VERIFY_TOKEN),
        ("JWT_GENERATOR_USERNAME", "issuer"),
        ("JWT_GENERATOR_PASSWORD", "issuer-pass"),
    ]
    .iter()
    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
    .collect();
    let config = edge::EdgeConfig::from_vars(&vars).expect("edge config");

    let state = edge::AppState::new(config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind edge");
    let addr = listener.local_addr().unwrap();
    let task = {
        let state = state.clone();
        tokio::spawn(edge::serve::serve(listener, None, state, std::future::pending()))
    };
    TestEdge { addr, state, _task: task }
}

pub struct TestAgent {
    pub shutdown: watch::Sender<bool>,
    pub task: tokio::task::JoinHandle<i32>,
}

impl TestAgent {
    /// Abrupt channel loss, as opposed to a graceful drain.
    pub fn kill(&self) {
        self.task.abort();
    }
}

/// A valid token for the test edge.
pub fn agent_token() -> String {
    edge::auth::sign_token(SECRET_KEY, VERIFY_TOKEN).expect("sign token")
}

/// Start an in-process agent pointed at `edge`, serving `origin_port`
/// under `path_prefix` (empty for the whole host).
pub async fn start_agent(edge: &TestEdge, origin_port: u16, path_prefix: &str) -> TestAgent {
    let vars: HashMap<String, String> = [
        ("TUNNEL_SERVER_URL", edge.ws_url("").as_str()),
        ("TUNNEL_AUTH_TOKEN", agent_token().as_str()),
        ("LOCAL_PORT", origin_port.to_string().as_str()),
        ("LOCAL_HOST", "127.0.0.1"),
        ("PATH_PREFIX", path_prefix),
    ]
    .iter()
    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
    .collect();
    let config = agent::AgentConfig::from_vars(&vars).expect("agent config");

    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(agent::uplink::run_with_shutdown(config, shutdown_rx));
    TestAgent { shutdown, task }
}

/// Wait until the edge can route `path` on its own host, i.e. the agent's
/// registration landed.
pub async fn wait_for_agent(edge: &TestEdge, path: &str) {
    let host = edge.host();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if edge.state.registry.resolve(&host, path).await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("agent did not register within 5s");
}

/// Wait until `count` registrations are live (multi-agent setups, where
/// a wildcard would satisfy `wait_for_agent` before a prefix registers).
pub async fn wait_for_agents(edge: &TestEdge, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if edge.state.registry.len().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} registrations within 5s", count);
}

/// Wait until no agent serves `path` anymore (after a disconnect).
pub async fn wait_for_agent_gone(edge: &TestEdge, path: &str) {
    let host = edge.host();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if edge.state.registry.resolve(&host, path).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("agent registration was not removed within 5s");
}
