pub mod config;
pub mod dispatch;
pub mod origin;
pub mod streams;
pub mod uplink;

pub use config::AgentConfig;
