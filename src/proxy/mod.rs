// Transparent proxy subsystem
//
// manager owns instance lifecycles; instance is the per-tool HTTP
// server; headers holds the vendor rewrite rules; websearch is the
// local AMP tool handler.

pub mod headers;
pub mod instance;
pub mod manager;
pub mod websearch;

pub use instance::InstanceState;
pub use manager::{ProxyManager, ProxyStatus};
