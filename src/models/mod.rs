// Shared data model types persisted under the user-data root
//
// These are the typed shapes of profiles.json, active.json, proxy.json,
// global.json, pricing.json and the stats database rows. Serialization
// matches the on-disk wire format exactly; behavior lives in the owning
// components, not here.

mod global;
mod pricing;
mod profile;
mod proxy_config;
mod session;
mod token_log;
mod watch;

pub use global::GlobalConfig;
pub use pricing::{ModelPrice, PricingStore, PricingTemplate, InheritedModel};
pub use profile::{ActiveProfile, Profile, ProfileDescriptor, ProfileSource};
pub use proxy_config::{ProxyStore, ToolProxyConfig};
pub use session::{ConfigMode, ProxySession, SESSION_ACTIVE_SECS};
pub use token_log::{RequestStatus, ResponseType, TokenCounters, TokenCosts, TokenLog};
pub use watch::{ConfigWatchConfig, WatchMode};
