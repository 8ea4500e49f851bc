// Proxy manager - lifecycle of one instance per tool
//
// Owns the map of running instances behind a single async mutex. start
// validates the tool's config, installs the internal dc_proxy_ profile,
// binds the listener, and spawns the serve task; stop drains in-flight
// requests for up to ten seconds, aborts the rest, and restores the
// displaced user profile. Config writes are refused while the instance
// runs - the only mutation path is stop, write, start.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::events::{CoreEvent, EventBus};
use crate::models::{GlobalConfig, ProxyStore, ToolProxyConfig};
use crate::paths;
use crate::profiles::ProfileManager;
use crate::sessions::SessionManager;
use crate::stats::StatsStore;
use crate::store::DataStore;
use crate::tools::{ToolId, ALL_TOOLS};

use super::instance::{self, InstanceState};

/// Drain budget before in-flight requests are aborted.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

struct RunningInstance {
    port: u16,
    started_at: DateTime<Utc>,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub running: bool,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

pub struct ProxyManager {
    store: Arc<DataStore>,
    profiles: Arc<ProfileManager>,
    sessions: SessionManager,
    stats: StatsStore,
    events: EventBus,
    instances: Mutex<HashMap<ToolId, RunningInstance>>,
}

impl ProxyManager {
    pub fn new(
        store: Arc<DataStore>,
        profiles: Arc<ProfileManager>,
        sessions: SessionManager,
        stats: StatsStore,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            profiles,
            sessions,
            stats,
            events,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Load proxy.json, migrating the legacy flat layout on first touch.
    pub fn load_proxy_store(&self) -> CoreResult<ProxyStore> {
        let raw = self.store.read_cached(&paths::proxy_file())?;
        if let Some(migrated) = ProxyStore::migrate_legacy(&raw) {
            tracing::info!("migrated legacy transparent_proxy_* keys in proxy.json");
            self.store.write_json(&paths::proxy_file(), &migrated)?;
            return Ok(migrated);
        }
        if raw.is_null() {
            return Ok(ProxyStore::default());
        }
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn is_running(&self, tool: ToolId) -> bool {
        self.instances.lock().await.contains_key(&tool)
    }

    pub async fn start(&self, tool: ToolId) -> CoreResult<()> {
        let mut instances = self.instances.lock().await;
        if instances.contains_key(&tool) {
            return Err(CoreError::conflict(format!("{tool} proxy already running")));
        }

        let cfg = self.load_proxy_store()?.get(tool);
        validate_config(&cfg)?;
        let local_key = cfg.local_api_key.clone().unwrap_or_default();
        if local_key.is_empty() {
            return Err(CoreError::invalid(format!(
                "{tool} proxy has no local_api_key configured"
            )));
        }

        let bind_ip: IpAddr = if cfg.allow_public {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        let listen_addr = SocketAddr::new(bind_ip, cfg.port);

        // Refuse a route that points back at this listener before any
        // side effect happens
        if let Some(base_url) = &cfg.real_base_url {
            if instance::routes_to_self(base_url, listen_addr) {
                return Err(CoreError::new(
                    ErrorKind::LoopDetected,
                    format!("real_base_url {base_url} routes back into the proxy"),
                ));
            }
            if cfg.allow_public && instance::is_loopback_url(base_url) {
                return Err(CoreError::new(
                    ErrorKind::LoopDetected,
                    "loopback upstream is not allowed on a public listener",
                ));
            }
        }

        // Port probe before touching profiles, so a busy port leaves no
        // half-installed state behind
        let listener = TcpListener::bind(listen_addr).await.map_err(|e| {
            CoreError::new(
                ErrorKind::PortBusy,
                format!("cannot bind {listen_addr}: {e}"),
            )
        })?;

        let local_url = format!("http://127.0.0.1:{}", cfg.port);
        let upstream = self
            .profiles
            .install_dc_proxy_profile(tool, &cfg, &local_url)
            .await?;

        let global: GlobalConfig = self.store.read_json(&paths::global_file())?;
        let client = instance::build_client(&global)
            .map_err(|e| CoreError::internal(format!("http client: {e:#}")))?;

        let state = InstanceState {
            tool,
            cfg: Arc::new(cfg.clone()),
            upstream: Arc::new(upstream),
            listen_addr,
            client,
            store: self.store.clone(),
            profiles: self.profiles.clone(),
            sessions: self.sessions.clone(),
            stats: self.stats.clone(),
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            if let Err(e) = instance::serve(state, listener, shutdown_rx).await {
                tracing::error!("{tool} proxy server error: {e:#}");
            }
        });

        instances.insert(
            tool,
            RunningInstance {
                port: cfg.port,
                started_at: Utc::now(),
                shutdown_tx,
                task,
            },
        );
        drop(instances);

        self.events.publish(CoreEvent::ProxyConfigUpdated {
            tool,
            running: true,
        });
        tracing::info!("started {tool} proxy on port {}", cfg.port);
        Ok(())
    }

    /// Graceful stop; calling it when nothing runs is a successful no-op.
    pub async fn stop(&self, tool: ToolId) -> CoreResult<()> {
        let instance = self.instances.lock().await.remove(&tool);
        let Some(instance) = instance else {
            // Idempotent: a second stop still restores profile state in
            // case a previous run crashed mid-stop
            self.profiles.restore_prior_active(tool).await?;
            return Ok(());
        };

        let _ = instance.shutdown_tx.send(());
        let mut task = instance.task;
        if tokio::time::timeout(STOP_DRAIN_TIMEOUT, &mut task)
            .await
            .is_err()
        {
            tracing::warn!("{tool} proxy did not drain within 10s, aborting");
            task.abort();
        }

        self.profiles.restore_prior_active(tool).await?;
        self.events.publish(CoreEvent::ProxyConfigUpdated {
            tool,
            running: false,
        });
        tracing::info!("stopped {tool} proxy");
        Ok(())
    }

    pub async fn stop_all(&self) {
        for tool in ALL_TOOLS {
            if let Err(e) = self.stop(tool).await {
                tracing::warn!("stopping {tool} proxy failed: {e}");
            }
        }
    }

    pub async fn status_all(&self) -> CoreResult<HashMap<ToolId, ProxyStatus>> {
        let store = self.load_proxy_store()?;
        let instances = self.instances.lock().await;
        let mut out = HashMap::new();
        for tool in ALL_TOOLS {
            let status = match instances.get(&tool) {
                Some(running) => ProxyStatus {
                    running: true,
                    port: running.port,
                    started_at: Some(running.started_at),
                },
                None => ProxyStatus {
                    running: false,
                    port: store.get(tool).port,
                    started_at: None,
                },
            };
            out.insert(tool, status);
        }
        Ok(out)
    }

    /// Start every enabled tool flagged for auto-start with a usable key.
    pub async fn auto_start_on_launch(&self) {
        let Ok(store) = self.load_proxy_store() else {
            return;
        };
        for tool in ALL_TOOLS {
            let cfg = store.get(tool);
            let has_key = cfg
                .local_api_key
                .as_deref()
                .map(|k| !k.is_empty())
                .unwrap_or(false);
            if cfg.enabled && cfg.auto_start && has_key {
                if let Err(e) = self.start(tool).await {
                    tracing::warn!("auto-start of {tool} proxy failed: {e}");
                }
            }
        }
    }

    pub fn get_config(&self, tool: ToolId) -> CoreResult<ToolProxyConfig> {
        Ok(self.load_proxy_store()?.get(tool))
    }

    pub fn get_all_configs(&self) -> CoreResult<HashMap<ToolId, ToolProxyConfig>> {
        let store = self.load_proxy_store()?;
        Ok(ALL_TOOLS
            .iter()
            .map(|t| (*t, store.get(*t)))
            .collect())
    }

    /// Rewrite a tool's proxy config. Refused while that instance runs.
    pub async fn update_config(&self, tool: ToolId, cfg: ToolProxyConfig) -> CoreResult<()> {
        if self.is_running(tool).await {
            return Err(CoreError::conflict(format!(
                "stop the {tool} proxy before changing its config"
            )));
        }
        validate_config(&cfg)?;

        let mut store = self.load_proxy_store()?;
        store.set(tool, cfg);
        self.store.write_json(&paths::proxy_file(), &store)?;
        self.events.publish(CoreEvent::ProxyConfigUpdated {
            tool,
            running: false,
        });
        Ok(())
    }
}

fn validate_config(cfg: &ToolProxyConfig) -> CoreResult<()> {
    if cfg.port < 1024 {
        return Err(CoreError::new(
            ErrorKind::PortInvalid,
            format!("port {} is outside 1024..=65535", cfg.port),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_manager(name: &str) -> (Arc<ProxyManager>, std::sync::MutexGuard<'static, ()>) {
        let guard = crate::paths::TEST_ENV_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let unique = format!(
            "duckcoding-proxy-{}-{}-{}",
            name,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        );
        let root = std::env::temp_dir().join(unique);
        std::env::set_var("DUCKCODING_HOME", &root);
        std::env::set_var("DUCKCODING_NATIVE_HOME", root.join("home"));

        let store = Arc::new(DataStore::new());
        let profiles = Arc::new(ProfileManager::new(store.clone()));
        let stats = StatsStore::open(&root.join("stats.sqlite")).unwrap();
        let sessions = SessionManager::new(stats.clone());
        let manager = Arc::new(ProxyManager::new(
            store,
            profiles,
            sessions,
            stats,
            EventBus::new(),
        ));
        (manager, guard)
    }

    fn write_config(manager: &ProxyManager, tool: ToolId, cfg: ToolProxyConfig) {
        let mut store = manager.load_proxy_store().unwrap();
        store.set(tool, cfg);
        manager
            .store
            .write_json(&paths::proxy_file(), &store)
            .unwrap();
    }

    fn runnable_config(port: u16) -> ToolProxyConfig {
        let mut cfg = ToolProxyConfig::new(port);
        cfg.enabled = true;
        cfg.local_api_key = Some("K".to_string());
        cfg.real_api_key = Some("sk-upstream".to_string());
        cfg.real_base_url = Some("https://jp.duckcoding.com".to_string());
        cfg
    }

    #[tokio::test]
    async fn start_requires_local_key() {
        let (manager, _env) = scratch_manager("nokey");
        let mut cfg = runnable_config(18791);
        cfg.local_api_key = None;
        write_config(&manager, ToolId::AmpCode, cfg);

        let err = manager.start(ToolId::AmpCode).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn start_rejects_privileged_port() {
        let (manager, _env) = scratch_manager("port");
        write_config(&manager, ToolId::AmpCode, runnable_config(80));
        let err = manager.start(ToolId::AmpCode).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PortInvalid);
    }

    #[tokio::test]
    async fn loop_route_is_refused_before_binding() {
        let (manager, _env) = scratch_manager("loop");
        let mut cfg = runnable_config(18792);
        cfg.real_base_url = Some("http://127.0.0.1:18792".to_string());
        write_config(&manager, ToolId::AmpCode, cfg);

        let err = manager.start(ToolId::AmpCode).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LoopDetected);
        let status = manager.status_all().await.unwrap();
        assert!(!status[&ToolId::AmpCode].running);
    }

    #[tokio::test]
    async fn start_stop_round_trip_and_double_stop() {
        let (manager, _env) = scratch_manager("lifecycle");
        write_config(&manager, ToolId::AmpCode, runnable_config(18793));

        manager.start(ToolId::AmpCode).await.unwrap();
        assert!(manager.is_running(ToolId::AmpCode).await);

        let again = manager.start(ToolId::AmpCode).await.unwrap_err();
        assert_eq!(again.kind, ErrorKind::Conflict);

        manager.stop(ToolId::AmpCode).await.unwrap();
        assert!(!manager.is_running(ToolId::AmpCode).await);
        // Idempotent
        manager.stop(ToolId::AmpCode).await.unwrap();
    }

    #[tokio::test]
    async fn claude_lifecycle_rewrites_and_restores_native_files() {
        use crate::profiles::{native, NewProfile};

        let (manager, _env) = scratch_manager("claude-native");
        manager
            .profiles
            .create(
                ToolId::ClaudeCode,
                NewProfile {
                    name: "user".to_string(),
                    api_key: "sk-user".to_string(),
                    base_url: "https://jp.duckcoding.com".to_string(),
                    wire_api: None,
                    model: None,
                    pricing_template_id: None,
                    source: None,
                },
            )
            .await
            .unwrap();
        manager
            .profiles
            .activate(ToolId::ClaudeCode, "user", false)
            .await
            .unwrap();

        write_config(&manager, ToolId::ClaudeCode, runnable_config(18796));
        manager.start(ToolId::ClaudeCode).await.unwrap();

        // While running, settings.json points the CLI at the listener
        let creds = native::extract(&manager.store, ToolId::ClaudeCode).unwrap();
        assert_eq!(creds.api_key, "K");
        assert_eq!(creds.base_url, "http://127.0.0.1:18796");

        manager.stop(ToolId::ClaudeCode).await.unwrap();

        // Stop puts the displaced user profile back on disk
        let creds = native::extract(&manager.store, ToolId::ClaudeCode).unwrap();
        assert_eq!(creds.api_key, "sk-user");
        assert_eq!(creds.base_url, "https://jp.duckcoding.com");
    }

    #[tokio::test]
    async fn config_update_refused_while_running() {
        let (manager, _env) = scratch_manager("cfglock");
        write_config(&manager, ToolId::AmpCode, runnable_config(18794));
        manager.start(ToolId::AmpCode).await.unwrap();

        let err = manager
            .update_config(ToolId::AmpCode, runnable_config(18795))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        manager.stop(ToolId::AmpCode).await.unwrap();

        manager
            .update_config(ToolId::AmpCode, runnable_config(18795))
            .await
            .unwrap();
        assert_eq!(manager.get_config(ToolId::AmpCode).unwrap().port, 18795);
    }
}
