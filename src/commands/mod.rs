// Command surface - the RPC handlers the desktop shell calls
//
// Thin parameter validation over the owning components. Every command
// returns a typed value or a CoreError with a stable kind; no command
// does file I/O except through the data store. dispatch() exposes the
// same handlers by name for shells that speak JSON-RPC-ish envelopes.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::events::EventBus;
use crate::models::{
    ActiveProfile, ConfigMode, ConfigWatchConfig, GlobalConfig, PricingStore, PricingTemplate,
    ProfileDescriptor, ProxySession, ToolProxyConfig,
};
use crate::paths;
use crate::pricing;
use crate::profiles::{NewProfile, ProfileManager, ProfilePatch};
use crate::proxy::{ProxyManager, ProxyStatus};
use crate::sessions::SessionManager;
use crate::stats::{
    AggregateBucket, CostSummaryRow, Granularity, LogFilters, LogPage, StatsStore, StatsSummary,
};
use crate::store::DataStore;
use crate::tools::ToolId;
use crate::watcher::ConfigWatcher;

/// Owns handles to every component; constructed once at startup.
pub struct CommandHub {
    pub store: Arc<DataStore>,
    pub profiles: Arc<ProfileManager>,
    pub proxies: Arc<ProxyManager>,
    pub watcher: Arc<ConfigWatcher>,
    pub sessions: SessionManager,
    pub stats: StatsStore,
    pub events: EventBus,
}

#[derive(Debug, Deserialize)]
struct ToolParam {
    tool: ToolId,
}

#[derive(Debug, Deserialize)]
struct ToolNameParams {
    tool: ToolId,
    name: String,
}

#[derive(Debug, Deserialize)]
struct SessionParam {
    session_id: String,
}

impl CommandHub {
    // ── Profiles ─────────────────────────────────────────────────────────

    pub async fn list_profiles(&self, tool: ToolId) -> CoreResult<Vec<ProfileDescriptor>> {
        self.profiles.list(tool).await
    }

    pub async fn create_profile(
        &self,
        tool: ToolId,
        payload: NewProfile,
    ) -> CoreResult<ProfileDescriptor> {
        let profile = self.profiles.create(tool, payload).await?;
        Ok(ProfileDescriptor::from(&profile))
    }

    pub async fn update_profile(
        &self,
        tool: ToolId,
        name: &str,
        patch: ProfilePatch,
    ) -> CoreResult<ProfileDescriptor> {
        let profile = self.profiles.update(tool, name, patch).await?;
        Ok(ProfileDescriptor::from(&profile))
    }

    pub async fn delete_profile(&self, tool: ToolId, name: &str) -> CoreResult<()> {
        let running = self.proxies.is_running(tool).await;
        self.profiles.delete(tool, name, running).await
    }

    pub async fn activate_profile(&self, tool: ToolId, name: &str) -> CoreResult<()> {
        let running = self.proxies.is_running(tool).await;
        self.profiles.activate(tool, name, running).await
    }

    pub async fn import_from_native(
        &self,
        tool: ToolId,
        name: &str,
    ) -> CoreResult<ProfileDescriptor> {
        let profile = self.profiles.import_from_native(tool, name).await?;
        Ok(ProfileDescriptor::from(&profile))
    }

    pub async fn get_active_config(&self, tool: ToolId) -> CoreResult<Option<ActiveProfile>> {
        self.profiles.get_active(tool).await
    }

    // ── Global config ────────────────────────────────────────────────────

    pub fn get_global_config(&self) -> CoreResult<GlobalConfig> {
        Ok(self.store.read_json(&paths::global_file())?)
    }

    pub fn save_global_config(&self, mut config: GlobalConfig) -> CoreResult<GlobalConfig> {
        config.config_watch.clamp();
        self.store.write_json(&paths::global_file(), &config)?;
        Ok(config)
    }

    // ── Proxy lifecycle ──────────────────────────────────────────────────

    pub async fn start_tool_proxy(&self, tool: ToolId) -> CoreResult<()> {
        self.proxies.start(tool).await
    }

    pub async fn stop_tool_proxy(&self, tool: ToolId) -> CoreResult<()> {
        self.proxies.stop(tool).await
    }

    pub async fn get_all_proxy_status(&self) -> CoreResult<HashMap<ToolId, ProxyStatus>> {
        self.proxies.status_all().await
    }

    pub fn get_proxy_config(&self, tool: ToolId) -> CoreResult<ToolProxyConfig> {
        self.proxies.get_config(tool)
    }

    pub fn get_all_proxy_configs(&self) -> CoreResult<HashMap<ToolId, ToolProxyConfig>> {
        self.proxies.get_all_configs()
    }

    pub async fn update_proxy_config(
        &self,
        tool: ToolId,
        config: ToolProxyConfig,
    ) -> CoreResult<()> {
        self.proxies.update_config(tool, config).await
    }

    // ── Config watcher ───────────────────────────────────────────────────

    pub async fn block_external_change(&self, tool: ToolId) -> CoreResult<()> {
        self.watcher.block_external_change(tool).await
    }

    pub async fn allow_external_change(&self, tool: ToolId) -> CoreResult<()> {
        self.watcher.allow_external_change(tool).await
    }

    pub fn get_watch_config(&self) -> CoreResult<ConfigWatchConfig> {
        Ok(self.watcher.get_watch_config())
    }

    pub fn update_watch_config(
        &self,
        config: ConfigWatchConfig,
    ) -> CoreResult<ConfigWatchConfig> {
        self.watcher.update_watch_config(config)
    }

    // ── Token logs & stats ───────────────────────────────────────────────

    pub fn query_token_logs(
        &self,
        filters: LogFilters,
        page: u64,
        page_size: u64,
    ) -> CoreResult<LogPage> {
        Ok(self.stats.query().query_logs(&filters, page, page_size)?)
    }

    pub fn get_token_stats_summary(&self, filters: LogFilters) -> CoreResult<StatsSummary> {
        Ok(self.stats.query().summary(&filters, self.stats.metrics())?)
    }

    pub fn query_token_trends(
        &self,
        filters: LogFilters,
        granularity: Granularity,
    ) -> CoreResult<Vec<AggregateBucket>> {
        Ok(self.stats.query().aggregate(&filters, granularity)?)
    }

    pub fn query_cost_summary(&self, filters: LogFilters) -> CoreResult<Vec<CostSummaryRow>> {
        Ok(self.stats.query().cost_summary(&filters)?)
    }

    // ── Pricing templates ────────────────────────────────────────────────

    fn load_pricing(&self) -> CoreResult<PricingStore> {
        let mut store: PricingStore = self.store.read_json(&paths::pricing_file())?;
        pricing::install_presets(&mut store);
        Ok(store)
    }

    fn save_pricing(&self, store: &PricingStore) -> CoreResult<()> {
        Ok(self.store.write_json(&paths::pricing_file(), store)?)
    }

    pub fn list_pricing_templates(&self) -> CoreResult<Vec<PricingTemplate>> {
        let store = self.load_pricing()?;
        let mut templates: Vec<PricingTemplate> = store.templates.into_values().collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(templates)
    }

    pub fn save_pricing_template(&self, template: PricingTemplate) -> CoreResult<()> {
        if template.id.trim().is_empty() || template.name.trim().is_empty() {
            return Err(CoreError::invalid("template id and name are required"));
        }
        let mut store = self.load_pricing()?;
        if let Some(existing) = store.templates.get(&template.id) {
            if existing.is_default_preset {
                return Err(CoreError::conflict(format!(
                    "preset template {} is immutable",
                    template.id
                )));
            }
        }
        if template.is_default_preset {
            return Err(CoreError::invalid(
                "user templates cannot be marked as presets",
            ));
        }
        pricing::validate_template(&store, &template)?;
        store.templates.insert(template.id.clone(), template);
        self.save_pricing(&store)
    }

    pub fn delete_pricing_template(&self, id: &str) -> CoreResult<()> {
        let mut store = self.load_pricing()?;
        let Some(template) = store.templates.get(id) else {
            return Err(CoreError::not_found(format!("pricing template {id}")));
        };
        if template.is_default_preset {
            return Err(CoreError::conflict(format!(
                "preset template {id} cannot be deleted"
            )));
        }
        let referenced = store.templates.values().any(|t| {
            t.id != id
                && t.inherited_models
                    .iter()
                    .any(|m| m.source_template_id == id)
        });
        if referenced {
            return Err(CoreError::conflict(format!(
                "template {id} is inherited from by another template"
            )));
        }
        store.templates.remove(id);
        // Tools defaulting to the removed template fall back to presets
        for tool in crate::tools::ALL_TOOLS {
            if store.tool_defaults.get(&tool).map(String::as_str) == Some(id) {
                store
                    .tool_defaults
                    .insert(tool, tool.default_pricing_template().to_string());
            }
        }
        self.save_pricing(&store)
    }

    pub fn set_default_template(&self, tool: ToolId, id: &str) -> CoreResult<()> {
        let mut store = self.load_pricing()?;
        if !store.templates.contains_key(id) {
            return Err(CoreError::new(
                ErrorKind::PricingMissing,
                format!("pricing template {id} not found"),
            ));
        }
        store.tool_defaults.insert(tool, id.to_string());
        self.save_pricing(&store)
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    pub fn get_session_list(&self, tool: Option<ToolId>) -> CoreResult<Vec<ProxySession>> {
        Ok(self.stats.query().list_sessions(tool)?)
    }

    pub fn get_session_stats(&self, session_id: &str) -> CoreResult<Value> {
        let session = self
            .stats
            .query()
            .get_session(session_id)?
            .ok_or_else(|| CoreError::not_found(format!("session {session_id}")))?;
        let filters = LogFilters {
            session: Some(session_id.to_string()),
            ..Default::default()
        };
        let summary = self.stats.query().summary(&filters, self.stats.metrics())?;
        let active = session.is_active(chrono::Utc::now());
        Ok(json!({
            "session": session,
            "active": active,
            "stats": summary,
        }))
    }

    pub async fn update_session_note(
        &self,
        session_id: &str,
        note: Option<String>,
    ) -> CoreResult<()> {
        self.sessions.update_note(session_id, note).await;
        Ok(())
    }

    pub async fn update_session_config(
        &self,
        session_id: &str,
        config_mode: ConfigMode,
    ) -> CoreResult<()> {
        if let ConfigMode::Custom { profile_name } = &config_mode {
            // The pinned profile must exist for the session's tool
            let session = self.stats.query().get_session(session_id)?;
            if let Some(session) = session {
                self.profiles.get(session.tool_id, profile_name).await?;
            }
        }
        self.sessions.update_config(session_id, config_mode).await;
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> CoreResult<()> {
        self.sessions.delete(session_id).await;
        Ok(())
    }

    pub async fn clear_all_sessions(&self) -> CoreResult<()> {
        self.sessions.clear_all().await;
        Ok(())
    }

    // ── Dispatch by name ─────────────────────────────────────────────────

    /// Route a named command with JSON params to its handler. This is the
    /// wire form the shell speaks; typed callers use the methods above.
    pub async fn dispatch(&self, name: &str, params: Value) -> CoreResult<Value> {
        fn parse<T: serde::de::DeserializeOwned>(params: &Value) -> CoreResult<T> {
            serde_json::from_value(params.clone())
                .map_err(|e| CoreError::invalid(format!("bad params: {e}")))
        }

        let out = match name {
            "list_profiles" => {
                let p: ToolParam = parse(&params)?;
                serde_json::to_value(self.list_profiles(p.tool).await?)?
            }
            "create_profile" => {
                #[derive(Deserialize)]
                struct P {
                    tool: ToolId,
                    #[serde(flatten)]
                    payload: NewProfile,
                }
                let p: P = parse(&params)?;
                serde_json::to_value(self.create_profile(p.tool, p.payload).await?)?
            }
            "update_profile" => {
                #[derive(Deserialize)]
                struct P {
                    tool: ToolId,
                    name: String,
                    #[serde(flatten)]
                    patch: ProfilePatch,
                }
                let p: P = parse(&params)?;
                serde_json::to_value(self.update_profile(p.tool, &p.name, p.patch).await?)?
            }
            "delete_profile" => {
                let p: ToolNameParams = parse(&params)?;
                serde_json::to_value(self.delete_profile(p.tool, &p.name).await?)?
            }
            "activate_profile" => {
                let p: ToolNameParams = parse(&params)?;
                serde_json::to_value(self.activate_profile(p.tool, &p.name).await?)?
            }
            "import_from_native" => {
                let p: ToolNameParams = parse(&params)?;
                serde_json::to_value(self.import_from_native(p.tool, &p.name).await?)?
            }
            "get_active_config" => {
                let p: ToolParam = parse(&params)?;
                serde_json::to_value(self.get_active_config(p.tool).await?)?
            }
            "get_global_config" => serde_json::to_value(self.get_global_config()?)?,
            "save_global_config" => {
                let config: GlobalConfig = parse(&params)?;
                serde_json::to_value(self.save_global_config(config)?)?
            }
            "start_tool_proxy" => {
                let p: ToolParam = parse(&params)?;
                serde_json::to_value(self.start_tool_proxy(p.tool).await?)?
            }
            "stop_tool_proxy" => {
                let p: ToolParam = parse(&params)?;
                serde_json::to_value(self.stop_tool_proxy(p.tool).await?)?
            }
            "get_all_proxy_status" => serde_json::to_value(self.get_all_proxy_status().await?)?,
            "update_proxy_config" => {
                #[derive(Deserialize)]
                struct P {
                    tool: ToolId,
                    config: ToolProxyConfig,
                }
                let p: P = parse(&params)?;
                serde_json::to_value(self.update_proxy_config(p.tool, p.config).await?)?
            }
            "get_proxy_config" => {
                let p: ToolParam = parse(&params)?;
                serde_json::to_value(self.get_proxy_config(p.tool)?)?
            }
            "get_all_proxy_configs" => serde_json::to_value(self.get_all_proxy_configs()?)?,
            "block_external_change" => {
                let p: ToolParam = parse(&params)?;
                serde_json::to_value(self.block_external_change(p.tool).await?)?
            }
            "allow_external_change" => {
                let p: ToolParam = parse(&params)?;
                serde_json::to_value(self.allow_external_change(p.tool).await?)?
            }
            "get_watch_config" => serde_json::to_value(self.get_watch_config()?)?,
            "update_watch_config" => {
                let config: ConfigWatchConfig = parse(&params)?;
                serde_json::to_value(self.update_watch_config(config)?)?
            }
            "query_token_logs" => {
                #[derive(Deserialize)]
                struct P {
                    #[serde(default)]
                    filters: LogFilters,
                    #[serde(default = "default_page")]
                    page: u64,
                    #[serde(default = "default_page_size")]
                    page_size: u64,
                }
                fn default_page() -> u64 {
                    1
                }
                fn default_page_size() -> u64 {
                    50
                }
                let p: P = parse(&params)?;
                serde_json::to_value(self.query_token_logs(p.filters, p.page, p.page_size)?)?
            }
            "get_token_stats_summary" => {
                #[derive(Deserialize)]
                struct P {
                    #[serde(default)]
                    filters: LogFilters,
                }
                let p: P = parse(&params)?;
                serde_json::to_value(self.get_token_stats_summary(p.filters)?)?
            }
            "query_token_trends" => {
                #[derive(Deserialize)]
                struct P {
                    #[serde(default)]
                    filters: LogFilters,
                    granularity: Granularity,
                }
                let p: P = parse(&params)?;
                serde_json::to_value(self.query_token_trends(p.filters, p.granularity)?)?
            }
            "query_cost_summary" => {
                #[derive(Deserialize)]
                struct P {
                    #[serde(default)]
                    filters: LogFilters,
                }
                let p: P = parse(&params)?;
                serde_json::to_value(self.query_cost_summary(p.filters)?)?
            }
            "list_pricing_templates" => serde_json::to_value(self.list_pricing_templates()?)?,
            "save_pricing_template" => {
                let template: PricingTemplate = parse(&params)?;
                serde_json::to_value(self.save_pricing_template(template)?)?
            }
            "delete_pricing_template" => {
                #[derive(Deserialize)]
                struct P {
                    id: String,
                }
                let p: P = parse(&params)?;
                serde_json::to_value(self.delete_pricing_template(&p.id)?)?
            }
            "set_default_template" => {
                #[derive(Deserialize)]
                struct P {
                    tool: ToolId,
                    id: String,
                }
                let p: P = parse(&params)?;
                serde_json::to_value(self.set_default_template(p.tool, &p.id)?)?
            }
            "get_session_list" => {
                #[derive(Deserialize)]
                struct P {
                    #[serde(default)]
                    tool: Option<ToolId>,
                }
                let p: P = parse(&params)?;
                serde_json::to_value(self.get_session_list(p.tool)?)?
            }
            "get_session_stats" => {
                let p: SessionParam = parse(&params)?;
                self.get_session_stats(&p.session_id)?
            }
            "update_session_note" => {
                #[derive(Deserialize)]
                struct P {
                    session_id: String,
                    #[serde(default)]
                    note: Option<String>,
                }
                let p: P = parse(&params)?;
                serde_json::to_value(self.update_session_note(&p.session_id, p.note).await?)?
            }
            "update_session_config" => {
                #[derive(Deserialize)]
                struct P {
                    session_id: String,
                    config_mode: ConfigMode,
                }
                let p: P = parse(&params)?;
                serde_json::to_value(
                    self.update_session_config(&p.session_id, p.config_mode)
                        .await?,
                )?
            }
            "delete_session" => {
                let p: SessionParam = parse(&params)?;
                serde_json::to_value(self.delete_session(&p.session_id).await?)?
            }
            "clear_all_sessions" => serde_json::to_value(self.clear_all_sessions().await?)?,
            other => {
                return Err(CoreError::not_found(format!("unknown command {other}")));
            }
        };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::ConfigWatcher;
    use chrono::Utc;

    fn scratch_hub(name: &str) -> (CommandHub, std::sync::MutexGuard<'static, ()>) {
        let guard = crate::paths::TEST_ENV_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let unique = format!(
            "duckcoding-commands-{}-{}-{}",
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
        let events = EventBus::new();
        let proxies = Arc::new(ProxyManager::new(
            store.clone(),
            profiles.clone(),
            sessions.clone(),
            stats.clone(),
            events.clone(),
        ));
        let watcher = Arc::new(ConfigWatcher::new(
            store.clone(),
            profiles.clone(),
            events.clone(),
        ));
        (
            CommandHub {
                store,
                profiles,
                proxies,
                watcher,
                sessions,
                stats,
                events,
            },
            guard,
        )
    }

    #[tokio::test]
    async fn dispatch_round_trips_profile_crud() {
        let (hub, _env) = scratch_hub("dispatch");
        let created = hub
            .dispatch(
                "create_profile",
                json!({
                    "tool": "codex",
                    "name": "work",
                    "api_key": "sk-1",
                    "base_url": "https://jp.duckcoding.com"
                }),
            )
            .await
            .unwrap();
        assert_eq!(created["name"], "work");

        let listed = hub
            .dispatch("list_profiles", json!({"tool": "codex"}))
            .await
            .unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        hub.dispatch("delete_profile", json!({"tool": "codex", "name": "work"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_command_is_not_found() {
        let (hub, _env) = scratch_hub("unknown");
        let err = hub.dispatch("frobnicate", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn preset_templates_are_immutable() {
        let (hub, _env) = scratch_hub("presets");
        let templates = hub.list_pricing_templates().unwrap();
        assert!(templates.iter().any(|t| t.id == "preset-claude"));

        let err = hub.delete_pricing_template("preset-claude").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        let preset = templates
            .into_iter()
            .find(|t| t.id == "preset-claude")
            .unwrap();
        let err = hub.save_pricing_template(preset).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn user_template_save_and_default_selection() {
        let (hub, _env) = scratch_hub("templates");
        let template = PricingTemplate {
            id: "reseller".to_string(),
            name: "Reseller".to_string(),
            is_default_preset: false,
            inherited_models: vec![crate::models::InheritedModel {
                model_name: "claude-sonnet-4".to_string(),
                source_template_id: "preset-claude".to_string(),
                multiplier: 0.8,
            }],
            custom_models: HashMap::new(),
        };
        hub.save_pricing_template(template).unwrap();
        hub.set_default_template(ToolId::ClaudeCode, "reseller")
            .unwrap();

        let err = hub
            .set_default_template(ToolId::ClaudeCode, "ghost")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PricingMissing);

        // Deleting the default falls the tool back to its preset
        hub.delete_pricing_template("reseller").unwrap();
        let pricing = hub.load_pricing().unwrap();
        assert_eq!(
            pricing
                .tool_defaults
                .get(&ToolId::ClaudeCode)
                .map(String::as_str),
            Some("preset-claude")
        );
    }

    #[tokio::test]
    async fn global_config_round_trips() {
        let (hub, _env) = scratch_hub("global");
        let mut config = hub.get_global_config().unwrap();
        config.http_proxy = Some("http://127.0.0.1:7890".to_string());
        config.config_watch.scan_interval_seconds = 120; // clamped on save
        let saved = hub.save_global_config(config).unwrap();
        assert_eq!(saved.config_watch.scan_interval_seconds, 60);

        let reloaded = hub.get_global_config().unwrap();
        assert_eq!(
            reloaded.http_proxy.as_deref(),
            Some("http://127.0.0.1:7890")
        );
    }
}
