// Profile manager - CRUD over per-tool credential profiles
//
// Profiles live in profiles.json, the per-tool active pointer in
// active.json. Activation writes the profile's credentials into the
// tool's native files, re-reads them into a snapshot, and records the
// sync time. Names beginning with dc_proxy_ are reserved for the
// internal profile the proxy manager installs while an instance runs;
// those bypass the reserved-name check through a crate-private API and
// are hidden from every list.

pub mod native;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::models::{ActiveProfile, Profile, ProfileDescriptor, ProfileSource, ToolProxyConfig};
use crate::paths;
use crate::store::DataStore;
use crate::tools::{ToolId, ALL_TOOLS};

pub use native::NativeCredentials;

const RESERVED_PREFIX: &str = "dc_proxy_";

type ProfileMap = HashMap<ToolId, HashMap<String, Profile>>;
type ActiveMap = HashMap<ToolId, ActiveProfile>;

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("valid name pattern"))
}

/// Creation payload for a user profile.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProfile {
    pub name: String,
    pub api_key: String,
    pub base_url: String,
    #[serde(default)]
    pub wire_api: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub pricing_template_id: Option<String>,
    #[serde(default)]
    pub source: Option<ProfileSource>,
}

/// Partial update; absent fields keep their current values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfilePatch {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub wire_api: Option<Option<String>>,
    pub model: Option<Option<String>>,
    pub pricing_template_id: Option<Option<String>>,
}

pub struct ProfileManager {
    store: Arc<DataStore>,
    /// Per-tool serialization of profile-store mutations
    locks: HashMap<ToolId, Mutex<()>>,
}

impl ProfileManager {
    pub fn new(store: Arc<DataStore>) -> Self {
        let locks = ALL_TOOLS.iter().map(|t| (*t, Mutex::new(()))).collect();
        Self { store, locks }
    }

    fn lock_for(&self, tool: ToolId) -> &Mutex<()> {
        self.locks.get(&tool).expect("all tools have locks")
    }

    fn load_profiles(&self) -> CoreResult<ProfileMap> {
        Ok(self.store.read_json(&paths::profiles_file())?)
    }

    fn save_profiles(&self, profiles: &ProfileMap) -> CoreResult<()> {
        Ok(self.store.write_json(&paths::profiles_file(), profiles)?)
    }

    fn load_active(&self) -> CoreResult<ActiveMap> {
        Ok(self.store.read_json(&paths::active_file())?)
    }

    fn save_active(&self, active: &ActiveMap) -> CoreResult<()> {
        Ok(self.store.write_json(&paths::active_file(), active)?)
    }

    fn validate_name(name: &str) -> CoreResult<()> {
        if !name_pattern().is_match(name) {
            return Err(CoreError::invalid(format!(
                "profile name {name:?} must match [A-Za-z0-9_.-]+"
            )));
        }
        if name.starts_with(RESERVED_PREFIX) {
            return Err(CoreError::new(
                ErrorKind::Reserved,
                format!("names starting with {RESERVED_PREFIX} are reserved"),
            ));
        }
        Ok(())
    }

    /// User-visible profiles; internal dc_proxy_ entries are filtered out.
    pub async fn list(&self, tool: ToolId) -> CoreResult<Vec<ProfileDescriptor>> {
        let profiles = self.load_profiles()?;
        let mut out: Vec<ProfileDescriptor> = profiles
            .get(&tool)
            .map(|m| {
                m.values()
                    .filter(|p| !p.name.starts_with(RESERVED_PREFIX))
                    .map(ProfileDescriptor::from)
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub async fn get(&self, tool: ToolId, name: &str) -> CoreResult<Profile> {
        let profiles = self.load_profiles()?;
        profiles
            .get(&tool)
            .and_then(|m| m.get(name))
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("profile {name} for {tool}")))
    }

    pub async fn create(&self, tool: ToolId, payload: NewProfile) -> CoreResult<Profile> {
        Self::validate_name(&payload.name)?;
        if payload.api_key.trim().is_empty() {
            return Err(CoreError::invalid("api_key must not be empty"));
        }
        if payload.base_url.trim().is_empty() {
            return Err(CoreError::invalid("base_url must not be empty"));
        }

        let _guard = self.lock_for(tool).lock().await;
        let mut profiles = self.load_profiles()?;
        let tool_profiles = profiles.entry(tool).or_default();
        if tool_profiles.contains_key(&payload.name) {
            return Err(CoreError::conflict(format!(
                "profile {} already exists",
                payload.name
            )));
        }

        let now = Utc::now();
        let profile = Profile {
            name: payload.name.clone(),
            api_key: payload.api_key,
            base_url: payload.base_url,
            wire_api: payload.wire_api,
            model: payload.model,
            pricing_template_id: payload.pricing_template_id,
            source: payload.source.unwrap_or_default(),
            native_snapshot: Value::Null,
            created_at: now,
            updated_at: now,
        };
        tool_profiles.insert(profile.name.clone(), profile.clone());
        self.save_profiles(&profiles)?;
        tracing::info!("created profile {} for {tool}", profile.name);
        Ok(profile)
    }

    pub async fn update(
        &self,
        tool: ToolId,
        name: &str,
        patch: ProfilePatch,
    ) -> CoreResult<Profile> {
        Self::validate_name(name)?;
        let _guard = self.lock_for(tool).lock().await;
        let mut profiles = self.load_profiles()?;
        let profile = profiles
            .get_mut(&tool)
            .and_then(|m| m.get_mut(name))
            .ok_or_else(|| CoreError::not_found(format!("profile {name} for {tool}")))?;

        if let Some(api_key) = patch.api_key {
            if api_key.trim().is_empty() {
                return Err(CoreError::invalid("api_key must not be empty"));
            }
            profile.api_key = api_key;
        }
        if let Some(base_url) = patch.base_url {
            if base_url.trim().is_empty() {
                return Err(CoreError::invalid("base_url must not be empty"));
            }
            profile.base_url = base_url;
        }
        if let Some(wire_api) = patch.wire_api {
            profile.wire_api = wire_api;
        }
        if let Some(model) = patch.model {
            profile.model = model;
        }
        if let Some(template) = patch.pricing_template_id {
            profile.pricing_template_id = template;
        }
        profile.updated_at = Utc::now();

        let updated = profile.clone();
        self.save_profiles(&profiles)?;
        Ok(updated)
    }

    pub async fn delete(&self, tool: ToolId, name: &str, proxy_running: bool) -> CoreResult<()> {
        Self::validate_name(name)?;
        let _guard = self.lock_for(tool).lock().await;

        let mut active = self.load_active()?;
        let is_active = active
            .get(&tool)
            .map(|a| a.profile_name == name)
            .unwrap_or(false);
        if is_active && proxy_running {
            return Err(CoreError::conflict(format!(
                "profile {name} is active while the proxy is running"
            )));
        }

        let mut profiles = self.load_profiles()?;
        let removed = profiles
            .get_mut(&tool)
            .and_then(|m| m.remove(name))
            .is_some();
        if !removed {
            return Err(CoreError::not_found(format!("profile {name} for {tool}")));
        }
        self.save_profiles(&profiles)?;

        if is_active {
            active.remove(&tool);
            self.save_active(&active)?;
        }
        tracing::info!("deleted profile {name} for {tool}");
        Ok(())
    }

    /// Write the profile's credentials into the tool's native files, then
    /// snapshot what landed on disk.
    pub async fn activate(&self, tool: ToolId, name: &str, proxy_running: bool) -> CoreResult<()> {
        Self::validate_name(name)?;
        if proxy_running {
            return Err(CoreError::conflict(format!(
                "stop the {tool} proxy before switching profiles"
            )));
        }

        let _guard = self.lock_for(tool).lock().await;
        let mut profiles = self.load_profiles()?;
        let profile = profiles
            .get_mut(&tool)
            .and_then(|m| m.get_mut(name))
            .ok_or_else(|| CoreError::not_found(format!("profile {name} for {tool}")))?;

        let creds = NativeCredentials {
            api_key: profile.api_key.clone(),
            base_url: profile.base_url.clone(),
            wire_api: profile.wire_api.clone(),
            model: profile.model.clone(),
        };
        native::apply(&self.store, tool, &creds)?;
        let image = native::snapshot(&self.store, tool)?;

        let now = Utc::now();
        profile.native_snapshot = image.clone();
        profile.updated_at = now;

        let mut active = self.load_active()?;
        active.insert(
            tool,
            ActiveProfile {
                profile_name: name.to_string(),
                switched_at: now,
                last_synced_at: now,
                native_snapshot: image,
                prior_profile: None,
            },
        );

        self.save_profiles(&profiles)?;
        self.save_active(&active)?;
        tracing::info!("activated profile {name} for {tool}");
        Ok(())
    }

    /// Create a profile from whatever the native files currently contain.
    pub async fn import_from_native(&self, tool: ToolId, name: &str) -> CoreResult<Profile> {
        let creds = native::extract(&self.store, tool)?;
        if creds.api_key.is_empty() || creds.base_url.is_empty() {
            return Err(CoreError::invalid(format!(
                "native {tool} config has no importable credentials"
            )));
        }
        self.create(
            tool,
            NewProfile {
                name: name.to_string(),
                api_key: creds.api_key,
                base_url: creds.base_url,
                wire_api: creds.wire_api,
                model: creds.model,
                pricing_template_id: None,
                source: Some(ProfileSource::Custom),
            },
        )
        .await
    }

    pub async fn get_active(&self, tool: ToolId) -> CoreResult<Option<ActiveProfile>> {
        Ok(self.load_active()?.remove(&tool))
    }

    /// Replace the active snapshot with the current on-disk state
    /// (external change accepted).
    pub async fn resnapshot_active(&self, tool: ToolId) -> CoreResult<()> {
        let _guard = self.lock_for(tool).lock().await;
        let mut active = self.load_active()?;
        let Some(entry) = active.get_mut(&tool) else {
            return Err(CoreError::not_found(format!("no active profile for {tool}")));
        };
        entry.native_snapshot = native::snapshot(&self.store, tool)?;
        entry.last_synced_at = Utc::now();
        self.save_active(&active)?;
        Ok(())
    }

    /// Rewrite the native files from the active snapshot (external change
    /// blocked).
    pub async fn restore_active_snapshot(&self, tool: ToolId) -> CoreResult<()> {
        let _guard = self.lock_for(tool).lock().await;
        let active = self.load_active()?;
        let Some(entry) = active.get(&tool) else {
            return Err(CoreError::not_found(format!("no active profile for {tool}")));
        };
        native::restore_snapshot(&self.store, tool, &entry.native_snapshot)?;
        Ok(())
    }

    // ── Internal API (proxy manager only) ────────────────────────────────

    /// Install the dc_proxy_<tool> profile: native files point the CLI at
    /// the local listener while the internal profile record carries the
    /// real upstream credentials the instance forwards with. Returns that
    /// record for route resolution.
    pub(crate) async fn install_dc_proxy_profile(
        &self,
        tool: ToolId,
        cfg: &ToolProxyConfig,
        local_url: &str,
    ) -> CoreResult<Profile> {
        let _guard = self.lock_for(tool).lock().await;
        let mut profiles = self.load_profiles()?;
        let mut active = self.load_active()?;

        // Upstream credentials: explicit config first, else the active
        // user profile's
        let prior_name = active.get(&tool).map(|a| a.profile_name.clone());
        let fallback = prior_name
            .as_ref()
            .and_then(|name| profiles.get(&tool).and_then(|m| m.get(name)))
            .cloned();

        let real_api_key = cfg
            .real_api_key
            .clone()
            .or_else(|| fallback.as_ref().map(|p| p.api_key.clone()))
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                CoreError::not_found(format!("no upstream credentials configured for {tool}"))
            })?;
        let real_base_url = cfg
            .real_base_url
            .clone()
            .or_else(|| fallback.as_ref().map(|p| p.base_url.clone()))
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                CoreError::not_found(format!("no upstream base_url configured for {tool}"))
            })?;

        // Pre-install image, restored if the proxy stops with no prior
        // profile to fall back to
        let pre_install = native::snapshot(&self.store, tool)?;

        let local_key = cfg.local_api_key.clone().unwrap_or_default();
        native::apply(
            &self.store,
            tool,
            &NativeCredentials {
                api_key: local_key,
                base_url: local_url.to_string(),
                wire_api: fallback.as_ref().and_then(|p| p.wire_api.clone()),
                model: fallback.as_ref().and_then(|p| p.model.clone()),
            },
        )?;
        let post_install = native::snapshot(&self.store, tool)?;

        let now = Utc::now();
        let internal = Profile {
            name: tool.internal_profile_name(),
            api_key: real_api_key,
            base_url: real_base_url,
            wire_api: fallback.as_ref().and_then(|p| p.wire_api.clone()),
            model: fallback.as_ref().and_then(|p| p.model.clone()),
            pricing_template_id: cfg.pricing_template_id.clone().or_else(|| {
                fallback
                    .as_ref()
                    .and_then(|p| p.pricing_template_id.clone())
            }),
            source: ProfileSource::Custom,
            native_snapshot: pre_install,
            created_at: now,
            updated_at: now,
        };
        profiles
            .entry(tool)
            .or_default()
            .insert(internal.name.clone(), internal.clone());

        active.insert(
            tool,
            ActiveProfile {
                profile_name: internal.name.clone(),
                switched_at: now,
                last_synced_at: now,
                native_snapshot: post_install,
                prior_profile: prior_name,
            },
        );

        self.save_profiles(&profiles)?;
        self.save_active(&active)?;
        tracing::info!("installed internal profile for {tool}");
        Ok(internal)
    }

    /// Undo install_dc_proxy_profile: restore the displaced user profile
    /// (or the pre-install native image) and remove the internal record.
    /// No-op when no internal profile is active.
    pub(crate) async fn restore_prior_active(&self, tool: ToolId) -> CoreResult<()> {
        let _guard = self.lock_for(tool).lock().await;
        let mut profiles = self.load_profiles()?;
        let mut active = self.load_active()?;

        let internal_name = tool.internal_profile_name();
        let internal = profiles
            .get_mut(&tool)
            .and_then(|m| m.remove(&internal_name));

        let is_internal_active = active
            .get(&tool)
            .map(|a| a.profile_name == internal_name)
            .unwrap_or(false);
        if !is_internal_active {
            if internal.is_some() {
                self.save_profiles(&profiles)?;
            }
            return Ok(());
        }

        let prior_name = active
            .get(&tool)
            .and_then(|a| a.prior_profile.clone());

        let now = Utc::now();
        match prior_name.and_then(|name| {
            profiles
                .get(&tool)
                .and_then(|m| m.get(&name))
                .cloned()
        }) {
            Some(prior) => {
                native::apply(
                    &self.store,
                    tool,
                    &NativeCredentials {
                        api_key: prior.api_key.clone(),
                        base_url: prior.base_url.clone(),
                        wire_api: prior.wire_api.clone(),
                        model: prior.model.clone(),
                    },
                )?;
                let image = native::snapshot(&self.store, tool)?;
                active.insert(
                    tool,
                    ActiveProfile {
                        profile_name: prior.name.clone(),
                        switched_at: now,
                        last_synced_at: now,
                        native_snapshot: image,
                        prior_profile: None,
                    },
                );
            }
            None => {
                if let Some(internal) = &internal {
                    native::restore_snapshot(&self.store, tool, &internal.native_snapshot)?;
                }
                active.remove(&tool);
            }
        }

        self.save_profiles(&profiles)?;
        self.save_active(&active)?;
        tracing::info!("restored prior profile state for {tool}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_manager(name: &str) -> (ProfileManager, std::sync::MutexGuard<'static, ()>) {
        let guard = crate::paths::TEST_ENV_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let unique = format!(
            "duckcoding-profiles-{}-{}-{}",
            name,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        );
        let root = std::env::temp_dir().join(unique);
        std::env::set_var("DUCKCODING_HOME", &root);
        std::env::set_var("DUCKCODING_NATIVE_HOME", root.join("home"));
        (ProfileManager::new(Arc::new(DataStore::new())), guard)
    }

    fn payload(name: &str) -> NewProfile {
        NewProfile {
            name: name.to_string(),
            api_key: "sk-test".to_string(),
            base_url: "https://jp.duckcoding.com".to_string(),
            wire_api: None,
            model: None,
            pricing_template_id: None,
            source: None,
        }
    }

    #[tokio::test]
    async fn create_list_delete_cycle() {
        let (manager, _env) = scratch_manager("crud");
        manager
            .create(ToolId::ClaudeCode, payload("work"))
            .await
            .unwrap();
        manager
            .create(ToolId::ClaudeCode, payload("personal"))
            .await
            .unwrap();

        let listed = manager.list(ToolId::ClaudeCode).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "personal");

        manager
            .delete(ToolId::ClaudeCode, "work", false)
            .await
            .unwrap();
        assert_eq!(manager.list(ToolId::ClaudeCode).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reserved_prefix_is_rejected() {
        let (manager, _env) = scratch_manager("reserved");
        let err = manager
            .create(ToolId::Codex, payload("dc_proxy_codex"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Reserved);
    }

    #[tokio::test]
    async fn invalid_characters_are_rejected() {
        let (manager, _env) = scratch_manager("chars");
        let err = manager
            .create(ToolId::Codex, payload("has space"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let (manager, _env) = scratch_manager("dup");
        manager.create(ToolId::Codex, payload("a")).await.unwrap();
        let err = manager
            .create(ToolId::Codex, payload("a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn empty_key_is_invalid() {
        let (manager, _env) = scratch_manager("empty");
        let mut p = payload("x");
        p.api_key = "".to_string();
        let err = manager.create(ToolId::Codex, p).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn update_preserves_created_at() {
        let (manager, _env) = scratch_manager("update");
        let created = manager.create(ToolId::Codex, payload("p")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let updated = manager
            .update(
                ToolId::Codex,
                "p",
                ProfilePatch {
                    base_url: Some("https://other.example".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at > created.updated_at);
        assert_eq!(updated.base_url, "https://other.example");
    }

    #[tokio::test]
    async fn activate_while_proxy_running_conflicts() {
        let (manager, _env) = scratch_manager("running");
        manager.create(ToolId::AmpCode, payload("p")).await.unwrap();
        let err = manager
            .activate(ToolId::AmpCode, "p", true)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn delete_active_while_running_conflicts() {
        let (manager, _env) = scratch_manager("delactive");
        manager.create(ToolId::AmpCode, payload("p")).await.unwrap();
        // AMP has no native files, so activation is a pure bookkeeping write
        manager.activate(ToolId::AmpCode, "p", false).await.unwrap();
        let err = manager
            .delete(ToolId::AmpCode, "p", true)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        manager.delete(ToolId::AmpCode, "p", false).await.unwrap();
        assert!(manager.get_active(ToolId::AmpCode).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claude_activate_then_import_round_trips() {
        let (manager, _env) = scratch_manager("claude-rt");
        manager
            .create(ToolId::ClaudeCode, payload("origin"))
            .await
            .unwrap();
        manager
            .activate(ToolId::ClaudeCode, "origin", false)
            .await
            .unwrap();

        let active = manager
            .get_active(ToolId::ClaudeCode)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            active.native_snapshot["env"]["ANTHROPIC_AUTH_TOKEN"],
            "sk-test"
        );

        let imported = manager
            .import_from_native(ToolId::ClaudeCode, "copy")
            .await
            .unwrap();
        assert_eq!(imported.api_key, "sk-test");
        assert_eq!(imported.base_url, "https://jp.duckcoding.com");
    }

    #[tokio::test]
    async fn codex_activate_then_import_round_trips() {
        let (manager, _env) = scratch_manager("codex-rt");
        let mut p = payload("origin");
        p.wire_api = Some("responses".to_string());
        manager.create(ToolId::Codex, p).await.unwrap();
        manager.activate(ToolId::Codex, "origin", false).await.unwrap();

        let active = manager.get_active(ToolId::Codex).await.unwrap().unwrap();
        assert_eq!(
            active.native_snapshot["config"]["model_provider"],
            "duckcoding"
        );
        assert_eq!(active.native_snapshot["auth"]["OPENAI_API_KEY"], "sk-test");

        let imported = manager
            .import_from_native(ToolId::Codex, "copy")
            .await
            .unwrap();
        assert_eq!(imported.api_key, "sk-test");
        assert_eq!(imported.base_url, "https://jp.duckcoding.com");
        assert_eq!(imported.wire_api.as_deref(), Some("responses"));
    }

    #[tokio::test]
    async fn gemini_activate_then_import_round_trips() {
        let (manager, _env) = scratch_manager("gemini-rt");
        let mut p = payload("origin");
        p.model = Some("gemini-2.5-pro".to_string());
        manager.create(ToolId::GeminiCli, p).await.unwrap();
        manager
            .activate(ToolId::GeminiCli, "origin", false)
            .await
            .unwrap();

        let active = manager.get_active(ToolId::GeminiCli).await.unwrap().unwrap();
        assert_eq!(active.native_snapshot["env"]["GEMINI_API_KEY"], "sk-test");
        assert_eq!(
            active.native_snapshot["env"]["GEMINI_MODEL"],
            "gemini-2.5-pro"
        );

        let imported = manager
            .import_from_native(ToolId::GeminiCli, "copy")
            .await
            .unwrap();
        assert_eq!(imported.api_key, "sk-test");
        assert_eq!(imported.base_url, "https://jp.duckcoding.com");
        assert_eq!(imported.model.as_deref(), Some("gemini-2.5-pro"));
    }

    #[tokio::test]
    async fn internal_install_rewrites_claude_native_files_and_restores() {
        let (manager, _env) = scratch_manager("internal-claude");
        manager
            .create(ToolId::ClaudeCode, payload("user"))
            .await
            .unwrap();
        manager
            .activate(ToolId::ClaudeCode, "user", false)
            .await
            .unwrap();

        let mut cfg = ToolProxyConfig::new(8787);
        cfg.local_api_key = Some("local-k".to_string());
        manager
            .install_dc_proxy_profile(ToolId::ClaudeCode, &cfg, "http://127.0.0.1:8787")
            .await
            .unwrap();

        // While the proxy runs, the CLI's own config points at the listener
        let creds = native::extract(&manager.store, ToolId::ClaudeCode).unwrap();
        assert_eq!(creds.api_key, "local-k");
        assert_eq!(creds.base_url, "http://127.0.0.1:8787");

        manager
            .restore_prior_active(ToolId::ClaudeCode)
            .await
            .unwrap();
        let creds = native::extract(&manager.store, ToolId::ClaudeCode).unwrap();
        assert_eq!(creds.api_key, "sk-test");
        assert_eq!(creds.base_url, "https://jp.duckcoding.com");
    }

    #[tokio::test]
    async fn internal_install_and_restore_round_trip() {
        let (manager, _env) = scratch_manager("internal");
        manager.create(ToolId::AmpCode, payload("user")).await.unwrap();
        manager
            .activate(ToolId::AmpCode, "user", false)
            .await
            .unwrap();

        let mut cfg = ToolProxyConfig::new(8790);
        cfg.local_api_key = Some("local-k".to_string());
        let internal = manager
            .install_dc_proxy_profile(ToolId::AmpCode, &cfg, "http://127.0.0.1:8790")
            .await
            .unwrap();
        // Upstream creds fall back to the displaced user profile
        assert_eq!(internal.api_key, "sk-test");
        assert_eq!(internal.base_url, "https://jp.duckcoding.com");

        // Internal profile never shows up in listings
        let listed = manager.list(ToolId::AmpCode).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "user");

        let active = manager.get_active(ToolId::AmpCode).await.unwrap().unwrap();
        assert_eq!(active.profile_name, "dc_proxy_amp-code");
        assert_eq!(active.prior_profile.as_deref(), Some("user"));

        manager.restore_prior_active(ToolId::AmpCode).await.unwrap();
        let active = manager.get_active(ToolId::AmpCode).await.unwrap().unwrap();
        assert_eq!(active.profile_name, "user");

        // Second restore is a no-op
        manager.restore_prior_active(ToolId::AmpCode).await.unwrap();
    }
}
