// Config watcher - guards tool-native files against external edits
//
// One scan task per tool. Each cycle: read the tool's native files,
// diff against the active profile's snapshot, drop blacklisted paths,
// then keep sensitive paths (default mode) or everything else (full
// mode). Surviving diffs raise an external-config-change event and the
// task parks until the user blocks the change, allows it, or 60 seconds
// pass - scans for one tool never overlap a pending notification.

mod diff;

pub use diff::{any_match, diff as diff_snapshots, pattern_matches, DiffEntry, DiffKind};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, Notify};

use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus};
use crate::models::{ConfigWatchConfig, GlobalConfig, WatchMode};
use crate::paths;
use crate::profiles::{native, ProfileManager};
use crate::store::DataStore;
use crate::tools::{ToolId, ALL_TOOLS};

/// How long a notification waits for resolution before the watcher
/// resumes scanning.
const ACK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Idle,
    Scanning,
    Notifying,
}

struct ToolWatch {
    state: WatchState,
    /// Set while a notification awaits block/allow
    pending: bool,
}

pub struct ConfigWatcher {
    store: Arc<DataStore>,
    profiles: Arc<ProfileManager>,
    events: EventBus,
    watches: HashMap<ToolId, Arc<Mutex<ToolWatch>>>,
    acks: HashMap<ToolId, Arc<Notify>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl ConfigWatcher {
    pub fn new(store: Arc<DataStore>, profiles: Arc<ProfileManager>, events: EventBus) -> Self {
        let watches = ALL_TOOLS
            .iter()
            .map(|t| {
                (
                    *t,
                    Arc::new(Mutex::new(ToolWatch {
                        state: WatchState::Idle,
                        pending: false,
                    })),
                )
            })
            .collect();
        let acks = ALL_TOOLS
            .iter()
            .map(|t| (*t, Arc::new(Notify::new())))
            .collect();
        Self {
            store,
            profiles,
            events,
            watches,
            acks,
            shutdown: Mutex::new(None),
        }
    }

    /// Spawn one scan task per watched tool. AMP keeps no native files,
    /// so it is skipped.
    pub async fn start(self: &Arc<Self>) {
        let (tx, rx) = oneshot::channel();
        *self.shutdown.lock().await = Some(tx);

        let mut stop_channels = Vec::new();
        for tool in ALL_TOOLS {
            if tool.native_files().is_empty() {
                continue;
            }
            let (stop_tx, stop_rx) = oneshot::channel();
            stop_channels.push(stop_tx);
            let watcher = self.clone();
            tokio::spawn(async move {
                watcher.scan_loop(tool, stop_rx).await;
            });
        }

        // Fan the single shutdown signal out to every scan task
        tokio::spawn(async move {
            let _ = rx.await;
            for stop in stop_channels {
                let _ = stop.send(());
            }
        });
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
    }

    fn load_config(&self) -> ConfigWatchConfig {
        let mut cfg = self
            .store
            .read_json::<GlobalConfig>(&paths::global_file())
            .map(|g| g.config_watch)
            .unwrap_or_default();
        cfg.clamp();
        cfg
    }

    async fn scan_loop(&self, tool: ToolId, mut stop: oneshot::Receiver<()>) {
        tracing::debug!("config watcher started for {tool}");
        loop {
            let cfg = self.load_config();
            let interval = Duration::from_secs(cfg.scan_interval_seconds);

            tokio::select! {
                _ = &mut stop => {
                    tracing::debug!("config watcher stopped for {tool}");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            if !cfg.enabled {
                continue;
            }

            if let Err(e) = self.scan_once(tool, &cfg).await {
                tracing::warn!("config scan failed for {tool}: {e}");
            }
        }
    }

    /// One scan cycle. Public for command-surface-triggered rescans and
    /// for tests.
    pub async fn scan_once(&self, tool: ToolId, cfg: &ConfigWatchConfig) -> CoreResult<()> {
        let watch = self.watches.get(&tool).expect("all tools have watches");
        {
            let mut guard = watch.lock().await;
            if guard.pending {
                // Previous notification unresolved; skip this cycle
                return Ok(());
            }
            guard.state = WatchState::Scanning;
        }

        let result = self.detect(tool, cfg).await;

        match result {
            Ok(Some((diffs, is_sensitive))) => {
                {
                    let mut guard = watch.lock().await;
                    guard.state = WatchState::Notifying;
                    guard.pending = true;
                }
                tracing::info!(
                    "external config change on {tool}: {} field(s), sensitive={is_sensitive}",
                    diffs.len()
                );
                self.events.publish(CoreEvent::ExternalConfigChange {
                    tool,
                    diffs,
                    is_sensitive,
                });

                let ack = self.acks.get(&tool).expect("all tools have acks").clone();
                let _ = tokio::time::timeout(ACK_TIMEOUT, ack.notified()).await;

                let mut guard = watch.lock().await;
                guard.pending = false;
                guard.state = WatchState::Idle;
            }
            Ok(None) => {
                watch.lock().await.state = WatchState::Idle;
            }
            Err(e) => {
                watch.lock().await.state = WatchState::Idle;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Diff current native files against the active snapshot and apply
    /// the blacklist + mode filters.
    async fn detect(
        &self,
        tool: ToolId,
        cfg: &ConfigWatchConfig,
    ) -> CoreResult<Option<(Vec<DiffEntry>, bool)>> {
        let Some(active) = self.profiles.get_active(tool).await? else {
            return Ok(None);
        };

        let current = native::snapshot(&self.store, tool)?;
        let raw = diff_snapshots(&active.native_snapshot, &current);
        if raw.is_empty() {
            return Ok(None);
        }

        let empty = Vec::new();
        let blacklist = cfg.blacklist.get(&tool).unwrap_or(&empty);
        let sensitive = cfg.sensitive_fields.get(&tool).unwrap_or(&empty);

        let after_blacklist: Vec<DiffEntry> = raw
            .into_iter()
            .filter(|entry| !any_match(blacklist, &entry.path))
            .collect();

        let is_sensitive = after_blacklist
            .iter()
            .any(|entry| any_match(sensitive, &entry.path));

        let kept: Vec<DiffEntry> = match cfg.mode {
            WatchMode::Default => after_blacklist
                .into_iter()
                .filter(|entry| any_match(sensitive, &entry.path))
                .collect(),
            WatchMode::Full => after_blacklist,
        };

        if kept.is_empty() {
            return Ok(None);
        }
        Ok(Some((kept, is_sensitive)))
    }

    /// Reject the external edit: rewrite the native files from the active
    /// snapshot and release the parked scan task.
    pub async fn block_external_change(&self, tool: ToolId) -> CoreResult<()> {
        self.profiles.restore_active_snapshot(tool).await?;
        self.acknowledge(tool).await;
        Ok(())
    }

    /// Accept the external edit: fold the current files into the active
    /// snapshot and release the parked scan task.
    pub async fn allow_external_change(&self, tool: ToolId) -> CoreResult<()> {
        self.profiles.resnapshot_active(tool).await?;
        self.acknowledge(tool).await;
        Ok(())
    }

    async fn acknowledge(&self, tool: ToolId) {
        if let Some(ack) = self.acks.get(&tool) {
            // notify_one stores a permit, so a resolution that lands just
            // before the scan task awaits is not lost
            ack.notify_one();
        }
        if let Some(watch) = self.watches.get(&tool) {
            let mut guard = watch.lock().await;
            guard.pending = false;
            guard.state = WatchState::Idle;
        }
    }

    pub fn get_watch_config(&self) -> ConfigWatchConfig {
        self.load_config()
    }

    pub fn update_watch_config(&self, mut cfg: ConfigWatchConfig) -> CoreResult<ConfigWatchConfig> {
        if cfg.scan_interval_seconds == 0 || cfg.scan_interval_seconds > 60 {
            return Err(CoreError::invalid(
                "scan_interval_seconds must be within 1..=60",
            ));
        }
        cfg.clamp();
        let mut global: GlobalConfig = self.store.read_json(&paths::global_file())?;
        global.config_watch = cfg.clone();
        self.store.write_json(&paths::global_file(), &global)?;
        Ok(cfg)
    }
}
