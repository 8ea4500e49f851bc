// Session manager - payload-derived identity and per-session aggregates
//
// Each tool embeds a conversation identifier somewhere different in its
// request payload; derivation is dispatched on the wire flavor. Touches
// update an in-memory map and enqueue an upsert that a background task
// flushes to the stats store every 100 ms or 10 dirty sessions,
// whichever comes first. Requests with no derivable identity fall back
// to a synthetic per-client-per-day id.

mod derive;

pub use derive::{derive_session_identity, SessionIdentity};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{Mutex, Notify};

use crate::models::{ConfigMode, ProxySession, TokenCounters};
use crate::stats::StatsStore;
use crate::tools::ToolId;

/// Dirty-set size that triggers an early flush.
const FLUSH_BATCH: usize = 10;
/// Interval between periodic flushes.
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);
/// In-memory retention mirror of the persisted policy.
const RETENTION_DAYS: i64 = 30;
const MAX_SESSIONS: usize = 1000;

struct Inner {
    sessions: HashMap<String, ProxySession>,
    dirty: HashSet<String>,
}

/// Process-singleton. Request tasks hold a cheap clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Mutex<Inner>>,
    stats: StatsStore,
    flush_now: Arc<Notify>,
}

impl SessionManager {
    pub fn new(stats: StatsStore) -> Self {
        let manager = Self {
            inner: Arc::new(Mutex::new(Inner {
                sessions: HashMap::new(),
                dirty: HashSet::new(),
            })),
            stats,
            flush_now: Arc::new(Notify::new()),
        };
        manager.spawn_flush_task();
        manager.spawn_retention_task();
        manager
    }

    /// Record one finalized request against its session.
    pub async fn touch(
        &self,
        identity: &SessionIdentity,
        tool: ToolId,
        counters: &TokenCounters,
        config_mode: ConfigMode,
    ) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let session = match inner.sessions.entry(identity.session_id.clone()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                // First sight in this process: rehydrate a persisted
                // aggregate so counters continue instead of restarting
                let persisted = self
                    .stats
                    .query()
                    .get_session(&identity.session_id)
                    .ok()
                    .flatten();
                entry.insert(persisted.unwrap_or_else(|| ProxySession {
                    session_id: identity.session_id.clone(),
                    display_id: identity.display_id.clone(),
                    tool_id: tool,
                    first_seen_at: now,
                    last_seen_at: now,
                    request_count: 0,
                    counters: TokenCounters::default(),
                    note: None,
                    config_mode: ConfigMode::Global,
                }))
            }
        };
        session.last_seen_at = now;
        session.request_count += 1;
        session.counters.add(counters);
        session.config_mode = config_mode;

        inner.dirty.insert(identity.session_id.clone());
        let flush_early = inner.dirty.len() >= FLUSH_BATCH;
        drop(inner);

        if flush_early {
            self.flush_now.notify_one();
        }
    }

    /// Session bound to a custom profile, if any (used for per-session
    /// endpoint routing).
    pub async fn config_mode(&self, session_id: &str) -> Option<ConfigMode> {
        let inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get(session_id) {
            return Some(session.config_mode.clone());
        }
        drop(inner);
        self.stats
            .query()
            .get_session(session_id)
            .ok()
            .flatten()
            .map(|s| s.config_mode)
    }

    pub async fn update_note(&self, session_id: &str, note: Option<String>) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.note = note.clone();
        }
        drop(inner);
        self.stats
            .update_session_note(session_id.to_string(), note);
    }

    pub async fn update_config(&self, session_id: &str, config_mode: ConfigMode) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.config_mode = config_mode.clone();
        }
        drop(inner);
        self.stats
            .update_session_config(session_id.to_string(), config_mode);
    }

    pub async fn delete(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.sessions.remove(session_id);
        inner.dirty.remove(session_id);
        drop(inner);
        self.stats.delete_session(session_id.to_string());
    }

    pub async fn clear_all(&self) {
        let mut inner = self.inner.lock().await;
        inner.sessions.clear();
        inner.dirty.clear();
        drop(inner);
        self.stats.clear_sessions();
    }

    /// Flush dirty aggregates immediately (shutdown path).
    pub async fn flush(&self) {
        let batch = {
            let mut inner = self.inner.lock().await;
            let dirty: Vec<String> = inner.dirty.drain().collect();
            dirty
                .iter()
                .filter_map(|id| inner.sessions.get(id).cloned())
                .collect::<Vec<_>>()
        };
        self.stats.upsert_sessions(batch);
    }

    fn spawn_flush_task(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
                    _ = manager.flush_now.notified() => {}
                }
                manager.flush().await;
            }
        });
    }

    fn spawn_retention_task(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                manager.prune().await;
            }
        });
    }

    /// Mirror the persisted retention policy in memory: drop sessions idle
    /// beyond the window, then the oldest beyond the cap. The database
    /// side runs the same policy on the stats writer thread.
    async fn prune(&self) {
        let cutoff = Utc::now() - Duration::days(RETENTION_DAYS);
        let mut inner = self.inner.lock().await;
        inner.sessions.retain(|_, s| s.last_seen_at >= cutoff);

        if inner.sessions.len() > MAX_SESSIONS {
            let mut by_age: Vec<(String, chrono::DateTime<Utc>)> = inner
                .sessions
                .iter()
                .map(|(id, s)| (id.clone(), s.last_seen_at))
                .collect();
            by_age.sort_by_key(|(_, seen)| *seen);
            let excess = inner.sessions.len() - MAX_SESSIONS;
            for (id, _) in by_age.into_iter().take(excess) {
                inner.sessions.remove(&id);
                inner.dirty.remove(&id);
            }
        }
    }
}
