// Stats store - SQLite persistence for token logs and session aggregates
//
// Writes go through a dedicated OS thread fed by a bounded in-memory
// queue so the request path never blocks on the database. Reads go
// through a small r2d2 pool of read-only connections (WAL mode allows
// concurrent readers while the writer is active).
//
// # Architecture
//
// ```text
// request task ──→ StatsHandle.append_log()      (lock, push, never blocks)
//                        │
//                        └──→ bounded deque (1024; full = drop oldest)
//                                │
//                                └──→ writer thread
//                                        ├──→ batch buffer (10 rows or 100 ms)
//                                        ├──→ sessions upsert
//                                        └──→ hourly retention cleanup
// ```

mod queries;
mod writer;

pub use queries::{
    AggregateBucket, CostSummaryRow, Granularity, LogFilters, LogPage, StatsQuery, StatsSummary,
};
pub use writer::{StatsWriterMetrics, WriterMetricsSnapshot};

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};

use crate::models::{ConfigMode, ProxySession, TokenLog};

/// Queue capacity before the oldest unsent entry is dropped.
const QUEUE_CAPACITY: usize = 1024;

pub(crate) enum WriterCommand {
    Append(Box<TokenLog>),
    UpsertSessions(Vec<ProxySession>),
    UpdateSessionNote {
        session_id: String,
        note: Option<String>,
    },
    UpdateSessionConfig {
        session_id: String,
        config_mode: ConfigMode,
    },
    DeleteSession(String),
    ClearSessions,
    Cleanup {
        retention_days: u32,
        max_rows: u64,
    },
    Shutdown,
}

pub(crate) struct SharedQueue {
    queue: Mutex<VecDeque<WriterCommand>>,
    ready: Condvar,
}

/// Handle owned by producers. Cheap to clone; all methods are
/// non-blocking (a full queue sheds the oldest unsent log).
#[derive(Clone)]
pub struct StatsStore {
    shared: Arc<SharedQueue>,
    metrics: Arc<StatsWriterMetrics>,
    query: StatsQuery,
    writer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl StatsStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("create stats directory")?;
        }

        let shared = Arc::new(SharedQueue {
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            ready: Condvar::new(),
        });
        let metrics = Arc::new(StatsWriterMetrics::default());

        let writer = writer::spawn(db_path.to_path_buf(), shared.clone(), metrics.clone())?;
        let query = StatsQuery::open(db_path)?;

        Ok(Self {
            shared,
            metrics,
            query,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    /// Read-side query interface (snapshot-isolated via WAL).
    pub fn query(&self) -> &StatsQuery {
        &self.query
    }

    pub fn metrics(&self) -> WriterMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Append one finalized request log. Never blocks: a full queue drops
    /// its oldest unsent entry and bumps the dropped counter.
    pub fn append_log(&self, log: TokenLog) {
        self.push(WriterCommand::Append(Box::new(log)));
    }

    /// Batched session upsert from the session manager's flush task.
    pub fn upsert_sessions(&self, sessions: Vec<ProxySession>) {
        if sessions.is_empty() {
            return;
        }
        self.push(WriterCommand::UpsertSessions(sessions));
    }

    pub fn update_session_note(&self, session_id: String, note: Option<String>) {
        self.push(WriterCommand::UpdateSessionNote { session_id, note });
    }

    pub fn update_session_config(&self, session_id: String, config_mode: ConfigMode) {
        self.push(WriterCommand::UpdateSessionConfig {
            session_id,
            config_mode,
        });
    }

    pub fn delete_session(&self, session_id: String) {
        self.push(WriterCommand::DeleteSession(session_id));
    }

    pub fn clear_sessions(&self) {
        self.push(WriterCommand::ClearSessions);
    }

    /// Manual retention pass (the writer also runs this hourly).
    pub fn cleanup(&self, retention_days: u32, max_rows: u64) {
        self.push(WriterCommand::Cleanup {
            retention_days,
            max_rows,
        });
    }

    /// Flush pending work and stop the writer thread. Idempotent.
    pub fn shutdown(&self) {
        self.push(WriterCommand::Shutdown);
        if let Some(handle) = self.writer.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn push(&self, cmd: WriterCommand) {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= QUEUE_CAPACITY {
            // Shed the oldest data command; never shed a Shutdown
            let dropped = queue
                .iter()
                .position(|c| !matches!(c, WriterCommand::Shutdown))
                .and_then(|idx| queue.remove(idx));
            if dropped.is_some() {
                self.metrics.note_dropped();
                tracing::warn!("stats queue full, dropping oldest unsent log");
            }
        }
        queue.push_back(cmd);
        drop(queue);
        self.shared.ready.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        RequestStatus, ResponseType, TokenCosts, TokenCounters,
    };
    use crate::tools::ToolId;
    use chrono::{Duration, Utc};
    use std::path::PathBuf;

    fn temp_db(name: &str) -> PathBuf {
        let unique = format!(
            "duckcoding-stats-{}-{}-{}",
            name,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        );
        std::env::temp_dir().join(unique).join("stats.sqlite")
    }

    fn sample_log(session: &str, ts_offset_secs: i64) -> TokenLog {
        TokenLog {
            id: 0,
            timestamp: Utc::now() + Duration::seconds(ts_offset_secs),
            tool_id: ToolId::ClaudeCode,
            session_id: session.to_string(),
            message_id: Some("msg".to_string()),
            model: "claude-sonnet-4".to_string(),
            config_name: "global".to_string(),
            client_ip: "127.0.0.1".to_string(),
            request_status: RequestStatus::Success,
            error_type: None,
            error_detail: None,
            response_type: ResponseType::Sse,
            counters: TokenCounters {
                input: 10,
                output: 20,
                cache_creation: 0,
                cache_read: 5,
            },
            costs: TokenCosts {
                input: 0.00003,
                output: 0.0003,
                cache_write: 0.0,
                cache_read: 0.0000015,
                total: 0.0003315,
            },
            response_ms: 1200,
        }
    }

    fn drain(store: &StatsStore, expected: u64) {
        // The writer flushes every 100 ms; give it a few cycles
        for _ in 0..60 {
            std::thread::sleep(std::time::Duration::from_millis(50));
            if store.metrics().logs_stored >= expected {
                break;
            }
        }
    }

    #[test]
    fn append_then_query_round_trips() {
        let store = StatsStore::open(&temp_db("roundtrip")).unwrap();
        store.append_log(sample_log("sess-a", 0));
        drain(&store, 1);

        let page = store
            .query()
            .query_logs(&LogFilters::default(), 1, 50)
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.logs[0].session_id, "sess-a");
        assert_eq!(page.logs[0].counters.output, 20);
        store.shutdown();
    }

    #[test]
    fn per_session_append_order_is_id_order() {
        let store = StatsStore::open(&temp_db("order")).unwrap();
        for i in 0..5 {
            store.append_log(sample_log("sess-b", i));
        }
        drain(&store, 5);

        let filters = LogFilters {
            session: Some("sess-b".to_string()),
            ..Default::default()
        };
        let page = store.query().query_logs(&filters, 1, 50).unwrap();
        let ids: Vec<i64> = page.logs.iter().map(|l| l.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids.len(), 5);
        // query returns newest-first; ids ascend with finalize order
        sorted.reverse();
        assert_eq!(ids, sorted);
        store.shutdown();
    }

    #[test]
    fn cleanup_trims_to_max_rows_dropping_earliest() {
        let store = StatsStore::open(&temp_db("cleanup")).unwrap();
        for i in 0..120 {
            store.append_log(sample_log("sess-c", i));
        }
        drain(&store, 120);
        store.cleanup(30, 100);
        // Cleanup runs behind the appends on the writer thread
        std::thread::sleep(std::time::Duration::from_millis(400));

        let page = store
            .query()
            .query_logs(&LogFilters::default(), 1, 200)
            .unwrap();
        assert_eq!(page.total, 100);
        // The earliest 20 rows (lowest ids) are the ones gone
        assert!(page.logs.iter().all(|l| l.id > 20));
        store.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let store = StatsStore::open(&temp_db("shutdown")).unwrap();
        store.shutdown();
        store.shutdown();
    }
}
