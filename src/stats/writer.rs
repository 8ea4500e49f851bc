// Dedicated writer thread for the stats database
//
// Single writer, batched transactions: up to 10 rows or 100 ms per
// flush, whichever comes first. Retention runs on the same thread once
// an hour so there is never writer/writer contention.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};

use super::{SharedQueue, WriterCommand};
use crate::models::{ProxySession, TokenLog};

/// Batch size before an early flush.
const BATCH_SIZE: usize = 10;
/// Maximum time a pending batch may wait.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
/// Retention cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Default log retention applied by the hourly pass.
const LOG_RETENTION_DAYS: u32 = 90;
const LOG_MAX_ROWS: u64 = 100_000;
/// Session retention: drop after 30 idle days, keep at most 1000.
const SESSION_RETENTION_DAYS: i64 = 30;
const SESSION_MAX_ROWS: u64 = 1000;

#[derive(Debug, Default)]
pub struct StatsWriterMetrics {
    pub logs_stored: AtomicU64,
    pub logs_dropped: AtomicU64,
    pub store_failed: AtomicU64,
    pub flush_count: AtomicU64,
}

impl StatsWriterMetrics {
    pub(crate) fn note_dropped(&self) {
        self.logs_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WriterMetricsSnapshot {
        WriterMetricsSnapshot {
            logs_stored: self.logs_stored.load(Ordering::Relaxed),
            logs_dropped: self.logs_dropped.load(Ordering::Relaxed),
            store_failed: self.store_failed.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct WriterMetricsSnapshot {
    pub logs_stored: u64,
    pub logs_dropped: u64,
    pub store_failed: u64,
    pub flush_count: u64,
}

pub(crate) fn spawn(
    db_path: PathBuf,
    shared: Arc<SharedQueue>,
    metrics: Arc<StatsWriterMetrics>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("stats-writer".into())
        .spawn(move || {
            if let Err(e) = run(db_path, shared, metrics) {
                tracing::error!("stats writer thread error: {e:#}");
            }
        })
        .context("spawn stats writer")?;
    Ok(handle)
}

fn run(
    db_path: PathBuf,
    shared: Arc<SharedQueue>,
    metrics: Arc<StatsWriterMetrics>,
) -> Result<()> {
    let conn = Connection::open(&db_path).context("open stats db")?;
    init_schema(&conn)?;

    let mut batch: Vec<TokenLog> = Vec::with_capacity(BATCH_SIZE);
    let mut last_flush = Instant::now();
    let mut last_cleanup = Instant::now();

    loop {
        let cmd = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(cmd) = queue.pop_front() {
                    break Some(cmd);
                }
                let (guard, timeout) = shared
                    .ready
                    .wait_timeout(queue, FLUSH_INTERVAL)
                    .unwrap();
                queue = guard;
                if timeout.timed_out() {
                    break None;
                }
            }
        };

        match cmd {
            Some(WriterCommand::Append(log)) => {
                batch.push(*log);
                // Size or age, whichever trips first; a steady trickle of
                // appends must not starve the interval flush
                if batch.len() >= BATCH_SIZE || last_flush.elapsed() >= FLUSH_INTERVAL {
                    flush_batch(&conn, &mut batch, &metrics);
                    last_flush = Instant::now();
                }
            }
            Some(WriterCommand::UpsertSessions(sessions)) => {
                // Logs referencing these sessions flush first
                flush_batch(&conn, &mut batch, &metrics);
                if let Err(e) = upsert_sessions(&conn, &sessions) {
                    tracing::warn!("session upsert failed: {e:#}");
                }
            }
            Some(WriterCommand::UpdateSessionNote { session_id, note }) => {
                let _ = conn.execute(
                    "UPDATE sessions SET note = ?1 WHERE session_id = ?2",
                    params![note, session_id],
                );
            }
            Some(WriterCommand::UpdateSessionConfig {
                session_id,
                config_mode,
            }) => {
                let encoded = serde_json::to_string(&config_mode).unwrap_or_default();
                let _ = conn.execute(
                    "UPDATE sessions SET config_mode = ?1 WHERE session_id = ?2",
                    params![encoded, session_id],
                );
            }
            Some(WriterCommand::DeleteSession(session_id)) => {
                let _ = conn.execute(
                    "DELETE FROM sessions WHERE session_id = ?1",
                    params![session_id],
                );
            }
            Some(WriterCommand::ClearSessions) => {
                let _ = conn.execute("DELETE FROM sessions", []);
            }
            Some(WriterCommand::Cleanup {
                retention_days,
                max_rows,
            }) => {
                flush_batch(&conn, &mut batch, &metrics);
                match run_log_cleanup(&conn, retention_days, max_rows) {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!("log retention removed {deleted} rows");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("log retention failed: {e:#}"),
                }
            }
            Some(WriterCommand::Shutdown) => {
                flush_batch(&conn, &mut batch, &metrics);
                tracing::debug!("stats writer shutting down");
                break;
            }
            None => {
                // Timeout tick: flush stale batches, run periodic retention
                if !batch.is_empty() && last_flush.elapsed() >= FLUSH_INTERVAL {
                    flush_batch(&conn, &mut batch, &metrics);
                    last_flush = Instant::now();
                }
                if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                    if let Err(e) = run_log_cleanup(&conn, LOG_RETENTION_DAYS, LOG_MAX_ROWS) {
                        tracing::warn!("log retention failed: {e:#}");
                    }
                    if let Err(e) = run_session_cleanup(&conn) {
                        tracing::warn!("session retention failed: {e:#}");
                    }
                    last_cleanup = Instant::now();
                }
            }
        }
    }

    Ok(())
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        "#,
    )?;

    let version: i64 = conn
        .query_row(
            "SELECT COALESCE(
                (SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'),
                0
            )",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS token_logs (
                id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp             INTEGER NOT NULL,
                tool_id               TEXT NOT NULL,
                session_id            TEXT NOT NULL,
                message_id            TEXT,
                model                 TEXT NOT NULL,
                config_name           TEXT NOT NULL,
                client_ip             TEXT NOT NULL,
                request_status        TEXT NOT NULL,
                error_type            TEXT,
                error_detail          TEXT,
                response_type         TEXT NOT NULL,
                input_tokens          INTEGER NOT NULL DEFAULT 0,
                output_tokens         INTEGER NOT NULL DEFAULT 0,
                cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens     INTEGER NOT NULL DEFAULT 0,
                input_cost            REAL NOT NULL DEFAULT 0,
                output_cost           REAL NOT NULL DEFAULT 0,
                cache_write_cost      REAL NOT NULL DEFAULT 0,
                cache_read_cost       REAL NOT NULL DEFAULT 0,
                total_cost            REAL NOT NULL DEFAULT 0,
                response_ms           INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_logs_tool_ts
                ON token_logs(tool_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_logs_session_ts
                ON token_logs(session_id, timestamp);

            CREATE TABLE IF NOT EXISTS sessions (
                session_id            TEXT PRIMARY KEY,
                display_id            TEXT NOT NULL,
                tool_id               TEXT NOT NULL,
                first_seen_at         INTEGER NOT NULL,
                last_seen_at          INTEGER NOT NULL,
                request_count         INTEGER NOT NULL DEFAULT 0,
                input_tokens          INTEGER NOT NULL DEFAULT 0,
                output_tokens         INTEGER NOT NULL DEFAULT 0,
                cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens     INTEGER NOT NULL DEFAULT 0,
                note                  TEXT,
                config_mode           TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_last_seen
                ON sessions(last_seen_at);

            INSERT OR REPLACE INTO metadata(key, value) VALUES ('schema_version', '1');
            "#,
        )?;
    }

    Ok(())
}

fn flush_batch(conn: &Connection, batch: &mut Vec<TokenLog>, metrics: &StatsWriterMetrics) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len() as u64;
    let mut failed = 0u64;

    if let Err(e) = conn.execute("BEGIN TRANSACTION", []) {
        tracing::error!("stats flush begin failed: {e}");
        metrics.store_failed.fetch_add(count, Ordering::Relaxed);
        batch.clear();
        return;
    }

    for log in batch.drain(..) {
        if let Err(e) = insert_log(conn, &log) {
            failed += 1;
            tracing::warn!(
                "failed to store log (session {}): {e}",
                log.session_id
            );
        }
    }

    if let Err(e) = conn.execute("COMMIT", []) {
        tracing::error!("stats flush commit failed: {e}");
        metrics.store_failed.fetch_add(count, Ordering::Relaxed);
        return;
    }

    metrics
        .logs_stored
        .fetch_add(count - failed, Ordering::Relaxed);
    if failed > 0 {
        metrics.store_failed.fetch_add(failed, Ordering::Relaxed);
    }
    metrics.flush_count.fetch_add(1, Ordering::Relaxed);
}

fn insert_log(conn: &Connection, log: &TokenLog) -> Result<()> {
    conn.execute(
        r#"INSERT INTO token_logs (
            timestamp, tool_id, session_id, message_id, model, config_name,
            client_ip, request_status, error_type, error_detail, response_type,
            input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
            input_cost, output_cost, cache_write_cost, cache_read_cost, total_cost,
            response_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                  ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"#,
        params![
            log.timestamp.timestamp_millis(),
            log.tool_id.as_str(),
            log.session_id,
            log.message_id,
            log.model,
            log.config_name,
            log.client_ip,
            match log.request_status {
                crate::models::RequestStatus::Success => "success",
                crate::models::RequestStatus::Failed => "failed",
            },
            log.error_type,
            log.error_detail,
            log.response_type.as_str(),
            log.counters.input as i64,
            log.counters.output as i64,
            log.counters.cache_creation as i64,
            log.counters.cache_read as i64,
            log.costs.input,
            log.costs.output,
            log.costs.cache_write,
            log.costs.cache_read,
            log.costs.total,
            log.response_ms as i64,
        ],
    )?;
    Ok(())
}

fn upsert_sessions(conn: &Connection, sessions: &[ProxySession]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", [])?;
    for s in sessions {
        let config_mode = serde_json::to_string(&s.config_mode)
            .unwrap_or_else(|_| r#"{"mode":"global"}"#.to_string());
        conn.execute(
            r#"INSERT INTO sessions (
                session_id, display_id, tool_id, first_seen_at, last_seen_at,
                request_count, input_tokens, output_tokens,
                cache_creation_tokens, cache_read_tokens, note, config_mode
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(session_id) DO UPDATE SET
                last_seen_at = excluded.last_seen_at,
                request_count = excluded.request_count,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens,
                cache_creation_tokens = excluded.cache_creation_tokens,
                cache_read_tokens = excluded.cache_read_tokens,
                config_mode = excluded.config_mode"#,
            params![
                s.session_id,
                s.display_id,
                s.tool_id.as_str(),
                s.first_seen_at.timestamp_millis(),
                s.last_seen_at.timestamp_millis(),
                s.request_count as i64,
                s.counters.input as i64,
                s.counters.output as i64,
                s.counters.cache_creation as i64,
                s.counters.cache_read as i64,
                s.note,
                config_mode,
            ],
        )?;
    }
    conn.execute("COMMIT", [])?;
    Ok(())
}

fn run_log_cleanup(conn: &Connection, retention_days: u32, max_rows: u64) -> Result<u64> {
    let mut deleted = 0u64;

    if retention_days > 0 {
        let cutoff = Utc::now().timestamp_millis() - (retention_days as i64) * 86_400_000;
        deleted += conn.execute(
            "DELETE FROM token_logs WHERE timestamp < ?1",
            params![cutoff],
        )? as u64;
    }

    if max_rows > 0 {
        deleted += conn.execute(
            r#"DELETE FROM token_logs WHERE id NOT IN (
                SELECT id FROM token_logs ORDER BY timestamp DESC, id DESC LIMIT ?1
            )"#,
            params![max_rows as i64],
        )? as u64;
    }

    Ok(deleted)
}

fn run_session_cleanup(conn: &Connection) -> Result<u64> {
    let mut deleted = 0u64;
    let cutoff = Utc::now().timestamp_millis() - SESSION_RETENTION_DAYS * 86_400_000;
    deleted += conn.execute(
        "DELETE FROM sessions WHERE last_seen_at < ?1",
        params![cutoff],
    )? as u64;
    deleted += conn.execute(
        r#"DELETE FROM sessions WHERE session_id NOT IN (
            SELECT session_id FROM sessions ORDER BY last_seen_at DESC LIMIT ?1
        )"#,
        params![SESSION_MAX_ROWS as i64],
    )? as u64;
    Ok(deleted)
}
