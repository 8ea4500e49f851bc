// Read-side query interface for the stats database
//
// A small r2d2 pool of connections serves concurrent queries while the
// writer thread holds the sole write connection (WAL mode). Every query
// here is filter-driven and index-backed; pagination is LIMIT/OFFSET
// with a separate COUNT for totals.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value as SqlValue;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::models::{
    ConfigMode, ProxySession, RequestStatus, ResponseType, TokenCosts, TokenCounters, TokenLog,
};
use crate::tools::ToolId;

const POOL_SIZE: u32 = 4;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilters {
    pub tool: Option<ToolId>,
    pub session: Option<String>,
    pub config_name: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub status: Option<RequestStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub logs: Vec<TokenLog>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "12h")]
    Hour12,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "1w")]
    Week1,
    #[serde(rename = "1mo")]
    Month1,
}

impl Granularity {
    /// Bucket width in milliseconds. Months are calendar-aligned in SQL,
    /// not fixed-width; this value is unused for Month1.
    fn bucket_ms(&self) -> i64 {
        match self {
            Self::Min15 => 15 * 60_000,
            Self::Min30 => 30 * 60_000,
            Self::Hour1 => 3_600_000,
            Self::Hour12 => 12 * 3_600_000,
            Self::Day1 => 86_400_000,
            Self::Week1 => 7 * 86_400_000,
            Self::Month1 => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateBucket {
    pub bucket_start: DateTime<Utc>,
    pub counters: TokenCounters,
    pub avg_response_ms: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub input_price: f64,
    pub output_price: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
    pub counters: TokenCounters,
    pub total_cost: f64,
    pub by_model: HashMap<String, ModelSummary>,
    pub writer: super::WriterMetricsSnapshot,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelSummary {
    pub requests: u64,
    pub counters: TokenCounters,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostSummaryRow {
    pub config_name: String,
    pub requests: u64,
    pub total_cost: f64,
}

/// Pooled read-only interface. Clones share the pool.
#[derive(Clone)]
pub struct StatsQuery {
    pool: Pool<SqliteConnectionManager>,
}

impl StatsQuery {
    pub fn open(db_path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
        });
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .build(manager)
            .context("build stats read pool")?;
        Ok(Self { pool })
    }

    pub fn query_logs(&self, filters: &LogFilters, page: u64, page_size: u64) -> Result<LogPage> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 500);
        let (where_sql, params) = build_where(filters);

        let conn = self.pool.get().context("stats pool exhausted")?;

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM token_logs {where_sql}"),
            rusqlite::params_from_iter(params.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT * FROM token_logs {where_sql} \
             ORDER BY timestamp DESC, id DESC LIMIT {page_size} OFFSET {}",
            (page - 1) * page_size
        );
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), row_to_log)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(LogPage {
            logs,
            total: total as u64,
            page,
            page_size,
        })
    }

    pub fn aggregate(
        &self,
        filters: &LogFilters,
        granularity: Granularity,
    ) -> Result<Vec<AggregateBucket>> {
        let (where_sql, params) = build_where(filters);
        let bucket_expr = match granularity {
            Granularity::Month1 => {
                // Calendar month start, back to unix ms
                "CAST(strftime('%s', date(timestamp / 1000, 'unixepoch', 'start of month')) AS INTEGER) * 1000"
                    .to_string()
            }
            g => format!("(timestamp / {0}) * {0}", g.bucket_ms()),
        };

        let sql = format!(
            r#"SELECT {bucket_expr} AS bucket,
                   SUM(input_tokens), SUM(output_tokens),
                   SUM(cache_creation_tokens), SUM(cache_read_tokens),
                   CAST(AVG(response_ms) AS INTEGER),
                   SUM(CASE WHEN request_status = 'success' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN request_status = 'failed' THEN 1 ELSE 0 END),
                   SUM(input_cost), SUM(output_cost), SUM(total_cost)
            FROM token_logs {where_sql}
            GROUP BY bucket ORDER BY bucket ASC"#
        );

        let conn = self.pool.get().context("stats pool exhausted")?;
        let mut stmt = conn.prepare(&sql)?;
        let buckets = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                Ok(AggregateBucket {
                    bucket_start: ms_to_utc(row.get::<_, i64>(0)?),
                    counters: TokenCounters {
                        input: row.get::<_, i64>(1)? as u64,
                        output: row.get::<_, i64>(2)? as u64,
                        cache_creation: row.get::<_, i64>(3)? as u64,
                        cache_read: row.get::<_, i64>(4)? as u64,
                    },
                    avg_response_ms: row.get::<_, i64>(5)? as u64,
                    success_count: row.get::<_, i64>(6)? as u64,
                    fail_count: row.get::<_, i64>(7)? as u64,
                    input_price: row.get(8)?,
                    output_price: row.get(9)?,
                    total_cost: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(buckets)
    }

    pub fn summary(
        &self,
        filters: &LogFilters,
        writer: super::WriterMetricsSnapshot,
    ) -> Result<StatsSummary> {
        let (where_sql, params) = build_where(filters);
        let conn = self.pool.get().context("stats pool exhausted")?;

        let (total, success, failed, counters, total_cost) = conn.query_row(
            &format!(
                r#"SELECT COUNT(*),
                       SUM(CASE WHEN request_status = 'success' THEN 1 ELSE 0 END),
                       SUM(CASE WHEN request_status = 'failed' THEN 1 ELSE 0 END),
                       COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                       COALESCE(SUM(cache_creation_tokens), 0), COALESCE(SUM(cache_read_tokens), 0),
                       COALESCE(SUM(total_cost), 0)
                FROM token_logs {where_sql}"#
            ),
            rusqlite::params_from_iter(params.iter()),
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                    row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                    TokenCounters {
                        input: row.get::<_, i64>(3)? as u64,
                        output: row.get::<_, i64>(4)? as u64,
                        cache_creation: row.get::<_, i64>(5)? as u64,
                        cache_read: row.get::<_, i64>(6)? as u64,
                    },
                    row.get::<_, f64>(7)?,
                ))
            },
        )?;

        let mut by_model = HashMap::new();
        let mut stmt = conn.prepare(&format!(
            r#"SELECT model, COUNT(*),
                   SUM(input_tokens), SUM(output_tokens),
                   SUM(cache_creation_tokens), SUM(cache_read_tokens),
                   SUM(total_cost)
            FROM token_logs {where_sql} GROUP BY model"#
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                ModelSummary {
                    requests: row.get::<_, i64>(1)? as u64,
                    counters: TokenCounters {
                        input: row.get::<_, i64>(2)? as u64,
                        output: row.get::<_, i64>(3)? as u64,
                        cache_creation: row.get::<_, i64>(4)? as u64,
                        cache_read: row.get::<_, i64>(5)? as u64,
                    },
                    total_cost: row.get(6)?,
                },
            ))
        })?;
        for row in rows {
            let (model, summary) = row?;
            by_model.insert(model, summary);
        }

        Ok(StatsSummary {
            total_requests: total,
            success_requests: success,
            failed_requests: failed,
            counters,
            total_cost,
            by_model,
            writer,
        })
    }

    pub fn cost_summary(&self, filters: &LogFilters) -> Result<Vec<CostSummaryRow>> {
        let (where_sql, params) = build_where(filters);
        let conn = self.pool.get().context("stats pool exhausted")?;
        let mut stmt = conn.prepare(&format!(
            r#"SELECT config_name, COUNT(*), SUM(total_cost)
            FROM token_logs {where_sql}
            GROUP BY config_name ORDER BY SUM(total_cost) DESC"#
        ))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                Ok(CostSummaryRow {
                    config_name: row.get(0)?,
                    requests: row.get::<_, i64>(1)? as u64,
                    total_cost: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_sessions(&self, tool: Option<ToolId>) -> Result<Vec<ProxySession>> {
        let conn = self.pool.get().context("stats pool exhausted")?;
        let (sql, params): (String, Vec<SqlValue>) = match tool {
            Some(t) => (
                "SELECT * FROM sessions WHERE tool_id = ?1 ORDER BY last_seen_at DESC".into(),
                vec![SqlValue::Text(t.as_str().to_string())],
            ),
            None => (
                "SELECT * FROM sessions ORDER BY last_seen_at DESC".into(),
                vec![],
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<ProxySession>> {
        let conn = self.pool.get().context("stats pool exhausted")?;
        let mut stmt = conn.prepare("SELECT * FROM sessions WHERE session_id = ?1")?;
        let mut rows = stmt.query_map([session_id], row_to_session)?;
        Ok(rows.next().transpose()?)
    }
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn build_where(filters: &LogFilters) -> (String, Vec<SqlValue>) {
    let mut clauses = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    if let Some(tool) = filters.tool {
        params.push(SqlValue::Text(tool.as_str().to_string()));
        clauses.push(format!("tool_id = ?{}", params.len()));
    }
    if let Some(session) = &filters.session {
        params.push(SqlValue::Text(session.clone()));
        clauses.push(format!("session_id = ?{}", params.len()));
    }
    if let Some(config) = &filters.config_name {
        params.push(SqlValue::Text(config.clone()));
        clauses.push(format!("config_name = ?{}", params.len()));
    }
    if let Some(start) = filters.start {
        params.push(SqlValue::Integer(start.timestamp_millis()));
        clauses.push(format!("timestamp >= ?{}", params.len()));
    }
    if let Some(end) = filters.end {
        params.push(SqlValue::Integer(end.timestamp_millis()));
        clauses.push(format!("timestamp <= ?{}", params.len()));
    }
    if let Some(status) = filters.status {
        params.push(SqlValue::Text(
            match status {
                RequestStatus::Success => "success",
                RequestStatus::Failed => "failed",
            }
            .to_string(),
        ));
        clauses.push(format!("request_status = ?{}", params.len()));
    }

    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), params)
    }
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<TokenLog> {
    let status: String = row.get("request_status")?;
    let response_type: String = row.get("response_type")?;
    let tool: String = row.get("tool_id")?;
    Ok(TokenLog {
        id: row.get("id")?,
        timestamp: ms_to_utc(row.get("timestamp")?),
        tool_id: ToolId::parse(&tool).unwrap_or(ToolId::ClaudeCode),
        session_id: row.get("session_id")?,
        message_id: row.get("message_id")?,
        model: row.get("model")?,
        config_name: row.get("config_name")?,
        client_ip: row.get("client_ip")?,
        request_status: if status == "success" {
            RequestStatus::Success
        } else {
            RequestStatus::Failed
        },
        error_type: row.get("error_type")?,
        error_detail: row.get("error_detail")?,
        response_type: match response_type.as_str() {
            "sse" => ResponseType::Sse,
            "json" => ResponseType::Json,
            _ => ResponseType::Unknown,
        },
        counters: TokenCounters {
            input: row.get::<_, i64>("input_tokens")? as u64,
            output: row.get::<_, i64>("output_tokens")? as u64,
            cache_creation: row.get::<_, i64>("cache_creation_tokens")? as u64,
            cache_read: row.get::<_, i64>("cache_read_tokens")? as u64,
        },
        costs: TokenCosts {
            input: row.get("input_cost")?,
            output: row.get("output_cost")?,
            cache_write: row.get("cache_write_cost")?,
            cache_read: row.get("cache_read_cost")?,
            total: row.get("total_cost")?,
        },
        response_ms: row.get::<_, i64>("response_ms")? as u64,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<ProxySession> {
    let tool: String = row.get("tool_id")?;
    let config_mode: String = row.get("config_mode")?;
    Ok(ProxySession {
        session_id: row.get("session_id")?,
        display_id: row.get("display_id")?,
        tool_id: ToolId::parse(&tool).unwrap_or(ToolId::ClaudeCode),
        first_seen_at: ms_to_utc(row.get("first_seen_at")?),
        last_seen_at: ms_to_utc(row.get("last_seen_at")?),
        request_count: row.get::<_, i64>("request_count")? as u64,
        counters: TokenCounters {
            input: row.get::<_, i64>("input_tokens")? as u64,
            output: row.get::<_, i64>("output_tokens")? as u64,
            cache_creation: row.get::<_, i64>("cache_creation_tokens")? as u64,
            cache_read: row.get::<_, i64>("cache_read_tokens")? as u64,
        },
        note: row.get("note")?,
        config_mode: serde_json::from_str(&config_mode).unwrap_or(ConfigMode::Global),
    })
}
