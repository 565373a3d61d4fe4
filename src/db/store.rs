//! SQLite store for nodes and samples.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// All samples of one telemetry bucket, grouped by the store.
#[derive(Debug, Clone)]
pub struct BucketSamples {
    /// Bucket start, Unix milliseconds, aligned to the bucket width.
    pub bucket_start_ms: i64,
    pub response_times_ms: Vec<f64>,
    pub failed: i64,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Nodes ---

    pub fn create_node(&self, node: &Node) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO nodes (id, user_id, name, endpoint_url, method, headers, body,
                                check_interval_ms, expected_status_codes, failure_threshold,
                                status, consecutive_failures, last_check_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                node.id,
                node.user_id,
                node.name,
                node.endpoint_url,
                node.method,
                serde_json::to_string(&node.headers)?,
                node.body,
                node.check_interval_ms,
                serde_json::to_string(&node.expected_status_codes)?,
                node.failure_threshold,
                node.status,
                node.consecutive_failures,
                node.last_check_at.map(|t| t.timestamp_millis()),
                node.created_at.timestamp_millis(),
                node.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Result<Node, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_NODE),
            params![id],
            node_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Fetch a node only if it belongs to the given user.
    ///
    /// A foreign node and a missing node are indistinguishable to the caller.
    pub fn get_node_for_user(&self, user_id: &str, id: &str) -> Result<Node, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1 AND user_id = ?2", SELECT_NODE),
            params![id, user_id],
            node_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Persist the configuration fields of a node. Status and failure
    /// counters are mutated only through the dedicated operations below.
    pub fn update_node(&self, node: &Node) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE nodes SET name = ?1, endpoint_url = ?2, method = ?3, headers = ?4,
                              body = ?5, check_interval_ms = ?6, expected_status_codes = ?7,
                              failure_threshold = ?8, updated_at = ?9
             WHERE id = ?10",
            params![
                node.name,
                node.endpoint_url,
                node.method,
                serde_json::to_string(&node.headers)?,
                node.body,
                node.check_interval_ms,
                serde_json::to_string(&node.expected_status_codes)?,
                node.failure_threshold,
                Utc::now().timestamp_millis(),
                node.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn delete_node(&self, id: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Nodes of one user, optionally filtered by name substring and status.
    /// Newest first; sorting beyond that is the aggregator's concern.
    pub fn list_by_user(
        &self,
        user_id: &str,
        search: Option<&str>,
        status: Option<NodeStatus>,
    ) -> Result<Vec<Node>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!("{} WHERE user_id = ?1", SELECT_NODE);
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];

        if let Some(search) = search {
            args.push(Box::new(format!("%{}%", search)));
            sql.push_str(&format!(" AND name LIKE ?{}", args.len()));
        }
        if let Some(status) = status {
            args.push(Box::new(status));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let nodes = stmt
            .query_map(params_from_iter(args.iter().map(|a| a.as_ref())), node_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(nodes)
    }

    /// Every node that should hold a scheduler timer: anything not paused.
    pub fn list_active(&self) -> Result<Vec<Node>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status != 'paused' ORDER BY created_at ASC",
            SELECT_NODE
        ))?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(nodes)
    }

    pub fn count_by_user(&self, user_id: &str) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )?)
    }

    pub fn count_nodes(&self) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?)
    }

    /// Whether any node in the system is currently down.
    pub fn any_down(&self) -> Result<bool, DbError> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM nodes WHERE status = 'down')",
            [],
            |r| r.get(0),
        )?;
        Ok(n != 0)
    }

    /// Record one more consecutive failure; `last_check_at` moves on every
    /// tick regardless of outcome.
    pub fn increment_failures(&self, id: &str, checked_at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE nodes SET consecutive_failures = consecutive_failures + 1,
                              last_check_at = ?1, updated_at = ?2
             WHERE id = ?3",
            params![
                checked_at.timestamp_millis(),
                Utc::now().timestamp_millis(),
                id
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Clear the failure counter. `checked_at` is set when the reset comes
    /// from a successful probe; `None` (resume) leaves `last_check_at` alone.
    pub fn reset_failures(
        &self,
        id: &str,
        checked_at: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE nodes SET consecutive_failures = 0,
                              last_check_at = COALESCE(?1, last_check_at),
                              updated_at = ?2
             WHERE id = ?3",
            params![
                checked_at.map(|t| t.timestamp_millis()),
                Utc::now().timestamp_millis(),
                id
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn update_status(&self, id: &str, status: NodeStatus) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE nodes SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, Utc::now().timestamp_millis(), id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Samples ---

    pub fn append_sample(&self, sample: &Sample) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO samples (id, node_id, status_code, status_text, response_time_ms,
                                  success, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                sample.id,
                sample.node_id,
                sample.status_code,
                sample.status_text,
                sample.response_time_ms,
                sample.success,
                sample.error_message,
                sample.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Newest-first samples for one node.
    pub fn list_by_node(&self, node_id: &str, limit: i64) -> Result<Vec<Sample>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE node_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            SELECT_SAMPLE
        ))?;
        let samples = stmt
            .query_map(params![node_id, limit], sample_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// Newest-first failed samples for one node.
    pub fn list_errors_by_node(&self, node_id: &str, limit: i64) -> Result<Vec<Sample>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE node_id = ?1 AND success = 0 ORDER BY created_at DESC LIMIT ?2",
            SELECT_SAMPLE
        ))?;
        let samples = stmt
            .query_map(params![node_id, limit], sample_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// Newest-first samples across a set of nodes.
    pub fn list_by_nodes(&self, node_ids: &[String], limit: i64) -> Result<Vec<Sample>, DbError> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = placeholders(node_ids.len());
        let mut stmt = conn.prepare(&format!(
            "{} WHERE node_id IN ({}) ORDER BY created_at DESC LIMIT ?{}",
            SELECT_SAMPLE,
            placeholders,
            node_ids.len() + 1
        ))?;

        let mut args: Vec<&dyn rusqlite::ToSql> =
            node_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        args.push(&limit);

        let samples = stmt
            .query_map(params_from_iter(args), sample_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    pub fn delete_samples_by_node(&self, node_id: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM samples WHERE node_id = ?1", params![node_id])?;
        Ok(())
    }

    pub fn sample_count(&self, node_id: &str) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM samples WHERE node_id = ?1",
            params![node_id],
            |r| r.get(0),
        )?)
    }

    /// Success and failure counts over the full history of one node.
    pub fn aggregate_counts(&self, node_id: &str) -> Result<(i64, i64), DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COALESCE(SUM(success), 0), COALESCE(SUM(1 - success), 0)
             FROM samples WHERE node_id = ?1",
            params![node_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?)
    }

    /// `(total, successes)` over the window starting at `since`.
    pub fn aggregate_uptime(
        &self,
        node_id: &str,
        since: DateTime<Utc>,
    ) -> Result<(i64, i64), DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0)
             FROM samples WHERE node_id = ?1 AND created_at >= ?2",
            params![node_id, since.timestamp_millis()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?)
    }

    /// Mean response time over successful samples in the window; 0 if none.
    pub fn aggregate_average(
        &self,
        node_id: &str,
        since: DateTime<Utc>,
    ) -> Result<f64, DbError> {
        let conn = self.conn.lock().unwrap();
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(response_time_ms) FROM samples
             WHERE node_id = ?1 AND success = 1 AND created_at >= ?2",
            params![node_id, since.timestamp_millis()],
            |r| r.get(0),
        )?;
        Ok(avg.unwrap_or(0.0))
    }

    /// `(created_at, response_time_ms)` of successful samples in the window,
    /// oldest first.
    pub fn success_history(
        &self,
        node_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, i64)>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT created_at, response_time_ms FROM samples
             WHERE node_id = ?1 AND success = 1 AND created_at >= ?2
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![node_id, since.timestamp_millis()], |row| {
                let ms: i64 = row.get(0)?;
                Ok((from_millis(ms), row.get::<_, i64>(1)?))
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// `(total, successes)` per node over the window, in one grouped query
    /// so list views do not fan out per row.
    pub fn aggregate_uptime_by_node(
        &self,
        node_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, i64, i64)>, DbError> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = placeholders(node_ids.len());
        let mut stmt = conn.prepare(&format!(
            "SELECT node_id, COUNT(*), COALESCE(SUM(success), 0)
             FROM samples
             WHERE node_id IN ({}) AND created_at >= ?{}
             GROUP BY node_id",
            placeholders,
            node_ids.len() + 1
        ))?;

        let since_ms = since.timestamp_millis();
        let mut args: Vec<&dyn rusqlite::ToSql> =
            node_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        args.push(&since_ms);

        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Samples of a node set in `[since, until]`, grouped into half-open
    /// buckets of `bucket_width_ms` aligned to the Unix epoch. Buckets with
    /// no samples do not appear; results are ordered by bucket start.
    pub fn aggregate_buckets(
        &self,
        node_ids: &[String],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        bucket_width_ms: i64,
    ) -> Result<Vec<BucketSamples>, DbError> {
        if node_ids.is_empty() || bucket_width_ms <= 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = placeholders(node_ids.len());
        let n = node_ids.len();
        let mut stmt = conn.prepare(&format!(
            "SELECT (created_at / ?{w}) * ?{w} AS bucket, response_time_ms, success
             FROM samples
             WHERE node_id IN ({ids}) AND created_at >= ?{since} AND created_at <= ?{until}
             ORDER BY bucket ASC, created_at ASC",
            w = n + 1,
            ids = placeholders,
            since = n + 2,
            until = n + 3,
        ))?;

        let since_ms = since.timestamp_millis();
        let until_ms = until.timestamp_millis();
        let mut args: Vec<&dyn rusqlite::ToSql> =
            node_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        args.push(&bucket_width_ms);
        args.push(&since_ms);
        args.push(&until_ms);

        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut buckets: Vec<BucketSamples> = Vec::new();
        for (bucket_start_ms, response_time_ms, success) in rows {
            if buckets.last().map(|b| b.bucket_start_ms) != Some(bucket_start_ms) {
                buckets.push(BucketSamples {
                    bucket_start_ms,
                    response_times_ms: Vec::new(),
                    failed: 0,
                });
            }
            let bucket = buckets.last_mut().unwrap();
            bucket.response_times_ms.push(response_time_ms as f64);
            if !success {
                bucket.failed += 1;
            }
        }
        Ok(buckets)
    }
}

const SELECT_NODE: &str = "SELECT id, user_id, name, endpoint_url, method, headers, body,
            check_interval_ms, expected_status_codes, failure_threshold, status,
            consecutive_failures, last_check_at, created_at, updated_at FROM nodes";

const SELECT_SAMPLE: &str = "SELECT id, node_id, status_code, status_text, response_time_ms,
            success, error_message, created_at FROM samples";

fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let headers: String = row.get(5)?;
    let codes: String = row.get(8)?;
    Ok(Node {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        endpoint_url: row.get(3)?,
        method: row.get(4)?,
        headers: serde_json::from_str(&headers).unwrap_or_default(),
        body: row.get(6)?,
        check_interval_ms: row.get(7)?,
        expected_status_codes: serde_json::from_str(&codes).unwrap_or_default(),
        failure_threshold: row.get(9)?,
        status: row.get(10)?,
        consecutive_failures: row.get(11)?,
        last_check_at: row.get::<_, Option<i64>>(12)?.map(from_millis),
        created_at: from_millis(row.get(13)?),
        updated_at: from_millis(row.get(14)?),
    })
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<Sample> {
    Ok(Sample {
        id: row.get(0)?,
        node_id: row.get(1)?,
        status_code: row.get(2)?,
        status_text: row.get(3)?,
        response_time_ms: row.get(4)?,
        success: row.get(5)?,
        error_message: row.get(6)?,
        created_at: from_millis(row.get(7)?),
    })
}
