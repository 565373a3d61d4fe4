//! The core programmatic API consumed by the HTTP layer.
//!
//! All operations are parameterized by the acting user; ownership is
//! enforced here, not at the request boundary.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{
    default_expected_status_codes, DbError, HttpMethod, Node, NodeStatus, Sample, Store,
    DEFAULT_FAILURE_THRESHOLD, MAX_CHECK_INTERVAL_MS, MAX_FAILURE_THRESHOLD,
    MIN_CHECK_INTERVAL_MS, MIN_FAILURE_THRESHOLD,
};
use crate::probe::{self, ProbeOutcome, ProbeTarget};
use crate::scheduler::Scheduler;
use crate::telemetry::{DashboardReport, NodeMetrics, NodeSummary, Telemetry};

const MAX_NAME_LEN: usize = 100;
const DETAIL_SAMPLE_LIMIT: i64 = 20;
const DEFAULT_PAGE_LIMIT: i64 = 20;
const MAX_PAGE_LIMIT: i64 = 100;

/// Operation errors, mapped to user-visible status at the request boundary.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The resource does not exist, or belongs to someone else; the two are
    /// indistinguishable so existence is not leaked.
    #[error("not found")]
    NotFound,
    #[error("node is already paused")]
    AlreadyPaused,
    #[error("node is already active")]
    AlreadyActive,
    #[error("{0}")]
    Validation(String),
    #[error("not authorized")]
    Unauthorized,
    #[error("internal error")]
    Internal(#[source] DbError),
}

impl From<DbError> for ServiceError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => ServiceError::NotFound,
            other => ServiceError::Internal(other),
        }
    }
}

/// Creation request for a node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub endpoint_url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    pub check_interval_ms: i64,
    #[serde(default = "default_expected_status_codes")]
    pub expected_status_codes: Vec<u16>,
    #[serde(default = "default_threshold")]
    pub failure_threshold: i64,
}

fn default_threshold() -> i64 {
    DEFAULT_FAILURE_THRESHOLD
}

/// Partial update; absent fields keep their current values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodePatch {
    pub name: Option<String>,
    pub endpoint_url: Option<String>,
    pub method: Option<HttpMethod>,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<String>,
    pub check_interval_ms: Option<i64>,
    pub expected_status_codes: Option<Vec<u16>>,
    pub failure_threshold: Option<i64>,
}

/// Ad-hoc configuration for `test_connection`; no node involved.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSpec {
    pub endpoint_url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_expected_status_codes")]
    pub expected_status_codes: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    Name,
    Uptime,
    LastCheck,
    CreatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// List query: pagination, name search, status filter, sorting.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub search: Option<String>,
    pub status: Option<NodeStatus>,
    pub sort_by: Option<SortBy>,
    pub sort_order: Option<SortOrder>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaginatedList {
    pub data: Vec<NodeSummary>,
    pub total_count: i64,
    pub page: i64,
    pub limit: i64,
}

/// Node core fields joined with its 24-hour metrics and recent samples.
#[derive(Debug, Clone, Serialize)]
pub struct NodeDetail {
    #[serde(flatten)]
    pub node: Node,
    pub metrics: NodeMetrics,
    pub recent_samples: Vec<Sample>,
    pub recent_errors: Vec<Sample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatusReport {
    pub system_status: String,
    pub total_nodes: i64,
    pub active_scheduled_count: usize,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Long-lived service handle; constructed once at process init and shared.
pub struct Service {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    telemetry: Arc<Telemetry>,
}

impl Service {
    pub fn new(store: Arc<Store>, scheduler: Arc<Scheduler>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            store,
            scheduler,
            telemetry,
        }
    }

    pub async fn create_node(&self, user_id: &str, spec: NodeSpec) -> Result<Node, ServiceError> {
        validate_name(&spec.name)?;
        validate_url(&spec.endpoint_url)?;
        validate_interval(spec.check_interval_ms)?;
        validate_threshold(spec.failure_threshold)?;
        validate_status_codes(&spec.expected_status_codes)?;

        let now = Utc::now();
        let node = Node {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: spec.name,
            endpoint_url: spec.endpoint_url,
            method: spec.method,
            headers: spec.headers,
            body: spec.body,
            check_interval_ms: spec.check_interval_ms,
            expected_status_codes: spec.expected_status_codes,
            failure_threshold: spec.failure_threshold,
            status: NodeStatus::Active,
            consecutive_failures: 0,
            last_check_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_node(&node)?;
        self.scheduler.start_node(&node).await;
        Ok(node)
    }

    pub async fn update_node(
        &self,
        user_id: &str,
        node_id: &str,
        patch: NodePatch,
    ) -> Result<Node, ServiceError> {
        let mut node = self.store.get_node_for_user(user_id, node_id)?;
        let old_interval = node.check_interval_ms;

        if let Some(name) = patch.name {
            node.name = name;
        }
        if let Some(url) = patch.endpoint_url {
            node.endpoint_url = url;
        }
        if let Some(method) = patch.method {
            node.method = method;
        }
        if let Some(headers) = patch.headers {
            node.headers = headers;
        }
        if let Some(body) = patch.body {
            node.body = body;
        }
        if let Some(interval) = patch.check_interval_ms {
            node.check_interval_ms = interval;
        }
        if let Some(codes) = patch.expected_status_codes {
            node.expected_status_codes = codes;
        }
        if let Some(threshold) = patch.failure_threshold {
            node.failure_threshold = threshold;
        }

        validate_name(&node.name)?;
        validate_url(&node.endpoint_url)?;
        validate_interval(node.check_interval_ms)?;
        validate_threshold(node.failure_threshold)?;
        validate_status_codes(&node.expected_status_codes)?;

        self.store.update_node(&node)?;

        // Config-only changes apply on the next tick via the fresh read; a
        // new cadence needs the timer reinstalled.
        if node.check_interval_ms != old_interval && node.status != NodeStatus::Paused {
            self.scheduler.start_node(&node).await;
        }

        Ok(self.store.get_node_for_user(user_id, node_id)?)
    }

    pub async fn pause_node(&self, user_id: &str, node_id: &str) -> Result<Node, ServiceError> {
        let node = self.store.get_node_for_user(user_id, node_id)?;
        if node.status == NodeStatus::Paused {
            return Err(ServiceError::AlreadyPaused);
        }
        self.scheduler.stop_node(node_id).await;
        self.store.update_status(node_id, NodeStatus::Paused)?;
        Ok(self.store.get_node_for_user(user_id, node_id)?)
    }

    pub async fn resume_node(&self, user_id: &str, node_id: &str) -> Result<Node, ServiceError> {
        let node = self.store.get_node_for_user(user_id, node_id)?;
        if node.status == NodeStatus::Active {
            return Err(ServiceError::AlreadyActive);
        }
        self.store.update_status(node_id, NodeStatus::Active)?;
        self.store.reset_failures(node_id, None)?;
        let node = self.store.get_node_for_user(user_id, node_id)?;
        self.scheduler.start_node(&node).await;
        Ok(node)
    }

    pub async fn delete_node(&self, user_id: &str, node_id: &str) -> Result<(), ServiceError> {
        self.store.get_node_for_user(user_id, node_id)?;
        self.scheduler.stop_node(node_id).await;
        self.store.delete_samples_by_node(node_id)?;
        self.store.delete_node(node_id)?;
        Ok(())
    }

    /// Run one probe with the node's configuration. Nothing is persisted
    /// and node state is untouched.
    pub async fn test_probe(
        &self,
        user_id: &str,
        node_id: &str,
    ) -> Result<ProbeOutcome, ServiceError> {
        let node = self.store.get_node(node_id)?;
        if node.user_id != user_id {
            return Err(ServiceError::Unauthorized);
        }
        Ok(probe::execute(&ProbeTarget::from_node(&node)).await)
    }

    /// Probe an arbitrary configuration; used for pre-create validation.
    pub async fn test_connection(
        &self,
        spec: ConnectionSpec,
    ) -> Result<ProbeOutcome, ServiceError> {
        validate_url(&spec.endpoint_url)?;
        validate_status_codes(&spec.expected_status_codes)?;
        let target = ProbeTarget {
            endpoint_url: spec.endpoint_url,
            method: spec.method,
            headers: spec.headers,
            body: spec.body,
            expected_status_codes: spec.expected_status_codes,
        };
        Ok(probe::execute(&target).await)
    }

    pub fn get_node(&self, user_id: &str, node_id: &str) -> Result<NodeDetail, ServiceError> {
        let node = self.store.get_node_for_user(user_id, node_id)?;
        let since = Utc::now() - chrono::Duration::hours(24);
        let metrics = self.telemetry.metrics(node_id, since)?;
        let recent_samples = self.telemetry.recent_samples(node_id, DETAIL_SAMPLE_LIMIT)?;
        let recent_errors = self.telemetry.recent_errors(node_id, DETAIL_SAMPLE_LIMIT)?;
        Ok(NodeDetail {
            node,
            metrics,
            recent_samples,
            recent_errors,
        })
    }

    pub fn list_nodes(&self, user_id: &str, query: ListQuery) -> Result<PaginatedList, ServiceError> {
        let mut summaries =
            self.telemetry
                .enriched_nodes(user_id, query.search.as_deref(), query.status)?;

        let sort_by = query.sort_by.unwrap_or(SortBy::CreatedAt);
        let sort_order = query.sort_order.unwrap_or(match sort_by {
            SortBy::Name => SortOrder::Asc,
            _ => SortOrder::Desc,
        });
        summaries.sort_by(|a, b| {
            let ordering = match sort_by {
                SortBy::Name => a.node.name.to_lowercase().cmp(&b.node.name.to_lowercase()),
                SortBy::Uptime => a
                    .uptime_percent
                    .partial_cmp(&b.uptime_percent)
                    .unwrap_or(std::cmp::Ordering::Equal),
                SortBy::LastCheck => a.node.last_check_at.cmp(&b.node.last_check_at),
                SortBy::CreatedAt => a.node.created_at.cmp(&b.node.created_at),
            };
            match sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total_count = summaries.len() as i64;
        let page = query.page.unwrap_or(1).max(1);
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let data = summaries
            .into_iter()
            .skip(((page - 1) * limit) as usize)
            .take(limit as usize)
            .collect();

        Ok(PaginatedList {
            data,
            total_count,
            page,
            limit,
        })
    }

    pub fn dashboard_overview(&self, user_id: &str) -> Result<DashboardReport, ServiceError> {
        Ok(self.telemetry.dashboard_overview(user_id)?)
    }

    /// Unauthenticated system health summary.
    pub async fn system_status(&self) -> Result<SystemStatusReport, ServiceError> {
        let degraded = self.store.any_down()?;
        Ok(SystemStatusReport {
            system_status: if degraded { "degraded" } else { "operational" }.to_string(),
            total_nodes: self.store.count_nodes()?,
            active_scheduled_count: self.scheduler.active_count().await,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        })
    }
}

fn validate_name(name: &str) -> Result<(), ServiceError> {
    if name.trim().is_empty() {
        return Err(ServiceError::Validation("name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ServiceError::Validation(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<(), ServiceError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|_| ServiceError::Validation(format!("invalid endpoint URL: {}", url)))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ServiceError::Validation(
            "endpoint URL must use http or https".into(),
        ));
    }
    Ok(())
}

fn validate_interval(interval_ms: i64) -> Result<(), ServiceError> {
    if !(MIN_CHECK_INTERVAL_MS..=MAX_CHECK_INTERVAL_MS).contains(&interval_ms) {
        return Err(ServiceError::Validation(format!(
            "check_interval_ms must be between {} and {}",
            MIN_CHECK_INTERVAL_MS, MAX_CHECK_INTERVAL_MS
        )));
    }
    Ok(())
}

fn validate_threshold(threshold: i64) -> Result<(), ServiceError> {
    if !(MIN_FAILURE_THRESHOLD..=MAX_FAILURE_THRESHOLD).contains(&threshold) {
        return Err(ServiceError::Validation(format!(
            "failure_threshold must be between {} and {}",
            MIN_FAILURE_THRESHOLD, MAX_FAILURE_THRESHOLD
        )));
    }
    Ok(())
}

fn validate_status_codes(codes: &[u16]) -> Result<(), ServiceError> {
    if codes.is_empty() {
        return Err(ServiceError::Validation(
            "expected_status_codes must not be empty".into(),
        ));
    }
    if let Some(code) = codes.iter().find(|c| !(100..=599).contains(*c)) {
        return Err(ServiceError::Validation(format!(
            "status code {} is outside 100..=599",
            code
        )));
    }
    Ok(())
}
