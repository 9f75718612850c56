//! Persistence surface for audit entries and meter rollups.
//!
//! The pipeline only sees the [`GatewayStore`] trait; the embedded SQLite
//! implementation lives in [`sqlite`] and a networked store can be slotted in
//! without touching the orchestrator.

mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Terminal status of one audited call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// The backend answered and the result was returned.
    Success,
    /// The call failed (unknown tool, timeout, transport, or remote error).
    Error,
    /// Policy refused the call.
    Denied,
    /// Admission control refused the call.
    RateLimited,
}

impl AuditStatus {
    /// Stable label used in persistence and the hash composition.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Denied => "denied",
            Self::RateLimited => "rate_limited",
        }
    }

    /// Parse a persisted label.
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "denied" => Some(Self::Denied),
            "rate_limited" => Some(Self::RateLimited),
            _ => None,
        }
    }
}

/// One persisted audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Opaque unique id.
    pub id: String,
    /// ISO-8601 UTC timestamp.
    pub timestamp: String,
    /// Billing subject.
    pub consumer_id: String,
    /// Credential that authenticated the call.
    pub credential_id: String,
    /// Backend that was (or would have been) called.
    pub server_id: String,
    /// Tool name.
    pub tool: String,
    /// Bounded serialized arguments.
    pub args: String,
    /// Bounded serialized response (truncated at write time).
    pub response: String,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: u64,
    /// Terminal status.
    pub status: AuditStatus,
    /// Error text for non-success entries.
    pub error: Option<String>,
    /// Hash of the previous entry, or `"genesis"`, when chaining is enabled.
    pub prev_hash: Option<String>,
    /// SHA-256 over the canonical field composition.
    pub hash: String,
}

/// Equality and range filters for audit queries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    /// Exact consumer match.
    #[serde(default)]
    pub consumer_id: Option<String>,
    /// Exact server match.
    #[serde(default)]
    pub server_id: Option<String>,
    /// Exact tool match.
    #[serde(default)]
    pub tool: Option<String>,
    /// Exact status match.
    #[serde(default)]
    pub status: Option<AuditStatus>,
    /// Inclusive lower timestamp bound.
    #[serde(default)]
    pub from: Option<String>,
    /// Exclusive upper timestamp bound.
    #[serde(default)]
    pub to: Option<String>,
    /// Page size (default 100).
    #[serde(default)]
    pub limit: Option<u32>,
    /// Page offset.
    #[serde(default)]
    pub offset: Option<u32>,
}

/// Aggregates over the audit table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    /// Total row count.
    pub total: u64,
    /// Row counts per status label.
    pub by_status: HashMap<String, u64>,
    /// Row counts per server id.
    pub by_server: HashMap<String, u64>,
}

/// One meter rollup row, keyed by `(consumer, server, tool, period)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterRow {
    /// Billing subject.
    pub consumer_id: String,
    /// Backend id.
    pub server_id: String,
    /// Tool name.
    pub tool: String,
    /// `YYYY-MM-DDTHH` in UTC.
    pub period_key: String,
    /// Calls in the period.
    pub calls: u64,
    /// Errored calls in the period.
    pub errors: u64,
    /// Summed latency in milliseconds.
    pub total_latency_ms: u64,
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem-level failure.
    #[error("store io error: {0}")]
    Io(String),
    /// Database engine failure.
    #[error("store db error: {0}")]
    Db(String),
    /// A persisted row failed to decode.
    #[error("store invalid data: {0}")]
    Invalid(String),
}

/// Uniform persistence surface over an embedded or networked store.
///
/// Writes are bounded synchronous operations; the pipeline invokes them
/// inline without suspending.
pub trait GatewayStore: Send + Sync {
    /// Append one audit row.
    fn insert_audit(&self, record: &AuditRecord) -> Result<(), StoreError>;

    /// Query audit rows, ordered by timestamp descending.
    fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, StoreError>;

    /// Hash of the most recently inserted row, if any.
    fn last_hash(&self) -> Result<Option<String>, StoreError>;

    /// Visit every row in insertion order without materializing the table.
    fn for_each_ordered(
        &self,
        visit: &mut dyn FnMut(AuditRecord) -> bool,
    ) -> Result<(), StoreError>;

    /// Aggregate counts over the audit table.
    fn audit_stats(&self) -> Result<AuditStats, StoreError>;

    /// Add a rollup row's counters into the meter table.
    fn upsert_meter(&self, row: &MeterRow) -> Result<(), StoreError>;

    /// Read meter rows, optionally restricted to one consumer.
    fn query_meter(&self, consumer_id: Option<&str>) -> Result<Vec<MeterRow>, StoreError>;

    /// Release the underlying handle. Later calls may fail.
    fn close(&self) -> Result<(), StoreError>;
}
