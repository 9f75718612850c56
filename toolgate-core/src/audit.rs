//! Tamper-evident audit logging.
//!
//! Every terminal call outcome appends exactly one row. With chaining
//! enabled each row carries the previous row's hash (the first carries the
//! literal `"genesis"`), and the row hash covers the canonical field
//! composition `id|timestamp|consumer|server|tool|status|prev_hash`, so a
//! rewritten row breaks verification exactly where it was rewritten. The
//! running hash and the insert are guarded by one lock, giving the chain a
//! total order even under concurrent callers.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::sha256_hex;
use crate::config::AuditConfig;
use crate::storage::{
    AuditFilter, AuditRecord, AuditStats, AuditStatus, GatewayStore, StoreError,
};

/// Hash value preceding the first chained entry.
pub const GENESIS: &str = "genesis";

/// Serialized args and responses are stored at most this long.
pub const MAX_FIELD_BYTES: usize = 10_000;

/// Fields the orchestrator supplies for one entry; the log assigns identity,
/// time, and chain linkage.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    /// Billing subject.
    pub consumer_id: String,
    /// Credential that authenticated the call.
    pub credential_id: String,
    /// Backend addressed (or `"unknown"`).
    pub server_id: String,
    /// Tool name.
    pub tool: String,
    /// Serialized arguments.
    pub args: String,
    /// Serialized response, empty for non-success entries.
    pub response: String,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: u64,
    /// Terminal status.
    pub status: AuditStatus,
    /// Error text for non-success entries.
    pub error: Option<String>,
}

/// Result of a chain verification walk.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VerifyResult {
    /// Whether every row linked and recomputed cleanly.
    pub valid: bool,
    /// Id of the first failing row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<String>,
}

/// Durable, hash-chained, append-only audit log.
pub struct AuditLog {
    store: Arc<dyn GatewayStore>,
    chain_enabled: bool,
    webhook_url: Option<String>,
    // Serializes writers: prev_hash → hash must be totally ordered.
    last_hash: Mutex<String>,
    http: reqwest::Client,
}

impl AuditLog {
    /// Open the log over a store, resuming the chain from the last persisted
    /// row (or `"genesis"` on an empty store).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the last hash cannot be read.
    pub fn open(store: Arc<dyn GatewayStore>, config: &AuditConfig) -> Result<Self, StoreError> {
        let last_hash = store.last_hash()?.unwrap_or_else(|| GENESIS.to_string());
        Ok(Self {
            store,
            chain_enabled: config.chain,
            webhook_url: config.webhook_url.clone(),
            last_hash: Mutex::new(last_hash),
            http: reqwest::Client::new(),
        })
    }

    /// Append one entry and return the persisted row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when persistence fails; the running hash is
    /// left untouched so the chain stays consistent with what is on disk.
    pub fn append(&self, draft: AuditDraft) -> Result<AuditRecord, StoreError> {
        let id = Uuid::new_v4().to_string();
        let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        let mut guard = self
            .last_hash
            .lock()
            .map_err(|_| StoreError::Db("audit chain mutex poisoned".to_string()))?;
        let prev_hash = self.chain_enabled.then(|| guard.clone());
        let hash = compose_hash(
            &id,
            &timestamp,
            &draft.consumer_id,
            &draft.server_id,
            &draft.tool,
            draft.status,
            prev_hash.as_deref(),
        );

        let record = AuditRecord {
            id,
            timestamp,
            consumer_id: draft.consumer_id,
            credential_id: draft.credential_id,
            server_id: draft.server_id,
            tool: draft.tool,
            args: truncate_utf8(draft.args, MAX_FIELD_BYTES),
            response: truncate_utf8(draft.response, MAX_FIELD_BYTES),
            latency_ms: draft.latency_ms,
            status: draft.status,
            error: draft.error,
            prev_hash,
            hash: hash.clone(),
        };

        self.store.insert_audit(&record)?;
        *guard = hash;
        drop(guard);

        if let Some(url) = &self.webhook_url {
            self.post_webhook(url.clone(), &record);
        }
        debug!(id = %record.id, status = record.status.as_str(), "audit entry appended");
        Ok(record)
    }

    /// Fire-and-forget JSON POST; delivery failure never fails the call.
    fn post_webhook(&self, url: String, record: &AuditRecord) {
        let body = match serde_json::to_value(record) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "audit webhook payload serialization failed");
                return;
            }
        };
        let client = self.http.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&body).send().await {
                warn!(%url, error = %e, "audit webhook delivery failed");
            }
        });
    }

    /// Query entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on a storage fault.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, StoreError> {
        self.store.query_audit(filter)
    }

    /// Walk every row in insertion order and report the first broken one.
    ///
    /// A row is broken when its `prev_hash` does not equal the previous
    /// row's hash (`"genesis"` for the first), or its stored hash does not
    /// recompute from the canonical composition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on a storage fault.
    pub fn verify(&self) -> Result<VerifyResult, StoreError> {
        let chain_enabled = self.chain_enabled;
        let mut expected_prev = GENESIS.to_string();
        let mut broken_at: Option<String> = None;

        self.store.for_each_ordered(&mut |record| {
            if chain_enabled && record.prev_hash.as_deref() != Some(expected_prev.as_str()) {
                broken_at = Some(record.id.clone());
                return false;
            }
            let recomputed = compose_hash(
                &record.id,
                &record.timestamp,
                &record.consumer_id,
                &record.server_id,
                &record.tool,
                record.status,
                record.prev_hash.as_deref(),
            );
            if recomputed != record.hash {
                broken_at = Some(record.id.clone());
                return false;
            }
            expected_prev = record.hash.clone();
            true
        })?;

        Ok(VerifyResult {
            valid: broken_at.is_none(),
            broken_at,
        })
    }

    /// Aggregate counts over the whole log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on a storage fault.
    pub fn stats(&self) -> Result<AuditStats, StoreError> {
        self.store.audit_stats()
    }
}

/// SHA-256 hex over the canonical field composition.
fn compose_hash(
    id: &str,
    timestamp: &str,
    consumer_id: &str,
    server_id: &str,
    tool: &str,
    status: AuditStatus,
    prev_hash: Option<&str>,
) -> String {
    sha256_hex(&format!(
        "{id}|{timestamp}|{consumer_id}|{server_id}|{tool}|{}|{}",
        status.as_str(),
        prev_hash.unwrap_or_default(),
    ))
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_utf8(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}
