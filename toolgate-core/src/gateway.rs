//! The per-call pipeline: authenticate → locate → policy → rate-limit →
//! proxy → audit → meter.
//!
//! Every terminal path writes exactly one audit entry. Denials, rate
//! rejections, and backend failures come back as structured
//! [`CallOutcome`]s; only storage faults (and configuration problems at
//! construction) surface as errors, because silently dropping provenance
//! is worse than failing the call.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditDraft, AuditLog, VerifyResult};
use crate::auth::{Authenticator, CallerContext};
use crate::config::{Config, ConfigError};
use crate::error::GatewayError;
use crate::metering::{Meter, UsageSummary};
use crate::policy::PolicyEngine;
use crate::proxy::ToolDescriptor;
use crate::ratelimit::RateLimiter;
use crate::registry::{ServerRegistry, ServerStatusReport};
use crate::storage::{AuditFilter, AuditRecord, AuditStats, AuditStatus, SqliteStore};

/// Server id recorded when no backend owns the requested tool.
const UNKNOWN_SERVER: &str = "unknown";

/// Structured result of one tool call.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    /// The backend's `result`, verbatim.
    Success {
        /// Backend result value.
        result: Value,
    },
    /// Policy refused the call; nothing downstream was touched.
    Denied {
        /// The denial reason, naming the policy and rule.
        reason: String,
    },
    /// Admission control refused the call.
    RateLimited {
        /// Human-readable rejection text.
        reason: String,
    },
    /// The call failed: unknown tool, backend not running, deadline, or a
    /// backend error.
    Failed {
        /// Failure description.
        error: String,
    },
}

/// The gateway instance: owns the pipeline collaborators and their stores.
pub struct Gateway {
    authenticator: Authenticator,
    policy: PolicyEngine,
    rate_limiter: Arc<RateLimiter>,
    registry: Arc<ServerRegistry>,
    audit: AuditLog,
    meter: Arc<Meter>,
    store: Arc<SqliteStore>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Build a gateway from a validated configuration, opening the embedded
    /// store and spawning the background sweep and flush tasks.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] when required sections are absent or the
    /// store cannot be opened.
    pub fn new(config: &Config) -> Result<Self, GatewayError> {
        let auth = config.auth.as_ref().ok_or(ConfigError::MissingAuth)?;
        let audit_config = config.audit.as_ref().ok_or(ConfigError::MissingAudit)?;

        let store = Arc::new(SqliteStore::open(&audit_config.path)?);
        let audit = AuditLog::open(
            Arc::clone(&store) as Arc<dyn crate::storage::GatewayStore>,
            audit_config,
        )?;
        let meter = Arc::new(Meter::new(
            Arc::clone(&store) as Arc<dyn crate::storage::GatewayStore>,
            &config.metering,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let registry = Arc::new(ServerRegistry::new(config.servers.clone()));

        let shutdown = CancellationToken::new();
        rate_limiter.spawn_cleanup_task(shutdown.clone());
        meter.spawn_flush_task(shutdown.clone());

        info!(
            server_count = config.servers.len(),
            policy_count = config.policies.len(),
            "gateway assembled"
        );

        Ok(Self {
            authenticator: Authenticator::new(auth),
            policy: PolicyEngine::new(config.policies.clone()),
            rate_limiter,
            registry,
            audit,
            meter,
            store,
            shutdown,
        })
    }

    /// The backend registry (shared with the supervisor surface).
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Resolve a presented credential. Fail-closed: `None` means no caller.
    pub async fn authenticate(&self, credential: Option<&str>) -> Option<CallerContext> {
        self.authenticator.authenticate(credential).await
    }

    /// Run one tool call through the full pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] when the terminal audit entry
    /// cannot be persisted; every other failure is a structured
    /// [`CallOutcome`].
    pub async fn call_tool(
        &self,
        caller: &CallerContext,
        tool: &str,
        args: Value,
    ) -> Result<CallOutcome, GatewayError> {
        let args_text = args.to_string();

        // Locate the owning backend.
        let Some((server_id, proxy, timeout)) = self.registry.find_server_for_tool(tool).await
        else {
            let reason = format!("Tool not found: {tool}");
            self.audit.append(AuditDraft {
                consumer_id: caller.consumer_id.clone(),
                credential_id: caller.credential_id.clone(),
                server_id: UNKNOWN_SERVER.to_string(),
                tool: tool.to_string(),
                args: args_text,
                response: String::new(),
                latency_ms: 0,
                status: AuditStatus::Error,
                error: Some(reason.clone()),
            })?;
            return Ok(CallOutcome::Failed { error: reason });
        };

        // Policy gate. A denial mutates nothing downstream.
        let decision = self.policy.evaluate(caller, &server_id, tool, &args);
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| "No matching rule".to_string());
            self.audit.append(AuditDraft {
                consumer_id: caller.consumer_id.clone(),
                credential_id: caller.credential_id.clone(),
                server_id: server_id.clone(),
                tool: tool.to_string(),
                args: args_text,
                response: String::new(),
                latency_ms: 0,
                status: AuditStatus::Denied,
                error: Some(reason.clone()),
            })?;
            return Ok(CallOutcome::Denied { reason });
        }

        // Admission control on (consumer, server).
        let rate_key = format!("{}:{}", caller.consumer_id, server_id);
        let admission = self
            .rate_limiter
            .check(&rate_key, caller.rate_limit_per_minute);
        if !admission.allowed {
            let reason = format!("Rate limit exceeded for {rate_key}");
            self.audit.append(AuditDraft {
                consumer_id: caller.consumer_id.clone(),
                credential_id: caller.credential_id.clone(),
                server_id: server_id.clone(),
                tool: tool.to_string(),
                args: args_text,
                response: String::new(),
                latency_ms: 0,
                status: AuditStatus::RateLimited,
                error: Some(reason.clone()),
            })?;
            return Ok(CallOutcome::RateLimited { reason });
        }

        let Some(proxy) = proxy else {
            let reason = format!("Backend {server_id} is not running");
            self.audit.append(AuditDraft {
                consumer_id: caller.consumer_id.clone(),
                credential_id: caller.credential_id.clone(),
                server_id: server_id.clone(),
                tool: tool.to_string(),
                args: args_text,
                response: String::new(),
                latency_ms: 0,
                status: AuditStatus::Error,
                error: Some(reason.clone()),
            })?;
            return Ok(CallOutcome::Failed { error: reason });
        };

        // Forward and measure.
        let started = Instant::now();
        let result = proxy.call_tool(tool, args, Some(timeout)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(result) => {
                self.audit.append(AuditDraft {
                    consumer_id: caller.consumer_id.clone(),
                    credential_id: caller.credential_id.clone(),
                    server_id: server_id.clone(),
                    tool: tool.to_string(),
                    args: args_text,
                    response: result.to_string(),
                    latency_ms,
                    status: AuditStatus::Success,
                    error: None,
                })?;
                self.meter
                    .record(&caller.consumer_id, &server_id, tool, latency_ms, false);
                debug!(consumer_id = %caller.consumer_id, server_id, tool, latency_ms, "call succeeded");
                Ok(CallOutcome::Success { result })
            }
            Err(e) => {
                let error = e.to_string();
                self.audit.append(AuditDraft {
                    consumer_id: caller.consumer_id.clone(),
                    credential_id: caller.credential_id.clone(),
                    server_id: server_id.clone(),
                    tool: tool.to_string(),
                    args: args_text,
                    response: String::new(),
                    latency_ms,
                    status: AuditStatus::Error,
                    error: Some(error.clone()),
                })?;
                self.meter
                    .record(&caller.consumer_id, &server_id, tool, latency_ms, true);
                warn!(consumer_id = %caller.consumer_id, server_id, tool, %error, "call failed");
                Ok(CallOutcome::Failed { error })
            }
        }
    }

    /// Tools visible to one caller: every discovered tool whose
    /// (server, tool) pair the policy would allow with empty arguments.
    pub async fn list_tools(&self, caller: &CallerContext) -> Vec<(String, ToolDescriptor)> {
        let empty = Value::Object(serde_json::Map::new());
        let mut visible = Vec::new();
        for (server_id, tool) in self.registry.all_tools().await {
            if self
                .policy
                .evaluate(caller, &server_id, &tool.name, &empty)
                .allowed
            {
                visible.push((server_id, tool));
            }
        }
        visible
    }

    /// Supervisor report for every backend.
    pub async fn server_status(&self) -> Vec<ServerStatusReport> {
        self.registry.status().await
    }

    /// Audit query, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] on a storage fault.
    pub fn audit_query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, GatewayError> {
        Ok(self.audit.query(filter)?)
    }

    /// Audit chain verification.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] on a storage fault.
    pub fn audit_verify(&self) -> Result<VerifyResult, GatewayError> {
        Ok(self.audit.verify()?)
    }

    /// Audit aggregates.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] on a storage fault.
    pub fn audit_stats(&self) -> Result<AuditStats, GatewayError> {
        Ok(self.audit.stats()?)
    }

    /// Usage summary, optionally scoped to one consumer.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] on a storage fault.
    pub fn usage(&self, consumer_id: Option<&str>) -> Result<UsageSummary, GatewayError> {
        Ok(self.meter.summary(consumer_id)?)
    }

    /// Apply a reloaded configuration: swap credentials and policies
    /// atomically. Backend descriptor changes apply on the next explicit
    /// start/stop, never mid-flight.
    pub fn reload(&self, config: &Config) -> Result<(), GatewayError> {
        let auth = config.auth.as_ref().ok_or(ConfigError::MissingAuth)?;
        self.authenticator.reload(&auth.keys);
        self.policy.reload(config.policies.clone());
        info!("configuration reloaded");
        Ok(())
    }

    /// Drain backends, flush the meter, stop background tasks, and release
    /// the store.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.registry.stop_all().await;
        self.meter.flush();
        if let Err(e) = crate::storage::GatewayStore::close(self.store.as_ref()) {
            warn!(error = %e, "store close failed");
        }
        info!("gateway closed");
    }
}
