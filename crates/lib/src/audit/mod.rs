//! Audit trail: one record per request, queued without blocking the request path
//! beyond a bounded wait, and written by a single worker to a hash-chained sink.

mod chain;
mod logger;
mod queue;
mod sink;

pub use chain::{verify_chain, ChainReport, ChainTip, HashChain, GENESIS_HASH};
pub use logger::{AuditHealth, AuditLogger};
pub use sink::{JsonlFileSink, MemorySink};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::request::{ExecutionRequest, Role};
use crate::result::{ExecutionResult, Outcome};

/// Pipeline stage at which the request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    Validation,
    RateLimit,
    Execution,
    /// Failed closed on an internal fault before reaching the executor.
    Internal,
}

/// What happened to one request. Arguments are already redacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub request_id: String,
    pub correlation_id: String,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub actor_id: String,
    pub actor_role: Role,
    pub command: String,
    pub args: Vec<String>,
    pub stage: AuditStage,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl AuditRecord {
    pub fn new(
        req: &ExecutionRequest,
        redacted_args: Vec<String>,
        stage: AuditStage,
        result: &ExecutionResult,
    ) -> Self {
        Self {
            request_id: req.id().to_string(),
            correlation_id: req.correlation_id().to_string(),
            submitted_at: req.submitted_at(),
            completed_at: Utc::now(),
            actor_id: req.actor().id.clone(),
            actor_role: req.actor().role,
            command: req.command().to_string(),
            args: redacted_args,
            stage,
            outcome: result.outcome,
            exit_code: result.exit_code,
            duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            error: result.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// A record as persisted: chained to the one before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub seq: u64,
    pub prev_hash: String,
    pub hash: String,
    #[serde(flatten)]
    pub record: AuditRecord,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("audit log {} is locked by another process", .0.display())]
    Locked(PathBuf),
    #[error("audit chain broken at line {line}: {reason}")]
    Chain { line: usize, reason: String },
    #[error("audit sink error: {0}")]
    Sink(String),
    #[error("audit logger is shut down")]
    Closed,
}

/// Durable destination for audit events. Writes arrive one at a time from a single worker.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one event. Returning `Ok` means the event is durable.
    async fn append(&self, event: &AuditEvent) -> Result<(), AuditError>;

    /// Last event already persisted, so a restarted worker continues the chain.
    async fn chain_tip(&self) -> Result<Option<ChainTip>, AuditError>;

    async fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}
