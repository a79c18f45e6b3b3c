//! The command gate: runs one request through validation, rate limiting and execution,
//! and writes exactly one audit record for it whichever way it ends.
//!
//! Fails closed: a limiter fault denies the request, a spawn fault reports an internal
//! error, and neither spawns anything the validator and limiter did not both approve.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditHealth, AuditLogger, AuditRecord, AuditStage, JsonlFileSink};
use crate::config::{self, Config};
use crate::executor::{OutputChunk, ProcessExecutor};
use crate::ratelimit::{Decision, RateLimiter};
use crate::registry::{self, Redaction, Registry};
use crate::request::ExecutionRequest;
use crate::result::{ExecutionResult, GateError, Outcome};
use crate::validator::{DenyList, Validator};

/// Operator health for the whole pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateHealth {
    pub commands: usize,
    pub internal_errors: u64,
    pub audit: AuditHealth,
}

pub struct CommandGate {
    validator: Validator,
    limiter: RateLimiter,
    executor: ProcessExecutor,
    audit: Arc<AuditLogger>,
    internal_errors: AtomicU64,
}

impl CommandGate {
    pub fn new(
        validator: Validator,
        limiter: RateLimiter,
        executor: ProcessExecutor,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            validator,
            limiter,
            executor,
            audit,
            internal_errors: AtomicU64::new(0),
        }
    }

    /// Load the registry, open the audit log and start its worker.
    pub async fn from_config(config: &Config, config_path: &Path) -> Result<Self> {
        let deny = DenyList::from_config(&config.validator);
        let registry = Arc::new(registry::load_registry(config, config_path, &deny)?);
        let audit_path = config::resolve_audit_path(config, config_path);
        let sink = JsonlFileSink::open(&audit_path, config.audit.fsync)
            .with_context(|| format!("opening audit log {}", audit_path.display()))?;
        let audit = AuditLogger::start(Arc::new(sink), config.audit.clone())
            .await
            .with_context(|| format!("resuming audit chain from {}", audit_path.display()))?;
        Ok(Self::new(
            Validator::new(registry, deny),
            RateLimiter::in_memory(config.rate_limit.clone()),
            ProcessExecutor::new(config.executor.clone()),
            Arc::new(audit),
        ))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.validator.registry()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn health(&self) -> GateHealth {
        GateHealth {
            commands: self.registry().len(),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
            audit: self.audit.health(),
        }
    }

    /// Run `req` to completion. `live` receives output chunks only for streaming commands.
    pub async fn execute(
        &self,
        req: ExecutionRequest,
        cancel: &CancellationToken,
        live: Option<mpsc::Sender<OutputChunk>>,
    ) -> ExecutionResult {
        let (result, stage, args) = self.run_stages(&req, cancel, live).await;
        if result.outcome == Outcome::InternalError {
            self.internal_errors.fetch_add(1, Ordering::Relaxed);
        }
        log::info!(
            "request {} actor={} command={} outcome={} duration={:?}",
            req.id(),
            req.actor().id,
            req.command(),
            result.outcome,
            result.duration
        );
        self.audit
            .record(AuditRecord::new(&req, args, stage, &result))
            .await;
        result
    }

    async fn run_stages(
        &self,
        req: &ExecutionRequest,
        cancel: &CancellationToken,
        live: Option<mpsc::Sender<OutputChunk>>,
    ) -> (ExecutionResult, AuditStage, Vec<String>) {
        let started = Instant::now();

        let spec = match self.validator.validate(req) {
            Ok(spec) => spec,
            Err(e) => {
                log::debug!("request {} rejected: {}", req.id(), e);
                let args = match self.registry().get(req.command()) {
                    Some(spec) => spec.redaction.apply(req.args()),
                    None => Redaction::all().apply(req.args()),
                };
                let result =
                    ExecutionResult::rejected(req, GateError::Validation(e), started.elapsed());
                return (result, AuditStage::Validation, args);
            }
        };
        let args = spec.redaction.apply(req.args());

        if cancel.is_cancelled() {
            let result = ExecutionResult::rejected(req, GateError::Killed, started.elapsed());
            return (result, AuditStage::Execution, args);
        }

        match self
            .limiter
            .check(&req.actor().id, &spec.name, spec.rate_limit.as_ref())
        {
            Ok(Decision::Allow) => {}
            Ok(Decision::Deny { retry_after }) => {
                log::debug!(
                    "request {} rate limited, retry after {:?}",
                    req.id(),
                    retry_after
                );
                let result = ExecutionResult::rejected(
                    req,
                    GateError::RateLimited { retry_after },
                    started.elapsed(),
                );
                return (result, AuditStage::RateLimit, args);
            }
            Err(e) => {
                log::error!("request {}: rate limiter failed, denying: {}", req.id(), e);
                let result = ExecutionResult::rejected(
                    req,
                    GateError::Internal(e.to_string()),
                    started.elapsed(),
                );
                return (result, AuditStage::Internal, args);
            }
        }

        let live = if spec.streaming { live } else { None };
        let outcome = self.executor.run(spec, req.args(), cancel, live).await;
        if let Some(err) = &outcome.error {
            log::error!("request {}: {}", req.id(), err);
        }
        let result = ExecutionResult::from_exec(req, spec.timeout, outcome);
        (result, AuditStage::Execution, args)
    }

    /// Flush and stop the audit worker. Requests finishing afterwards are counted as dropped.
    pub async fn shutdown(&self) {
        self.audit.shutdown().await;
    }
}
