//! The audit logger: bounded enqueue for callers, one worker draining to the sink.
//! The worker holds an accepted record until the sink takes it; only shutdown can abandon one.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::queue::{AuditQueue, Enqueued};
use super::{AuditError, AuditEvent, AuditRecord, AuditSink, HashChain};
use crate::config::AuditConfig;

/// Operator-facing audit health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditHealth {
    pub queued: usize,
    pub written: u64,
    pub dropped: u64,
    pub failed: u64,
    pub degraded: bool,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    degraded: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    initial: Duration,
    max: Duration,
    attempts: u32,
}

pub struct AuditLogger {
    queue: Arc<AuditQueue>,
    counters: Arc<Counters>,
    config: AuditConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLogger {
    /// Resume the chain from `sink` and start the worker.
    pub async fn start(sink: Arc<dyn AuditSink>, config: AuditConfig) -> Result<Self, AuditError> {
        let tip = sink.chain_tip().await?;
        if let Some(t) = &tip {
            log::info!("audit chain resumed at seq {}", t.seq);
        }
        let chain = HashChain::resume(tip);
        let queue = Arc::new(AuditQueue::new(config.queue_capacity));
        let counters = Arc::new(Counters::default());
        let retry = RetryPolicy {
            initial: Duration::from_millis(config.retry_initial_ms),
            max: Duration::from_millis(config.retry_max_ms.max(config.retry_initial_ms)),
            attempts: config.max_retries.max(1),
        };
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            sink,
            counters.clone(),
            chain,
            retry,
        ));
        Ok(Self {
            queue,
            counters,
            config,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue a record. Waits at most `enqueueTimeoutMs`; returns false if the record was
    /// not accepted. Evicted and rejected records are counted as dropped and logged.
    pub async fn record(&self, record: AuditRecord) -> bool {
        let deadline = Instant::now() + Duration::from_millis(self.config.enqueue_timeout_ms);
        match self
            .queue
            .push(record, self.config.full_policy, deadline)
            .await
        {
            Enqueued::Queued => true,
            Enqueued::Evicted(old) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "audit queue full: dropped oldest record for request {} ({} {})",
                    old.request_id,
                    old.command,
                    old.outcome
                );
                true
            }
            Enqueued::TimedOut(rec) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "audit queue full: dropped record for request {} ({} {})",
                    rec.request_id,
                    rec.command,
                    rec.outcome
                );
                false
            }
            Enqueued::Closed(rec) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "audit logger shut down: dropped record for request {}",
                    rec.request_id
                );
                false
            }
        }
    }

    pub fn health(&self) -> AuditHealth {
        AuditHealth {
            queued: self.queue.len(),
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting records and wait for the worker to write what is queued.
    pub async fn shutdown(&self) {
        self.queue.close();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(h) = handle {
            if let Err(e) = h.await {
                log::error!("audit worker panicked: {}", e);
            }
        }
    }
}

async fn run_worker(
    queue: Arc<AuditQueue>,
    sink: Arc<dyn AuditSink>,
    counters: Arc<Counters>,
    mut chain: HashChain,
    retry: RetryPolicy,
) {
    // Set once a record is abandoned at shutdown; the rest of the backlog then gets one try each.
    let mut gave_up = false;
    while let Some(record) = queue.pop().await {
        let request_id = record.request_id.clone();
        let event = match chain.seal(record) {
            Ok(ev) => ev,
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("audit record for {} could not be sealed: {}", request_id, e);
                continue;
            }
        };

        let policy = if gave_up {
            RetryPolicy { attempts: 1, ..retry }
        } else {
            retry
        };
        if write_with_retry(&queue, sink.as_ref(), &counters, &event, policy).await {
            chain.advance(&event);
            counters.written.fetch_add(1, Ordering::Relaxed);
            if counters.degraded.swap(false, Ordering::Relaxed) {
                log::info!("audit sink recovered");
            }
        } else {
            gave_up = true;
            counters.failed.fetch_add(1, Ordering::Relaxed);
            counters.degraded.store(true, Ordering::Relaxed);
            log::error!(
                "audit record for {} not written before shutdown; gave up after {} attempts",
                request_id,
                policy.attempts
            );
        }
    }

    if let Err(e) = sink.flush().await {
        log::error!("audit flush on shutdown failed: {}", e);
    }
    log::debug!("audit worker stopped");
}

/// Append `event`, backing off between failures. While the queue is open this only returns
/// once the write succeeds; audit is marked degraded after `retry.attempts` failures. After
/// close it gets `retry.attempts` more tries, then gives up and returns false.
async fn write_with_retry(
    queue: &AuditQueue,
    sink: &dyn AuditSink,
    counters: &Counters,
    event: &AuditEvent,
    retry: RetryPolicy,
) -> bool {
    let request_id = &event.record.request_id;
    let mut delay = retry.initial;
    let mut attempt: u64 = 0;
    let mut left_after_close: Option<u32> = None;
    loop {
        attempt += 1;
        let err = match sink.append(event).await {
            Ok(()) => return true,
            Err(e) => e,
        };
        if attempt == u64::from(retry.attempts) {
            counters.degraded.store(true, Ordering::Relaxed);
            log::error!(
                "audit write for {} still failing after {} attempts, audit is degraded: {}",
                request_id,
                attempt,
                err
            );
        } else {
            log::warn!("audit write for {} failed (attempt {}): {}", request_id, attempt, err);
        }
        if queue.is_closed() {
            let left = left_after_close.get_or_insert(retry.attempts);
            *left = left.saturating_sub(1);
            if *left == 0 {
                return false;
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(retry.max);
    }
}
