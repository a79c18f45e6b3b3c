//! Bounded multi-producer, single-consumer queue with an explicit full policy.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::AuditRecord;
use crate::config::QueueFullPolicy;

/// What happened to an offered record.
#[derive(Debug)]
pub(crate) enum Enqueued {
    Queued,
    /// Queued after evicting the oldest record, which is returned.
    Evicted(Box<AuditRecord>),
    /// No room before the deadline; the offered record is returned.
    TimedOut(Box<AuditRecord>),
    /// The queue is closed; the offered record is returned.
    Closed(Box<AuditRecord>),
}

#[derive(Default)]
struct State {
    items: VecDeque<AuditRecord>,
    closed: bool,
}

pub(crate) struct AuditQueue {
    state: Mutex<State>,
    capacity: usize,
    item_ready: Notify,
    space_ready: Notify,
}

impl AuditQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            capacity: capacity.max(1),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub(crate) async fn push(
        &self,
        record: AuditRecord,
        policy: QueueFullPolicy,
        deadline: Instant,
    ) -> Enqueued {
        loop {
            let space = self.space_ready.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let mut state = self.lock();
                if state.closed {
                    return Enqueued::Closed(Box::new(record));
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(record);
                    drop(state);
                    self.item_ready.notify_one();
                    return Enqueued::Queued;
                }
                if policy == QueueFullPolicy::DropOldest {
                    let evicted = state.items.pop_front();
                    state.items.push_back(record);
                    drop(state);
                    self.item_ready.notify_one();
                    return match evicted {
                        Some(old) => Enqueued::Evicted(Box::new(old)),
                        None => Enqueued::Queued,
                    };
                }
            }
            if tokio::time::timeout_at(deadline, space).await.is_err() {
                return Enqueued::TimedOut(Box::new(record));
            }
        }
    }

    /// Next record, or `None` once the queue is closed and empty.
    pub(crate) async fn pop(&self) -> Option<AuditRecord> {
        loop {
            let ready = self.item_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(record) = state.items.pop_front() {
                    drop(state);
                    self.space_ready.notify_one();
                    return Some(record);
                }
                if state.closed {
                    return None;
                }
            }
            ready.await;
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Refuse new records; queued ones are still handed out by [`AuditQueue::pop`].
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.item_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditStage;
    use crate::request::Role;
    use crate::result::Outcome;
    use chrono::Utc;
    use std::time::Duration;

    fn record(id: &str) -> AuditRecord {
        AuditRecord {
            request_id: id.to_string(),
            correlation_id: id.to_string(),
            submitted_at: Utc::now(),
            completed_at: Utc::now(),
            actor_id: "a".into(),
            actor_role: Role::Viewer,
            command: "c".into(),
            args: vec![],
            stage: AuditStage::Validation,
            outcome: Outcome::Denied,
            exit_code: None,
            duration_ms: 0,
            error: None,
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(20)
    }

    #[tokio::test]
    async fn block_policy_times_out_when_full() {
        let q = AuditQueue::new(1);
        assert!(matches!(q.push(record("1"), QueueFullPolicy::Block, soon()).await, Enqueued::Queued));
        match q.push(record("2"), QueueFullPolicy::Block, soon()).await {
            Enqueued::TimedOut(r) => assert_eq!(r.request_id, "2"),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn block_policy_waits_for_room() {
        let q = std::sync::Arc::new(AuditQueue::new(1));
        q.push(record("1"), QueueFullPolicy::Block, soon()).await;
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                q.pop().await
            })
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        assert!(matches!(q.push(record("2"), QueueFullPolicy::Block, deadline).await, Enqueued::Queued));
        assert_eq!(consumer.await.unwrap().unwrap().request_id, "1");
        assert_eq!(q.pop().await.unwrap().request_id, "2");
    }

    #[tokio::test]
    async fn drop_oldest_evicts_front() {
        let q = AuditQueue::new(2);
        q.push(record("1"), QueueFullPolicy::DropOldest, soon()).await;
        q.push(record("2"), QueueFullPolicy::DropOldest, soon()).await;
        match q.push(record("3"), QueueFullPolicy::DropOldest, soon()).await {
            Enqueued::Evicted(old) => assert_eq!(old.request_id, "1"),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(q.pop().await.unwrap().request_id, "2");
        assert_eq!(q.pop().await.unwrap().request_id, "3");
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = AuditQueue::new(4);
        q.push(record("1"), QueueFullPolicy::Block, soon()).await;
        q.close();
        assert!(matches!(q.push(record("2"), QueueFullPolicy::Block, soon()).await, Enqueued::Closed(_)));
        assert_eq!(q.pop().await.unwrap().request_id, "1");
        assert!(q.pop().await.is_none());
    }
}
