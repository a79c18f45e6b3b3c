//! Audit sinks: an append-only JSON-lines file and an in-memory sink.

use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::chain::read_tip;
use super::{AuditError, AuditEvent, AuditSink, ChainTip};

/// One JSON object per line, appended. The file stays exclusively locked while the sink lives.
pub struct JsonlFileSink {
    path: PathBuf,
    file: Arc<Mutex<File>>,
    fsync: bool,
}

impl JsonlFileSink {
    pub fn open(path: impl Into<PathBuf>, fsync: bool) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(AuditError::Locked(path));
        }
        log::debug!("audit log opened: {}", path.display());
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
            fsync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlFileSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let file = self.file.clone();
        let fsync = self.fsync;
        tokio::task::spawn_blocking(move || -> Result<(), AuditError> {
            let mut f = file.lock().unwrap_or_else(PoisonError::into_inner);
            let start = f.metadata()?.len();
            write_or_rollback(&mut f, start, |f| {
                f.write_all(&line)?;
                f.flush()?;
                if fsync {
                    f.sync_data()?;
                }
                Ok(())
            })?;
            Ok(())
        })
        .await
        .map_err(|e| AuditError::Sink(format!("audit write task failed: {}", e)))?
    }

    async fn chain_tip(&self) -> Result<Option<ChainTip>, AuditError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_tip(&path))
            .await
            .map_err(|e| AuditError::Sink(format!("audit read task failed: {}", e)))?
    }

    async fn flush(&self) -> Result<(), AuditError> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || -> Result<(), AuditError> {
            let f = file.lock().unwrap_or_else(PoisonError::into_inner);
            f.sync_all()?;
            Ok(())
        })
        .await
        .map_err(|e| AuditError::Sink(format!("audit flush task failed: {}", e)))?
    }
}

/// Run `write`; if it fails, cut the file back to `start` so a retry never lands after a
/// partial line.
fn write_or_rollback(
    file: &mut File,
    start: u64,
    write: impl FnOnce(&mut File) -> io::Result<()>,
) -> io::Result<()> {
    if let Err(e) = write(file) {
        if let Err(t) = file.set_len(start) {
            log::error!("audit log could not be truncated after a failed write: {}", t);
        }
        return Err(e);
    }
    Ok(())
}

impl Drop for JsonlFileSink {
    fn drop(&mut self) {
        let f = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = FileExt::unlock(&*f);
    }
}

/// Keeps events in memory. `fail_next` makes the next N appends fail.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
    failures: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AuditError::Sink("injected failure".to_string()));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    async fn chain_tip(&self) -> Result<Option<ChainTip>, AuditError> {
        Ok(self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .map(|e| ChainTip {
                seq: e.seq,
                hash: e.hash.clone(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{verify_chain, AuditRecord, AuditStage, HashChain};
    use crate::request::Role;
    use crate::result::Outcome;
    use chrono::Utc;

    fn record(id: &str) -> AuditRecord {
        AuditRecord {
            request_id: id.to_string(),
            correlation_id: id.to_string(),
            submitted_at: Utc::now(),
            completed_at: Utc::now(),
            actor_id: "alice".into(),
            actor_role: Role::Operator,
            command: "list-items".into(),
            args: vec![],
            stage: AuditStage::Execution,
            outcome: Outcome::Completed,
            exit_code: Some(0),
            duration_ms: 1,
            error: None,
        }
    }

    fn temp_log() -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("cligate-sink-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("audit.jsonl");
        (dir, path)
    }

    #[tokio::test]
    async fn file_sink_appends_and_resumes_chain() {
        let (dir, path) = temp_log();
        let mut chain = HashChain::default();
        {
            let sink = JsonlFileSink::open(&path, false).unwrap();
            assert_eq!(sink.chain_tip().await.unwrap(), None);
            for id in ["a", "b"] {
                let ev = chain.seal(record(id)).unwrap();
                sink.append(&ev).await.unwrap();
                chain.advance(&ev);
            }
            sink.flush().await.unwrap();
        }

        let sink = JsonlFileSink::open(&path, true).unwrap();
        let tip = sink.chain_tip().await.unwrap();
        assert_eq!(tip, Some(chain.tip()));
        let mut resumed = HashChain::resume(tip);
        let ev = resumed.seal(record("c")).unwrap();
        assert_eq!(ev.seq, 3);
        sink.append(&ev).await.unwrap();
        resumed.advance(&ev);
        drop(sink);

        let report = verify_chain(&path).unwrap();
        assert_eq!(report.events, 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failed_append_leaves_no_partial_line() {
        let (dir, path) = temp_log();
        let sink = JsonlFileSink::open(&path, false).unwrap();
        let mut chain = HashChain::default();
        let first = chain.seal(record("a")).unwrap();
        sink.append(&first).await.unwrap();
        chain.advance(&first);

        let second = chain.seal(record("b")).unwrap();
        let line = serde_json::to_vec(&second).unwrap();
        {
            let mut f = sink.file.lock().unwrap();
            let start = f.metadata().unwrap().len();
            let res = write_or_rollback(&mut f, start, |f| {
                f.write_all(&line[..line.len() / 2])?;
                Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
            });
            assert!(res.is_err());
            assert_eq!(f.metadata().unwrap().len(), start);
        }

        // The retry of the same event lands on a clean line boundary.
        sink.append(&second).await.unwrap();
        chain.advance(&second);
        assert_eq!(sink.chain_tip().await.unwrap(), Some(chain.tip()));
        drop(sink);
        assert_eq!(verify_chain(&path).unwrap().events, 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn second_file_sink_on_same_path_is_refused() {
        let (dir, path) = temp_log();
        let _first = JsonlFileSink::open(&path, false).unwrap();
        assert!(matches!(
            JsonlFileSink::open(&path, false),
            Err(AuditError::Locked(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn memory_sink_injects_failures() {
        let sink = MemorySink::new();
        let ev = HashChain::default().seal(record("a")).unwrap();
        sink.fail_next(2);
        assert!(sink.append(&ev).await.is_err());
        assert!(sink.append(&ev).await.is_err());
        assert!(sink.append(&ev).await.is_ok());
        assert_eq!(sink.len(), 1);
    }
}
