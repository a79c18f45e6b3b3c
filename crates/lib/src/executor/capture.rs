//! Bounded capture of a child's stdout/stderr, with optional live forwarding.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One piece of output forwarded while the process runs.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

/// Output kept for the result. Bytes beyond the ceiling are read and discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub data: Vec<u8>,
    pub truncated: bool,
    /// Everything the process wrote, including discarded bytes.
    pub total_bytes: u64,
}

impl CapturedOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Append `chunk` without growing past `limit`; returns the part that was kept.
    fn append<'a>(&mut self, chunk: &'a [u8], limit: usize) -> &'a [u8] {
        self.total_bytes += chunk.len() as u64;
        let room = limit.saturating_sub(self.data.len());
        let kept = &chunk[..chunk.len().min(room)];
        if kept.len() < chunk.len() {
            self.truncated = true;
        }
        self.data.extend_from_slice(kept);
        kept
    }
}

/// Shared buffer so whatever was read survives even if the reader task is aborted.
pub(crate) type SharedCapture = Arc<Mutex<CapturedOutput>>;

pub(crate) fn snapshot(shared: &SharedCapture) -> CapturedOutput {
    shared
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Read `reader` to EOF, keeping at most `limit` bytes and forwarding kept bytes to `live`.
pub(crate) async fn capture<R>(
    mut reader: R,
    stream: StreamKind,
    limit: usize,
    shared: SharedCapture,
    live: Option<mpsc::Sender<OutputChunk>>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("reading {:?} failed: {}", stream, e);
                break;
            }
        };
        let kept = {
            let mut out = shared.lock().unwrap_or_else(PoisonError::into_inner);
            out.append(&buf[..n], limit).to_vec()
        };
        if kept.is_empty() {
            continue;
        }
        if let Some(tx) = &live {
            // A caller that stopped listening does not stop the capture.
            let _ = tx
                .send(OutputChunk {
                    stream,
                    data: kept,
                })
                .await;
        }
    }
}
