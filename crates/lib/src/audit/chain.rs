//! Hash chaining for audit events and offline verification of a JSON-lines log.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::{AuditError, AuditEvent, AuditRecord};

/// `prevHash` of the first event.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Position of the last persisted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTip {
    pub seq: u64,
    pub hash: String,
}

/// Chain state owned by the audit worker.
#[derive(Debug, Clone)]
pub struct HashChain {
    seq: u64,
    tip: String,
}

impl Default for HashChain {
    fn default() -> Self {
        Self {
            seq: 0,
            tip: GENESIS_HASH.to_string(),
        }
    }
}

fn event_hash(seq: u64, prev_hash: &str, record: &AuditRecord) -> Result<String, AuditError> {
    let body = serde_json::to_vec(record)?;
    let mut hasher = Sha256::new();
    hasher.update(seq.to_be_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(&body);
    Ok(hex::encode(hasher.finalize()))
}

impl HashChain {
    pub fn resume(tip: Option<ChainTip>) -> Self {
        match tip {
            Some(t) => Self {
                seq: t.seq,
                tip: t.hash,
            },
            None => Self::default(),
        }
    }

    /// Build the next event without advancing; call [`HashChain::advance`] once it is durable.
    pub fn seal(&self, record: AuditRecord) -> Result<AuditEvent, AuditError> {
        let seq = self.seq + 1;
        let hash = event_hash(seq, &self.tip, &record)?;
        Ok(AuditEvent {
            seq,
            prev_hash: self.tip.clone(),
            hash,
            record,
        })
    }

    pub fn advance(&mut self, event: &AuditEvent) {
        self.seq = event.seq;
        self.tip = event.hash.clone();
    }

    pub fn tip(&self) -> ChainTip {
        ChainTip {
            seq: self.seq,
            hash: self.tip.clone(),
        }
    }
}

/// Summary of a verified log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub events: u64,
    pub tip: Option<ChainTip>,
}

/// Re-hash every line of `path`; the first mismatch is reported with its 1-based line number.
pub fn verify_chain(path: &Path) -> Result<ChainReport, AuditError> {
    let file = std::fs::File::open(path)?;
    let mut chain = HashChain::default();
    let mut events = 0u64;
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line_no = i + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: AuditEvent = serde_json::from_str(&line).map_err(|e| AuditError::Chain {
            line: line_no,
            reason: format!("unparseable event: {}", e),
        })?;
        if event.seq != chain.seq + 1 {
            return Err(AuditError::Chain {
                line: line_no,
                reason: format!("expected seq {}, found {}", chain.seq + 1, event.seq),
            });
        }
        if event.prev_hash != chain.tip {
            return Err(AuditError::Chain {
                line: line_no,
                reason: "prevHash does not match previous event".to_string(),
            });
        }
        let expected = event_hash(event.seq, &event.prev_hash, &event.record)?;
        if expected != event.hash {
            return Err(AuditError::Chain {
                line: line_no,
                reason: "hash does not match event contents".to_string(),
            });
        }
        chain.advance(&event);
        events += 1;
    }
    Ok(ChainReport {
        events,
        tip: (events > 0).then(|| chain.tip()),
    })
}

/// Tip of an existing log without re-hashing it. Missing or empty file => `None`.
pub(crate) fn read_tip(path: &Path) -> Result<Option<ChainTip>, AuditError> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut last: Option<(usize, String)> = None;
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some((i + 1, line));
        }
    }
    let Some((line_no, line)) = last else {
        return Ok(None);
    };
    let event: AuditEvent = serde_json::from_str(&line).map_err(|e| AuditError::Chain {
        line: line_no,
        reason: format!("unparseable last event: {}", e),
    })?;
    Ok(Some(ChainTip {
        seq: event.seq,
        hash: event.hash,
    }))
}
