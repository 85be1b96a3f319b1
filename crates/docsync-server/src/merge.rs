//! CRDT merge collaborator seam.
//!
//! The merge algorithm itself lives outside this crate. `UpdateLogMerge` is
//! the bundled engine: it stores updates as an append-only log and leaves the
//! merge to clients, whose CRDT apply is idempotent.
//!
//! `UpdateLogMerge` stands in for a real CRDT library. Its step2 payload is
//! the raw log, not a y-protocols encoded update, so stock Yjs clients cannot
//! consume it; they need an engine behind `CrdtMerge` that speaks that format.

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("corrupt document content: {0}")]
    CorruptDocument(String),
}

/// Result of applying an update to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// New materialized content.
    pub content: Vec<u8>,
    /// Update to forward to the document's other sessions, if any.
    pub broadcast: Option<Bytes>,
}

/// CRDT engine glue. Only called while the document lock is held.
pub trait CrdtMerge: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build the step2 reply for a peer that sent `state_vector`.
    fn encode_diff(&self, content: &[u8], state_vector: &[u8]) -> Result<Bytes, MergeError>;

    /// Merge `update` into `content`.
    fn apply_update(&self, content: &[u8], update: &[u8]) -> Result<MergeOutcome, MergeError>;
}

const LEN_PREFIX: usize = 4;

/// Stores a document as a sequence of `[len: u32 LE][update bytes]` records.
///
/// The state vector is ignored and step2 returns the whole log in this
/// record framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpdateLogMerge;

impl UpdateLogMerge {
    /// Split stored content into its update records.
    pub fn updates(content: &[u8]) -> Result<Vec<&[u8]>, MergeError> {
        let mut records = Vec::new();
        let mut rest = content;
        while !rest.is_empty() {
            if rest.len() < LEN_PREFIX {
                return Err(MergeError::CorruptDocument(format!(
                    "{} trailing bytes, expected a length prefix",
                    rest.len()
                )));
            }
            let (prefix, tail) = rest.split_at(LEN_PREFIX);
            let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
            if tail.len() < len {
                return Err(MergeError::CorruptDocument(format!(
                    "record of {} bytes truncated to {}",
                    len,
                    tail.len()
                )));
            }
            let (record, next) = tail.split_at(len);
            records.push(record);
            rest = next;
        }
        Ok(records)
    }
}

impl CrdtMerge for UpdateLogMerge {
    fn name(&self) -> &'static str {
        "update-log"
    }

    fn encode_diff(&self, content: &[u8], _state_vector: &[u8]) -> Result<Bytes, MergeError> {
        Self::updates(content)?;
        Ok(Bytes::copy_from_slice(content))
    }

    fn apply_update(&self, content: &[u8], update: &[u8]) -> Result<MergeOutcome, MergeError> {
        Self::updates(content)?;
        if update.is_empty() {
            return Ok(MergeOutcome {
                content: content.to_vec(),
                broadcast: None,
            });
        }
        let len = u32::try_from(update.len()).map_err(|_| {
            MergeError::InvalidUpdate(format!("{} bytes is too large", update.len()))
        })?;

        let mut merged = Vec::with_capacity(content.len() + LEN_PREFIX + update.len());
        merged.extend_from_slice(content);
        merged.extend_from_slice(&len.to_le_bytes());
        merged.extend_from_slice(update);

        Ok(MergeOutcome {
            content: merged,
            broadcast: Some(Bytes::copy_from_slice(update)),
        })
    }
}
