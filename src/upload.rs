//! Chunked upload reassembly.
//!
//! Clients deliver large media files as out-of-order binary chunks, each
//! tagged with a zero-based index and the declared total. A session
//! accumulates the chunks into index-ordered slots and hands back the
//! assembled buffer exactly once, on whichever submission fills the last
//! slot. Ordering is solely by chunk index; the byte offset that rides
//! along in the metadata is advisory and only logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Largest chunk count a session may declare. The slot vector is allocated
/// up front, so the declaration must be bounded before any session state
/// exists.
pub const MAX_TOTAL_CHUNKS: u32 = 8_192;

/// Metadata accompanying every uploaded chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Advisory only; never used for ordering or completion.
    pub chunk_offset: u64,
    pub chunk_size: u64,
    pub mime_type: String,
}

/// Result of submitting one chunk.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// More chunks are still outstanding.
    Pending { received: u32, total: u32 },
    /// This submission filled the last slot; the buffer is the
    /// concatenation of all chunks in index order.
    Completed(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Filling,
    Complete,
    Expired,
}

/// One in-flight chunked upload.
struct UploadSession {
    slots: Vec<Option<Bytes>>,
    received: u32,
    total: u32,
    phase: Phase,
    last_activity: Instant,
}

impl UploadSession {
    fn new(total_chunks: u32) -> Self {
        Self {
            slots: vec![None; total_chunks as usize],
            received: 0,
            total: total_chunks,
            phase: Phase::Filling,
            last_activity: Instant::now(),
        }
    }

    fn assemble(&mut self) -> Vec<u8> {
        let size: usize = self.slots.iter().flatten().map(|b| b.len()).sum();
        let mut out = Vec::with_capacity(size);
        for slot in self.slots.iter_mut() {
            if let Some(chunk) = slot.take() {
                out.extend_from_slice(&chunk);
            }
        }
        self.slots = Vec::new();
        out
    }
}

/// Registry of upload sessions, keyed by session id.
///
/// Sessions are created on the first chunk for an id and retired by
/// [`UploadRegistry::evict_idle`] or an explicit [`UploadRegistry::remove`].
/// Completed and expired sessions leave a slot-free tombstone behind so
/// that a late retry gets a precise error instead of silently opening a
/// fresh session.
pub struct UploadRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<UploadSession>>>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Submit one chunk for a session.
    ///
    /// Chunks may arrive in any order and from concurrent tasks.
    /// Re-submitting an index overwrites that slot without double-counting,
    /// so idempotent retries are safe. The completion check runs under the
    /// session's mutex, so exactly one submission observes completion.
    pub fn submit_chunk(
        &self,
        session_id: &str,
        meta: &ChunkMeta,
        payload: Bytes,
    ) -> Result<SubmitOutcome, ServiceError> {
        if meta.total_chunks == 0 || meta.chunk_index >= meta.total_chunks {
            return Err(ServiceError::InvalidChunkIndex {
                index: meta.chunk_index,
                total: meta.total_chunks,
            });
        }
        if meta.total_chunks > MAX_TOTAL_CHUNKS {
            return Err(ServiceError::TooManyChunks {
                total: meta.total_chunks,
                max: MAX_TOTAL_CHUNKS,
            });
        }

        let session = {
            let sessions = self.sessions.read().unwrap();
            sessions.get(session_id).cloned()
        };
        let session = match session {
            Some(session) => session,
            None => {
                let mut sessions = self.sessions.write().unwrap();
                sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| {
                        info!(
                            "Opening upload session {} ({} chunks)",
                            session_id, meta.total_chunks
                        );
                        Arc::new(Mutex::new(UploadSession::new(meta.total_chunks)))
                    })
                    .clone()
            }
        };

        let mut session = session.lock().unwrap();
        match session.phase {
            Phase::Complete => return Err(ServiceError::SessionAlreadyComplete(session_id.to_string())),
            Phase::Expired => return Err(ServiceError::SessionExpired(session_id.to_string())),
            Phase::Filling => {}
        }
        session.last_activity = Instant::now();

        // The first chunk fixed the slot count; later chunks must agree.
        if meta.chunk_index >= session.total {
            return Err(ServiceError::InvalidChunkIndex {
                index: meta.chunk_index,
                total: session.total,
            });
        }
        if meta.total_chunks != session.total {
            warn!(
                "Session {}: chunk declared {} total chunks, session has {}",
                session_id, meta.total_chunks, session.total
            );
        }

        let index = meta.chunk_index as usize;
        if session.slots[index].is_none() {
            session.received += 1;
        } else {
            debug!(
                "Session {}: overwriting chunk {} on resubmission",
                session_id, meta.chunk_index
            );
        }
        debug!(
            "Session {}: chunk {}/{} ({} bytes, advisory offset {})",
            session_id,
            meta.chunk_index + 1,
            session.total,
            payload.len(),
            meta.chunk_offset
        );
        session.slots[index] = Some(payload);

        if session.received == session.total {
            let assembled = session.assemble();
            session.phase = Phase::Complete;
            info!(
                "Upload session {} complete: {} chunks, {:.2} MB",
                session_id,
                session.total,
                assembled.len() as f64 / (1024.0 * 1024.0)
            );
            Ok(SubmitOutcome::Completed(assembled))
        } else {
            Ok(SubmitOutcome::Pending {
                received: session.received,
                total: session.total,
            })
        }
    }

    /// Drop a session outright (e.g. the owning connection closed).
    pub fn remove(&self, session_id: &str) {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.remove(session_id).is_some() {
            debug!("Removed upload session {}", session_id);
        }
    }

    /// Expire sessions idle past `max_idle` and drop tombstones idle past
    /// `grace`. Returns the number of sessions expired by this pass.
    pub fn evict_idle(&self, max_idle: Duration, grace: Duration) -> usize {
        let mut expired = 0;
        let mut drop_keys = Vec::new();
        {
            let sessions = self.sessions.read().unwrap();
            for (id, session) in sessions.iter() {
                let mut session = session.lock().unwrap();
                let idle = session.last_activity.elapsed();
                match session.phase {
                    Phase::Filling if idle > max_idle => {
                        warn!(
                            "Expiring upload session {} after {:?} idle ({}/{} chunks)",
                            id, idle, session.received, session.total
                        );
                        session.phase = Phase::Expired;
                        session.slots = Vec::new();
                        expired += 1;
                    }
                    Phase::Complete | Phase::Expired if idle > grace => {
                        drop_keys.push(id.clone());
                    }
                    _ => {}
                }
            }
        }
        if !drop_keys.is_empty() {
            let mut sessions = self.sessions.write().unwrap();
            for key in drop_keys {
                sessions.remove(&key);
            }
        }
        expired
    }

    /// Number of sessions currently tracked, tombstones included.
    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}

impl Default for UploadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
