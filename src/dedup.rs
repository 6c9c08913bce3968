//! Rehydration of deduplicated payloads.
//!
//! A record whose stream tag carries the dedup bit stores references instead
//! of bytes.  The [`Rehydrator`] collaborator turns them back into the
//! original payload before the stream is interpreted.
//!
//! [`ChunkStore`] is the bundled implementation: a payload is a list of
//! `blake3(32) ‖ len(u32 BE)` references into a content-addressed store.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::{debug, warn};

use crate::record::Record;

pub const CHUNK_REF_LEN: usize = 36;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RehydrateError {
    /// The job cannot continue.
    #[error("rehydration failed: {0}")]
    Fatal(String),
    /// The record is damaged; `partial` holds what could be rebuilt.
    #[error("rehydration incomplete: {message}")]
    Recoverable { message: String, partial: Vec<u8> },
}

pub trait Rehydrator {
    fn rehydrate(&mut self, record: &Record) -> Result<Vec<u8>, RehydrateError>;
}

/// Rehydrator for sources that were never deduplicated.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRehydration;

impl Rehydrator for NoRehydration {
    fn rehydrate(&mut self, record: &Record) -> Result<Vec<u8>, RehydrateError> {
        Err(RehydrateError::Fatal(format!(
            "device is not dedup aware (file index {}, stream {})",
            record.file_index, record.stream
        )))
    }
}

// ── ChunkStore ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct ChunkStore {
    chunks: HashMap<[u8; 32], Vec<u8>>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize { self.chunks.len() }
    pub fn is_empty(&self) -> bool { self.chunks.is_empty() }

    pub fn insert(&mut self, data: &[u8]) -> [u8; 32] {
        let digest = *blake3::hash(data).as_bytes();
        self.chunks.entry(digest).or_insert_with(|| data.to_vec());
        digest
    }

    /// Load every file named by the hex blake3 digest of its content.
    /// Files whose name does not match their content are skipped.
    pub fn load_dir(dir: &Path) -> io::Result<Self> {
        let mut store = Self::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(digest) = name.to_str().and_then(parse_digest) else {
                debug!(file = ?name, "not a chunk file");
                continue;
            };
            let data = fs::read(entry.path())?;
            if *blake3::hash(&data).as_bytes() != digest {
                warn!(file = ?name, "chunk content does not match its name, skipped");
                continue;
            }
            store.chunks.insert(digest, data);
        }
        debug!(dir = %dir.display(), chunks = store.len(), "chunk store loaded");
        Ok(store)
    }

    /// Split `data` into `chunk_size` pieces, store them, and return the
    /// reference list that replaces `data` in a dedup record.
    pub fn store_and_encode(&mut self, data: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut refs = Vec::with_capacity(data.len() / chunk_size.max(1) * CHUNK_REF_LEN + CHUNK_REF_LEN);
        for piece in data.chunks(chunk_size.max(1)) {
            let digest = self.insert(piece);
            refs.extend_from_slice(&digest);
            refs.extend_from_slice(&(piece.len() as u32).to_be_bytes());
        }
        refs
    }
}

fn parse_digest(name: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(name).ok()?;
    bytes.try_into().ok()
}

impl Rehydrator for ChunkStore {
    fn rehydrate(&mut self, record: &Record) -> Result<Vec<u8>, RehydrateError> {
        let refs = &record.payload;
        if refs.len() % CHUNK_REF_LEN != 0 {
            return Err(RehydrateError::Fatal(format!(
                "malformed reference list of {} bytes (file index {})",
                refs.len(),
                record.file_index
            )));
        }
        let mut out = Vec::new();
        for r in refs.chunks_exact(CHUNK_REF_LEN) {
            let mut digest = [0u8; 32];
            digest.copy_from_slice(&r[..32]);
            let len = BigEndian::read_u32(&r[32..]) as usize;
            match self.chunks.get(&digest) {
                Some(chunk) if chunk.len() == len => out.extend_from_slice(chunk),
                Some(chunk) => {
                    return Err(RehydrateError::Recoverable {
                        message: format!("chunk {} is {} bytes, reference says {}", hex::encode(digest), chunk.len(), len),
                        partial: out,
                    });
                }
                None => {
                    return Err(RehydrateError::Recoverable {
                        message: format!("chunk {} not found", hex::encode(digest)),
                        partial: out,
                    });
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamKind, StreamTag};

    fn dedup_record(refs: Vec<u8>) -> Record {
        Record::new(1, StreamTag::new(StreamKind::FileData).with_dedup(), refs)
    }

    #[test]
    fn rebuilds_from_references() {
        let mut store = ChunkStore::new();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 13) as u8).collect();
        let refs = store.store_and_encode(&data, 1024);
        assert_eq!(refs.len(), 10 * CHUNK_REF_LEN);
        assert_eq!(store.rehydrate(&dedup_record(refs)).unwrap(), data);
    }

    #[test]
    fn missing_chunk_is_recoverable_and_truncated() {
        let mut writer = ChunkStore::new();
        let refs = writer.store_and_encode(b"aaaabbbb", 4);
        let mut reader = ChunkStore::new();
        reader.insert(b"aaaa");
        match reader.rehydrate(&dedup_record(refs)) {
            Err(RehydrateError::Recoverable { partial, .. }) => assert_eq!(partial, b"aaaa"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ragged_reference_list_is_fatal() {
        let mut store = ChunkStore::new();
        assert!(matches!(store.rehydrate(&dedup_record(vec![0u8; 40])), Err(RehydrateError::Fatal(_))));
        assert!(matches!(NoRehydration.rehydrate(&dedup_record(vec![])), Err(RehydrateError::Fatal(_))));
    }

    #[test]
    fn load_dir_checks_names() {
        let dir = tempfile::tempdir().unwrap();
        let good = blake3::hash(b"chunk one");
        std::fs::write(dir.path().join(good.to_hex().as_str()), b"chunk one").unwrap();
        let liar = blake3::hash(b"something else");
        std::fs::write(dir.path().join(liar.to_hex().as_str()), b"chunk two").unwrap();
        std::fs::write(dir.path().join("README"), b"ignored").unwrap();

        let store = ChunkStore::load_dir(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
    }
}
