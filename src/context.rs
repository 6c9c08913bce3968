//! Job configuration and per-run state.
//!
//! ## JobOptions
//!
//! - **forge_on**: proceed despite block-level errors (default: false)
//! - **skip_extract**: decode everything, write nothing (default: false)
//! - **verify_checksums**: verify block checksums on read (default: true)
//! - **decompress_cap**: largest scratch buffer a decompressor may use (default: 10,000,000)
//! - **scratch_initial**: initial scratch buffer size (default: 70,000)
//! - **block_size**: block size on write and in fixed-block mode (default: 64,512)
//! - **block_checksums**: checksum written blocks (default: true)
//! - **spool_attributes**: spool catalog updates until the job ends (default: false)
//! - **progress_interval**: records between progress lines (default: 200,000)
//!
//! Options are read from a JSON file and then overridden from the command line.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::block::{BLKHDR_MIN_LENGTH, DEFAULT_BLOCK_SIZE, MAX_BLOCK_LENGTH, WRITE_BLKHDR_LENGTH};
use crate::codec::{DEFAULT_DECOMPRESS_CAP, DEFAULT_SCRATCH_INITIAL};
use crate::error::{Error, Result};
use crate::record::WRITE_RECHDR_LENGTH;

// ── JobOptions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub forge_on: bool,

    #[serde(default)]
    pub skip_extract: bool,

    /// 0 = warnings, 1 = info, 2+ = debug
    #[serde(default)]
    pub verbose: u8,

    /// Volumes to read, in order
    #[serde(default)]
    pub volume_names: Vec<String>,

    #[serde(default = "default_true")]
    pub verify_checksums: bool,

    #[serde(default = "default_decompress_cap")]
    pub decompress_cap: usize,

    #[serde(default = "default_scratch_initial")]
    pub scratch_initial: usize,

    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default = "default_true")]
    pub block_checksums: bool,

    #[serde(default)]
    pub spool_attributes: bool,

    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

fn default_true() -> bool {
    true
}

fn default_decompress_cap() -> usize {
    DEFAULT_DECOMPRESS_CAP
}

fn default_scratch_initial() -> usize {
    DEFAULT_SCRATCH_INITIAL
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_progress_interval() -> u64 {
    200_000
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            forge_on:          false,
            skip_extract:      false,
            verbose:           0,
            volume_names:      Vec::new(),
            verify_checksums:  true,
            decompress_cap:    default_decompress_cap(),
            scratch_initial:   default_scratch_initial(),
            block_size:        default_block_size(),
            block_checksums:   true,
            spool_attributes:  false,
            progress_interval: default_progress_interval(),
        }
    }
}

impl JobOptions {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let opts: JobOptions = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        let min_block = WRITE_BLKHDR_LENGTH + WRITE_RECHDR_LENGTH + 1;
        if self.block_size < min_block.max(BLKHDR_MIN_LENGTH) || self.block_size > MAX_BLOCK_LENGTH {
            return Err(Error::Config(format!(
                "block_size {} outside [{min_block}, {MAX_BLOCK_LENGTH}]",
                self.block_size
            )));
        }
        if self.decompress_cap == 0 || self.scratch_initial == 0 {
            return Err(Error::Config("decompression buffer sizes must be non-zero".into()));
        }
        if self.scratch_initial > self.decompress_cap {
            return Err(Error::Config(format!(
                "scratch_initial {} exceeds decompress_cap {}",
                self.scratch_initial, self.decompress_cap
            )));
        }
        Ok(())
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cooperative cancellation flag, checked between records.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Counters and summary ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub files:          u64,
    pub records:        u64,
    pub errors:         u64,
    pub blocks:         u64,
    pub corrupt_blocks: u64,
    pub bytes:          u64,
    pub seeks:          u64,
    pub labels:         u64,
    pub unsupported:    u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Terminated,
    Canceled,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Terminated => "terminated",
            JobStatus::Canceled   => "canceled",
            JobStatus::Failed     => "failed",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub status:         JobStatus,
    pub files:          u64,
    pub records:        u64,
    pub errors:         u64,
    pub blocks:         u64,
    pub corrupt_blocks: u64,
    pub bytes:          u64,
    pub seeks:          u64,
    pub started:        DateTime<Utc>,
    pub elapsed_ms:     u64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Status:          {}", self.status)?;
        writeln!(f, "Started:         {}", self.started.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "Files:           {}", self.files)?;
        writeln!(f, "Records:         {}", self.records)?;
        writeln!(f, "Blocks:          {} ({} corrupt)", self.blocks, self.corrupt_blocks)?;
        writeln!(f, "Bytes:           {}", self.bytes)?;
        writeln!(f, "Errors:          {}", self.errors)?;
        write!(f,   "Elapsed:         {:.3}s", self.elapsed_ms as f64 / 1000.0)
    }
}

// ── PipelineContext ──────────────────────────────────────────────────────────

/// State threaded through one pipeline run.
#[derive(Debug)]
pub struct PipelineContext {
    pub options:  JobOptions,
    pub cancel:   CancelToken,
    pub counters: Counters,
    started:      DateTime<Utc>,
    clock:        Instant,
}

impl PipelineContext {
    pub fn new(options: JobOptions) -> Self {
        Self::with_cancel(options, CancelToken::new())
    }

    pub fn with_cancel(options: JobOptions, cancel: CancelToken) -> Self {
        Self {
            options,
            cancel,
            counters: Counters::default(),
            started:  Utc::now(),
            clock:    Instant::now(),
        }
    }

    #[inline]
    pub fn forge_on(&self) -> bool {
        self.options.forge_on
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Count one record and log a progress line every `progress_interval`.
    pub fn note_record(&mut self) {
        self.counters.records += 1;
        let every = self.options.progress_interval;
        if every > 0 && self.counters.records % every == 0 {
            info!(
                records = self.counters.records,
                files = self.counters.files,
                errors = self.counters.errors,
                "progress"
            );
        }
    }

    pub fn summary(&self, status: JobStatus) -> Summary {
        let c = &self.counters;
        Summary {
            status,
            files:          c.files,
            records:        c.records,
            errors:         c.errors,
            blocks:         c.blocks,
            corrupt_blocks: c.corrupt_blocks,
            bytes:          c.bytes,
            seeks:          c.seeks,
            started:        self.started,
            elapsed_ms:     self.clock.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_takes_defaults() {
        let opts: JobOptions = serde_json::from_str(r#"{ "forge_on": true, "block_size": 4096 }"#).unwrap();
        assert!(opts.forge_on);
        assert_eq!(opts.block_size, 4096);
        assert!(opts.verify_checksums);
        assert_eq!(opts.decompress_cap, 10_000_000);
        assert_eq!(opts.scratch_initial, 70_000);
        opts.validate().unwrap();
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, r#"{ "skip_extract": true, "volume_names": ["a", "b"] }"#).unwrap();
        let opts = JobOptions::load(&path).unwrap();
        assert!(opts.skip_extract);
        assert_eq!(opts.volume_names, vec!["a", "b"]);

        std::fs::write(&path, r#"{ "block_size": 10 }"#).unwrap();
        assert!(matches!(JobOptions::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn cancel_is_shared() {
        let token = CancelToken::new();
        let ctx = PipelineContext::with_cancel(JobOptions::default(), token.clone());
        assert!(!ctx.is_canceled());
        token.cancel();
        assert!(ctx.is_canceled());
    }
}
