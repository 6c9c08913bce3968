//! Record and file selection.
//!
//! - [`PathFilter`]: include prefixes and exclude wildcard patterns applied
//!   to file names from attribute records.
//! - [`RecordSelector`]: decides which records of a volume belong to the job.
//!   [`Bootstrap`] selects by session and file index range.

use std::fs;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::Record;

// ── PathFilter ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PathFilter {
    includes: Vec<String>,
    excludes: GlobSet,
    patterns: usize,
}

impl Default for PathFilter {
    fn default() -> Self {
        Self { includes: Vec::new(), excludes: GlobSet::empty(), patterns: 0 }
    }
}

impl PathFilter {
    pub fn new(includes: Vec<String>, excludes: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in excludes {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::Config(format!("exclude pattern {pattern:?}: {e}")))?;
            builder.add(glob);
        }
        let excludes_set = builder
            .build()
            .map_err(|e| Error::Config(format!("exclude patterns: {e}")))?;
        let includes = includes
            .into_iter()
            .map(|p| if p.len() > 1 { p.trim_end_matches('/').to_string() } else { p })
            .collect();
        Ok(Self { includes, excludes: excludes_set, patterns: excludes.len() })
    }

    /// Build from list files: one entry per line, blank lines and `#`
    /// comments skipped.
    pub fn from_lists(include_list: Option<&Path>, exclude_list: Option<&Path>) -> Result<Self> {
        let includes = match include_list {
            Some(p) => read_list(p)?,
            None    => Vec::new(),
        };
        let excludes = match exclude_list {
            Some(p) => read_list(p)?,
            None    => Vec::new(),
        };
        Self::new(includes, &excludes)
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.patterns == 0
    }

    /// No include list means everything is included.
    pub fn is_included(&self, fname: &str) -> bool {
        if self.includes.is_empty() {
            return true;
        }
        let trimmed = if fname.len() > 1 { fname.trim_end_matches('/') } else { fname };
        if self.includes.iter().any(|inc| inc == trimmed || inc == "/") {
            return true;
        }
        let mut current = trimmed;
        while let Some(slash) = current.rfind('/') {
            current = &current[..slash];
            if self.includes.iter().any(|inc| inc == current) {
                return true;
            }
        }
        false
    }

    /// Patterns match the whole path or its last component.
    pub fn is_excluded(&self, fname: &str) -> bool {
        if self.patterns == 0 {
            return false;
        }
        let trimmed = fname.trim_end_matches('/');
        let base = trimmed.rsplit('/').next().unwrap_or(trimmed);
        self.excludes.is_match(trimmed) || self.excludes.is_match(base)
    }

    pub fn accepts(&self, fname: &str) -> bool {
        self.is_included(fname) && !self.is_excluded(fname)
    }
}

fn read_list(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}

// ── Record selection ─────────────────────────────────────────────────────────

pub trait RecordSelector {
    fn accept(&self, record: &Record) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl RecordSelector for AcceptAll {
    fn accept(&self, _record: &Record) -> bool {
        true
    }
}

/// One selected session, optionally narrowed to file index ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSelection {
    pub session_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_time: Option<u32>,
    /// Inclusive `[first, last]` ranges; empty selects every file.
    #[serde(default)]
    pub file_indexes: Vec<(i32, i32)>,
}

impl SessionSelection {
    fn matches(&self, record: &Record) -> bool {
        if record.session_id != self.session_id {
            return false;
        }
        if self.session_time.is_some_and(|t| t != record.session_time) {
            return false;
        }
        self.file_indexes.is_empty()
            || self
                .file_indexes
                .iter()
                .any(|(first, last)| (*first..=*last).contains(&record.file_index))
    }
}

/// Job selection file: which volumes to read and which records to keep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootstrap {
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub sessions: Vec<SessionSelection>,
}

impl Bootstrap {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

impl RecordSelector for Bootstrap {
    /// Labels always pass; no sessions selects everything.
    fn accept(&self, record: &Record) -> bool {
        record.is_label() || self.sessions.is_empty() || self.sessions.iter().any(|s| s.matches(record))
    }
}
