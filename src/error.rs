//! Job-level error type.
//!
//! Every module has its own `thiserror` enum; [`Error`] aggregates them so
//! the pipelines can propagate with `?`.  [`Error::scope`] tells the
//! pipelines how far a failure reaches:
//!
//! - `Record`: one record is bad; counted, the job goes on.
//! - `Block`: one block (or the record spanning it) is lost; the job goes on
//!   only when proceeding despite errors.
//! - `Job`: nothing after this can be trusted; the job stops.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::attr::AttrError;
use crate::block::CorruptHeader;
use crate::codec::CodecError;
use crate::context::Summary;
use crate::crypto::CryptoError;
use crate::dedup::RehydrateError;
use crate::record::RecordError;
use crate::stream::StreamTag;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Corrupt block: {0}")]
    CorruptHeader(#[from] CorruptHeader),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("{0}")]
    Rehydration(#[from] RehydrateError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Attribute error: {0}")]
    Attributes(#[from] AttrError),

    #[error("Payload of {len} bytes too short for stream {stream}")]
    ShortPayload { stream: StreamTag, len: usize },

    #[error("Write error on {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("Seek error on {} at {offset}: {source}", path.display())]
    Seek { path: PathBuf, offset: u64, source: io::Error },

    #[error("Device error: {0}")]
    Device(#[from] io::Error),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Record,
    Block,
    Job,
}

impl Error {
    pub fn scope(&self) -> ErrorScope {
        match self {
            Error::Codec(_) | Error::ShortPayload { .. } => ErrorScope::Record,
            Error::CorruptHeader(_) | Error::Record(_) | Error::Crypto(_) => ErrorScope::Block,
            Error::Rehydration(_)
            | Error::Attributes(_)
            | Error::Write { .. }
            | Error::Seek { .. }
            | Error::Device(_)
            | Error::Catalog(_)
            | Error::Config(_) => ErrorScope::Job,
        }
    }
}

/// Failure of a whole pipeline run, with everything counted up to it.
#[derive(Debug)]
pub struct Aborted {
    pub summary: Summary,
    pub source:  Error,
}

impl fmt::Display for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} after {} files, {} records: {}",
            self.summary.status, self.summary.files, self.summary.records, self.source
        )
    }
}

impl std::error::Error for Aborted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
