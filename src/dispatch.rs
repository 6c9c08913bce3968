//! Stream dispatch: turns one complete record into an [`Action`].
//!
//! The masked stream type selects a handler from a fixed table.  Two modifier
//! bits are checked before the lookup: dedup data is rehydrated first, and
//! offset-bearing payloads have their 8-byte file address split off by the
//! data handlers.
//!
//! Record-scoped failures (bad compression, short payloads) never escape as
//! errors: they come back as [`Action::Error`] and are counted in
//! [`DispatchStats::errors`].  Damaged dedup data is tolerated only under
//! forge_on, where the recovered part of the payload stands in for it.

use std::collections::{HashMap, HashSet};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, error, info, warn};

use crate::attr::{AttributeUnpacker, Attributes, UnixAttributes};
use crate::codec::{inflate, unwrap_container, ScratchBuffer};
use crate::context::JobOptions;
use crate::dedup::{NoRehydration, RehydrateError, Rehydrator};
use crate::error::{Error, ErrorScope, Result};
use crate::record::Record;
use crate::stream::{StreamKind, StreamTag, OFFSET_FADDR_SIZE, STREAM_BIT_DEDUPLICATION_DATA};

#[derive(Debug)]
pub enum Action {
    StoreAttributes(Attributes),
    /// Write `data` at `offset`, or at the current position when `None`.
    WriteBytes { offset: Option<u64>, data: Vec<u8> },
    Ignore,
    Error(RecordFault),
}

/// A record that could not be decoded.
#[derive(Debug)]
pub struct RecordFault {
    pub file_index:   i32,
    pub stream:       StreamTag,
    pub block_number: u32,
    pub error:        Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub records:     u64,
    pub rehydrated:  u64,
    pub inflated:    u64,
    /// Record-scoped faults, including dedup damage tolerated under forge_on.
    pub errors:      u64,
    pub unsupported: u64,
}

type Handler = fn(&mut StreamDispatcher, &Record) -> Result<Action>;

const DISPATCH_TABLE: &[(StreamKind, Handler)] = &[
    (StreamKind::UnixAttributes,      StreamDispatcher::on_attributes),
    (StreamKind::UnixAttributesEx,    StreamDispatcher::on_attributes),
    (StreamKind::UnixAttributeUpdate, StreamDispatcher::on_attributes),

    (StreamKind::FileData,            StreamDispatcher::on_data),
    (StreamKind::SparseData,          StreamDispatcher::on_data),
    (StreamKind::Win32Data,           StreamDispatcher::on_data),

    (StreamKind::GzipData,            StreamDispatcher::on_gzip),
    (StreamKind::SparseGzipData,      StreamDispatcher::on_gzip),
    (StreamKind::Win32GzipData,       StreamDispatcher::on_gzip),

    (StreamKind::CompressedData,       StreamDispatcher::on_compressed),
    (StreamKind::SparseCompressedData, StreamDispatcher::on_compressed),
    (StreamKind::Win32CompressedData,  StreamDispatcher::on_compressed),

    (StreamKind::Md5Digest,            StreamDispatcher::on_ignore),
    (StreamKind::Sha1Digest,           StreamDispatcher::on_ignore),
    (StreamKind::Sha256Digest,         StreamDispatcher::on_ignore),
    (StreamKind::Sha512Digest,         StreamDispatcher::on_ignore),
    (StreamKind::SignedDigest,         StreamDispatcher::on_ignore),
    (StreamKind::EncryptedSessionData, StreamDispatcher::on_ignore),
    (StreamKind::PluginName,           StreamDispatcher::on_ignore),
    (StreamKind::RestoreObject,        StreamDispatcher::on_ignore),
    (StreamKind::PluginObject,         StreamDispatcher::on_ignore),
    (StreamKind::PluginMetaBlob,       StreamDispatcher::on_ignore),
    (StreamKind::PluginMetaCatalog,    StreamDispatcher::on_ignore),

    (StreamKind::ProgramNames,         StreamDispatcher::on_program),
    (StreamKind::ProgramData,          StreamDispatcher::on_program),
];

pub struct StreamDispatcher {
    handlers:   HashMap<i32, Handler>,
    rehydrator: Box<dyn Rehydrator>,
    unpacker:   Box<dyn AttributeUnpacker>,
    scratch:    ScratchBuffer,
    forge_on:   bool,
    /// Stream types already reported as unsupported in this job.
    reported:   HashSet<i32>,
    program_noted: bool,
    pub stats:  DispatchStats,
}

impl StreamDispatcher {
    pub fn new(options: &JobOptions) -> Self {
        Self::with_collaborators(options, Box::new(NoRehydration), Box::new(UnixAttributes))
    }

    pub fn with_collaborators(
        options:    &JobOptions,
        rehydrator: Box<dyn Rehydrator>,
        unpacker:   Box<dyn AttributeUnpacker>,
    ) -> Self {
        let handlers = DISPATCH_TABLE.iter().map(|(kind, h)| (*kind as i32, *h)).collect();
        Self {
            handlers,
            rehydrator,
            unpacker,
            scratch: ScratchBuffer::new(options.scratch_initial, options.decompress_cap),
            forge_on: options.forge_on,
            reported: HashSet::new(),
            program_noted: false,
            stats: DispatchStats::default(),
        }
    }

    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }

    /// Decode one complete record.
    ///
    /// `Err` is reserved for failures that end the job: rehydration errors
    /// (damaged dedup data included, unless under forge_on) and undecodable
    /// attribute records.
    pub fn dispatch(&mut self, mut record: Record) -> Result<Action> {
        self.stats.records += 1;

        if record.stream.is_dedup() {
            self.rehydrate(&mut record)?;
        }

        let handler = self.handlers.get(&record.stream.masked()).copied();
        let result = match handler {
            Some(handler) => handler(self, &record),
            None => Ok(self.unsupported(&record)),
        };

        match result {
            Err(e) if e.scope() == ErrorScope::Record => Ok(self.fault(&record, e)),
            other => other,
        }
    }

    fn rehydrate(&mut self, record: &mut Record) -> Result<()> {
        let data = match self.rehydrator.rehydrate(record) {
            Ok(data) => data,
            Err(RehydrateError::Recoverable { message, partial }) if self.forge_on => {
                self.stats.errors += 1;
                warn!(
                    file_index = record.file_index,
                    stream = %record.stream,
                    block = record.block_number,
                    "rehydration error, keeping {} recovered bytes: {message}",
                    partial.len()
                );
                partial
            }
            Err(e) => {
                if let RehydrateError::Recoverable { .. } = &e {
                    self.stats.errors += 1;
                }
                error!(file_index = record.file_index, stream = %record.stream, block = record.block_number, "{e}");
                return Err(e.into());
            }
        };
        self.stats.rehydrated += 1;
        record.payload = data;
        record.stream = StreamTag(record.stream.0 & !STREAM_BIT_DEDUPLICATION_DATA);
        Ok(())
    }

    fn fault(&mut self, record: &Record, error: Error) -> Action {
        self.stats.errors += 1;
        warn!(
            file_index = record.file_index,
            stream = %record.stream,
            block = record.block_number,
            "{error}"
        );
        Action::Error(RecordFault {
            file_index:   record.file_index,
            stream:       record.stream,
            block_number: record.block_number,
            error,
        })
    }

    fn unsupported(&mut self, record: &Record) -> Action {
        self.stats.unsupported += 1;
        if self.reported.insert(record.stream.masked()) {
            warn!(stream = %record.stream, file_index = record.file_index, "stream type not supported, ignored");
        }
        Action::Ignore
    }

    // ── Handlers ────────────────────────────────────────────────────────────

    fn on_attributes(&mut self, record: &Record) -> Result<Action> {
        Ok(Action::StoreAttributes(self.unpacker.unpack(record)?))
    }

    fn on_data(&mut self, record: &Record) -> Result<Action> {
        let (offset, data) = split_offset(record)?;
        Ok(Action::WriteBytes { offset, data: data.to_vec() })
    }

    fn on_gzip(&mut self, record: &Record) -> Result<Action> {
        let (offset, body) = split_offset(record)?;
        let data = inflate(body, &mut self.scratch)?.to_vec();
        self.stats.inflated += 1;
        debug!(file_index = record.file_index, packed = body.len(), unpacked = data.len(), "inflated");
        Ok(Action::WriteBytes { offset, data })
    }

    fn on_compressed(&mut self, record: &Record) -> Result<Action> {
        let (offset, body) = split_offset(record)?;
        let data = unwrap_container(body, &mut self.scratch)?.to_vec();
        self.stats.inflated += 1;
        debug!(file_index = record.file_index, packed = body.len(), unpacked = data.len(), "decompressed");
        Ok(Action::WriteBytes { offset, data })
    }

    fn on_ignore(&mut self, _record: &Record) -> Result<Action> {
        Ok(Action::Ignore)
    }

    fn on_program(&mut self, _record: &Record) -> Result<Action> {
        if !self.program_noted {
            self.program_noted = true;
            info!("program name or data stream found, ignored");
        }
        Ok(Action::Ignore)
    }
}

/// Split the file address off an offset-bearing payload.
pub fn split_offset(record: &Record) -> Result<(Option<u64>, &[u8])> {
    if !record.stream.has_offsets() {
        return Ok((None, &record.payload));
    }
    if record.payload.len() < OFFSET_FADDR_SIZE {
        return Err(Error::ShortPayload { stream: record.stream, len: record.payload.len() });
    }
    let (addr, rest) = record.payload.split_at(OFFSET_FADDR_SIZE);
    Ok((Some(BigEndian::read_u64(addr)), rest))
}

/// Build an offset-bearing payload: the big-endian address, then `data`.
pub fn with_offset(offset: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(OFFSET_FADDR_SIZE + data.len());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(data);
    out
}
