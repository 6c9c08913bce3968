//! Migration: copy the records of one volume onto another under a new
//! session.
//!
//! Label records are never copied.  Every other record is re-packed as is,
//! compressed or dedup payloads included, so nothing is decoded on the way
//! except the attribute and digest records reported to the [`Catalog`].

use std::io::{self, Write};
use std::mem;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::attr::Attributes;
use crate::context::{CancelToken, JobOptions, JobStatus, PipelineContext, Summary};
use crate::crypto::VolumeKey;
use crate::device::{BlockSink, BlockSource};
use crate::error::{Aborted, Error, ErrorScope, Result};
use crate::filter::{AcceptAll, RecordSelector};
use crate::io_stream::{VolumeReader, VolumeWriter};
use crate::record::Record;

// ── Catalog ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogEntry {
    File {
        session_id:   u32,
        session_time: u32,
        file_index:   i32,
        attributes:   Attributes,
    },
    Digest {
        session_id:   u32,
        session_time: u32,
        file_index:   i32,
        algorithm:    String,
        digest:       String,
    },
}

impl CatalogEntry {
    /// `None` for records that are neither attributes nor digests.
    pub fn from_record(record: &Record) -> Result<Option<Self>> {
        if record.stream.is_attributes() {
            let attributes = Attributes::decode(&record.payload)?;
            return Ok(Some(CatalogEntry::File {
                session_id:   record.session_id,
                session_time: record.session_time,
                file_index:   record.file_index,
                attributes,
            }));
        }
        if record.stream.is_digest() {
            return Ok(Some(CatalogEntry::Digest {
                session_id:   record.session_id,
                session_time: record.session_time,
                file_index:   record.file_index,
                algorithm:    record.stream.to_string(),
                digest:       hex::encode(&record.payload),
            }));
        }
        Ok(None)
    }
}

pub trait Catalog {
    fn insert(&mut self, entry: &CatalogEntry) -> io::Result<()>;
    /// Called once after the last entry of a successful job.
    fn commit(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullCatalog;

impl Catalog for NullCatalog {
    fn insert(&mut self, _entry: &CatalogEntry) -> io::Result<()> {
        Ok(())
    }
}

/// One JSON object per line.
pub struct JsonLinesCatalog<W: Write> {
    out:     W,
    entries: u64,
}

impl<W: Write> JsonLinesCatalog<W> {
    pub fn new(out: W) -> Self {
        Self { out, entries: 0 }
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Catalog for JsonLinesCatalog<W> {
    fn insert(&mut self, entry: &CatalogEntry) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, entry)?;
        self.out.write_all(b"\n")?;
        self.entries += 1;
        Ok(())
    }

    fn commit(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewSession {
    pub session_id:   u32,
    pub session_time: u32,
}

enum LoopEnd {
    Done,
    Canceled,
}

pub struct MigrationPipeline {
    ctx:        PipelineContext,
    catalog:    Box<dyn Catalog>,
    selector:   Box<dyn RecordSelector>,
    spool:      Vec<CatalogEntry>,
    source_key: Option<VolumeKey>,
    dest_key:   Option<VolumeKey>,
}

impl MigrationPipeline {
    pub fn new(options: JobOptions) -> Self {
        Self {
            ctx: PipelineContext::new(options),
            catalog: Box::new(NullCatalog),
            selector: Box::new(AcceptAll),
            spool: Vec::new(),
            source_key: None,
            dest_key: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Box<dyn Catalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_selector(mut self, selector: Box<dyn RecordSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_source_key(mut self, key: VolumeKey) -> Self {
        self.source_key = Some(key);
        self
    }

    pub fn with_dest_key(mut self, key: VolumeKey) -> Self {
        self.dest_key = Some(key);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.ctx.cancel = cancel;
        self
    }

    pub fn run<S: BlockSource, K: BlockSink>(
        mut self,
        source:      S,
        destination: K,
        session:     NewSession,
    ) -> std::result::Result<Summary, Aborted> {
        let opts = &self.ctx.options;
        let mut reader = VolumeReader::with_options(source, opts.verify_checksums, self.source_key.clone());
        let mut writer = VolumeWriter::with_options(
            destination,
            opts.block_size,
            session.session_id,
            session.session_time,
            opts.block_checksums,
            self.dest_key.clone(),
        );
        info!(
            session_id = session.session_id,
            session_time = session.session_time,
            "copying to new session"
        );

        let outcome = self.copy_loop(&mut reader, &mut writer, session);
        if let Err(e) = &outcome {
            error!(record = self.ctx.counters.records, block = ?reader.current_block(), "copy stopped: {e}");
        }

        let flushed = if outcome.is_ok() || writer.sink().can_write() {
            writer.flush_block()
        } else {
            Ok(())
        };
        let src_released = reader.source_mut().release().map_err(Error::from);
        let dst_released = writer.sink_mut().release().map_err(Error::from);

        self.ctx.counters.blocks         = reader.stats.blocks;
        self.ctx.counters.corrupt_blocks = reader.stats.corrupt_blocks;
        debug!(blocks_written = writer.blocks_written, bytes_written = writer.bytes_written, "destination closed");

        let result = outcome
            .and_then(|end| flushed.map(|_| end))
            .and_then(|end| src_released.map(|_| end))
            .and_then(|end| dst_released.map(|_| end));

        let result = match result {
            Ok(LoopEnd::Done) => self.commit_catalog().map(|_| JobStatus::Terminated),
            Ok(LoopEnd::Canceled) => {
                self.discard_spool();
                Ok(JobStatus::Canceled)
            }
            Err(e) => {
                self.discard_spool();
                Err(e)
            }
        };
        match result {
            Ok(status) => Ok(self.ctx.summary(status)),
            Err(source) => Err(Aborted { summary: self.ctx.summary(JobStatus::Failed), source }),
        }
    }

    fn copy_loop<S: BlockSource, K: BlockSink>(
        &mut self,
        reader:  &mut VolumeReader<S>,
        writer:  &mut VolumeWriter<K>,
        session: NewSession,
    ) -> Result<LoopEnd> {
        loop {
            if self.ctx.is_canceled() {
                info!(records = self.ctx.counters.records, "copy canceled");
                return Ok(LoopEnd::Canceled);
            }
            let mut record = match reader.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(LoopEnd::Done),
                Err(e) if e.scope() == ErrorScope::Block => {
                    self.ctx.counters.errors += 1;
                    if !self.ctx.forge_on() {
                        return Err(e);
                    }
                    warn!("{e}; continuing");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if record.file_index < 0 {
                self.ctx.counters.labels += 1;
                continue;
            }
            if !self.selector.accept(&record) {
                continue;
            }
            self.ctx.note_record();

            record.session_id   = session.session_id;
            record.session_time = session.session_time;
            self.catalog_record(&record)?;

            self.ctx.counters.bytes += record.payload.len() as u64;
            writer.write_record(&mut record)?;
        }
    }

    fn catalog_record(&mut self, record: &Record) -> Result<()> {
        let entry = match CatalogEntry::from_record(record) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(()),
            Err(e) => {
                // The record is still copied; only its catalog entry is lost.
                self.ctx.counters.errors += 1;
                warn!(file_index = record.file_index, stream = %record.stream, "no catalog entry: {e}");
                return Ok(());
            }
        };
        if matches!(entry, CatalogEntry::File { .. }) {
            self.ctx.counters.files += 1;
        }
        if self.ctx.options.spool_attributes {
            self.spool.push(entry);
            return Ok(());
        }
        self.catalog.insert(&entry).map_err(|e| Error::Catalog(e.to_string()))
    }

    fn commit_catalog(&mut self) -> Result<()> {
        for entry in mem::take(&mut self.spool) {
            self.catalog.insert(&entry).map_err(|e| Error::Catalog(e.to_string()))?;
        }
        self.catalog.commit().map_err(|e| Error::Catalog(e.to_string()))
    }

    fn discard_spool(&mut self) {
        if !self.spool.is_empty() {
            info!(entries = self.spool.len(), "discarding spooled catalog entries");
            self.spool.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{StatInfo, FT_REG};
    use crate::device::MemoryVolume;
    use crate::filter::{Bootstrap, SessionSelection};
    use crate::record::{RecordError, PRE_LABEL};
    use crate::stream::StreamKind;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn attrs(fi: i32, fname: &str) -> Vec<u8> {
        Attributes {
            file_index: fi,
            file_type: FT_REG,
            fname: fname.into(),
            stat: StatInfo { mode: 0o100644, size: 3, ..Default::default() },
            link: String::new(),
            attr_ex: String::new(),
            delta_seq: 0,
        }
        .encode()
    }

    fn source() -> MemoryVolume {
        let mut w = VolumeWriter::new(MemoryVolume::new("src"), 512, 7, 100);
        let records = vec![
            Record::new(PRE_LABEL, StreamKind::UnixAttributes, b"label".to_vec()),
            Record::new(1, StreamKind::UnixAttributes, attrs(1, "/a")),
            Record::new(1, StreamKind::FileData, vec![1u8; 2000]),
            Record::new(1, StreamKind::Md5Digest, vec![0xAB; 16]),
            Record::new(2, StreamKind::UnixAttributes, attrs(2, "/b")),
            Record::new(2, StreamKind::FileData, b"abc".to_vec()),
        ];
        for mut r in records {
            w.write_record(&mut r).unwrap();
        }
        w.flush_block().unwrap();
        w.into_sink()
    }

    fn read_all(vol: MemoryVolume) -> Vec<Record> {
        let mut reader = VolumeReader::new(MemoryVolume::from_blocks("dst", vol.into_blocks()));
        let mut out = Vec::new();
        while let Some(r) = reader.next_record().unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn labels_dropped_and_session_rewritten() {
        let mut dest = MemoryVolume::new("dst");
        let session = NewSession { session_id: 42, session_time: 4242 };
        let summary = MigrationPipeline::new(JobOptions::default())
            .run(source(), &mut dest, session)
            .unwrap();
        assert_eq!(summary.status, JobStatus::Terminated);
        assert_eq!(summary.records, 5);
        assert_eq!(summary.files, 2);
        assert!(dest.is_released());

        let copied = read_all(dest);
        assert_eq!(copied.len(), 5);
        assert!(copied.iter().all(|r| r.file_index >= 0));
        assert!(copied.iter().all(|r| r.session_id == 42 && r.session_time == 4242));
        assert_eq!(copied[1].payload, vec![1u8; 2000]);
    }

    #[test]
    fn catalog_gets_attributes_and_digests() {
        let out = Shared::default();
        let mut dest = MemoryVolume::new("dst");
        MigrationPipeline::new(JobOptions::default())
            .with_catalog(Box::new(JsonLinesCatalog::new(out.clone())))
            .run(source(), &mut dest, NewSession { session_id: 1, session_time: 1 })
            .unwrap();

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "file");
        assert_eq!(lines[0]["attributes"]["fname"], "/a");
        assert_eq!(lines[1]["kind"], "digest");
        assert_eq!(lines[1]["algorithm"], "MD5");
    }

    #[test]
    fn spooled_entries_discarded_on_failure() {
        let out = Shared::default();
        let mut dest = MemoryVolume::new("dst");
        dest.set_writable(false);
        let opts = JobOptions { spool_attributes: true, ..Default::default() };
        let aborted = MigrationPipeline::new(opts)
            .with_catalog(Box::new(JsonLinesCatalog::new(out.clone())))
            .run(source(), &mut dest, NewSession { session_id: 1, session_time: 1 })
            .unwrap_err();
        assert_eq!(aborted.summary.status, JobStatus::Failed);
        assert!(matches!(aborted.source, Error::Write { .. }));
        assert!(out.0.lock().unwrap().is_empty());
    }

    /// Cancels the job when it first sees `file_index`, letting that record through.
    struct CancelAt {
        token:      CancelToken,
        file_index: i32,
    }

    impl RecordSelector for CancelAt {
        fn accept(&self, record: &Record) -> bool {
            if record.file_index == self.file_index {
                self.token.cancel();
            }
            true
        }
    }

    /// One 100-byte data record per block.
    fn one_record_per_block(n: i32) -> Vec<Vec<u8>> {
        let mut w = VolumeWriter::new(MemoryVolume::new("src"), 512, 7, 100);
        for fi in 1..=n {
            w.write_record(&mut Record::new(fi, StreamKind::FileData, vec![fi as u8; 100])).unwrap();
            w.flush_block().unwrap();
        }
        w.into_sink().into_blocks()
    }

    #[test]
    fn bootstrap_limits_copied_files() {
        let bsr = Bootstrap {
            volumes:  Vec::new(),
            sessions: vec![SessionSelection { session_id: 7, session_time: None, file_indexes: vec![(2, 2)] }],
        };
        let mut dest = MemoryVolume::new("dst");
        let summary = MigrationPipeline::new(JobOptions::default())
            .with_selector(Box::new(bsr))
            .run(source(), &mut dest, NewSession { session_id: 8, session_time: 800 })
            .unwrap();
        assert_eq!(summary.status, JobStatus::Terminated);
        assert_eq!(summary.records, 2);
        assert_eq!(summary.files, 1);

        let copied = read_all(dest);
        assert_eq!(copied.len(), 2);
        assert!(copied.iter().all(|r| r.file_index == 2 && r.session_id == 8));
        assert_eq!(copied[1].payload, b"abc");
    }

    #[test]
    fn bootstrap_for_another_session_copies_nothing() {
        let bsr = Bootstrap {
            volumes:  Vec::new(),
            sessions: vec![SessionSelection { session_id: 99, session_time: None, file_indexes: Vec::new() }],
        };
        let mut dest = MemoryVolume::new("dst");
        let summary = MigrationPipeline::new(JobOptions::default())
            .with_selector(Box::new(bsr))
            .run(source(), &mut dest, NewSession { session_id: 8, session_time: 800 })
            .unwrap();
        assert_eq!(summary.records, 0);
        assert!(dest.blocks().is_empty());
    }

    #[test]
    fn cancel_flushes_copied_records_and_drops_spool() {
        let out = Shared::default();
        let token = CancelToken::new();
        let mut dest = MemoryVolume::new("dst");
        let opts = JobOptions { spool_attributes: true, ..Default::default() };
        let summary = MigrationPipeline::new(opts)
            .with_catalog(Box::new(JsonLinesCatalog::new(out.clone())))
            .with_selector(Box::new(CancelAt { token: token.clone(), file_index: 2 }))
            .with_cancel(token)
            .run(source(), &mut dest, NewSession { session_id: 1, session_time: 1 })
            .unwrap();

        assert_eq!(summary.status, JobStatus::Canceled);
        assert_eq!(summary.records, 4);
        assert!(dest.is_released());
        assert!(out.0.lock().unwrap().is_empty());

        let copied = read_all(dest);
        assert_eq!(copied.len(), 4);
        assert_eq!(copied[3].file_index, 2);
        assert!(copied[3].stream.is_attributes());
    }

    #[test]
    fn read_error_flushes_writable_destination() {
        let mut blocks = one_record_per_block(6);
        let last = blocks[3].len() - 1;
        blocks[3][last] ^= 0x40;
        let mut src  = MemoryVolume::from_blocks("src", blocks);
        let mut dest = MemoryVolume::new("dst");

        let aborted = MigrationPipeline::new(JobOptions::default())
            .run(&mut src, &mut dest, NewSession { session_id: 1, session_time: 1 })
            .unwrap_err();
        assert_eq!(aborted.summary.status, JobStatus::Failed);
        assert_eq!(aborted.source.scope(), ErrorScope::Block);
        assert_eq!(aborted.summary.errors, 1);
        assert!(src.is_released());
        assert!(dest.is_released());

        let copied = read_all(dest);
        let indexes: Vec<i32> = copied.iter().map(|r| r.file_index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    /// Block 0 of a split record followed by block 1 of a different one.
    fn spliced_continuation() -> MemoryVolume {
        let mut a = VolumeWriter::new(MemoryVolume::new("a"), 512, 7, 100);
        a.write_record(&mut Record::new(1, StreamKind::FileData, vec![1u8; 1000])).unwrap();
        a.flush_block().unwrap();
        let a = a.into_sink().into_blocks();

        let mut b = VolumeWriter::new(MemoryVolume::new("b"), 512, 7, 100);
        b.write_record(&mut Record::new(2, StreamKind::FileData, vec![2u8; 1000])).unwrap();
        b.write_record(&mut Record::new(3, StreamKind::FileData, b"tail".to_vec())).unwrap();
        b.flush_block().unwrap();
        let b = b.into_sink().into_blocks();
        assert!(a.len() >= 2 && b.len() >= 2);

        let mut blocks = vec![a[0].clone()];
        blocks.extend(b[1..].iter().cloned());
        MemoryVolume::from_blocks("spliced", blocks)
    }

    #[test]
    fn broken_continuation_skipped_with_forge_on() {
        let mut dest = MemoryVolume::new("dst");
        let opts = JobOptions { forge_on: true, ..Default::default() };
        let summary = MigrationPipeline::new(opts)
            .run(spliced_continuation(), &mut dest, NewSession { session_id: 1, session_time: 1 })
            .unwrap();
        assert_eq!(summary.status, JobStatus::Terminated);
        assert_eq!(summary.errors, 1);

        let copied = read_all(dest);
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].file_index, 3);
        assert_eq!(copied[0].payload, b"tail");
    }

    #[test]
    fn broken_continuation_stops_strict_copy() {
        let mut dest = MemoryVolume::new("dst");
        let aborted = MigrationPipeline::new(JobOptions::default())
            .run(spliced_continuation(), &mut dest, NewSession { session_id: 1, session_time: 1 })
            .unwrap_err();
        assert_eq!(aborted.summary.status, JobStatus::Failed);
        assert!(matches!(aborted.source, Error::Record(RecordError::BrokenContinuation { .. })));
        assert!(dest.is_released());
    }
}
