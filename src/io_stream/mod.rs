//! Record streams over block devices: writer and reader.
//!
//! # Writer
//! [`VolumeWriter`] packs records into the current block, splitting them
//! across block boundaries, and hands every full block to its sink as a
//! `BB03` block.  With a [`VolumeKey`] the record area of every block that
//! carries file data is sealed; blocks holding only labels stay readable.
//!
//! # Reader
//! [`VolumeReader`] pulls raw blocks from a source, verifies and decrypts
//! them, and reassembles complete records.  Block-level failures are
//! returned as errors without losing the reader's place: the caller decides
//! whether to stop or to call again, which resumes with the next block.

use std::borrow::Cow;

use tracing::{debug, warn};

use crate::block::{Block, BlockOptions, HeaderLayout, BLKHDR_CS64_OFFSET, WRITE_BLKHDR_LENGTH};
use crate::crypto::{block_aad, CryptoError, VolumeKey, SEAL_OVERHEAD};
use crate::device::{BlockSink, BlockSource};
use crate::error::{Error, Result};
use crate::record::{pack, PackOutcome, Record, RecordReader, Unpacked, WRITE_RECHDR_LENGTH};

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct VolumeWriter<K: BlockSink> {
    sink:           K,
    block:          Block,
    key:            Option<VolumeKey>,
    checksums:      bool,
    next_block:     u32,
    pub blocks_written: u64,
    pub bytes_written:  u64,
}

impl<K: BlockSink> VolumeWriter<K> {
    /// `block_size` is the size of a whole serialized block.
    pub fn new(sink: K, block_size: usize, session_id: u32, session_time: u32) -> Self {
        Self::with_options(sink, block_size, session_id, session_time, true, None)
    }

    pub fn with_options(
        sink:         K,
        block_size:   usize,
        session_id:   u32,
        session_time: u32,
        checksums:    bool,
        key:          Option<VolumeKey>,
    ) -> Self {
        let header_len = if checksums { WRITE_BLKHDR_LENGTH } else { BLKHDR_CS64_OFFSET };
        let overhead   = header_len + if key.is_some() { SEAL_OVERHEAD } else { 0 };
        let capacity   = block_size.saturating_sub(overhead).max(WRITE_RECHDR_LENGTH + 1);
        let mut block  = Block::new(capacity, session_id, session_time);
        block.options  = if checksums { BlockOptions::CHECKSUM } else { BlockOptions::empty() };
        Self {
            sink,
            block,
            key,
            checksums,
            next_block: 0,
            blocks_written: 0,
            bytes_written: 0,
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    pub fn into_sink(self) -> K {
        self.sink
    }

    pub fn pending_bytes(&self) -> usize {
        self.block.used_bytes()
    }

    /// Pack a whole record, flushing every block it fills.
    pub fn write_record(&mut self, record: &mut Record) -> Result<()> {
        record.remainder = 0;
        loop {
            match pack(&mut self.block, record) {
                PackOutcome::Fits if record.remainder == 0 => return Ok(()),
                PackOutcome::Fits => self.flush_block()?,
                PackOutcome::BlockFull if self.block.is_empty() => {
                    return Err(Error::Config(format!(
                        "block capacity {} cannot hold a record header",
                        self.block.capacity()
                    )));
                }
                PackOutcome::BlockFull => self.flush_block()?,
            }
        }
    }

    /// Write out the current block if it holds anything.
    pub fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let mut header = self.block.header();
        header.layout = HeaderLayout::V3;
        header.options = if self.checksums { BlockOptions::CHECKSUM } else { BlockOptions::empty() };

        let payload: Cow<'_, [u8]> = match &self.key {
            Some(key) => {
                header.options |= BlockOptions::ENCRYPT_VOL;
                if self.block.holds_only_labels() {
                    Cow::Borrowed(self.block.payload())
                } else {
                    header.options |= BlockOptions::ENCRYPT_BLOCK;
                    let aad = block_aad(header.block_number, header.session_id, header.session_time);
                    Cow::Owned(key.seal(self.block.payload(), &aad)?)
                }
            }
            None => Cow::Borrowed(self.block.payload()),
        };
        let raw = header.encode(&payload);

        self.sink.write_block(&raw).map_err(|source| Error::Write {
            path: self.sink.name().into(),
            source,
        })?;
        debug!(block = header.block_number, len = raw.len(), "block written");
        self.blocks_written += 1;
        self.bytes_written += raw.len() as u64;
        self.next_block = self.next_block.wrapping_add(1);
        self.block.reset(self.next_block);
        Ok(())
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub blocks:          u64,
    pub corrupt_blocks:  u64,
    pub broken_records:  u64,
    pub dropped_partial: u64,
}

pub struct VolumeReader<S: BlockSource> {
    source:  S,
    key:     Option<VolumeKey>,
    verify:  bool,
    current: Option<Block>,
    records: RecordReader,
    last:    Option<(u32, u32)>,
    pub stats: ReaderStats,
}

impl<S: BlockSource> VolumeReader<S> {
    pub fn new(source: S) -> Self {
        Self::with_options(source, true, None)
    }

    pub fn with_options(source: S, verify: bool, key: Option<VolumeKey>) -> Self {
        Self {
            source,
            key,
            verify,
            current: None,
            records: RecordReader::new(),
            last: None,
            stats: ReaderStats::default(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Block number of the block being drained, for diagnostics.
    pub fn current_block(&self) -> Option<u32> {
        self.current.as_ref().map(|b| b.block_number)
    }

    /// Next complete record, `Ok(None)` at end of data.
    ///
    /// Corrupt blocks, undecryptable blocks and broken continuations come
    /// back as errors; the reader stays usable afterwards.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(block) = self.current.as_mut() {
                match self.records.unpack(block) {
                    Ok(Unpacked::Record(record)) => return Ok(Some(record)),
                    Ok(Unpacked::BlockExhausted) => self.current = None,
                    Err(e) => {
                        self.stats.broken_records += 1;
                        return Err(e.into());
                    }
                }
            }

            let Some(raw) = self.source.read_block()? else {
                if self.records.discard_partial() {
                    self.stats.dropped_partial += 1;
                    warn!(device = self.source.name(), "end of data inside a split record");
                }
                return Ok(None);
            };
            self.stats.blocks += 1;

            match self.decode(&raw.bytes, raw.address) {
                Ok(block) => self.current = Some(block),
                Err(e) => {
                    self.stats.corrupt_blocks += 1;
                    if self.records.discard_partial() {
                        self.stats.dropped_partial += 1;
                        warn!(address = raw.address, "split record lost with corrupt block");
                    }
                    return Err(e);
                }
            }
        }
    }

    fn decode(&mut self, bytes: &[u8], address: u64) -> Result<Block> {
        let mut block = Block::from_raw(bytes, address, self.verify)?;

        if block.options.contains(BlockOptions::ENCRYPT_BLOCK) {
            let key = self.key.as_ref().ok_or(CryptoError::MissingKey)?;
            let aad = block_aad(block.block_number, block.session_id, block.session_time);
            let plain = key.open(block.payload(), &aad)?;
            block.set_payload(plain);
        }

        if let Some((session, number)) = self.last {
            if session == block.session_id && block.block_number <= number && block.block_number != 0 {
                warn!(
                    block = block.block_number,
                    previous = number,
                    session = session,
                    "block number did not increase"
                );
            }
        }
        self.last = Some((block.session_id, block.block_number));
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryVolume;
    use crate::record::VOL_LABEL;
    use crate::stream::StreamKind;

    fn records(n: i32, len: usize) -> Vec<Record> {
        (1..=n)
            .map(|fi| Record::new(fi, StreamKind::FileData, vec![fi as u8; len]))
            .collect()
    }

    #[test]
    fn writer_then_reader() {
        let mut w = VolumeWriter::new(MemoryVolume::new("out"), 512, 11, 22);
        for mut rec in records(20, 300) {
            w.write_record(&mut rec).unwrap();
        }
        w.flush_block().unwrap();
        let vol = w.into_sink();
        assert!(vol.blocks().iter().all(|b| b.len() <= 512));

        let mut r = VolumeReader::new(vol);
        let mut seen = 0;
        while let Some(rec) = r.next_record().unwrap() {
            seen += 1;
            assert_eq!(rec.file_index, seen);
            assert_eq!(rec.payload, vec![seen as u8; 300]);
            assert_eq!(rec.session_id, 11);
        }
        assert_eq!(seen, 20);
        assert_eq!(r.stats.corrupt_blocks, 0);
    }

    #[test]
    fn corrupt_block_is_reported_and_skippable() {
        let mut w = VolumeWriter::new(MemoryVolume::new("out"), 256, 1, 1);
        for mut rec in records(6, 200) {
            w.write_record(&mut rec).unwrap();
        }
        w.flush_block().unwrap();
        let mut blocks = w.into_sink().into_blocks();
        let last = blocks[2].len() - 1;
        blocks[2][last] ^= 0x01;

        let mut r = VolumeReader::new(MemoryVolume::from_blocks("in", blocks));
        let mut ok = Vec::new();
        let mut errors = 0;
        loop {
            match r.next_record() {
                Ok(Some(rec)) => ok.push(rec.file_index),
                Ok(None) => break,
                Err(e) => {
                    assert!(matches!(e, Error::CorruptHeader(_)));
                    errors += 1;
                }
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(r.stats.corrupt_blocks, 1);
        assert!(!ok.is_empty() && ok.len() < 6);
    }

    #[test]
    fn encrypted_volume_needs_the_key() {
        let key = VolumeKey::from_bytes([9u8; 32]);
        let mut w = VolumeWriter::with_options(MemoryVolume::new("enc"), 512, 5, 6, true, Some(key.clone()));
        w.write_record(&mut Record::new(VOL_LABEL, StreamKind::UnixAttributes, b"label".to_vec())).unwrap();
        w.flush_block().unwrap();
        w.write_record(&mut Record::new(1, StreamKind::FileData, b"secret bytes".to_vec())).unwrap();
        w.flush_block().unwrap();
        let blocks = w.into_sink().into_blocks();
        assert!(blocks.iter().all(|b| b.len() <= 512));
        assert!(!blocks[1].windows(6).any(|w| w == b"secret"));

        let mut plain = VolumeReader::new(MemoryVolume::from_blocks("in", blocks.clone()));
        assert_eq!(plain.next_record().unwrap().unwrap().file_index, VOL_LABEL);
        assert!(matches!(plain.next_record(), Err(Error::Crypto(CryptoError::MissingKey))));

        let mut keyed = VolumeReader::with_options(MemoryVolume::from_blocks("in", blocks), true, Some(key));
        keyed.next_record().unwrap();
        assert_eq!(keyed.next_record().unwrap().unwrap().payload, b"secret bytes");
    }

    #[test]
    fn unwritable_sink_is_a_write_error() {
        let mut vol = MemoryVolume::new("full");
        vol.set_writable(false);
        let mut w = VolumeWriter::new(vol, 256, 1, 1);
        w.write_record(&mut Record::new(1, StreamKind::FileData, vec![0u8; 10])).unwrap();
        assert!(matches!(w.flush_block(), Err(Error::Write { .. })));
    }
}
