//! Record packing and reassembly.
//!
//! A record is written into the record area of a block as a header followed
//! by payload bytes.  A record that does not fit is split: the first piece
//! carries the total length, every continuation piece repeats the file index
//! with a negated stream tag and the number of bytes still outstanding.
//!
//! ```text
//! v2/v3 (12 B)  file_index(i32) stream(i32) data_len(u32)
//! v1    (20 B)  session_id(u32) session_time(u32) file_index(i32) stream(i32) data_len(u32)
//! ```
//!
//! Record headers are never split; a tail shorter than one header is padding.

use std::mem;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::warn;

use crate::block::{Block, HeaderLayout};
use crate::stream::StreamTag;

pub const RECHDR1_LENGTH: usize = 20;
pub const RECHDR2_LENGTH: usize = 12;
pub const WRITE_RECHDR_LENGTH: usize = RECHDR2_LENGTH;

// ── Volume labels ────────────────────────────────────────────────────────────
//
// Label records carry a negative file index.  Their payload is opaque here.

pub const PRE_LABEL: i32 = -1;
pub const VOL_LABEL: i32 = -2;
pub const EOM_LABEL: i32 = -3;
pub const SOS_LABEL: i32 = -4;
pub const EOS_LABEL: i32 = -5;
pub const EOT_LABEL: i32 = -6;

pub fn label_name(file_index: i32) -> Option<&'static str> {
    match file_index {
        PRE_LABEL => Some("PRE_LABEL"),
        VOL_LABEL => Some("VOL_LABEL"),
        EOM_LABEL => Some("EOM_LABEL"),
        SOS_LABEL => Some("SOS_LABEL"),
        EOS_LABEL => Some("EOS_LABEL"),
        EOT_LABEL => Some("EOT_LABEL"),
        _         => None,
    }
}

pub fn record_header_len(layout: HeaderLayout) -> usize {
    match layout {
        HeaderLayout::V1 => RECHDR1_LENGTH,
        HeaderLayout::V2 | HeaderLayout::V3 => RECHDR2_LENGTH,
    }
}

// ── RecordHeader ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub file_index:   i32,
    pub stream:       StreamTag,
    /// Payload bytes outstanding as of this piece.
    pub data_len:     u32,
    pub session_id:   u32,
    pub session_time: u32,
}

impl RecordHeader {
    pub fn encode_into(&self, layout: HeaderLayout, out: &mut Vec<u8>) {
        if layout == HeaderLayout::V1 {
            out.extend_from_slice(&self.session_id.to_be_bytes());
            out.extend_from_slice(&self.session_time.to_be_bytes());
        }
        out.extend_from_slice(&self.file_index.to_be_bytes());
        out.extend_from_slice(&self.stream.0.to_be_bytes());
        out.extend_from_slice(&self.data_len.to_be_bytes());
    }

    /// Parse a header read from `block`; `raw` is exactly one header long.
    /// v2/v3 headers inherit the session from the block.
    pub fn decode(layout: HeaderLayout, raw: &[u8], block: &Block) -> Self {
        match layout {
            HeaderLayout::V1 => RecordHeader {
                session_id:   BigEndian::read_u32(&raw[0..4]),
                session_time: BigEndian::read_u32(&raw[4..8]),
                file_index:   BigEndian::read_i32(&raw[8..12]),
                stream:       StreamTag(BigEndian::read_i32(&raw[12..16])),
                data_len:     BigEndian::read_u32(&raw[16..20]),
            },
            HeaderLayout::V2 | HeaderLayout::V3 => RecordHeader {
                session_id:   block.session_id,
                session_time: block.session_time,
                file_index:   BigEndian::read_i32(&raw[0..4]),
                stream:       StreamTag(BigEndian::read_i32(&raw[4..8])),
                data_len:     BigEndian::read_u32(&raw[8..12]),
            },
        }
    }
}

// ── Record ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub file_index:   i32,
    pub stream:       StreamTag,
    pub payload:      Vec<u8>,
    /// Payload bytes not yet packed (write side).  Zero on every record
    /// handed out by [`RecordReader`].
    pub remainder:    usize,
    pub session_id:   u32,
    pub session_time: u32,
    /// Block in which the first piece was found (read side).
    pub block_number: u32,
}

impl Record {
    pub fn new(file_index: i32, stream: impl Into<StreamTag>, payload: Vec<u8>) -> Self {
        Self {
            file_index,
            stream: stream.into(),
            payload,
            remainder: 0,
            session_id: 0,
            session_time: 0,
            block_number: 0,
        }
    }

    #[inline]
    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_label(&self) -> bool {
        self.file_index < 0
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.remainder == 0
    }
}

// ── Write side ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackOutcome {
    /// Something was packed.  The record is done when `remainder == 0`,
    /// otherwise the block is full and the caller flushes it and packs again.
    Fits,
    /// Nothing was packed; the block is unchanged.
    BlockFull,
}

/// Pack as much of `record` as fits into `block`.
pub fn pack(block: &mut Block, record: &mut Record) -> PackOutcome {
    let hdr_len = record_header_len(block.layout);
    let offset  = match record.remainder {
        0 => 0,
        r => record.payload.len().saturating_sub(r),
    };
    let pending = record.payload.len() - offset;

    let needed = hdr_len + usize::from(pending > 0);
    if block.free() < needed {
        return PackOutcome::BlockFull;
    }

    let stream = if offset == 0 { record.stream } else { record.stream.continuation() };
    let take   = pending.min(block.free() - hdr_len);

    let mut head = Vec::with_capacity(hdr_len);
    RecordHeader {
        file_index:   record.file_index,
        stream,
        data_len:     pending as u32,
        session_id:   block.session_id,
        session_time: block.session_time,
    }
    .encode_into(block.layout, &mut head);

    block.append(&head);
    block.append(&record.payload[offset..offset + take]);
    block.note_file_index(record.file_index);
    record.remainder = pending - take;
    PackOutcome::Fits
}

// ── Read side ────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error(
        "broken continuation in block {block_number}: file index {file_index} awaited {expected} bytes, \
         found file index {found_index} stream {found_stream} len {found_len}"
    )]
    BrokenContinuation {
        block_number: u32,
        file_index:   i32,
        expected:     usize,
        found_index:  i32,
        found_stream: i32,
        found_len:    u32,
    },
}

/// State of the record currently being reassembled.
#[derive(Debug, Default)]
pub enum RecordAssembly {
    #[default]
    Empty,
    Partial { head: RecordHeader, block_number: u32, collected: Vec<u8>, remaining: usize },
    Complete(Record),
}

#[derive(Debug)]
pub enum Unpacked {
    Record(Record),
    /// No complete record left in this block.
    BlockExhausted,
}

/// Drains records from successive blocks, carrying split records across
/// block boundaries.
#[derive(Debug, Default)]
pub struct RecordReader {
    assembly:     RecordAssembly,
    pub records:  u64,
    pub orphans:  u64,
}

impl RecordReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_partial(&self) -> bool {
        matches!(self.assembly, RecordAssembly::Partial { .. })
    }

    /// Drop a pending partial record.  Returns `true` if one was pending.
    pub fn discard_partial(&mut self) -> bool {
        let was = self.is_partial();
        self.assembly = RecordAssembly::Empty;
        was
    }

    /// Next complete record from `block`.
    ///
    /// On [`RecordError::BrokenContinuation`] the partial record is dropped
    /// and the block cursor is left at the offending header, so calling
    /// again resumes with that header.
    pub fn unpack(&mut self, block: &mut Block) -> Result<Unpacked, RecordError> {
        let hdr_len = record_header_len(block.layout);
        loop {
            if block.remaining() < hdr_len {
                block.exhaust();
                return Ok(Unpacked::BlockExhausted);
            }
            let raw  = block.take(hdr_len).to_vec();
            let head = RecordHeader::decode(block.layout, &raw, block);

            let next = match mem::take(&mut self.assembly) {
                RecordAssembly::Empty | RecordAssembly::Complete(_) => {
                    if head.stream.is_continuation() {
                        let skipped = block.take(head.data_len as usize).len();
                        self.orphans += 1;
                        warn!(
                            block = block.block_number,
                            file_index = head.file_index,
                            stream = head.stream.0,
                            skipped,
                            "continuation piece without a record start, skipped"
                        );
                        continue;
                    }
                    let want = head.data_len as usize;
                    let mut collected = Vec::with_capacity(want.min(block.remaining()));
                    collected.extend_from_slice(block.take(want));
                    settle(head, block.block_number, collected, want)
                }
                RecordAssembly::Partial { head: first, block_number, mut collected, remaining } => {
                    let matches = head.stream.is_continuation()
                        && head.file_index == first.file_index
                        && head.stream == first.stream.continuation()
                        && head.data_len as usize == remaining;
                    if !matches {
                        block.rewind(hdr_len);
                        return Err(RecordError::BrokenContinuation {
                            block_number: block.block_number,
                            file_index:   first.file_index,
                            expected:     remaining,
                            found_index:  head.file_index,
                            found_stream: head.stream.0,
                            found_len:    head.data_len,
                        });
                    }
                    let total = collected.len() + remaining;
                    collected.extend_from_slice(block.take(remaining));
                    settle(first, block_number, collected, total)
                }
            };

            match next {
                RecordAssembly::Complete(record) => {
                    self.records += 1;
                    return Ok(Unpacked::Record(record));
                }
                partial => {
                    self.assembly = partial;
                    return Ok(Unpacked::BlockExhausted);
                }
            }
        }
    }
}

fn settle(head: RecordHeader, block_number: u32, collected: Vec<u8>, total: usize) -> RecordAssembly {
    if collected.len() < total {
        let remaining = total - collected.len();
        return RecordAssembly::Partial { head, block_number, collected, remaining };
    }
    RecordAssembly::Complete(Record {
        file_index:   head.file_index,
        stream:       head.stream,
        payload:      collected,
        remainder:    0,
        session_id:   head.session_id,
        session_time: head.session_time,
        block_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{decode_header, encode_block};
    use crate::stream::StreamKind;

    const CAP: usize = 100;
    const PER_BLOCK: usize = CAP - WRITE_RECHDR_LENGTH;

    /// Pack `records` into as many `CAP`-sized blocks as needed and return
    /// them serialized.
    fn write_all(records: &mut [Record]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut block = Block::new(CAP, 9, 1234);
        let mut number = 0;
        block.reset(number);
        for rec in records.iter_mut() {
            loop {
                let outcome = pack(&mut block, rec);
                if outcome == PackOutcome::Fits && rec.remainder == 0 {
                    break;
                }
                out.push(encode_block(&block));
                number += 1;
                block.reset(number);
            }
        }
        if !block.is_empty() {
            out.push(encode_block(&block));
        }
        out
    }

    fn read_all(blocks: &[Vec<u8>]) -> Vec<Record> {
        let mut reader = RecordReader::new();
        let mut out = Vec::new();
        for raw in blocks {
            let mut block = Block::from_raw(raw, 0, true).unwrap();
            while let Unpacked::Record(r) = reader.unpack(&mut block).unwrap() {
                out.push(r);
            }
        }
        assert!(!reader.is_partial());
        out
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn header_fields_are_big_endian() {
        let head = RecordHeader {
            file_index:   -3,
            stream:       StreamTag(0x0102_0304),
            data_len:     0x0A0B_0C0D,
            session_id:   7,
            session_time: 0x1122_3344,
        };
        let mut v2 = Vec::new();
        head.encode_into(HeaderLayout::V2, &mut v2);
        assert_eq!(v2, [0xFF, 0xFF, 0xFF, 0xFD, 1, 2, 3, 4, 0x0A, 0x0B, 0x0C, 0x0D]);

        let mut v1 = Vec::new();
        head.encode_into(HeaderLayout::V1, &mut v1);
        assert_eq!(&v1[..8], &[0, 0, 0, 7, 0x11, 0x22, 0x33, 0x44]);
        assert_eq!(&v1[8..], &v2[..]);
    }

    #[test]
    fn records_spanning_several_blocks_reassemble() {
        for n in [2usize, 3, 5] {
            let len = PER_BLOCK * (n - 1) + 40;
            let mut recs = vec![Record::new(1, StreamKind::FileData, patterned(len))];
            let blocks = write_all(&mut recs);
            assert_eq!(blocks.len(), n);

            let back = read_all(&blocks);
            assert_eq!(back.len(), 1);
            assert_eq!(back[0].payload, patterned(len));
            assert_eq!(back[0].stream, StreamTag::new(StreamKind::FileData));
            assert_eq!(back[0].session_id, 9);
            assert_eq!(back[0].block_number, 0);
        }
    }

    #[test]
    fn continuation_header_carries_the_remainder() {
        let mut rec = Record::new(4, StreamKind::FileData, patterned(150));
        let blocks = write_all(std::slice::from_mut(&mut rec));
        let (_, second) = decode_header(&blocks[1]).unwrap();
        assert_eq!(BigEndian::read_i32(&second[0..4]), 4);
        assert_eq!(BigEndian::read_i32(&second[4..8]), -(StreamKind::FileData as i32));
        assert_eq!(BigEndian::read_u32(&second[8..12]), (150 - PER_BLOCK) as u32);
    }

    #[test]
    fn full_block_is_left_untouched() {
        let mut block = Block::new(CAP, 1, 1);
        let mut filler = Record::new(1, StreamKind::FileData, patterned(CAP - WRITE_RECHDR_LENGTH - 5));
        assert_eq!(pack(&mut block, &mut filler), PackOutcome::Fits);
        assert_eq!(filler.remainder, 0);

        let used = block.used_bytes();
        let mut next = Record::new(2, StreamKind::FileData, patterned(10));
        assert_eq!(pack(&mut block, &mut next), PackOutcome::BlockFull);
        assert_eq!(block.used_bytes(), used);
        assert_eq!(next.remainder, 0);
    }

    #[test]
    fn empty_payload_needs_only_a_header() {
        let mut block = Block::new(WRITE_RECHDR_LENGTH, 1, 1);
        let mut rec = Record::new(1, StreamKind::Md5Digest, Vec::new());
        assert_eq!(pack(&mut block, &mut rec), PackOutcome::Fits);
        assert_eq!(block.free(), 0);
    }

    #[test]
    fn short_tail_is_padding() {
        let mut block = Block::new(CAP, 1, 1);
        let mut rec = Record::new(1, StreamKind::FileData, patterned(20));
        assert_eq!(pack(&mut block, &mut rec), PackOutcome::Fits);
        block.append(&[0u8; WRITE_RECHDR_LENGTH - 1]);

        let mut back = Block::from_raw(&encode_block(&block), 0, true).unwrap();
        let mut reader = RecordReader::new();
        assert!(matches!(reader.unpack(&mut back).unwrap(), Unpacked::Record(_)));
        assert!(matches!(reader.unpack(&mut back).unwrap(), Unpacked::BlockExhausted));
        assert_eq!(back.remaining(), 0);
        assert_eq!(reader.records, 1);
    }

    #[test]
    fn mismatched_continuation_is_reported_and_resumes() {
        let mut first = vec![Record::new(1, StreamKind::FileData, patterned(150))];
        let blocks_a = write_all(&mut first);
        let mut second = vec![Record::new(7, StreamKind::FileData, patterned(20))];
        let blocks_b = write_all(&mut second);

        let mut reader = RecordReader::new();
        let mut a = Block::from_raw(&blocks_a[0], 0, true).unwrap();
        assert!(matches!(reader.unpack(&mut a).unwrap(), Unpacked::BlockExhausted));
        assert!(reader.is_partial());

        let mut b = Block::from_raw(&blocks_b[0], 0, true).unwrap();
        let err = reader.unpack(&mut b).unwrap_err();
        assert!(matches!(err, RecordError::BrokenContinuation { file_index: 1, found_index: 7, .. }));
        assert!(!reader.is_partial());

        match reader.unpack(&mut b).unwrap() {
            Unpacked::Record(r) => assert_eq!(r.file_index, 7),
            Unpacked::BlockExhausted => panic!("record after the broken piece was lost"),
        }
    }

    #[test]
    fn orphan_continuation_is_skipped() {
        let mut recs = vec![
            Record::new(1, StreamKind::FileData, patterned(150)),
            Record::new(2, StreamKind::FileData, patterned(10)),
        ];
        let blocks = write_all(&mut recs);
        let mut reader = RecordReader::new();
        let mut tail = Block::from_raw(&blocks[1], 0, true).unwrap();
        match reader.unpack(&mut tail).unwrap() {
            Unpacked::Record(r) => assert_eq!(r.file_index, 2),
            Unpacked::BlockExhausted => panic!("expected the second record"),
        }
        assert_eq!(reader.orphans, 1);
    }

    #[test]
    fn legacy_v1_records_take_their_session_from_the_record() {
        let mut block = Block::new(200, 55, 66);
        block.layout = HeaderLayout::V1;
        let mut rec = Record::new(3, StreamKind::FileData, patterned(30));
        assert_eq!(pack(&mut block, &mut rec), PackOutcome::Fits);
        assert_eq!(block.used_bytes(), RECHDR1_LENGTH + 30);

        let raw = block.header().encode(block.payload());
        let mut back = Block::from_raw(&raw, 0, true).unwrap();
        assert_eq!(back.layout, HeaderLayout::V1);
        match RecordReader::new().unpack(&mut back).unwrap() {
            Unpacked::Record(r) => {
                assert_eq!(r.session_id, 55);
                assert_eq!(r.session_time, 66);
                assert_eq!(r.payload, patterned(30));
            }
            Unpacked::BlockExhausted => panic!("expected a record"),
        }
    }
}
