//! Block header codec.
//!
//! Every block on a volume starts with one of three header layouts,
//! distinguished by the 4-byte tag at offset 12.  All integers are
//! big-endian.
//!
//! ```text
//! BB01  checksum(4) block_len(4) block_number(4) "BB01"                         16 B
//! BB02  checksum(4) block_len(4) block_number(4) "BB02" session_id session_time 24 B
//! BB03  options(4)  block_len(4) block_number(4) "BB03" session_id session_time 24 B
//!       [xxh64(8) when options & CHECKSUM]                                      32 B
//! ```
//!
//! `BB01`/`BB02` always carry a CRC-32 over bytes `[4, block_len)`.  `BB03`
//! carries an optional xxHash64 over the whole block with the checksum field
//! zeroed.  Only `BB03` is ever written.

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;
use thiserror::Error;
use xxhash_rust::xxh64::Xxh64;

pub const BLKHDR_ID_LENGTH:   usize = 4;
pub const BLKHDR_TAG_OFFSET:  usize = 12;
/// Smallest header; also the prefix a device must read to learn `block_len`.
pub const BLKHDR_MIN_LENGTH:  usize = 16;
pub const BLKHDR_CS64_OFFSET: usize = 24;
pub const BLKHDR_CS64_LENGTH: usize = 8;
/// Header length of every block this crate writes.
pub const WRITE_BLKHDR_LENGTH: usize = BLKHDR_CS64_OFFSET + BLKHDR_CS64_LENGTH;

/// 64,512 bytes; deliberately not 65,536.
pub const DEFAULT_BLOCK_SIZE: usize = 512 * 126;
/// Sanity bound on any declared block length.
pub const MAX_BLOCK_LENGTH:   usize = 20_000_000;

bitflags! {
    /// Option word of a `BB03` header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlockOptions: u32 {
        const CHECKSUM      = 0x1;
        const ENCRYPT_VOL   = 0x2;
        /// Label blocks on an encrypted volume are left in clear.
        const ENCRYPT_BLOCK = 0x4;
    }
}

// ── Layout table ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderLayout {
    V1,
    V2,
    V3,
}

/// One row of the layout lookup table.
#[derive(Debug, Clone, Copy)]
pub struct LayoutInfo {
    pub layout:             HeaderLayout,
    pub tag:                [u8; BLKHDR_ID_LENGTH],
    /// Header length without the optional trailing checksum.
    pub fixed_len:          usize,
    /// `true` when the checksum word is part of the fixed header.
    pub always_checksummed: bool,
    pub checksum_width:     usize,
    pub has_session:        bool,
}

pub const LAYOUTS: [LayoutInfo; 3] = [
    LayoutInfo { layout: HeaderLayout::V1, tag: *b"BB01", fixed_len: 16, always_checksummed: true,  checksum_width: 4, has_session: false },
    LayoutInfo { layout: HeaderLayout::V2, tag: *b"BB02", fixed_len: 24, always_checksummed: true,  checksum_width: 4, has_session: true  },
    LayoutInfo { layout: HeaderLayout::V3, tag: *b"BB03", fixed_len: 24, always_checksummed: false, checksum_width: 8, has_session: true  },
];

impl HeaderLayout {
    pub fn info(self) -> &'static LayoutInfo {
        match self {
            HeaderLayout::V1 => &LAYOUTS[0],
            HeaderLayout::V2 => &LAYOUTS[1],
            HeaderLayout::V3 => &LAYOUTS[2],
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        LAYOUTS.iter().find(|l| l.tag[..] == *tag).map(|l| l.layout)
    }

    /// Full header length for a block carrying `options`.
    pub fn header_len(self, options: BlockOptions) -> usize {
        let info = self.info();
        if !info.always_checksummed && options.contains(BlockOptions::CHECKSUM) {
            info.fixed_len + info.checksum_width
        } else {
            info.fixed_len
        }
    }

    pub fn version(self) -> u8 {
        match self {
            HeaderLayout::V1 => 1,
            HeaderLayout::V2 => 2,
            HeaderLayout::V3 => 3,
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorruptHeader {
    #[error("block too short for a header: {0} bytes")]
    Truncated(usize),
    #[error("unrecognized block format tag {}", hex::encode(.0))]
    UnknownTag([u8; BLKHDR_ID_LENGTH]),
    #[error("unknown block option bits {0:#x}")]
    UnknownOptions(u32),
    #[error("block length {declared} invalid (header {header_len} B, {available} B available)")]
    BadLength { declared: u32, header_len: usize, available: usize },
    #[error("checksum mismatch on block {block_number}: stored {stored:#x}, computed {computed:#x}")]
    ChecksumMismatch { block_number: u32, stored: u64, computed: u64 },
}

// ── BlockHeader ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub layout:       HeaderLayout,
    /// Always `CHECKSUM` for `BB01`/`BB02`, whose checksum is mandatory.
    pub options:      BlockOptions,
    pub block_len:    u32,
    pub block_number: u32,
    pub session_id:   u32,
    pub session_time: u32,
    pub checksum:     u64,
}

impl BlockHeader {
    pub fn header_len(&self) -> usize {
        self.layout.header_len(self.options)
    }

    pub fn has_checksum(&self) -> bool {
        self.layout.info().always_checksummed || self.options.contains(BlockOptions::CHECKSUM)
    }

    /// Serialize the header followed by `payload`.  `block_len` and
    /// `checksum` are recomputed and written back into `self`.
    pub fn encode(&mut self, payload: &[u8]) -> Vec<u8> {
        if self.layout != HeaderLayout::V3 {
            self.options = BlockOptions::CHECKSUM;
        }
        let hdr_len = self.header_len();
        self.block_len = (hdr_len + payload.len()) as u32;

        let mut out = Vec::with_capacity(self.block_len as usize);
        let lead = if self.layout == HeaderLayout::V3 { self.options.bits() } else { 0 };
        out.extend_from_slice(&lead.to_be_bytes());
        out.extend_from_slice(&self.block_len.to_be_bytes());
        out.extend_from_slice(&self.block_number.to_be_bytes());
        out.extend_from_slice(&self.layout.info().tag);
        if self.layout.info().has_session {
            out.extend_from_slice(&self.session_id.to_be_bytes());
            out.extend_from_slice(&self.session_time.to_be_bytes());
        } else {
            self.session_id = 0;
            self.session_time = 0;
        }
        out.resize(hdr_len, 0);
        out.extend_from_slice(payload);

        self.checksum = if self.has_checksum() { compute_checksum(self.layout, &out) } else { 0 };
        match self.layout {
            HeaderLayout::V1 | HeaderLayout::V2 => {
                BigEndian::write_u32(&mut out[0..4], self.checksum as u32);
            }
            HeaderLayout::V3 if self.has_checksum() => {
                BigEndian::write_u64(
                    &mut out[BLKHDR_CS64_OFFSET..BLKHDR_CS64_OFFSET + BLKHDR_CS64_LENGTH],
                    self.checksum,
                );
            }
            HeaderLayout::V3 => {}
        }
        out
    }
}

/// Checksum of a serialized block (`bytes` is exactly `block_len` long).
pub fn compute_checksum(layout: HeaderLayout, bytes: &[u8]) -> u64 {
    match layout {
        HeaderLayout::V1 | HeaderLayout::V2 => {
            let mut hasher = Hasher::new();
            hasher.update(&bytes[4..]);
            hasher.finalize() as u64
        }
        HeaderLayout::V3 => {
            let mut hasher = Xxh64::new(0);
            hasher.update(&bytes[..BLKHDR_CS64_OFFSET]);
            hasher.update(&[0u8; BLKHDR_CS64_LENGTH]);
            hasher.update(&bytes[BLKHDR_CS64_OFFSET + BLKHDR_CS64_LENGTH..]);
            hasher.digest()
        }
    }
}

/// Parse and verify a block header.  Returns the header and the payload
/// slice (`raw[header_len..block_len]`); bytes past `block_len` are padding.
pub fn decode_header(raw: &[u8]) -> Result<(BlockHeader, &[u8]), CorruptHeader> {
    decode_header_with(raw, true)
}

pub fn decode_header_with(raw: &[u8], verify: bool) -> Result<(BlockHeader, &[u8]), CorruptHeader> {
    if raw.len() < BLKHDR_MIN_LENGTH {
        return Err(CorruptHeader::Truncated(raw.len()));
    }
    let tag = &raw[BLKHDR_TAG_OFFSET..BLKHDR_TAG_OFFSET + BLKHDR_ID_LENGTH];
    let layout = HeaderLayout::from_tag(tag).ok_or_else(|| {
        let mut t = [0u8; BLKHDR_ID_LENGTH];
        t.copy_from_slice(tag);
        CorruptHeader::UnknownTag(t)
    })?;
    let info = layout.info();

    let lead = BigEndian::read_u32(&raw[0..4]);
    let options = if info.always_checksummed {
        BlockOptions::CHECKSUM
    } else {
        BlockOptions::from_bits(lead).ok_or(CorruptHeader::UnknownOptions(lead))?
    };
    let hdr_len   = layout.header_len(options);
    let block_len = BigEndian::read_u32(&raw[4..8]);
    let declared  = block_len as usize;
    if declared < hdr_len || declared > MAX_BLOCK_LENGTH || declared > raw.len() {
        return Err(CorruptHeader::BadLength { declared: block_len, header_len: hdr_len, available: raw.len() });
    }

    let (session_id, session_time) = if info.has_session {
        (BigEndian::read_u32(&raw[16..20]), BigEndian::read_u32(&raw[20..24]))
    } else {
        (0, 0)
    };
    let checksum = if info.always_checksummed {
        lead as u64
    } else if options.contains(BlockOptions::CHECKSUM) {
        BigEndian::read_u64(&raw[BLKHDR_CS64_OFFSET..BLKHDR_CS64_OFFSET + BLKHDR_CS64_LENGTH])
    } else {
        0
    };

    let header = BlockHeader {
        layout,
        options,
        block_len,
        block_number: BigEndian::read_u32(&raw[8..12]),
        session_id,
        session_time,
        checksum,
    };

    if verify && header.has_checksum() {
        let computed = compute_checksum(layout, &raw[..declared]);
        if computed != checksum {
            return Err(CorruptHeader::ChecksumMismatch {
                block_number: header.block_number,
                stored: checksum,
                computed,
            });
        }
    }

    Ok((header, &raw[hdr_len..declared]))
}

// ── Block ────────────────────────────────────────────────────────────────────

/// One block in memory: header fields plus the record area.
///
/// On the write side the record area fills up to `capacity`; on the read
/// side a cursor drains it.
#[derive(Debug, Clone)]
pub struct Block {
    pub block_number:  u32,
    pub block_address: u64,
    pub layout:        HeaderLayout,
    pub options:       BlockOptions,
    pub session_id:    u32,
    pub session_time:  u32,
    pub checksum:      u64,
    /// First and last positive file index packed into this block (0 = none).
    pub first_index:   i32,
    pub last_index:    i32,
    capacity:          usize,
    buf:               Vec<u8>,
    cursor:            usize,
}

impl Block {
    /// Empty write-side block whose record area holds `capacity` bytes.
    pub fn new(capacity: usize, session_id: u32, session_time: u32) -> Self {
        Self {
            block_number: 0,
            block_address: 0,
            layout: HeaderLayout::V3,
            options: BlockOptions::CHECKSUM,
            session_id,
            session_time,
            checksum: 0,
            first_index: 0,
            last_index: 0,
            capacity,
            buf: Vec::with_capacity(capacity),
            cursor: 0,
        }
    }

    /// Decode a raw block read from a device.
    pub fn from_raw(raw: &[u8], block_address: u64, verify: bool) -> Result<Self, CorruptHeader> {
        let (header, payload) = decode_header_with(raw, verify)?;
        Ok(Self::from_parts(&header, payload.to_vec(), block_address))
    }

    pub fn from_parts(header: &BlockHeader, payload: Vec<u8>, block_address: u64) -> Self {
        Self {
            block_number: header.block_number,
            block_address,
            layout: header.layout,
            options: header.options,
            session_id: header.session_id,
            session_time: header.session_time,
            checksum: header.checksum,
            first_index: 0,
            last_index: 0,
            capacity: payload.len(),
            buf: payload,
            cursor: 0,
        }
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            layout:       self.layout,
            options:      self.options,
            block_len:    (self.layout.header_len(self.options) + self.buf.len()) as u32,
            block_number: self.block_number,
            session_id:   self.session_id,
            session_time: self.session_time,
            checksum:     self.checksum,
        }
    }

    pub fn capacity(&self) -> usize { self.capacity }
    pub fn used_bytes(&self) -> usize { self.buf.len() }
    pub fn free(&self) -> usize { self.capacity - self.buf.len() }
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }
    pub fn payload(&self) -> &[u8] { &self.buf }

    /// True when no record with a positive file index was packed.
    pub fn holds_only_labels(&self) -> bool {
        self.first_index == 0
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.free());
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn note_file_index(&mut self, file_index: i32) {
        if file_index > 0 {
            if self.first_index == 0 {
                self.first_index = file_index;
            }
            self.last_index = file_index;
        }
    }

    /// Swap in the decrypted record area of a read-side block.
    pub(crate) fn set_payload(&mut self, payload: Vec<u8>) {
        self.capacity = payload.len();
        self.buf = payload;
        self.cursor = 0;
    }

    // Read side.

    pub fn remaining(&self) -> usize { self.buf.len() - self.cursor }

    pub(crate) fn take(&mut self, n: usize) -> &[u8] {
        let start = self.cursor;
        self.cursor += n.min(self.remaining());
        &self.buf[start..self.cursor]
    }

    pub(crate) fn rewind(&mut self, n: usize) {
        self.cursor = self.cursor.saturating_sub(n);
    }

    pub(crate) fn exhaust(&mut self) {
        self.cursor = self.buf.len();
    }

    /// Empty the record area and stamp the next block number.
    pub fn reset(&mut self, block_number: u32) {
        self.buf.clear();
        self.cursor = 0;
        self.block_number = block_number;
        self.first_index = 0;
        self.last_index = 0;
        self.checksum = 0;
    }
}

/// Serialize a write-side block as `BB03`.
pub fn encode_block(block: &Block) -> Vec<u8> {
    let mut header = block.header();
    header.layout = HeaderLayout::V3;
    header.encode(block.payload())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn header(layout: HeaderLayout, options: BlockOptions) -> BlockHeader {
        BlockHeader {
            layout,
            options,
            block_len: 0,
            block_number: 42,
            session_id: 7,
            session_time: 1_700_000_000,
            checksum: 0,
        }
    }

    #[test]
    fn header_lengths_follow_the_table() {
        assert_eq!(HeaderLayout::V1.header_len(BlockOptions::CHECKSUM), 16);
        assert_eq!(HeaderLayout::V2.header_len(BlockOptions::CHECKSUM), 24);
        assert_eq!(HeaderLayout::V3.header_len(BlockOptions::empty()), 24);
        assert_eq!(HeaderLayout::V3.header_len(BlockOptions::CHECKSUM), WRITE_BLKHDR_LENGTH);
    }

    #[test]
    fn unknown_tag_is_corrupt() {
        let mut h = header(HeaderLayout::V3, BlockOptions::CHECKSUM);
        let mut raw = h.encode(b"payload");
        raw[12..16].copy_from_slice(b"BB09");
        assert_eq!(decode_header(&raw).unwrap_err(), CorruptHeader::UnknownTag(*b"BB09"));
    }

    #[test]
    fn unknown_option_bits_are_corrupt() {
        let mut h = header(HeaderLayout::V3, BlockOptions::empty());
        let mut raw = h.encode(b"x");
        raw[3] |= 0x40;
        assert!(matches!(decode_header(&raw), Err(CorruptHeader::UnknownOptions(_))));
    }

    #[test]
    fn declared_length_beyond_buffer_is_corrupt() {
        let mut h = header(HeaderLayout::V2, BlockOptions::CHECKSUM);
        let raw = h.encode(&[1u8; 100]);
        assert!(matches!(
            decode_header(&raw[..80]),
            Err(CorruptHeader::BadLength { declared: 124, .. })
        ));
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let mut h = header(HeaderLayout::V3, BlockOptions::CHECKSUM);
        let mut raw = h.encode(b"records");
        raw.resize(512, 0);
        let (decoded, payload) = decode_header(&raw).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(payload, b"records");
    }

    #[test]
    fn unchecksummed_v3_skips_verification() {
        let mut h = header(HeaderLayout::V3, BlockOptions::empty());
        let mut raw = h.encode(b"abc");
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let (_, payload) = decode_header(&raw).unwrap();
        assert_eq!(payload, &[b'a', b'b', b'c' ^ 0xff]);
    }

    #[test]
    fn write_block_is_always_bb03() {
        let mut block = Block::new(1024, 3, 99);
        block.reset(5);
        block.append(b"some records");
        let raw = encode_block(&block);
        assert_eq!(&raw[12..16], b"BB03");
        let back = Block::from_raw(&raw, 0, true).unwrap();
        assert_eq!(back.block_number, 5);
        assert_eq!(back.session_id, 3);
        assert_eq!(back.session_time, 99);
        assert_eq!(back.payload(), b"some records");
    }

    fn layout_strategy() -> impl Strategy<Value = HeaderLayout> {
        prop_oneof![Just(HeaderLayout::V1), Just(HeaderLayout::V2), Just(HeaderLayout::V3)]
    }

    proptest! {
        #[test]
        fn header_roundtrip_all_layouts(
            layout in layout_strategy(),
            bits in 0u32..8,
            block_number in any::<u32>(),
            session_id in any::<u32>(),
            session_time in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let mut h = BlockHeader {
                layout,
                options: BlockOptions::from_bits_truncate(bits),
                block_len: 0,
                block_number,
                session_id,
                session_time,
                checksum: 0,
            };
            let raw = h.encode(&payload);
            let (decoded, body) = decode_header(&raw).unwrap();
            prop_assert_eq!(decoded, h);
            prop_assert_eq!(body, &payload[..]);
            prop_assert_eq!(decoded.clone().encode(body), raw);
        }

        #[test]
        fn flipped_payload_bit_is_detected(
            layout in layout_strategy(),
            payload in proptest::collection::vec(any::<u8>(), 1..4096),
            pos in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut h = header(layout, BlockOptions::CHECKSUM);
            let mut raw = h.encode(&payload);
            let at = h.header_len() + pos.index(payload.len());
            raw[at] ^= 1 << bit;
            let is_mismatch = matches!(
                decode_header(&raw),
                Err(CorruptHeader::ChecksumMismatch { .. })
            );
            prop_assert!(is_mismatch);
        }
    }
}
