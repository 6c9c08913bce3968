//! Payload decompression: zlib streams and the compression container.
//!
//! # Container
//! LZO1X and ZSTD payloads are wrapped in a 12-byte big-endian header:
//!
//! ```text
//! magic(4) compressed_len(4) level(2) version(2)
//! ```
//!
//! `version` must equal [`COMP_HEAD_VERSION`] and `compressed_len + 12` must
//! equal the payload length.  Zlib ("gzip") streams carry no container.
//!
//! # Scratch buffer
//! Decompressed sizes are not stored anywhere.  Every codec decompresses into
//! an owned [`ScratchBuffer`]; on "output too small" the buffer doubles and
//! the attempt is repeated, up to an explicit cap.

use std::io::{self, Read};

use byteorder::{BigEndian, ByteOrder};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use rust_lzo::{worst_compress, LZOContext, LZOError};
use thiserror::Error;

pub const COMPRESS_LZO1X: u32 = 0x4c5a_4f58; // "LZOX"
pub const COMPRESS_ZSTD:  u32 = 0x5a53_5444; // "ZSTD"

pub const COMP_HEAD_VERSION: u16   = 1;
pub const COMP_HEADER_LEN:   usize = 12;

pub const DEFAULT_SCRATCH_INITIAL: usize = 70_000;
pub const DEFAULT_DECOMPRESS_CAP:  usize = 10_000_000;

// ── CodecId ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    Zlib,
    Lzo1x,
    Zstd,
}

impl CodecId {
    /// Container magic; zlib streams are never containerised.
    #[inline]
    pub fn magic(self) -> Option<u32> {
        match self {
            CodecId::Zlib  => None,
            CodecId::Lzo1x => Some(COMPRESS_LZO1X),
            CodecId::Zstd  => Some(COMPRESS_ZSTD),
        }
    }

    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            COMPRESS_LZO1X => Some(CodecId::Lzo1x),
            COMPRESS_ZSTD  => Some(CodecId::Zstd),
            _              => None,
        }
    }

    /// Human-readable name (for diagnostics only).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::Zlib  => "zlib",
            CodecId::Lzo1x => "lzo1x",
            CodecId::Zstd  => "zstd",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "zlib" | "gzip" => Some(CodecId::Zlib),
            "lzo" | "lzo1x" => Some(CodecId::Lzo1x),
            "zstd"          => Some(CodecId::Zstd),
            _               => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Compression container too short: {0} bytes")]
    TruncatedContainer(usize),
    #[error("Compression container version {found} (expected {expected})")]
    VersionMismatch { found: u16, expected: u16 },
    #[error("Compression container declares {declared} bytes but {actual} follow the header")]
    SizeMismatch { declared: u32, actual: usize },
    #[error("Unknown compression container magic {0:#010x}")]
    UnknownMagic(u32),
    #[error("Decompression needs more than {cap} bytes of buffer")]
    BufferExhausted { cap: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── ScratchBuffer ────────────────────────────────────────────────────────────

/// Owned decompression buffer.  Grows by doubling up to `cap`, never shrinks.
#[derive(Debug)]
pub struct ScratchBuffer {
    buf: Vec<u8>,
    cap: usize,
}

impl ScratchBuffer {
    pub fn new(initial: usize, cap: usize) -> Self {
        let cap = cap.max(1);
        Self { buf: vec![0u8; initial.clamp(1, cap)], cap }
    }

    #[inline] pub fn len(&self) -> usize { self.buf.len() }
    #[inline] pub fn is_empty(&self) -> bool { self.buf.is_empty() }
    #[inline] pub fn cap(&self) -> usize { self.cap }

    /// Double the buffer, clamped to the cap.  `false` when already at the cap.
    pub fn grow(&mut self) -> bool {
        if self.buf.len() >= self.cap {
            return false;
        }
        let next = self.buf.len().saturating_mul(2).min(self.cap);
        self.buf.resize(next, 0);
        true
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    #[inline]
    pub fn filled(&self, n: usize) -> &[u8] {
        &self.buf[..n]
    }
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SCRATCH_INITIAL, DEFAULT_DECOMPRESS_CAP)
    }
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    /// Decompress `data` into `out`.  `Ok(None)` when `out` is too small.
    fn decompress_into(&self, data: &[u8], out: &mut [u8]) -> Result<Option<usize>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct ZlibCodec;
impl Codec for ZlibCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zlib }

    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let mut z = Compress::new(Compression::new(level.clamp(0, 9) as u32), true);
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        loop {
            let consumed = z.total_in() as usize;
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(1024));
            }
            let status = z
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Finish)
                .map_err(|e| CodecError::Compression(e.to_string()))?;
            if status == Status::StreamEnd {
                return Ok(out);
            }
        }
    }

    fn decompress_into(&self, data: &[u8], out: &mut [u8]) -> Result<Option<usize>, CodecError> {
        let mut z = Decompress::new(true);
        match z.decompress(data, out, FlushDecompress::Finish) {
            Ok(Status::StreamEnd) => Ok(Some(z.total_out() as usize)),
            Ok(_) if z.total_out() as usize >= out.len() => Ok(None),
            Ok(_) => Err(CodecError::Decompression("truncated zlib stream".into())),
            Err(e) => Err(CodecError::Decompression(e.to_string())),
        }
    }
}

pub struct Lzo1xCodec;
impl Codec for Lzo1xCodec {
    fn codec_id(&self) -> CodecId { CodecId::Lzo1x }

    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut ctx = LZOContext::new();
        let mut out = Vec::with_capacity(worst_compress(data.len()));
        let err = ctx.compress(data, &mut out);
        if matches!(err, LZOError::OK) {
            Ok(out)
        } else {
            Err(CodecError::Compression(format!("lzo1x error {}", err as i32)))
        }
    }

    fn decompress_into(&self, data: &[u8], out: &mut [u8]) -> Result<Option<usize>, CodecError> {
        let (written, err) = LZOContext::decompress_to_slice(data, out);
        let n = written.len();
        match err {
            LZOError::OK             => Ok(Some(n)),
            LZOError::OUTPUT_OVERRUN => Ok(None),
            other => Err(CodecError::Decompression(format!("lzo1x error {}", other as i32))),
        }
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }

    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decompress_into(&self, data: &[u8], out: &mut [u8]) -> Result<Option<usize>, CodecError> {
        let mut dec = zstd::stream::read::Decoder::new(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        let mut filled = 0;
        loop {
            if filled == out.len() {
                let mut probe = [0u8; 1];
                return match dec.read(&mut probe) {
                    Ok(0)  => Ok(Some(filled)),
                    Ok(_)  => Ok(None),
                    Err(e) => Err(CodecError::Decompression(e.to_string())),
                };
            }
            match dec.read(&mut out[filled..]) {
                Ok(0)  => return Ok(Some(filled)),
                Ok(n)  => filled += n,
                Err(e) => return Err(CodecError::Decompression(e.to_string())),
            }
        }
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::Zlib  => Box::new(ZlibCodec),
        CodecId::Lzo1x => Box::new(Lzo1xCodec),
        CodecId::Zstd  => Box::new(ZstdCodec),
    }
}

/// Decompress into `scratch`, doubling it on overrun until the cap.
pub fn decompress_with_retry<'s>(
    codec:   &dyn Codec,
    data:    &[u8],
    scratch: &'s mut ScratchBuffer,
) -> Result<&'s [u8], CodecError> {
    let n = loop {
        match codec.decompress_into(data, scratch.as_mut_slice())? {
            Some(n) => break n,
            None => {
                if !scratch.grow() {
                    return Err(CodecError::BufferExhausted { cap: scratch.cap() });
                }
                tracing::debug!(codec = codec.codec_id().name(), size = scratch.len(), "scratch buffer grown");
            }
        }
    };
    Ok(scratch.filled(n))
}

// ── CompressionContainer ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionContainer {
    pub magic:             u32,
    pub compressed_length: u32,
    pub level:             u16,
    pub format_version:    u16,
}

impl CompressionContainer {
    /// Parse and validate the container at the start of `payload`; returns
    /// the header and the compressed bytes.
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        if payload.len() < COMP_HEADER_LEN {
            return Err(CodecError::TruncatedContainer(payload.len()));
        }
        let head = CompressionContainer {
            magic:             BigEndian::read_u32(&payload[0..4]),
            compressed_length: BigEndian::read_u32(&payload[4..8]),
            level:             BigEndian::read_u16(&payload[8..10]),
            format_version:    BigEndian::read_u16(&payload[10..12]),
        };
        if head.format_version != COMP_HEAD_VERSION {
            return Err(CodecError::VersionMismatch { found: head.format_version, expected: COMP_HEAD_VERSION });
        }
        let body = &payload[COMP_HEADER_LEN..];
        if head.compressed_length as usize != body.len() {
            return Err(CodecError::SizeMismatch { declared: head.compressed_length, actual: body.len() });
        }
        Ok((head, body))
    }

    pub fn codec(&self) -> Result<CodecId, CodecError> {
        CodecId::from_magic(self.magic).ok_or(CodecError::UnknownMagic(self.magic))
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic.to_be_bytes());
        out.extend_from_slice(&self.compressed_length.to_be_bytes());
        out.extend_from_slice(&self.level.to_be_bytes());
        out.extend_from_slice(&self.format_version.to_be_bytes());
    }
}

/// Compress `data` and wrap it in a container (LZO1X or ZSTD).
pub fn wrap_container(id: CodecId, level: i32, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let magic = id
        .magic()
        .ok_or_else(|| CodecError::Compression(format!("{} has no container form", id.name())))?;
    let body = get_codec(id).compress(data, level)?;
    let mut out = Vec::with_capacity(COMP_HEADER_LEN + body.len());
    CompressionContainer {
        magic,
        compressed_length: body.len() as u32,
        level: level.clamp(0, u16::MAX as i32) as u16,
        format_version: COMP_HEAD_VERSION,
    }
    .encode_into(&mut out);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decompress a container payload into `scratch`.
pub fn unwrap_container<'s>(payload: &[u8], scratch: &'s mut ScratchBuffer) -> Result<&'s [u8], CodecError> {
    let (head, body) = CompressionContainer::parse(payload)?;
    let codec = get_codec(head.codec()?);
    decompress_with_retry(codec.as_ref(), body, scratch)
}

/// Zlib-compress a payload for a gzip stream.
pub fn deflate(data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
    ZlibCodec.compress(data, level)
}

/// Inflate a gzip-stream payload into `scratch`.
pub fn inflate<'s>(payload: &[u8], scratch: &'s mut ScratchBuffer) -> Result<&'s [u8], CodecError> {
    decompress_with_retry(&ZlibCodec, payload, scratch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: [usize; 5] = [0, 1, 4095, 4096, 1_048_576];

    fn sample(len: usize) -> Vec<u8> {
        // Compressible but not trivially so.
        (0..len).map(|i| ((i / 7) % 97) as u8 ^ (i % 3) as u8).collect()
    }

    #[test]
    fn zlib_payload_sizes() {
        let mut scratch = ScratchBuffer::default();
        for len in SIZES {
            let data = sample(len);
            let packed = deflate(&data, 6).unwrap();
            assert_eq!(inflate(&packed, &mut scratch).unwrap(), &data[..], "len {len}");
        }
    }

    #[test]
    fn container_payload_sizes() {
        for id in [CodecId::Lzo1x, CodecId::Zstd] {
            let mut scratch = ScratchBuffer::default();
            for len in SIZES {
                let data = sample(len);
                let packed = wrap_container(id, 3, &data).unwrap();
                let out = unwrap_container(&packed, &mut scratch).unwrap();
                assert_eq!(out, &data[..], "{} len {len}", id.name());
            }
            assert!(scratch.len() >= 1_048_576);
        }
    }

    #[test]
    fn next_container_version_is_rejected() {
        for id in [CodecId::Lzo1x, CodecId::Zstd] {
            let mut packed = wrap_container(id, 1, b"hello hello hello").unwrap();
            BigEndian::write_u16(&mut packed[10..12], COMP_HEAD_VERSION + 1);
            let err = unwrap_container(&packed, &mut ScratchBuffer::default()).unwrap_err();
            assert!(matches!(err, CodecError::VersionMismatch { found: 2, expected: 1 }));
        }
    }

    #[test]
    fn declared_length_must_match() {
        let mut packed = wrap_container(CodecId::Zstd, 1, b"abcdefgh").unwrap();
        packed.push(0);
        let err = unwrap_container(&packed, &mut ScratchBuffer::default()).unwrap_err();
        assert!(matches!(err, CodecError::SizeMismatch { .. }));
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let mut packed = wrap_container(CodecId::Lzo1x, 1, b"abc").unwrap();
        packed[0] = b'Q';
        assert!(matches!(
            unwrap_container(&packed, &mut ScratchBuffer::default()),
            Err(CodecError::UnknownMagic(_))
        ));
    }

    #[test]
    fn cap_bounds_the_output() {
        let data = vec![0u8; 64 * 1024];
        let packed = deflate(&data, 9).unwrap();
        let mut scratch = ScratchBuffer::new(1024, 32 * 1024);
        let err = inflate(&packed, &mut scratch).unwrap_err();
        assert!(matches!(err, CodecError::BufferExhausted { cap: 32768 }));
        assert_eq!(scratch.len(), 32 * 1024);
    }

    #[test]
    fn scratch_doubles_then_clamps() {
        let mut s = ScratchBuffer::new(100, 350);
        assert!(s.grow());
        assert_eq!(s.len(), 200);
        assert!(s.grow());
        assert_eq!(s.len(), 350);
        assert!(!s.grow());
    }

    #[test]
    fn corrupt_zlib_is_a_decompression_error() {
        let mut packed = deflate(&sample(10_000), 6).unwrap();
        packed.truncate(packed.len() / 2);
        assert!(matches!(
            inflate(&packed, &mut ScratchBuffer::default()),
            Err(CodecError::Decompression(_))
        ));
    }
}
