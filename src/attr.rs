//! Unix attribute records.
//!
//! ```text
//! "<file_index> <type> <fname>\0<lstat>\0<link>\0<attr_ex>\0<delta_seq>\0"
//! ```
//!
//! `lstat` is the stat block as space-separated base64 integers in the order
//! `dev ino mode nlink uid gid rdev size blksize blocks atime mtime ctime
//! link_fi flags data_stream`.  The base64 alphabet is `A-Z a-z 0-9 + /`,
//! most significant digit first, with a leading `-` for negative values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Record;

const BASE64_DIGITS: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

// File types stored in the attribute record.
pub const FT_LNKSAVED: i32 = 1;
pub const FT_REGE:     i32 = 2;
pub const FT_REG:      i32 = 3;
pub const FT_LNK:      i32 = 4;
pub const FT_DIREND:   i32 = 5;
pub const FT_SPEC:     i32 = 6;
pub const FT_RAW:      i32 = 16;
pub const FT_FIFO:     i32 = 17;
pub const FT_DELETED:  i32 = 23;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttrError {
    #[error("malformed attribute record: {0}")]
    Malformed(&'static str),
    #[error("invalid base64 digit {0:?}")]
    BadDigit(char),
    #[error("record header file index {record} != attribute file index {attr}")]
    FileIndexMismatch { record: i32, attr: i32 },
}

// ── base64 integers ──────────────────────────────────────────────────────────

pub fn to_base64(value: i64) -> String {
    let mut out = Vec::with_capacity(12);
    let mut val = value.unsigned_abs();
    loop {
        out.push(BASE64_DIGITS[(val & 0x3f) as usize]);
        val >>= 6;
        if val == 0 {
            break;
        }
    }
    if value < 0 {
        out.push(b'-');
    }
    out.reverse();
    // Only ASCII digits were pushed.
    String::from_utf8_lossy(&out).into_owned()
}

fn digit_value(c: u8) -> Option<u64> {
    match c {
        b'A'..=b'Z' => Some((c - b'A') as u64),
        b'a'..=b'z' => Some((c - b'a') as u64 + 26),
        b'0'..=b'9' => Some((c - b'0') as u64 + 52),
        b'+'        => Some(62),
        b'/'        => Some(63),
        _           => None,
    }
}

pub fn from_base64(s: &str) -> Result<i64, AttrError> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None       => (false, s),
    };
    if digits.is_empty() {
        return Err(AttrError::Malformed("empty base64 field"));
    }
    let mut val: u64 = 0;
    for c in digits.bytes() {
        let d = digit_value(c).ok_or(AttrError::BadDigit(c as char))?;
        val = val.wrapping_shl(6).wrapping_add(d);
    }
    Ok(if neg { (val as i64).wrapping_neg() } else { val as i64 })
}

// ── stat block ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatInfo {
    pub dev:         u64,
    pub ino:         u64,
    pub mode:        u32,
    pub nlink:       u64,
    pub uid:         u32,
    pub gid:         u32,
    pub rdev:        u64,
    pub size:        i64,
    pub blksize:     i64,
    pub blocks:      i64,
    pub atime:       i64,
    pub mtime:       i64,
    pub ctime:       i64,
    pub link_fi:     i32,
    pub flags:       u32,
    pub data_stream: i32,
}

impl StatInfo {
    pub fn encode(&self) -> String {
        let fields = [
            self.dev as i64, self.ino as i64, self.mode as i64, self.nlink as i64,
            self.uid as i64, self.gid as i64, self.rdev as i64, self.size,
            self.blksize, self.blocks, self.atime, self.mtime, self.ctime,
            self.link_fi as i64, self.flags as i64, self.data_stream as i64,
        ];
        fields.iter().map(|v| to_base64(*v)).collect::<Vec<_>>().join(" ")
    }

    /// Missing trailing fields (older writers) decode as zero.
    pub fn decode(s: &str) -> Result<Self, AttrError> {
        let mut f = [0i64; 16];
        for (slot, tok) in f.iter_mut().zip(s.split(' ').filter(|t| !t.is_empty())) {
            *slot = from_base64(tok)?;
        }
        Ok(StatInfo {
            dev: f[0] as u64, ino: f[1] as u64, mode: f[2] as u32, nlink: f[3] as u64,
            uid: f[4] as u32, gid: f[5] as u32, rdev: f[6] as u64, size: f[7],
            blksize: f[8], blocks: f[9], atime: f[10], mtime: f[11], ctime: f[12],
            link_fi: f[13] as i32, flags: f[14] as u32, data_stream: f[15] as i32,
        })
    }
}

// ── Attributes ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub file_index: i32,
    pub file_type:  i32,
    pub fname:      String,
    pub stat:       StatInfo,
    /// Link target for `FT_LNK`/`FT_LNKSAVED`, empty otherwise.
    pub link:       String,
    pub attr_ex:    String,
    pub delta_seq:  u32,
}

impl Attributes {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}", self.file_index, self.file_type, self.fname).into_bytes();
        for part in [self.stat.encode(), self.link.clone(), self.attr_ex.clone(), self.delta_seq.to_string()] {
            out.push(0);
            out.extend_from_slice(part.as_bytes());
        }
        out.push(0);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, AttrError> {
        let mut parts = data.split(|b| *b == 0);
        let head = parts.next().ok_or(AttrError::Malformed("empty record"))?;
        let mut head_fields = head.splitn(3, |b| *b == b' ');
        let file_index = parse_int(head_fields.next(), "file index")?;
        let file_type  = parse_int(head_fields.next(), "file type")?;
        let fname = head_fields.next().ok_or(AttrError::Malformed("missing file name"))?;

        let lstat = parts.next().ok_or(AttrError::Malformed("missing stat block"))?;
        let link    = parts.next().unwrap_or_default();
        let attr_ex = parts.next().unwrap_or_default();
        let delta_seq = match parts.next() {
            Some(d) if !d.is_empty() => parse_int(Some(d), "delta sequence")? as u32,
            _ => 0,
        };

        Ok(Attributes {
            file_index,
            file_type,
            fname:   String::from_utf8_lossy(fname).into_owned(),
            stat:    StatInfo::decode(&String::from_utf8_lossy(lstat))?,
            link:    String::from_utf8_lossy(link).into_owned(),
            attr_ex: String::from_utf8_lossy(attr_ex).into_owned(),
            delta_seq,
        })
    }

    pub fn is_regular(&self) -> bool {
        matches!(self.file_type, FT_REG | FT_REGE)
    }

    /// One `ls -l` style line.
    pub fn ls_line(&self) -> String {
        let mtime = DateTime::<Utc>::from_timestamp(self.stat.mtime, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "????-??-?? ??:??:??".into());
        let mut line = format!(
            "{} {:>3} {:<8} {:<8} {:>12} {} {}",
            mode_string(self.stat.mode),
            self.stat.nlink,
            self.stat.uid,
            self.stat.gid,
            self.stat.size,
            mtime,
            self.fname
        );
        if !self.link.is_empty() && matches!(self.file_type, FT_LNK | FT_LNKSAVED) {
            line.push_str(" -> ");
            line.push_str(&self.link);
        }
        line
    }
}

fn mode_string(mode: u32) -> String {
    let kind = match mode & 0o170_000 {
        0o040_000 => 'd',
        0o120_000 => 'l',
        0o020_000 => 'c',
        0o060_000 => 'b',
        0o010_000 => 'p',
        0o140_000 => 's',
        _         => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

fn parse_int(field: Option<&[u8]>, what: &'static str) -> Result<i32, AttrError> {
    let field = field.ok_or(AttrError::Malformed(what))?;
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or(AttrError::Malformed(what))
}

// ── AttributeUnpacker ────────────────────────────────────────────────────────

pub trait AttributeUnpacker {
    fn unpack(&self, record: &Record) -> Result<Attributes, AttrError>;
}

/// Decodes the unix attribute record and checks it against its record header.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixAttributes;

impl AttributeUnpacker for UnixAttributes {
    fn unpack(&self, record: &Record) -> Result<Attributes, AttrError> {
        let attrs = Attributes::decode(&record.payload)?;
        if attrs.file_index != record.file_index {
            return Err(AttrError::FileIndexMismatch { record: record.file_index, attr: attrs.file_index });
        }
        Ok(attrs)
    }
}
