//! Stream-type tags carried in every record header.
//!
//! A tag is a signed 32-bit value.  The low 11 bits select the stream type;
//! the bits above it are modifiers that can be combined with most data
//! types.  A negative tag marks the continuation piece of a record that was
//! split across blocks (the writer negates the original tag).
//!
//! ```text
//!  bit 15  dedup data      payload must be rehydrated first
//!  bit 14  no dedup        informational, ignored by the codec
//!  bit 13  offsets         payload starts with an 8-byte file address
//!  bit 12  plugin          stream produced by a plugin
//!  0..=10  stream type     see [`StreamKind`]
//! ```

use std::fmt;

pub const STREAMBITS_TYPE: u32 = 11;
pub const STREAMMASK_TYPE: i32 = (1 << STREAMBITS_TYPE) - 1;

pub const STREAM_BIT_PLUGIN:             i32 = 1 << 12;
pub const STREAM_BIT_OFFSETS:            i32 = 1 << 13;
pub const STREAM_BIT_NO_DEDUPLICATION:   i32 = 1 << 14;
pub const STREAM_BIT_DEDUPLICATION_DATA: i32 = 1 << 15;

/// Size of the big-endian file address in front of offset-bearing payloads.
pub const OFFSET_FADDR_SIZE: usize = 8;

// ── Stream kinds ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StreamKind {
    UnixAttributes              = 1,
    FileData                    = 2,
    Md5Digest                   = 3,
    GzipData                    = 4,
    UnixAttributesEx            = 5,
    SparseData                  = 6,
    SparseGzipData              = 7,
    ProgramNames                = 8,
    ProgramData                 = 9,
    Sha1Digest                  = 10,
    Win32Data                   = 11,
    Win32GzipData               = 12,
    MacosForkData               = 13,
    HfsplusAttributes           = 14,
    UnixAccessAcl               = 15,
    UnixDefaultAcl              = 16,
    Sha256Digest                = 17,
    Sha512Digest                = 18,
    SignedDigest                = 19,
    EncryptedFileData           = 20,
    EncryptedWin32Data          = 21,
    EncryptedSessionData        = 22,
    EncryptedFileGzipData       = 23,
    EncryptedWin32GzipData      = 24,
    EncryptedMacosForkData      = 25,
    PluginName                  = 26,
    PluginData                  = 27,
    RestoreObject               = 28,
    CompressedData              = 29,
    SparseCompressedData        = 30,
    Win32CompressedData         = 31,
    EncryptedFileCompressedData = 32,
    EncryptedWin32CompressedData = 33,
    UnixAttributeUpdate         = 35,
    PluginObject                = 36,
    PluginMetaBlob              = 37,
    PluginMetaCatalog           = 38,
}

impl StreamKind {
    pub const ALL: [StreamKind; 37] = [
        StreamKind::UnixAttributes, StreamKind::FileData, StreamKind::Md5Digest,
        StreamKind::GzipData, StreamKind::UnixAttributesEx, StreamKind::SparseData,
        StreamKind::SparseGzipData, StreamKind::ProgramNames, StreamKind::ProgramData,
        StreamKind::Sha1Digest, StreamKind::Win32Data, StreamKind::Win32GzipData,
        StreamKind::MacosForkData, StreamKind::HfsplusAttributes, StreamKind::UnixAccessAcl,
        StreamKind::UnixDefaultAcl, StreamKind::Sha256Digest, StreamKind::Sha512Digest,
        StreamKind::SignedDigest, StreamKind::EncryptedFileData, StreamKind::EncryptedWin32Data,
        StreamKind::EncryptedSessionData, StreamKind::EncryptedFileGzipData,
        StreamKind::EncryptedWin32GzipData, StreamKind::EncryptedMacosForkData,
        StreamKind::PluginName, StreamKind::PluginData, StreamKind::RestoreObject,
        StreamKind::CompressedData, StreamKind::SparseCompressedData,
        StreamKind::Win32CompressedData, StreamKind::EncryptedFileCompressedData,
        StreamKind::EncryptedWin32CompressedData, StreamKind::UnixAttributeUpdate,
        StreamKind::PluginObject, StreamKind::PluginMetaBlob, StreamKind::PluginMetaCatalog,
    ];

    pub fn from_masked(value: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| *k as i32 == value)
    }

    /// Short upper-case name used in listings and diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::UnixAttributes               => "UATTR",
            StreamKind::FileData                     => "DATA",
            StreamKind::Md5Digest                    => "MD5",
            StreamKind::GzipData                     => "GZIP",
            StreamKind::UnixAttributesEx             => "UNIX-ATTR-EX",
            StreamKind::SparseData                   => "SPARSE-DATA",
            StreamKind::SparseGzipData               => "SPARSE-GZIP",
            StreamKind::ProgramNames                 => "PROG-NAMES",
            StreamKind::ProgramData                  => "PROG-DATA",
            StreamKind::Sha1Digest                   => "SHA1",
            StreamKind::Win32Data                    => "WIN32-DATA",
            StreamKind::Win32GzipData                => "WIN32-GZIP",
            StreamKind::MacosForkData                => "MACOS-RSRC",
            StreamKind::HfsplusAttributes            => "HFSPLUS-ATTR",
            StreamKind::UnixAccessAcl                => "ACL",
            StreamKind::UnixDefaultAcl               => "DEFAULT-ACL",
            StreamKind::Sha256Digest                 => "SHA256",
            StreamKind::Sha512Digest                 => "SHA512",
            StreamKind::SignedDigest                 => "SIGNED-DIGEST",
            StreamKind::EncryptedFileData            => "ENCRYPTED-FILE",
            StreamKind::EncryptedWin32Data           => "ENCRYPTED-WIN32-DATA",
            StreamKind::EncryptedSessionData         => "ENCRYPTED-SESSION-DATA",
            StreamKind::EncryptedFileGzipData        => "ENCRYPTED-GZIP",
            StreamKind::EncryptedWin32GzipData       => "ENCRYPTED-WIN32-GZIP",
            StreamKind::EncryptedMacosForkData       => "ENCRYPTED-MACOS-RSRC",
            StreamKind::PluginName                   => "PLUGIN-NAME",
            StreamKind::PluginData                   => "PLUGIN-DATA",
            StreamKind::RestoreObject                => "RESTORE-OBJECT",
            StreamKind::CompressedData               => "COMPRESSED",
            StreamKind::SparseCompressedData         => "SPARSE-COMPRESSED",
            StreamKind::Win32CompressedData          => "WIN32-COMPRESSED",
            StreamKind::EncryptedFileCompressedData  => "ENCRYPTED-COMPRESSED",
            StreamKind::EncryptedWin32CompressedData => "ENCRYPTED-WIN32-COMPRESSED",
            StreamKind::UnixAttributeUpdate          => "UNIX-ATTR-UPDATE",
            StreamKind::PluginObject                 => "PLUGIN-OBJECT",
            StreamKind::PluginMetaBlob               => "PLUGIN-META-BLOB",
            StreamKind::PluginMetaCatalog            => "PLUGIN-META-CATALOG",
        }
    }

    pub fn is_attributes(self) -> bool {
        matches!(
            self,
            StreamKind::UnixAttributes | StreamKind::UnixAttributesEx | StreamKind::UnixAttributeUpdate
        )
    }

    pub fn is_digest(self) -> bool {
        matches!(
            self,
            StreamKind::Md5Digest | StreamKind::Sha1Digest | StreamKind::Sha256Digest | StreamKind::Sha512Digest
        )
    }

    /// Streams whose payload becomes file content.
    pub fn is_file_data(self) -> bool {
        matches!(
            self,
            StreamKind::FileData
                | StreamKind::SparseData
                | StreamKind::Win32Data
                | StreamKind::GzipData
                | StreamKind::SparseGzipData
                | StreamKind::Win32GzipData
                | StreamKind::CompressedData
                | StreamKind::SparseCompressedData
                | StreamKind::Win32CompressedData
        )
    }

    /// File content this reader cannot decode.
    pub fn is_opaque_file_data(self) -> bool {
        matches!(
            self,
            StreamKind::EncryptedFileData
                | StreamKind::EncryptedWin32Data
                | StreamKind::EncryptedFileGzipData
                | StreamKind::EncryptedWin32GzipData
                | StreamKind::EncryptedFileCompressedData
                | StreamKind::EncryptedWin32CompressedData
        )
    }

    /// Sparse types always carry an offset prefix, with or without the bit.
    pub fn is_sparse(self) -> bool {
        matches!(
            self,
            StreamKind::SparseData | StreamKind::SparseGzipData | StreamKind::SparseCompressedData
        )
    }
}

// ── StreamTag ────────────────────────────────────────────────────────────────

/// Raw stream tag exactly as stored in a record header.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTag(pub i32);

impl StreamTag {
    pub fn new(kind: StreamKind) -> Self {
        StreamTag(kind as i32)
    }

    pub fn with_offsets(self) -> Self {
        StreamTag(self.0 | STREAM_BIT_OFFSETS)
    }

    pub fn with_dedup(self) -> Self {
        StreamTag(self.0 | STREAM_BIT_DEDUPLICATION_DATA)
    }

    /// Stream type with every modifier bit stripped.
    #[inline]
    pub fn masked(self) -> i32 {
        self.0.wrapping_abs() & STREAMMASK_TYPE
    }

    pub fn kind(self) -> Option<StreamKind> {
        StreamKind::from_masked(self.masked())
    }

    #[inline]
    pub fn is_dedup(self) -> bool {
        self.0 > 0 && self.0 & STREAM_BIT_DEDUPLICATION_DATA != 0
    }

    /// True when the payload starts with an [`OFFSET_FADDR_SIZE`] file address.
    pub fn has_offsets(self) -> bool {
        if self.0 & STREAM_BIT_OFFSETS != 0 {
            return true;
        }
        self.kind().map(StreamKind::is_sparse).unwrap_or(false)
    }

    #[inline]
    pub fn is_continuation(self) -> bool {
        self.0 < 0
    }

    /// Tag written in front of the tail piece of a split record.
    #[inline]
    pub fn continuation(self) -> Self {
        StreamTag(self.0.wrapping_abs().wrapping_neg())
    }

    pub fn is_attributes(self) -> bool {
        self.kind().map(StreamKind::is_attributes).unwrap_or(false)
    }

    pub fn is_digest(self) -> bool {
        self.kind().map(StreamKind::is_digest).unwrap_or(false)
    }

    pub fn is_file_data(self) -> bool {
        self.kind().map(StreamKind::is_file_data).unwrap_or(false)
    }

    pub fn is_opaque_file_data(self) -> bool {
        self.kind().map(StreamKind::is_opaque_file_data).unwrap_or(false)
    }
}

impl From<StreamKind> for StreamTag {
    fn from(kind: StreamKind) -> Self {
        StreamTag::new(kind)
    }
}

impl fmt::Debug for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamTag({}={:#x})", self, self.0)
    }
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_continuation() {
            f.write_str("contSTREAM-")?;
        }
        match self.kind() {
            Some(kind) => f.write_str(kind.name())?,
            None       => write!(f, "{}", self.masked())?,
        }
        if self.0 > 0 && self.0 & STREAM_BIT_OFFSETS != 0 {
            f.write_str("+OFFSETS")?;
        }
        if self.is_dedup() {
            f.write_str("+DEDUP")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_strips_modifier_bits() {
        let tag = StreamTag::new(StreamKind::GzipData).with_offsets().with_dedup();
        assert_eq!(tag.masked(), StreamKind::GzipData as i32);
        assert!(tag.is_dedup());
        assert!(tag.has_offsets());
        assert_eq!(tag.kind(), Some(StreamKind::GzipData));
    }

    #[test]
    fn sparse_kinds_imply_offsets() {
        assert!(StreamTag::new(StreamKind::SparseData).has_offsets());
        assert!(!StreamTag::new(StreamKind::FileData).has_offsets());
        assert!(StreamTag::new(StreamKind::FileData).with_offsets().has_offsets());
    }

    #[test]
    fn continuation_keeps_the_kind() {
        let tag = StreamTag::new(StreamKind::FileData).with_offsets();
        let cont = tag.continuation();
        assert!(cont.is_continuation());
        assert_eq!(cont.kind(), Some(StreamKind::FileData));
        assert_eq!(cont.continuation(), cont);
        assert!(!cont.is_dedup());
    }

    #[test]
    fn every_kind_resolves_from_its_value() {
        for kind in StreamKind::ALL {
            assert_eq!(StreamKind::from_masked(kind as i32), Some(kind));
        }
        assert_eq!(StreamKind::from_masked(34), None);
        assert_eq!(StreamKind::from_masked(999), None);
    }
}
