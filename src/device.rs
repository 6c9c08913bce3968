//! Raw block devices.
//!
//! The codec never positions or mounts media itself.  It pulls raw blocks
//! from a [`BlockSource`] and pushes serialized blocks into a [`BlockSink`].
//!
//! - [`VolumeFile`]: a volume stored in a file, either as back-to-back
//!   variable-length blocks or as fixed-size zero-padded physical blocks.
//! - [`VolumeChain`]: several sources read one after another.
//! - [`MemoryVolume`]: an in-memory list of blocks (source and sink).

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info};

use crate::block::{BLKHDR_MIN_LENGTH, MAX_BLOCK_LENGTH};

/// One block as read from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    /// Device-specific position of the block (byte offset or block index).
    pub address: u64,
    pub bytes:   Vec<u8>,
}

pub trait BlockSource {
    fn name(&self) -> &str;
    /// Next raw block; `Ok(None)` at end of data.
    fn read_block(&mut self) -> io::Result<Option<RawBlock>>;
    fn release(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub trait BlockSink {
    fn name(&self) -> &str;
    fn write_block(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// `false` once the device can no longer accept blocks.
    fn can_write(&self) -> bool {
        true
    }
    fn release(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: BlockSource + ?Sized> BlockSource for &mut T {
    fn name(&self) -> &str { (**self).name() }
    fn read_block(&mut self) -> io::Result<Option<RawBlock>> { (**self).read_block() }
    fn release(&mut self) -> io::Result<()> { (**self).release() }
}

impl<T: BlockSource + ?Sized> BlockSource for Box<T> {
    fn name(&self) -> &str { (**self).name() }
    fn read_block(&mut self) -> io::Result<Option<RawBlock>> { (**self).read_block() }
    fn release(&mut self) -> io::Result<()> { (**self).release() }
}

impl<T: BlockSink + ?Sized> BlockSink for &mut T {
    fn name(&self) -> &str { (**self).name() }
    fn write_block(&mut self, bytes: &[u8]) -> io::Result<()> { (**self).write_block(bytes) }
    fn can_write(&self) -> bool { (**self).can_write() }
    fn release(&mut self) -> io::Result<()> { (**self).release() }
}

impl<T: BlockSink + ?Sized> BlockSink for Box<T> {
    fn name(&self) -> &str { (**self).name() }
    fn write_block(&mut self, bytes: &[u8]) -> io::Result<()> { (**self).write_block(bytes) }
    fn can_write(&self) -> bool { (**self).can_write() }
    fn release(&mut self) -> io::Result<()> { (**self).release() }
}

// ── VolumeFile ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// Blocks stored back to back, each exactly `block_len` long.
    Variable,
    /// Every physical block is this many bytes, zero padded.
    Fixed(usize),
}

pub struct VolumeFile<F> {
    inner:    F,
    name:     String,
    mode:     BlockMode,
    position: u64,
    released: bool,
}

impl VolumeFile<BufReader<File>> {
    pub fn open(path: &Path, mode: BlockMode) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file), path.display().to_string(), mode))
    }
}

impl VolumeFile<BufWriter<File>> {
    pub fn create(path: &Path, mode: BlockMode) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file), path.display().to_string(), mode))
    }
}

impl<F> VolumeFile<F> {
    pub fn new(inner: F, name: impl Into<String>, mode: BlockMode) -> Self {
        Self { inner, name: name.into(), mode, position: 0, released: false }
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

/// Fill `buf` as far as the reader allows; returns the byte count.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn lost_sync(name: &str, position: u64, why: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("lost block sync on {name} at byte {position}: {why}"),
    )
}

impl<F: Read> BlockSource for VolumeFile<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_block(&mut self) -> io::Result<Option<RawBlock>> {
        let address = self.position;
        match self.mode {
            BlockMode::Fixed(size) => {
                let mut bytes = vec![0u8; size];
                let n = read_full(&mut self.inner, &mut bytes)?;
                if n == 0 {
                    return Ok(None);
                }
                bytes.truncate(n);
                self.position += n as u64;
                Ok(Some(RawBlock { address, bytes }))
            }
            BlockMode::Variable => {
                let mut prefix = [0u8; BLKHDR_MIN_LENGTH];
                let n = read_full(&mut self.inner, &mut prefix)?;
                if n == 0 {
                    return Ok(None);
                }
                if n < BLKHDR_MIN_LENGTH {
                    return Err(lost_sync(&self.name, address, "truncated block header"));
                }
                // The length sits at the same offset in every layout; a bad
                // tag is left for the header decoder to report.
                let block_len = BigEndian::read_u32(&prefix[4..8]) as usize;
                if !(BLKHDR_MIN_LENGTH..=MAX_BLOCK_LENGTH).contains(&block_len) {
                    return Err(lost_sync(&self.name, address, "impossible block length"));
                }
                let mut bytes = vec![0u8; block_len];
                bytes[..BLKHDR_MIN_LENGTH].copy_from_slice(&prefix);
                let got = read_full(&mut self.inner, &mut bytes[BLKHDR_MIN_LENGTH..])?;
                bytes.truncate(BLKHDR_MIN_LENGTH + got);
                self.position += bytes.len() as u64;
                Ok(Some(RawBlock { address, bytes }))
            }
        }
    }

    fn release(&mut self) -> io::Result<()> {
        if !self.released {
            self.released = true;
            debug!(device = %self.name, bytes = self.position, "volume released");
        }
        Ok(())
    }
}

impl<F: Write> BlockSink for VolumeFile<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_block(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.released {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, format!("{} already released", self.name)));
        }
        match self.mode {
            BlockMode::Variable => {
                self.inner.write_all(bytes)?;
                self.position += bytes.len() as u64;
            }
            BlockMode::Fixed(size) => {
                if bytes.len() > size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("block of {} bytes exceeds the {size}-byte physical block", bytes.len()),
                    ));
                }
                self.inner.write_all(bytes)?;
                self.inner.write_all(&vec![0u8; size - bytes.len()])?;
                self.position += size as u64;
            }
        }
        Ok(())
    }

    fn can_write(&self) -> bool {
        !self.released
    }

    fn release(&mut self) -> io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.inner.flush()?;
        debug!(device = %self.name, bytes = self.position, "volume released");
        Ok(())
    }
}

// ── VolumeChain ──────────────────────────────────────────────────────────────

/// Reads several volumes in order, moving to the next at end of data.
pub struct VolumeChain {
    volumes: Vec<Box<dyn BlockSource>>,
    current: usize,
}

impl VolumeChain {
    pub fn new(volumes: Vec<Box<dyn BlockSource>>) -> Self {
        Self { volumes, current: 0 }
    }

    /// Open `names` (relative to `dir` when not absolute) as file volumes.
    pub fn open(dir: &Path, names: &[String], mode: BlockMode) -> io::Result<Self> {
        let mut volumes: Vec<Box<dyn BlockSource>> = Vec::with_capacity(names.len());
        for name in names {
            volumes.push(Box::new(VolumeFile::open(&dir.join(name), mode)?));
        }
        Ok(Self::new(volumes))
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

impl BlockSource for VolumeChain {
    fn name(&self) -> &str {
        self.volumes
            .get(self.current)
            .or_else(|| self.volumes.last())
            .map(|v| v.name())
            .unwrap_or("<no volume>")
    }

    fn read_block(&mut self) -> io::Result<Option<RawBlock>> {
        while let Some(volume) = self.volumes.get_mut(self.current) {
            if let Some(block) = volume.read_block()? {
                return Ok(Some(block));
            }
            volume.release()?;
            self.current += 1;
            if let Some(next) = self.volumes.get(self.current) {
                info!(volume = next.name(), "end of volume, continuing on next");
            }
        }
        Ok(None)
    }

    fn release(&mut self) -> io::Result<()> {
        for volume in self.volumes.iter_mut().skip(self.current) {
            volume.release()?;
        }
        Ok(())
    }
}

// ── MemoryVolume ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MemoryVolume {
    name:     String,
    blocks:   Vec<Vec<u8>>,
    cursor:   usize,
    writable: bool,
    released: bool,
}

impl MemoryVolume {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), writable: true, ..Default::default() }
    }

    pub fn from_blocks(name: impl Into<String>, blocks: Vec<Vec<u8>>) -> Self {
        Self { name: name.into(), blocks, writable: true, ..Default::default() }
    }

    pub fn blocks(&self) -> &[Vec<u8>] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Vec<u8>> {
        self.blocks
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Make further writes fail, as a full or faulted device would.
    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.released = false;
    }
}

impl BlockSource for MemoryVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_block(&mut self) -> io::Result<Option<RawBlock>> {
        let Some(bytes) = self.blocks.get(self.cursor) else {
            return Ok(None);
        };
        let block = RawBlock { address: self.cursor as u64, bytes: bytes.clone() };
        self.cursor += 1;
        Ok(Some(block))
    }

    fn release(&mut self) -> io::Result<()> {
        self.released = true;
        Ok(())
    }
}

impl BlockSink for MemoryVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_block(&mut self, bytes: &[u8]) -> io::Result<()> {
        if !self.can_write() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, format!("{} is not writable", self.name)));
        }
        self.blocks.push(bytes.to_vec());
        Ok(())
    }

    fn can_write(&self) -> bool {
        self.writable && !self.released
    }

    fn release(&mut self) -> io::Result<()> {
        self.released = true;
        Ok(())
    }
}
