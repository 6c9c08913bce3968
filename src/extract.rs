//! Extraction: materialize the files of a volume under an output root.
//!
//! Attribute records open files, data records fill them.  An attribute
//! record first closes the file opened by the previous one (applying its
//! final attributes), then asks the [`FileCreator`] what to do with the new
//! file.  Data is written at the tracked file address; offset-bearing
//! records move it, with a seek only when the address actually changes.
//!
//! In dry-run mode (`skip_extract`) every record is still decoded, but
//! nothing touches the filesystem.

use std::fs::{self, File};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::attr::{Attributes, UnixAttributes, FT_DELETED, FT_DIREND, FT_LNK, FT_LNKSAVED, FT_REG, FT_REGE};
use crate::context::{CancelToken, JobOptions, JobStatus, PipelineContext, Summary};
use crate::crypto::VolumeKey;
use crate::dedup::Rehydrator;
use crate::device::BlockSource;
use crate::dispatch::{Action, StreamDispatcher};
use crate::error::{Aborted, Error, ErrorScope, Result};
use crate::filter::{AcceptAll, PathFilter, RecordSelector};
use crate::io_stream::VolumeReader;
use crate::record::Record;

// ── Collaborators ────────────────────────────────────────────────────────────

pub trait OutputFile {
    fn path(&self) -> &Path;
    fn seek_to(&mut self, offset: u64) -> io::Result<()>;
    fn write_data(&mut self, data: &[u8]) -> io::Result<()>;
    /// Close the file and apply its final attributes.
    fn finish(self: Box<Self>, attrs: &Attributes) -> io::Result<()>;
}

pub enum Disposition {
    /// Open for data; later data records are written into it.
    Extract(Box<dyn OutputFile>),
    /// Fully created already (directory, link, empty special file).
    Created,
    Skip,
}

pub trait FileCreator {
    fn create(&mut self, attrs: &Attributes) -> io::Result<Disposition>;
}

// ── LocalFs ──────────────────────────────────────────────────────────────────

/// Creates files under `root`, mirroring the absolute paths of the volume.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a volume path below the root; `None` for paths that escape it.
    pub fn target(&self, fname: &str) -> Option<PathBuf> {
        let mut out = self.root.clone();
        let mut pushed = false;
        for component in Path::new(fname).components() {
            match component {
                Component::Normal(part) => {
                    out.push(part);
                    pushed = true;
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => return None,
            }
        }
        pushed.then_some(out)
    }
}

impl FileCreator for LocalFs {
    fn create(&mut self, attrs: &Attributes) -> io::Result<Disposition> {
        let Some(target) = self.target(&attrs.fname) else {
            warn!(fname = %attrs.fname, "refusing to restore unsafe path");
            return Ok(Disposition::Skip);
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        match attrs.file_type {
            FT_REG | FT_REGE => {
                let file = File::create(&target)?;
                Ok(Disposition::Extract(Box::new(LocalFile { file: BufWriter::new(file), path: target })))
            }
            FT_DIREND => {
                fs::create_dir_all(&target)?;
                apply_mode(&target, attrs.stat.mode)?;
                Ok(Disposition::Created)
            }
            FT_LNK => {
                if fs::symlink_metadata(&target).is_ok() {
                    fs::remove_file(&target)?;
                }
                create_symlink(Path::new(&attrs.link), &target)?;
                Ok(Disposition::Created)
            }
            FT_LNKSAVED => {
                let Some(original) = self.target(&attrs.link) else {
                    warn!(fname = %attrs.fname, link = %attrs.link, "hard link target outside the output root");
                    return Ok(Disposition::Skip);
                };
                if fs::symlink_metadata(&target).is_ok() {
                    fs::remove_file(&target)?;
                }
                fs::hard_link(original, &target)?;
                Ok(Disposition::Created)
            }
            other => {
                debug!(fname = %attrs.fname, file_type = other, "file type not restored");
                Ok(Disposition::Skip)
            }
        }
    }
}

#[cfg(unix)]
fn create_symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn create_symlink(_link: &Path, target: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, format!("symlinks not supported: {}", target.display())))
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode & 0o7777 == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

struct LocalFile {
    file: BufWriter<File>,
    path: PathBuf,
}

impl OutputFile for LocalFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn write_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }

    fn finish(self: Box<Self>, attrs: &Attributes) -> io::Result<()> {
        let LocalFile { file, path } = *self;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        // Trailing holes of sparse files leave the file short.
        if attrs.stat.size > 0 && file.metadata()?.len() < attrs.stat.size as u64 {
            file.set_len(attrs.stat.size as u64)?;
        }
        file.sync_all()?;
        drop(file);
        apply_mode(&path, attrs.stat.mode)
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

struct OpenFile {
    out:     Box<dyn OutputFile>,
    attrs:   Attributes,
    address: u64,
}

enum LoopEnd {
    Done,
    Canceled,
}

pub struct ExtractionPipeline {
    ctx:        PipelineContext,
    dispatcher: StreamDispatcher,
    creator:    Box<dyn FileCreator>,
    filter:     PathFilter,
    selector:   Box<dyn RecordSelector>,
    key:        Option<VolumeKey>,
    open:       Option<OpenFile>,
    curr_fname: String,
}

impl ExtractionPipeline {
    pub fn new(options: JobOptions, creator: Box<dyn FileCreator>) -> Self {
        let dispatcher = StreamDispatcher::new(&options);
        Self {
            ctx: PipelineContext::new(options),
            dispatcher,
            creator,
            filter: PathFilter::default(),
            selector: Box::new(AcceptAll),
            key: None,
            open: None,
            curr_fname: String::new(),
        }
    }

    pub fn with_rehydrator(mut self, rehydrator: Box<dyn Rehydrator>) -> Self {
        self.dispatcher =
            StreamDispatcher::with_collaborators(&self.ctx.options, rehydrator, Box::new(UnixAttributes));
        self
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_selector(mut self, selector: Box<dyn RecordSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_key(mut self, key: VolumeKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.ctx.cancel = cancel;
        self
    }

    /// Read `source` to the end and extract what it holds.
    pub fn run<S: BlockSource>(mut self, source: S) -> std::result::Result<Summary, Aborted> {
        let verify = self.ctx.options.verify_checksums;
        let mut reader = VolumeReader::with_options(source, verify, self.key.clone());

        let outcome = self.read_loop(&mut reader);
        if let Err(e) = &outcome {
            error!(
                fname = %self.curr_fname,
                record = self.ctx.counters.records,
                block = ?reader.current_block(),
                "extraction stopped: {e}"
            );
        }
        let closed   = self.close_file();
        let released = reader.source_mut().release().map_err(Error::from);

        let stats = &reader.stats;
        self.ctx.counters.blocks         = stats.blocks;
        self.ctx.counters.corrupt_blocks = stats.corrupt_blocks;
        self.ctx.counters.errors        += self.dispatcher.stats.errors;
        self.ctx.counters.unsupported    = self.dispatcher.stats.unsupported;

        let result = outcome.and_then(|end| closed.and(released).map(|_| end));
        match result {
            Ok(LoopEnd::Done) => Ok(self.ctx.summary(JobStatus::Terminated)),
            Ok(LoopEnd::Canceled) => Ok(self.ctx.summary(JobStatus::Canceled)),
            Err(source) => Err(Aborted { summary: self.ctx.summary(JobStatus::Failed), source }),
        }
    }

    fn read_loop<S: BlockSource>(&mut self, reader: &mut VolumeReader<S>) -> Result<LoopEnd> {
        loop {
            if self.ctx.is_canceled() {
                info!(records = self.ctx.counters.records, "extraction canceled");
                return Ok(LoopEnd::Canceled);
            }
            let record = match reader.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(LoopEnd::Done),
                Err(e) if e.scope() == ErrorScope::Block => {
                    self.ctx.counters.errors += 1;
                    if !self.ctx.forge_on() {
                        return Err(e);
                    }
                    warn!(fname = %self.curr_fname, "{e}; continuing");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if record.is_label() {
                self.ctx.counters.labels += 1;
                continue;
            }
            if !self.selector.accept(&record) {
                continue;
            }
            self.ctx.note_record();
            self.handle(record)?;
        }
    }

    fn handle(&mut self, record: Record) -> Result<()> {
        let dry_run = self.ctx.options.skip_extract;

        if record.stream.is_attributes() {
            self.close_file()?;
        } else if record.stream.is_opaque_file_data() {
            // The rest of the file cannot be restored; keep what was written.
            if let Some(open) = self.open.as_ref() {
                warn!(fname = %open.attrs.fname, stream = %record.stream, "cannot decode file data, closing file");
                self.close_file()?;
            }
        } else if !dry_run && self.open.is_none() && (record.stream.is_file_data() || record.stream.is_dedup()) {
            // Data of a skipped or abandoned file.
            return Ok(());
        }

        match self.dispatcher.dispatch(record)? {
            Action::StoreAttributes(attrs) => self.open_file(attrs),
            Action::WriteBytes { offset, data } => self.write(offset, &data),
            Action::Ignore => Ok(()),
            Action::Error(fault) => {
                if !self.ctx.forge_on() {
                    if let Some(open) = self.open.take() {
                        warn!(fname = %open.attrs.fname, file_index = fault.file_index, "abandoning file after record error");
                    }
                }
                Ok(())
            }
        }
    }

    fn open_file(&mut self, attrs: Attributes) -> Result<()> {
        self.curr_fname.clone_from(&attrs.fname);

        if !self.filter.accepts(&attrs.fname) {
            return Ok(());
        }
        if self.ctx.options.skip_extract {
            self.ctx.counters.files += 1;
            if self.ctx.options.verbose > 0 {
                info!("{}", attrs.ls_line());
            }
            return Ok(());
        }
        if attrs.file_type == FT_DELETED {
            info!(fname = %attrs.fname, "file was deleted");
            return Ok(());
        }

        match self.creator.create(&attrs) {
            Ok(Disposition::Extract(out)) => {
                self.ctx.counters.files += 1;
                if self.ctx.options.verbose > 0 {
                    info!("{}", attrs.ls_line());
                }
                self.open = Some(OpenFile { out, attrs, address: 0 });
            }
            Ok(Disposition::Created) => {
                self.ctx.counters.files += 1;
                if self.ctx.options.verbose > 0 {
                    info!("{}", attrs.ls_line());
                }
            }
            Ok(Disposition::Skip) => {}
            Err(e) => {
                self.ctx.counters.errors += 1;
                warn!(fname = %attrs.fname, "cannot create file: {e}");
            }
        }
        Ok(())
    }

    fn write(&mut self, offset: Option<u64>, data: &[u8]) -> Result<()> {
        self.ctx.counters.bytes += data.len() as u64;
        let Some(open) = self.open.as_mut() else {
            return Ok(());
        };
        if let Some(offset) = offset {
            if offset != open.address {
                open.out.seek_to(offset).map_err(|source| Error::Seek {
                    path: open.out.path().to_path_buf(),
                    offset,
                    source,
                })?;
                self.ctx.counters.seeks += 1;
                open.address = offset;
            }
        }
        open.out.write_data(data).map_err(|source| Error::Write {
            path: open.out.path().to_path_buf(),
            source,
        })?;
        open.address += data.len() as u64;
        Ok(())
    }

    fn close_file(&mut self) -> Result<()> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        let path = open.out.path().to_path_buf();
        open.out
            .finish(&open.attrs)
            .map_err(|source| Error::Write { path, source })
    }
}

/// Extract everything on `source` below `output_root`.
pub fn extract_volume<S: BlockSource>(
    source:      S,
    output_root: &Path,
    options:     JobOptions,
) -> std::result::Result<Summary, Aborted> {
    ExtractionPipeline::new(options, Box::new(LocalFs::new(output_root))).run(source)
}
