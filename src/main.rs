use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use volstream::context::PipelineContext;
use volstream::crypto::VolumeKey;
use volstream::dedup::ChunkStore;
use volstream::device::{BlockMode, BlockSource, VolumeChain, VolumeFile};
use volstream::error::ErrorScope;
use volstream::extract::{ExtractionPipeline, LocalFs};
use volstream::filter::{Bootstrap, PathFilter};
use volstream::migrate::{JsonLinesCatalog, MigrationPipeline, NewSession};
use volstream::record::label_name;
use volstream::{JobOptions, JobStatus, Summary, VolumeReader};

#[derive(Parser)]
#[command(name = "volstream", about = "Read, extract and copy backup volumes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore the files of a volume below a directory
    Extract {
        /// Volume file, or the directory holding the volumes named by -V
        device: PathBuf,
        #[arg(value_name = "WHERE")]
        output: PathBuf,
        /// Bootstrap file selecting sessions and file indexes
        #[arg(short = 'b', long)]
        bootstrap: Option<PathBuf>,
        /// Job options file (JSON)
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
        /// Exclude list, one pattern per line
        #[arg(short = 'e', long)]
        exclude: Option<PathBuf>,
        /// Include list, one path per line
        #[arg(short = 'i', long)]
        include: Option<PathBuf>,
        /// Proceed despite errors
        #[arg(short = 'p', long)]
        proceed: bool,
        /// List files only, restore nothing
        #[arg(short = 't', long)]
        dry_run: bool,
        #[arg(short = 'v', long, action = clap::ArgAction::Count)]
        verbose: u8,
        /// Volume names separated by '|'
        #[arg(short = 'V', long)]
        volumes: Option<String>,
        /// Physical block size of a fixed-block volume
        #[arg(long)]
        fixed_block: Option<usize>,
        /// Directory of dedup chunks named by hex digest
        #[arg(long)]
        dedup_store: Option<PathBuf>,
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Copy the records of a volume to a new volume under a new session
    Copy {
        source: PathBuf,
        dest:   PathBuf,
        #[arg(long)]
        session_id: u32,
        /// Defaults to now
        #[arg(long)]
        session_time: Option<u32>,
        /// Bootstrap file selecting the sessions and file indexes to copy
        #[arg(short = 'b', long)]
        bootstrap: Option<PathBuf>,
        #[arg(short = 'p', long)]
        proceed: bool,
        #[arg(short = 'v', long, action = clap::ArgAction::Count)]
        verbose: u8,
        #[arg(short = 'V', long)]
        volumes: Option<String>,
        /// Hold catalog entries until the copy succeeds
        #[arg(long)]
        spool: bool,
        /// Write catalog entries as JSON lines to this file
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long)]
        fixed_block: Option<usize>,
        #[arg(long)]
        passphrase: Option<String>,
        #[arg(long)]
        dest_passphrase: Option<String>,
    },
    /// List the records of a volume, labels included
    Ls {
        device: PathBuf,
        #[arg(short = 'p', long)]
        proceed: bool,
        #[arg(short = 'v', long, action = clap::ArgAction::Count)]
        verbose: u8,
        #[arg(short = 'V', long)]
        volumes: Option<String>,
        #[arg(long)]
        fixed_block: Option<usize>,
        #[arg(long)]
        passphrase: Option<String>,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(match &cli.command {
        Commands::Extract { verbose, .. } | Commands::Copy { verbose, .. } | Commands::Ls { verbose, .. } => *verbose,
    });

    match run(cli.command) {
        Ok(summary) => {
            println!("{summary}");
            if summary.status == JobStatus::Failed { ExitCode::FAILURE } else { ExitCode::SUCCESS }
        }
        Err(e) => {
            match e.downcast_ref::<volstream::Aborted>() {
                Some(aborted) => {
                    println!("{}", aborted.summary);
                    eprintln!("volstream: {}", aborted.source);
                }
                None => eprintln!("volstream: {e}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Commands) -> CliResult<Summary> {
    match command {

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract {
            device, output, bootstrap, config, exclude, include, proceed, dry_run,
            verbose, volumes, fixed_block, dedup_store, passphrase,
        } => {
            let mut opts = match &config {
                Some(path) => JobOptions::load(path)?,
                None       => JobOptions::default(),
            };
            opts.forge_on     |= proceed;
            opts.skip_extract |= dry_run;
            opts.verbose       = opts.verbose.max(verbose);
            if let Some(v) = &volumes {
                opts.volume_names = split_volumes(v);
            }

            let bsr = bootstrap.as_deref().map(Bootstrap::load).transpose()?;
            if opts.volume_names.is_empty() {
                if let Some(bsr) = &bsr {
                    opts.volume_names = bsr.volumes.clone();
                }
            }
            let source = open_source(&device, &opts.volume_names, fixed_block)?;
            if !opts.skip_extract {
                std::fs::create_dir_all(&output)?;
            }

            let mut pipeline = ExtractionPipeline::new(opts, Box::new(LocalFs::new(&output)))
                .with_filter(PathFilter::from_lists(include.as_deref(), exclude.as_deref())?);
            if let Some(bsr) = bsr {
                pipeline = pipeline.with_selector(Box::new(bsr));
            }
            if let Some(dir) = &dedup_store {
                pipeline = pipeline.with_rehydrator(Box::new(ChunkStore::load_dir(dir)?));
            }
            if let Some(pass) = &passphrase {
                pipeline = pipeline.with_key(VolumeKey::from_passphrase(pass)?);
            }
            Ok(pipeline.run(source)?)
        }

        // ── Copy ─────────────────────────────────────────────────────────────
        Commands::Copy {
            source, dest, session_id, session_time, bootstrap, proceed, verbose, volumes,
            spool, catalog, fixed_block, passphrase, dest_passphrase,
        } => {
            let mut opts = JobOptions {
                forge_on: proceed,
                verbose,
                spool_attributes: spool,
                volume_names: volumes.as_deref().map(split_volumes).unwrap_or_default(),
                block_size: fixed_block.unwrap_or_else(|| JobOptions::default().block_size),
                ..Default::default()
            };
            opts.validate()?;

            let bsr = bootstrap.as_deref().map(Bootstrap::load).transpose()?;
            if opts.volume_names.is_empty() {
                if let Some(bsr) = &bsr {
                    opts.volume_names = bsr.volumes.clone();
                }
            }
            let input  = open_source(&source, &opts.volume_names, fixed_block)?;
            let output = VolumeFile::create(&dest, block_mode(fixed_block))?;
            let session = NewSession {
                session_id,
                session_time: session_time.unwrap_or_else(|| chrono::Utc::now().timestamp() as u32),
            };

            let mut pipeline = MigrationPipeline::new(opts);
            if let Some(bsr) = bsr {
                pipeline = pipeline.with_selector(Box::new(bsr));
            }
            if let Some(path) = &catalog {
                let file = std::io::BufWriter::new(std::fs::File::create(path)?);
                pipeline = pipeline.with_catalog(Box::new(JsonLinesCatalog::new(file)));
            }
            if let Some(pass) = &passphrase {
                pipeline = pipeline.with_source_key(VolumeKey::from_passphrase(pass)?);
            }
            if let Some(pass) = &dest_passphrase {
                pipeline = pipeline.with_dest_key(VolumeKey::from_passphrase(pass)?);
            }
            Ok(pipeline.run(input, output, session)?)
        }

        // ── Ls ───────────────────────────────────────────────────────────────
        Commands::Ls { device, proceed, verbose, volumes, fixed_block, passphrase } => {
            let opts = JobOptions {
                forge_on: proceed,
                verbose,
                volume_names: volumes.as_deref().map(split_volumes).unwrap_or_default(),
                ..Default::default()
            };
            let key = passphrase.as_deref().map(VolumeKey::from_passphrase).transpose()?;
            let source = open_source(&device, &opts.volume_names, fixed_block)?;
            list_records(source, opts, key)
        }
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn list_records(source: Box<dyn BlockSource>, opts: JobOptions, key: Option<VolumeKey>) -> CliResult<Summary> {
    let mut ctx = PipelineContext::new(opts);
    let mut reader = VolumeReader::with_options(source, ctx.options.verify_checksums, key);

    println!("{:>8}  {:<28} {:>10}  {:>8} {:>10}", "FileIdx", "Stream", "Length", "SessId", "SessTime");
    let status = loop {
        let record = match reader.next_record() {
            Ok(Some(record)) => record,
            Ok(None) => break JobStatus::Terminated,
            Err(e) if e.scope() == ErrorScope::Block && ctx.forge_on() => {
                ctx.counters.errors += 1;
                eprintln!("volstream: {e}");
                continue;
            }
            Err(e) => {
                ctx.counters.errors += 1;
                eprintln!("volstream: {e}");
                break JobStatus::Failed;
            }
        };
        ctx.note_record();
        if record.is_label() {
            ctx.counters.labels += 1;
        }
        if record.stream.is_attributes() && !record.is_label() {
            ctx.counters.files += 1;
        }
        ctx.counters.bytes += record.payload.len() as u64;
        let stream = label_name(record.file_index)
            .map(String::from)
            .unwrap_or_else(|| record.stream.to_string());
        println!(
            "{:>8}  {:<28} {:>10}  {:>8} {:>10}",
            record.file_index, stream, record.payload.len(), record.session_id, record.session_time
        );
    };
    reader.source_mut().release()?;
    ctx.counters.blocks         = reader.stats.blocks;
    ctx.counters.corrupt_blocks = reader.stats.corrupt_blocks;
    Ok(ctx.summary(status))
}

fn open_source(device: &Path, volumes: &[String], fixed_block: Option<usize>) -> CliResult<Box<dyn BlockSource>> {
    let mode = block_mode(fixed_block);
    if volumes.is_empty() {
        return Ok(Box::new(VolumeFile::open(device, mode)?));
    }
    Ok(Box::new(VolumeChain::open(device, volumes, mode)?))
}

fn block_mode(fixed_block: Option<usize>) -> BlockMode {
    match fixed_block {
        Some(size) => BlockMode::Fixed(size),
        None       => BlockMode::Variable,
    }
}

fn split_volumes(list: &str) -> Vec<String> {
    list.split('|').filter(|v| !v.is_empty()).map(String::from).collect()
}
