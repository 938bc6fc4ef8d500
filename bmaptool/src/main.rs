mod gpg;

use anyhow::{Context, Result};
use bmaptool_core::checksum::ChecksumAlgorithm;
use bmaptool_core::copy::{self, BmapInput, CopyOptions};
use bmaptool_core::create::{self, CreateOptions};
use bmaptool_core::destination::HolePolicy;
use bmaptool_core::source::Compression;
use bmaptool_core::{CopyError, Error, writer};
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufWriter, IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::gpg::GpgTrustStore;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "bmaptool")]
#[command(about = "Create block maps for sparse images and copy images with them", version)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only show warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a block map for a sparse image
    Create {
        /// Raw image file to map
        #[arg(required = true)]
        image: PathBuf,

        /// Write the block map here instead of standard output
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Block size in bytes (a power of two)
        #[arg(long, default_value_t = 4096)]
        block_size: u32,

        /// Digest algorithm for the mapped ranges
        #[arg(long, default_value = "sha256")]
        checksum_type: ChecksumAlgorithm,

        /// Produce a block map without checksums
        #[arg(long, conflicts_with = "image_checksum")]
        no_checksum: bool,

        /// Also digest the whole image
        #[arg(long)]
        image_checksum: bool,
    },
    /// Copy an image to a file or block device, skipping its holes
    Copy {
        /// Image to copy, possibly compressed, or `-` for standard input
        #[arg(required = true)]
        image: PathBuf,

        /// Destination file or block device
        #[arg(required = true)]
        dest: PathBuf,

        /// Block map of the image. Looked up next to the image by default
        #[arg(long, conflicts_with = "nobmap")]
        bmap: Option<PathBuf>,

        /// Detached signature of the block map
        #[arg(long, conflicts_with = "nobmap")]
        bmap_sig: Option<PathBuf>,

        /// Copy without a block map, skipping long runs of zeros
        #[arg(long)]
        nobmap: bool,

        /// Skip checking the written data against the block map
        #[arg(long)]
        no_verify: bool,

        /// Accept block maps without a valid signature
        #[arg(long)]
        no_sig_verify: bool,

        /// Deallocate (or zero) the holes of the image on the destination
        #[arg(long)]
        discard_holes: bool,

        /// GnuPG home directory holding the trusted keys
        #[arg(long)]
        gnupg_home: Option<PathBuf>,
    },
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`,
/// which would garble the progress bars when a copy is cancelled.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });

            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

fn init_logging(cli: &Cli) {
    let default = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{pos}}/{{len}} blocks ({{eta}})"
    );
    Ok(ProgressStyle::default_bar()
        .template(&template)?
        .progress_chars("■ "))
}

fn spinner_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_spinner()
        .template("{prefix:12} [{elapsed_precise}] [{spinner:.blue}] {pos} blocks")?)
}

/// Looks for `<image>.bmap` next to the image, with any compression suffix
/// removed first (`disk.img.xz` → `disk.img.bmap`, then `disk.bmap`).
fn discover_bmap(image: &Path) -> Option<PathBuf> {
    let name = image.file_name()?.to_str()?;

    let stem = [Compression::Gzip, Compression::Bzip2, Compression::Xz, Compression::Zstd]
        .iter()
        .flat_map(|c| c.suffixes())
        .find_map(|suffix| name.strip_suffix(suffix))
        .unwrap_or(name);

    let mut candidates = vec![format!("{stem}.bmap")];
    if let Some((base, _)) = stem.rsplit_once('.') {
        candidates.push(format!("{base}.bmap"));
    }

    candidates
        .into_iter()
        .map(|c| image.with_file_name(c))
        .find(|p| p.is_file())
}

/// Looks for a detached signature next to the block map.
fn discover_signature(bmap: &Path) -> Option<PathBuf> {
    [".asc", ".sig"]
        .into_iter()
        .map(|ext| {
            let mut path = OsString::from(bmap.as_os_str());
            path.push(ext);
            PathBuf::from(path)
        })
        .find(|p| p.is_file())
}

fn run_create(
    image: &Path,
    output: Option<&Path>,
    options: &CreateOptions,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let checksum_pb = if options.checksum.is_some() {
        ProgressBar::new(0)
    } else {
        ProgressBar::hidden()
    };
    let checksum_style = bar_style("green")?;

    let on_checksum_start = |blocks| {
        checksum_pb.set_length(blocks);
        checksum_pb.set_prefix("Checksum");
        checksum_pb.set_style(checksum_style);
    };
    let on_checksum_progress = |blocks| checksum_pb.set_position(blocks);

    let result = create::run(image, options, running, on_checksum_start, on_checksum_progress);

    let doc = match result {
        Ok(doc) => {
            checksum_pb.finish_with_message("Checksums complete.");
            doc
        }
        Err(e) => {
            checksum_pb.finish_and_clear();
            return Err(e).with_context(|| format!("Failed to map {image:?}"));
        }
    };

    match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {path:?}"))?;
            writer::write(&doc, BufWriter::new(file))
                .with_context(|| format!("Failed to write {path:?}"))?;
            info!("Block map written to {path:?}");
        }
        None => writer::write(&doc, stdout().lock()).context("Failed to write block map")?,
    }

    Ok(())
}

struct CopyArgs {
    image: PathBuf,
    dest: PathBuf,
    bmap: Option<PathBuf>,
    bmap_sig: Option<PathBuf>,
    nobmap: bool,
    options: CopyOptions,
}

fn run_copy(args: CopyArgs, running: Arc<AtomicBool>) -> Result<()> {
    let bmap_path = if args.nobmap {
        None
    } else {
        args.bmap.or_else(|| discover_bmap(&args.image))
    };

    let bmap = match &bmap_path {
        Some(path) => {
            info!("Using block map {path:?}");
            Some(std::fs::read(path).with_context(|| format!("Failed to read {path:?}"))?)
        }
        None => {
            if !args.nobmap {
                warn!("No block map found for {:?}, copying without one", args.image);
            }
            None
        }
    };

    let sig_path = args
        .bmap_sig
        .or_else(|| bmap_path.as_deref().and_then(discover_signature));
    let signature = match &sig_path {
        Some(path) => {
            info!("Using block map signature {path:?}");
            Some(std::fs::read(path).with_context(|| format!("Failed to read {path:?}"))?)
        }
        None => None,
    };

    let copy_pb = ProgressBar::new(0);
    let bar = bar_style("green")?;
    let spinner = spinner_style()?;

    let on_copy_start = |total: Option<u64>| {
        copy_pb.set_prefix("Copying");
        match total {
            Some(total) => {
                copy_pb.set_length(total);
                copy_pb.set_style(bar);
            }
            None => {
                copy_pb.set_style(spinner);
                copy_pb.enable_steady_tick(Duration::from_millis(100));
            }
        }
    };
    let on_progress = |done, total: Option<u64>| {
        if let Some(total) = total {
            copy_pb.set_length(total);
        }
        copy_pb.set_position(done);
    };

    let result = copy::run(
        &args.image,
        &args.dest,
        bmap.as_deref().map(|document| BmapInput {
            document,
            signature: signature.as_deref(),
        }),
        &args.options,
        running,
        on_copy_start,
        on_progress,
    );

    match result {
        Ok(report) => {
            copy_pb.finish_with_message("Copy complete.");
            println!(
                "\n✨ Successfully copied {} to {}: {} written, {} of holes skipped.",
                style(args.image.display()).cyan(),
                style(args.dest.display()).cyan(),
                HumanBytes(report.bytes_copied),
                HumanBytes(report.bytes_skipped),
            );
            Ok(())
        }
        Err(e) => {
            copy_pb.finish_and_clear();
            Err(e).with_context(|| format!("Failed to copy {:?} to {:?}", args.image, args.dest))
        }
    }
}

fn run(cli: Cli, running: Arc<AtomicBool>) -> Result<()> {
    match cli.command {
        Commands::Create {
            image,
            output,
            block_size,
            checksum_type,
            no_checksum,
            image_checksum,
        } => {
            let options = CreateOptions {
                block_size,
                checksum: (!no_checksum).then_some(checksum_type),
                image_checksum,
            };
            run_create(&image, output.as_deref(), &options, running)
        }
        Commands::Copy {
            image,
            dest,
            bmap,
            bmap_sig,
            nobmap,
            no_verify,
            no_sig_verify,
            discard_holes,
            gnupg_home,
        } => {
            let options = CopyOptions {
                verify: !no_verify,
                verify_signature: !no_sig_verify,
                trust_store: Some(Arc::new(GpgTrustStore::new(gnupg_home))),
                hole_policy: if discard_holes {
                    HolePolicy::Punch
                } else {
                    HolePolicy::Skip
                },
                ..Default::default()
            };
            let args = CopyArgs {
                image,
                dest,
                bmap,
                bmap_sig,
                nobmap,
                options,
            };
            run_copy(args, running)
        }
    }
}

/// Picks the exit code of the first core error in the chain.
fn exit_code(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(e) = cause.downcast_ref::<CopyError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<Error>() {
            return e.exit_code();
        }
    }
    1
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // This flag allows for graceful cancellation of operations.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Ranges already queued are finished before the copy stops.
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl+C handler: {e}");
    }

    match run(cli, running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
