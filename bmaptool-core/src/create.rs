//! Contains the logic for generating a block map from an image file.
//!
//! Generation runs in three steps:
//! 1.  Ask the filesystem which parts of the image hold data.
//! 2.  Align those extents to blocks and merge them into ranges.
//! 3.  Digest every range (in parallel) and, optionally, the whole image.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{debug, info, warn};

use crate::checksum::{self, ChecksumAlgorithm};
use crate::chunker;
use crate::document::{self, BmapDocument};
use crate::error::{Error, Result};
use crate::extent::{ExtentSource, WholeFile};
use crate::platform;

/// How many ranges are digested between two progress reports.
const PROGRESS_BATCH: usize = 64;

#[derive(Clone, Debug)]
pub struct CreateOptions {
    pub block_size: u32,
    /// Digest algorithm for the ranges. `None` produces a document without
    /// any checksums.
    pub checksum: Option<ChecksumAlgorithm>,
    /// Also digest the whole image, holes included.
    pub image_checksum: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            checksum: Some(ChecksumAlgorithm::default()),
            image_checksum: false,
        }
    }
}

/// Generates the block map of the image at `image_path`.
///
/// Extents come from the best mechanism the filesystem supports. When there is
/// none, the whole image is treated as mapped, which is correct but produces a
/// document without holes.
///
/// # Arguments
///
/// * `image_path` - Path to the raw (uncompressed) image file.
/// * `options` - Block size and checksum settings.
/// * `running` - An `Arc<AtomicBool>` used to gracefully cancel the operation.
/// * `on_checksum_start` - Called once the ranges are known, with the number
///   of mapped blocks that will be digested.
/// * `on_checksum_progress` - Called with the number of mapped blocks
///   digested so far.
///
/// # Errors
///
/// This function will return an error if:
/// - The image cannot be opened or read.
/// - The block size is not a power of two.
/// - The operation is cancelled.
pub fn run<F>(
    image_path: &Path,
    options: &CreateOptions,
    running: Arc<AtomicBool>,
    on_checksum_start: impl FnOnce(u64),
    on_checksum_progress: F,
) -> Result<BmapDocument>
where
    F: FnMut(u64),
{
    let file = File::open(image_path).map_err(Error::io("Failed to open image"))?;

    let extents = match platform::extent_source(&file, image_path)
        .and_then(|mut source| source.discover_extents())
    {
        Ok(extents) => extents,
        Err(Error::UnsupportedFilesystem { path, source }) => {
            warn!(
                ?path,
                "Filesystem cannot report holes ({}), mapping the whole image",
                source.map_or_else(|| "no support".to_owned(), |e| e.to_string()),
            );
            WholeFile::for_file(&file)?.discover_extents()?
        }
        Err(e) => return Err(e),
    };

    generate(&file, extents, options, running, on_checksum_start, on_checksum_progress)
}

/// Generates a block map for `file` from extents found by any
/// [`ExtentSource`].
pub fn generate<F>(
    file: &File,
    mut extents: impl ExtentSource,
    options: &CreateOptions,
    running: Arc<AtomicBool>,
    on_checksum_start: impl FnOnce(u64),
    mut on_checksum_progress: F,
) -> Result<BmapDocument>
where
    F: FnMut(u64),
{
    let image_size = file
        .metadata()
        .map_err(Error::io("Failed to query image size"))?
        .len();
    let block_size = options.block_size;
    let total_blocks = document::blocks_for(image_size, block_size)?;

    let extents = extents.discover_extents()?;
    let mut ranges = chunker::chunk_extents(&extents, block_size, total_blocks);
    let mapped_blocks: u64 = ranges.iter().map(|r| r.block_count).sum();

    debug!(
        extents = extents.len(),
        ranges = ranges.len(),
        mapped_blocks,
        total_blocks,
        "Image layout discovered"
    );

    let mut image_checksum = None;

    if let Some(algorithm) = options.checksum {
        on_checksum_start(mapped_blocks);

        let mut done = 0;
        for batch in ranges.chunks_mut(PROGRESS_BATCH) {
            let digests = checksum::checksum_ranges(
                file,
                batch,
                block_size,
                image_size,
                algorithm,
                &running,
            )?;

            for (range, digest) in batch.iter_mut().zip(digests) {
                done += range.block_count;
                range.checksum = Some(digest);
            }
            on_checksum_progress(done);
        }

        if options.image_checksum {
            let mut reader = file;
            // Extent discovery may have moved the file cursor.
            reader
                .seek(SeekFrom::Start(0))
                .map_err(Error::io("Failed to rewind image"))?;
            image_checksum = Some(checksum::checksum_whole(reader, algorithm, &running)?);
        }
    }

    let doc = BmapDocument::new(block_size, image_size, ranges, image_checksum)?;

    info!(
        "Mapped {} of {} blocks ({} of {} bytes)",
        doc.mapped_block_count(),
        doc.total_blocks(),
        doc.mapped_bytes(),
        doc.image_size(),
    );

    Ok(doc)
}
