//! Contains the logic for copying an image to a destination.
//!
//! A copy goes through `Idle → Preparing → Copying → Verifying → Done`, or ends
//! in `Failed`. With a block map, only the mapped ranges are read and written;
//! without one, the source is scanned for long runs of zeros instead.
//!
//! Copying runs as a three-stage pipeline:
//! 1.  A reader thread decompresses the source and queues range payloads.
//! 2.  A writer thread writes them at their offsets and punches holes.
//! 3.  The calling thread re-reads every finished range from the destination,
//!     compares its digest with the block map and reports progress.
//!
//! The stages talk through bounded channels, so a fast decompressor cannot run
//! ahead of a slow destination by more than a few buffers.

use std::io::{self, Read};
use std::panic;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, ScopedJoinHandle};

use tracing::{debug, info};

use crate::checksum;
use crate::destination::{DestinationTarget, FileTarget, HolePolicy};
use crate::document::BmapDocument;
use crate::error::{CopyError, Error, Result};
use crate::reader;
use crate::signature::{SignatureVerifier, TrustStore};
use crate::source::{Compression, ImageSource};
use crate::stream::{self, ReadAt};

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB
/// Granularity of zero detection when there is no block map.
const SPARSE_BLOCK_SIZE: u32 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Preparing,
    Copying,
    Verifying,
    Done,
    Failed,
}

#[derive(Clone)]
pub struct CopyOptions {
    /// Re-read and check every range that has a digest.
    pub verify: bool,
    /// Refuse block maps that `trust_store` does not vouch for.
    pub verify_signature: bool,
    pub trust_store: Option<Arc<dyn TrustStore>>,
    pub hole_policy: HolePolicy,
    /// Payloads of up to 1 MiB that may wait between two stages.
    pub queue_depth: usize,
    /// Shortest run of zeros treated as a hole when there is no block map.
    pub min_zero_run: u64,
    /// Source encoding. `None` detects it.
    pub compression: Option<Compression>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            verify: true,
            verify_signature: true,
            trust_store: None,
            hole_policy: HolePolicy::default(),
            queue_depth: 8,
            min_zero_run: 64 * 1024,
            compression: None,
        }
    }
}

impl CopyOptions {
    fn signature_verifier(&self) -> Result<SignatureVerifier> {
        if !self.verify_signature {
            return Ok(SignatureVerifier::disabled());
        }

        match &self.trust_store {
            Some(store) => Ok(SignatureVerifier::enforcing(store.clone())),
            None => Err(Error::SignatureInvalid(
                "Signature verification is enabled, but no trust store is available".to_owned(),
            )),
        }
    }
}

/// What a finished copy did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub bytes_copied: u64,
    /// Bytes of holes that were skipped or punched instead of copied.
    pub bytes_skipped: u64,
    pub ranges: usize,
}

/// A raw block map as handed to [`run`], before any parsing.
#[derive(Clone, Copy, Debug)]
pub struct BmapInput<'a> {
    pub document: &'a [u8],
    /// Detached signature of `document`.
    pub signature: Option<&'a [u8]>,
}

enum Job {
    Data { offset: u64, bytes: Vec<u8> },
    Hole { offset: u64, len: u64 },
    /// Every byte of range `index`, which ends at byte `end`, has been queued.
    EndOfRange { index: usize, end: u64 },
}

struct Completed {
    index: usize,
    end: u64,
}

/// Drives one copy from start to finish.
pub struct CopyEngine {
    state: State,
    options: CopyOptions,
    running: Arc<AtomicBool>,
}

impl CopyEngine {
    pub fn new(options: CopyOptions, running: Arc<AtomicBool>) -> Self {
        Self {
            state: State::Idle,
            options,
            running,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn transition(&mut self, next: State) {
        debug!(from = ?self.state, to = ?next, "Copy state changed");
        self.state = next;
    }

    fn fail(&mut self, error: Error, completed_ranges: usize, total_ranges: usize) -> CopyError {
        self.transition(State::Failed);
        CopyError {
            error,
            completed_ranges,
            total_ranges,
        }
    }

    /// Checks the signature of a raw block map and parses it. Nothing is
    /// written anywhere, so a bad document never touches the destination.
    pub fn prepare(&mut self, bmap: &[u8], signature: Option<&[u8]>) -> Result<BmapDocument> {
        self.transition(State::Preparing);

        let result = self
            .options
            .signature_verifier()
            .and_then(|verifier| verifier.authenticate(bmap, signature))
            .and_then(|document| reader::parse(&document));

        match result {
            Ok(doc) => {
                debug!(
                    version = %doc.version(),
                    ranges = doc.ranges().len(),
                    mapped_blocks = doc.mapped_block_count(),
                    "Block map accepted"
                );
                Ok(doc)
            }
            Err(e) => {
                self.transition(State::Failed);
                Err(e)
            }
        }
    }

    /// Copies `source` to `target`, guided by `document` when there is one.
    ///
    /// `on_progress` receives `(blocks_processed, total_blocks)` after every
    /// range. The total is unknown when there is no document and the source
    /// length cannot be known up front. Cancellation through the `running`
    /// flag is honoured between ranges only.
    pub fn copy<F>(
        mut self,
        source: ImageSource,
        document: Option<&BmapDocument>,
        target: &dyn DestinationTarget,
        mut on_progress: F,
    ) -> std::result::Result<CopyReport, CopyError>
    where
        F: FnMut(u64, Option<u64>),
    {
        let total_ranges = document.map_or(0, |d| d.ranges().len());

        if self.state == State::Idle {
            self.transition(State::Preparing);
        }
        if let Some(doc) = document {
            if let Err(e) = check_capacity(target, doc) {
                return Err(self.fail(e, 0, total_ranges));
            }
        } else {
            info!("No block map given, copying with zero detection");
        }

        self.transition(State::Copying);
        let (result, completed) = self.pipeline(source, document, target, &mut on_progress);
        let (bytes_copied, image_len) = match result {
            Ok(r) => r,
            Err(e) => {
                let total = if document.is_some() { total_ranges } else { completed };
                return Err(self.fail(e, completed, total));
            }
        };

        self.transition(State::Verifying);
        let finish = || -> io::Result<()> {
            if document.is_none() {
                target.set_len(image_len)?;
            }
            target.sync()
        };
        if let Err(e) = finish() {
            let total = if document.is_some() { total_ranges } else { completed };
            return Err(self.fail(Error::Io("Failed to flush destination", e), completed, total));
        }

        let block_size = document.map_or(SPARSE_BLOCK_SIZE, |d| d.block_size());
        let total_blocks = image_len.div_ceil(u64::from(block_size));
        on_progress(total_blocks, Some(total_blocks));

        let report = CopyReport {
            bytes_copied,
            bytes_skipped: image_len.saturating_sub(bytes_copied),
            ranges: completed,
        };
        self.transition(State::Done);
        info!(
            "Copied {} bytes in {} ranges, skipped {} bytes of holes",
            report.bytes_copied, report.ranges, report.bytes_skipped,
        );

        Ok(report)
    }

    /// Runs the reader, writer and verifier stages. Returns the bytes written
    /// and the image length, plus the number of ranges that made it through.
    fn pipeline<F>(
        &self,
        source: ImageSource,
        document: Option<&BmapDocument>,
        target: &dyn DestinationTarget,
        on_progress: &mut F,
    ) -> (Result<(u64, u64)>, usize)
    where
        F: FnMut(u64, Option<u64>),
    {
        let depth = self.options.queue_depth.max(1);
        let (job_tx, job_rx) = mpsc::sync_channel::<Job>(depth);
        let (done_tx, done_rx) = mpsc::sync_channel::<Completed>(depth);

        let running: &AtomicBool = &self.running;
        // Without a block map, zero runs are image content and must reach the
        // destination whatever the hole policy says.
        let punch_holes = !target.is_pre_zeroed()
            && (self.options.hole_policy == HolePolicy::Punch || document.is_none());
        let min_zero_run = self.options.min_zero_run;
        let verify = self.options.verify;

        let progress = ProgressScale {
            block_size: u64::from(document.map_or(SPARSE_BLOCK_SIZE, |d| d.block_size())),
            total_blocks: match document {
                Some(doc) => Some(doc.total_blocks()),
                None => source.len().map(|len| len.div_ceil(u64::from(SPARSE_BLOCK_SIZE))),
            },
        };

        let mut completed = 0;

        let (read_result, write_result, verify_result) = thread::scope(|s| {
            let reader = s.spawn(move || {
                let mut source = source;
                match document {
                    Some(doc) => read_mapped(&mut source, doc, punch_holes, &job_tx, running)
                        .map(|()| doc.image_size()),
                    None => read_sparse(&mut source, min_zero_run, punch_holes, &job_tx, running),
                }
            });
            let writer = s.spawn(move || write_stage(target, job_rx, done_tx));

            let verified = verify_stage(
                target,
                document.filter(|_| verify),
                done_rx,
                progress,
                &mut completed,
                on_progress,
            );

            (join(reader), join(writer), verified)
        });

        // The most downstream failure wins. Upstream stages only fail because
        // of it once it has hung up.
        let result = verify_result
            .and(write_result)
            .and_then(|written| read_result.map(|len| (written, len)));

        (result, completed)
    }
}

fn join<T>(handle: ScopedJoinHandle<'_, T>) -> T {
    handle.join().unwrap_or_else(|e| panic::resume_unwind(e))
}

fn check_capacity(target: &dyn DestinationTarget, doc: &BmapDocument) -> Result<()> {
    let capacity = target
        .capacity()
        .map_err(Error::io("Failed to query destination size"))?;
    if capacity < doc.image_size() {
        return Err(Error::DestinationTooSmall {
            capacity,
            required: doc.image_size(),
        });
    }
    Ok(())
}

fn send<T>(tx: &SyncSender<T>, msg: T) -> Result<()> {
    tx.send(msg)
        .map_err(|_| Error::Io("Copy pipeline stopped", io::ErrorKind::BrokenPipe.into()))
}

/// Queues the mapped ranges of `doc`, in ascending order, skipping the holes
/// between them in the source.
fn read_mapped(
    source: &mut ImageSource,
    doc: &BmapDocument,
    punch_holes: bool,
    tx: &SyncSender<Job>,
    running: &AtomicBool,
) -> Result<()> {
    let mut next = 0;

    for (index, range) in doc.ranges().iter().enumerate() {
        stream::check_running(running).map_err(Error::io("Copy interrupted"))?;

        let (offset, len) = range.byte_span(doc.block_size(), doc.image_size());
        if punch_holes && offset > next {
            send(tx, Job::Hole { offset: next, len: offset - next })?;
        }

        source
            .advance_to(offset)
            .map_err(Error::io("Failed to skip over a hole in the image"))?;

        let mut done = 0;
        while done < len {
            let n = (len - done).min(BUFFER_SIZE as u64) as usize;
            let mut bytes = vec![0u8; n];
            source
                .read_exact(&mut bytes)
                .map_err(Error::io("Failed to read image"))?;
            send(tx, Job::Data { offset: offset + done, bytes })?;
            done += n as u64;
        }

        send(tx, Job::EndOfRange { index, end: offset + len })?;
        next = offset + len;
    }

    if punch_holes && doc.image_size() > next {
        send(tx, Job::Hole { offset: next, len: doc.image_size() - next })?;
    }

    Ok(())
}

/// Splits a stream into data ranges and long zero runs.
struct ZeroRunSplitter<'a> {
    tx: &'a SyncSender<Job>,
    min_zero_run: u64,
    punch_holes: bool,
    data: Vec<u8>,
    data_offset: u64,
    zero_offset: u64,
    zero_len: u64,
    ranges: usize,
}

impl<'a> ZeroRunSplitter<'a> {
    fn new(tx: &'a SyncSender<Job>, min_zero_run: u64, punch_holes: bool) -> Self {
        Self {
            tx,
            min_zero_run: min_zero_run.max(1),
            punch_holes,
            data: Vec::with_capacity(BUFFER_SIZE),
            data_offset: 0,
            zero_offset: 0,
            zero_len: 0,
            ranges: 0,
        }
    }

    fn push(&mut self, offset: u64, block: &[u8]) -> Result<()> {
        if block.iter().all(|b| *b == 0) {
            if self.zero_len == 0 {
                self.zero_offset = offset;
            }
            self.zero_len += block.len() as u64;
            return Ok(());
        }

        self.settle_zeros()?;
        if self.data.is_empty() {
            self.data_offset = offset;
        }
        self.data.extend_from_slice(block);

        if self.data.len() >= BUFFER_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    /// Decides whether the pending zero run is a hole or part of the data.
    fn settle_zeros(&mut self) -> Result<()> {
        if self.zero_len == 0 {
            return Ok(());
        }

        if self.zero_len >= self.min_zero_run {
            self.flush()?;
            if self.punch_holes {
                send(self.tx, Job::Hole { offset: self.zero_offset, len: self.zero_len })?;
            }
        } else {
            if self.data.is_empty() {
                self.data_offset = self.zero_offset;
            }
            let len = self.data.len() + self.zero_len as usize;
            self.data.resize(len, 0);
        }

        self.zero_len = 0;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.data.is_empty() {
            return Ok(());
        }

        let bytes = std::mem::replace(&mut self.data, Vec::with_capacity(BUFFER_SIZE));
        let end = self.data_offset + bytes.len() as u64;
        send(self.tx, Job::Data { offset: self.data_offset, bytes })?;
        send(self.tx, Job::EndOfRange { index: self.ranges, end })?;
        self.ranges += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.settle_zeros()?;
        self.flush()
    }
}

/// Queues the non-zero parts of `source` and returns its total length.
fn read_sparse(
    source: &mut ImageSource,
    min_zero_run: u64,
    punch_holes: bool,
    tx: &SyncSender<Job>,
    running: &AtomicBool,
) -> Result<u64> {
    let mut splitter = ZeroRunSplitter::new(tx, min_zero_run, punch_holes);
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut pos = 0;

    loop {
        stream::check_running(running).map_err(Error::io("Copy interrupted"))?;

        let n = read_full(source, &mut buf).map_err(Error::io("Failed to read image"))?;
        if n == 0 {
            break;
        }

        for block in buf[..n].chunks(SPARSE_BLOCK_SIZE as usize) {
            splitter.push(pos, block)?;
            pos += block.len() as u64;
        }
    }

    splitter.finish()?;
    Ok(pos)
}

/// Fills `buf` as far as the stream allows. Returns less than `buf.len()`
/// only at the end of the stream.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn write_stage(
    target: &dyn DestinationTarget,
    rx: Receiver<Job>,
    done: SyncSender<Completed>,
) -> Result<u64> {
    let mut written = 0;

    for job in rx {
        match job {
            Job::Data { offset, bytes } => {
                target
                    .write_at(&bytes, offset)
                    .map_err(Error::io("Failed to write to destination"))?;
                written += bytes.len() as u64;
            }
            Job::Hole { offset, len } => target
                .punch_hole(offset, len)
                .map_err(Error::io("Failed to clear a hole in the destination"))?,
            Job::EndOfRange { index, end } => send(&done, Completed { index, end })?,
        }
    }

    Ok(written)
}

#[derive(Clone, Copy)]
struct ProgressScale {
    block_size: u64,
    total_blocks: Option<u64>,
}

fn verify_stage<F>(
    target: &dyn DestinationTarget,
    document: Option<&BmapDocument>,
    rx: Receiver<Completed>,
    progress: ProgressScale,
    completed: &mut usize,
    on_progress: &mut F,
) -> Result<()>
where
    F: FnMut(u64, Option<u64>),
{
    for Completed { index, end } in rx {
        if let Some(doc) = document {
            verify_range(target, doc, index)?;
        }
        *completed += 1;
        on_progress(end.div_ceil(progress.block_size), progress.total_blocks);
    }

    Ok(())
}

/// Re-reads range `index` from `target` and compares it with its digest.
fn verify_range(target: &(impl ReadAt + ?Sized), doc: &BmapDocument, index: usize) -> Result<()> {
    let range = &doc.ranges()[index];
    let Some(expected) = &range.checksum else {
        return Ok(());
    };

    let (offset, len) = range.byte_span(doc.block_size(), doc.image_size());
    let actual = checksum::digest_at(target, offset, len, expected.algorithm())
        .map_err(Error::io("Failed to read back destination"))?;

    if &actual != expected {
        return Err(Error::ChecksumMismatch {
            index,
            first: range.start_block,
            last: range.last_block(),
            expected: expected.clone(),
            actual,
        });
    }

    Ok(())
}

/// Checks every range of an already written destination against `document`.
///
/// `on_progress` receives `(blocks_processed, total_blocks)` after every range.
pub fn verify<F>(
    document: &BmapDocument,
    target: &(impl ReadAt + ?Sized),
    running: &AtomicBool,
    mut on_progress: F,
) -> std::result::Result<(), CopyError>
where
    F: FnMut(u64, u64),
{
    let total_ranges = document.ranges().len();

    for (index, range) in document.ranges().iter().enumerate() {
        let checked = stream::check_running(running)
            .map_err(Error::io("Verification interrupted"))
            .and_then(|()| verify_range(target, document, index));

        if let Err(error) = checked {
            return Err(CopyError {
                error,
                completed_ranges: index,
                total_ranges,
            });
        }
        on_progress(range.end_block(), document.total_blocks());
    }

    Ok(())
}

/// Copies the image at `image_path` to `dest_path`.
///
/// This is the main entry point for the copying process. It parses and checks
/// the block map, opens the (possibly compressed) image, prepares the
/// destination and runs a [`CopyEngine`].
///
/// # Arguments
///
/// * `image_path` - Path to the source image, or `-` for standard input.
/// * `dest_path` - Path to the destination file or block device.
/// * `bmap` - The raw block map and its detached signature, if any.
/// * `options` - Verification, signature and hole handling settings.
/// * `running` - An `Arc<AtomicBool>` to allow for graceful cancellation.
/// * `on_copy_start` - Called once the destination is ready, with the total
///   number of blocks when it is known.
/// * `on_progress` - Called with `(blocks_processed, total_blocks)`.
///
/// # Errors
///
/// A [`CopyError`] carries the failure and how many ranges were written (and
/// verified) before it. Block map problems are reported before the
/// destination is opened.
pub fn run<F>(
    image_path: &Path,
    dest_path: &Path,
    bmap: Option<BmapInput<'_>>,
    options: &CopyOptions,
    running: Arc<AtomicBool>,
    on_copy_start: impl FnOnce(Option<u64>),
    on_progress: F,
) -> std::result::Result<CopyReport, CopyError>
where
    F: FnMut(u64, Option<u64>),
{
    let mut engine = CopyEngine::new(options.clone(), running);

    let document = bmap
        .map(|b| engine.prepare(b.document, b.signature))
        .transpose()?;

    let source = ImageSource::open(image_path, options.compression)?;
    let image_size = document
        .as_ref()
        .map(BmapDocument::image_size)
        .or(source.len())
        .unwrap_or(0);
    let target = FileTarget::create(dest_path, image_size)?;

    on_copy_start(match &document {
        Some(doc) => Some(doc.total_blocks()),
        None => source.len().map(|len| len.div_ceil(u64::from(SPARSE_BLOCK_SIZE))),
    });

    engine.copy(source, document.as_ref(), &target, on_progress)
}
