use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use tempfile::TempDir;

use bmaptool_core::checksum::{self, ChecksumAlgorithm};
use bmaptool_core::copy::{self, BmapInput, CopyEngine, CopyOptions, CopyReport, State};
use bmaptool_core::create::{self, CreateOptions};
use bmaptool_core::destination::{DestinationTarget, FileTarget, HolePolicy};
use bmaptool_core::document::BmapDocument;
use bmaptool_core::extent::Extent;
use bmaptool_core::signature::TrustStore;
use bmaptool_core::source::{Compression, ImageSource};
use bmaptool_core::{CopyError, Error, ReadAt, writer};

const BS: u64 = 4096;

fn running() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

fn unsigned() -> CopyOptions {
    CopyOptions {
        verify_signature: false,
        ..Default::default()
    }
}

/// An image of `blocks` blocks where only `data_blocks` hold non-zero bytes.
struct Image {
    _dir: TempDir,
    path: PathBuf,
    content: Vec<u8>,
    doc: BmapDocument,
}

impl Image {
    fn new(blocks: u64, data_blocks: &[u64]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.img");

        let mut content = vec![0u8; (blocks * BS) as usize];
        for &b in data_blocks {
            let start = (b * BS) as usize;
            for (i, byte) in content[start..start + BS as usize].iter_mut().enumerate() {
                *byte = (b as u8).wrapping_mul(31).wrapping_add(i as u8) | 1;
            }
        }
        fs::write(&path, &content).unwrap();

        let extents = data_blocks
            .iter()
            .map(|b| Extent {
                offset: b * BS,
                len: BS,
            })
            .collect::<Vec<_>>();
        let doc = create::generate(
            &File::open(&path).unwrap(),
            extents,
            &CreateOptions::default(),
            running(),
            |_| {},
            |_| {},
        )
        .unwrap();

        Self {
            _dir: dir,
            path,
            content,
            doc,
        }
    }

    fn bmap(&self) -> String {
        writer::to_string(&self.doc)
    }

    fn dest(&self) -> PathBuf {
        self._dir.path().join("dest.img")
    }

    fn block(&self, index: u64) -> &[u8] {
        &self.content[(index * BS) as usize..((index + 1) * BS) as usize]
    }

    fn copy(&self, dest: &Path, options: &CopyOptions) -> Result<CopyReport, CopyError> {
        let bmap = self.bmap();
        copy::run(
            &self.path,
            dest,
            Some(BmapInput {
                document: bmap.as_bytes(),
                signature: None,
            }),
            options,
            running(),
            |_| {},
            |_, _| {},
        )
    }
}

#[test]
fn copies_single_range_of_large_image() {
    let image = Image::new(4096, &(10..20).collect::<Vec<_>>());
    assert_eq!(image.doc.ranges().len(), 1);
    assert_eq!(image.doc.ranges()[0].start_block, 10);
    assert_eq!(image.doc.ranges()[0].block_count, 10);
    let digest = image.doc.ranges()[0].checksum.clone().unwrap();
    assert_eq!(digest.algorithm(), ChecksumAlgorithm::Sha256);

    let dest = image.dest();
    let mut progress = vec![];
    let bmap = image.bmap();
    let report = copy::run(
        &image.path,
        &dest,
        Some(BmapInput {
            document: bmap.as_bytes(),
            signature: None,
        }),
        &unsigned(),
        running(),
        |total| assert_eq!(total, Some(4096)),
        |done, total| progress.push((done, total)),
    )
    .unwrap();

    assert_eq!(
        report,
        CopyReport {
            bytes_copied: 10 * BS,
            bytes_skipped: 4086 * BS,
            ranges: 1,
        }
    );
    assert_eq!(progress, vec![(20, Some(4096)), (4096, Some(4096))]);

    let written = fs::read(&dest).unwrap();
    assert_eq!(written.len() as u64, 4096 * BS);
    assert_eq!(written, image.content);
    assert!(written[..(10 * BS) as usize].iter().all(|b| *b == 0));
    assert!(written[(20 * BS) as usize..].iter().all(|b| *b == 0));
    assert_eq!(
        checksum::digest_bytes(
            ChecksumAlgorithm::Sha256,
            &written[(10 * BS) as usize..(20 * BS) as usize]
        ),
        digest
    );
}

#[test]
fn copying_twice_is_idempotent() {
    let image = Image::new(64, &[0, 1, 7, 30, 31, 63]);
    let dest = image.dest();

    image.copy(&dest, &unsigned()).unwrap();
    let first = fs::read(&dest).unwrap();
    image.copy(&dest, &unsigned()).unwrap();
    let second = fs::read(&dest).unwrap();

    assert_eq!(first, second);
    assert_eq!(first, image.content);
}

#[test]
fn fully_sparse_image() {
    let image = Image::new(100, &[]);
    assert_eq!(image.doc.mapped_block_count(), 0);

    let dest = image.dest();
    let report = image.copy(&dest, &unsigned()).unwrap();
    assert_eq!(report.ranges, 0);
    assert_eq!(report.bytes_copied, 0);
    assert_eq!(report.bytes_skipped, 100 * BS);

    let written = fs::read(&dest).unwrap();
    assert_eq!(written.len() as u64, 100 * BS);
    assert!(written.iter().all(|b| *b == 0));
}

#[test]
fn mutated_range_fails_verification() {
    let image = Image::new(64, &[2, 3, 20, 40, 41]);
    assert_eq!(image.doc.ranges().len(), 3);

    let dest = image.dest();
    image.copy(&dest, &unsigned()).unwrap();

    let target = FileTarget::open(&dest).unwrap();
    copy::verify(&image.doc, &target, &AtomicBool::new(true), |_, _| {}).unwrap();

    target.write_at(&[0x00], 20 * BS + 123).unwrap();

    let err = copy::verify(&image.doc, &target, &AtomicBool::new(true), |_, _| {}).unwrap_err();
    assert_matches!(
        err.error,
        Error::ChecksumMismatch {
            index: 1,
            first: 20,
            last: 20,
            ..
        }
    );
    assert_eq!(err.completed_ranges, 1);
    assert_eq!(err.total_ranges, 3);
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn unsupported_version_fails_before_any_io() {
    let image = Image::new(16, &[1]);
    let bmap = image.bmap().replace("<bmap version=\"2.0\">", "<bmap version=\"99.0\">");
    let dest = image.dest();

    let err = copy::run(
        &image.path,
        &dest,
        Some(BmapInput {
            document: bmap.as_bytes(),
            signature: None,
        }),
        &unsigned(),
        running(),
        |_| panic!("Copy must not start"),
        |_, _| panic!("Copy must not start"),
    )
    .unwrap_err();

    assert_matches!(err.error, Error::MalformedDocument(_));
    assert_eq!(err.exit_code(), 2);
    assert!(!dest.exists());
}

/// Accepts a detached signature that is the document reversed.
struct ReversingTrustStore;

impl TrustStore for ReversingTrustStore {
    fn verify_detached(&self, document: &[u8], signature: &[u8]) -> io::Result<bool> {
        Ok(document.iter().rev().eq(signature.iter()))
    }

    fn verify_clearsigned(&self, _message: &[u8]) -> io::Result<bool> {
        Ok(false)
    }
}

#[test]
fn signature_enforcement() {
    let image = Image::new(16, &[1, 5]);
    let dest = image.dest();
    let bmap = image.bmap();
    let signature = bmap.bytes().rev().collect::<Vec<_>>();

    let enforcing = CopyOptions {
        trust_store: Some(Arc::new(ReversingTrustStore)),
        ..Default::default()
    };

    let run = |options: &CopyOptions, signature: Option<&[u8]>| {
        copy::run(
            &image.path,
            &dest,
            Some(BmapInput {
                document: bmap.as_bytes(),
                signature,
            }),
            options,
            running(),
            |_| {},
            |_, _| {},
        )
    };

    // Unsigned, with enforcement.
    let err = run(&enforcing, None).unwrap_err();
    assert_matches!(err.error, Error::SignatureInvalid(_));
    assert_eq!(err.exit_code(), 4);
    assert!(!dest.exists());

    // Forged signature.
    let err = run(&enforcing, Some(b"forged")).unwrap_err();
    assert_matches!(err.error, Error::SignatureInvalid(_));

    // Unsigned, without enforcement.
    run(&unsigned(), None).unwrap();
    assert_eq!(fs::read(&dest).unwrap(), image.content);
    fs::remove_file(&dest).unwrap();

    // Properly signed.
    run(&enforcing, Some(&signature)).unwrap();
    assert_eq!(fs::read(&dest).unwrap(), image.content);
}

#[test]
fn compressed_sources() {
    let image = Image::new(48, &[0, 9, 10, 11, 47]);

    for (compression, ext) in [
        (Compression::Gzip, "gz"),
        (Compression::Bzip2, "bz2"),
        (Compression::Xz, "xz"),
        (Compression::Zstd, "zst"),
    ] {
        let compressed = compress(compression, &image.content);
        let path = image._dir.path().join(format!("image.img.{ext}"));
        fs::write(&path, compressed).unwrap();

        let dest = image._dir.path().join(format!("dest-{ext}.img"));
        let bmap = image.bmap();
        let report = copy::run(
            &path,
            &dest,
            Some(BmapInput {
                document: bmap.as_bytes(),
                signature: None,
            }),
            &unsigned(),
            running(),
            |_| {},
            |_, _| {},
        )
        .unwrap();

        assert_eq!(report.ranges, 3, "{compression}");
        assert_eq!(report.bytes_copied, 5 * BS, "{compression}");
        assert_eq!(fs::read(&dest).unwrap(), image.content, "{compression}");
    }
}

#[test]
fn copies_without_bmap() {
    let image = Image::new(256, &[0, 1, 100, 255]);
    let path = image._dir.path().join("image.img.gz");
    fs::write(&path, compress(Compression::Gzip, &image.content)).unwrap();
    let dest = image.dest();

    let mut last = None;
    let report = copy::run(
        &path,
        &dest,
        None,
        &unsigned(),
        running(),
        |total| assert_eq!(total, None),
        |done, total| last = Some((done, total)),
    )
    .unwrap();

    assert_eq!(report.bytes_copied, 4 * BS);
    assert_eq!(report.bytes_skipped, 252 * BS);
    assert_eq!(report.ranges, 3);
    assert_eq!(last, Some((256, Some(256))));
    assert_eq!(fs::read(&dest).unwrap(), image.content);
}

#[test]
fn cancellation_stops_between_ranges() {
    let blocks = (0..200).map(|i| i * 2).collect::<Vec<_>>();
    let image = Image::new(400, &blocks);
    assert_eq!(image.doc.ranges().len(), 200);

    let dest = image.dest();
    let bmap = image.bmap();
    let running = running();
    let options = CopyOptions {
        queue_depth: 1,
        ..unsigned()
    };

    let err = copy::run(
        &image.path,
        &dest,
        Some(BmapInput {
            document: bmap.as_bytes(),
            signature: None,
        }),
        &options,
        running.clone(),
        |_| {},
        |_, _| running.store(false, Ordering::SeqCst),
    )
    .unwrap_err();

    assert_matches!(err.error, Error::Cancelled);
    assert_eq!(err.exit_code(), 130);
    assert!(err.completed_ranges >= 1);
    assert!(err.completed_ranges < 200);
    assert_eq!(err.total_ranges, 200);

    // Every completed range is on disk.
    let written = fs::read(&dest).unwrap();
    for range in &image.doc.ranges()[..err.completed_ranges] {
        let b = range.start_block;
        assert_eq!(&written[(b * BS) as usize..((b + 1) * BS) as usize], image.block(b));
    }
}

/// A fixed-size destination that starts out full of garbage.
struct MemoryTarget {
    data: Mutex<Vec<u8>>,
}

impl MemoryTarget {
    fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0xee; len]),
        }
    }
}

impl ReadAt for MemoryTarget {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }
}

impl DestinationTarget for MemoryTarget {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        if start + buf.len() > data.len() {
            return Err(io::Error::other("Write past end of device"));
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn punch_hole(&self, offset: u64, len: u64) -> io::Result<()> {
        let mut data = self.data.lock().unwrap();
        data[offset as usize..(offset + len) as usize].fill(0);
        Ok(())
    }

    fn capacity(&self) -> io::Result<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn set_len(&self, _len: u64) -> io::Result<()> {
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn is_pre_zeroed(&self) -> bool {
        false
    }
}

#[test]
fn hole_policy_on_dirty_target() {
    let image = Image::new(32, &[4, 5, 20]);
    let bmap = image.bmap();

    for (policy, holes_zeroed) in [(HolePolicy::Skip, false), (HolePolicy::Punch, true)] {
        let options = CopyOptions {
            hole_policy: policy,
            ..unsigned()
        };
        let mut engine = CopyEngine::new(options, running());
        let doc = engine.prepare(bmap.as_bytes(), None).unwrap();
        assert_eq!(engine.state(), State::Preparing);

        let target = MemoryTarget::new((40 * BS) as usize);
        let source = ImageSource::open(&image.path, None).unwrap();
        engine.copy(source, Some(&doc), &target, |_, _| {}).unwrap();

        let data = target.data.lock().unwrap();
        assert_eq!(&data[(4 * BS) as usize..(6 * BS) as usize], &image.content[(4 * BS) as usize..(6 * BS) as usize]);
        assert_eq!(&data[(20 * BS) as usize..(21 * BS) as usize], image.block(20));
        assert_eq!(data[0] == 0, holes_zeroed, "{policy:?}");
        assert_eq!(data[(31 * BS) as usize] == 0, holes_zeroed, "{policy:?}");
        // Past the end of the image is never touched.
        assert_eq!(data[(32 * BS) as usize], 0xee);
    }
}

#[test]
fn copies_without_bmap_onto_dirty_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.img");
    let mut content = vec![0x11u8; BS as usize];
    content.resize((65 * BS) as usize, 0);
    content.resize((66 * BS) as usize, 0x22);
    fs::write(&path, &content).unwrap();

    let dest = dir.path().join("dest.img");
    fs::write(&dest, vec![0xffu8; content.len()]).unwrap();
    let target = FileTarget::open(&dest).unwrap();
    assert!(!target.is_pre_zeroed());

    for policy in [HolePolicy::Skip, HolePolicy::Punch] {
        let options = CopyOptions {
            hole_policy: policy,
            ..unsigned()
        };
        let source = ImageSource::open(&path, None).unwrap();
        let report = CopyEngine::new(options, running())
            .copy(source, None, &target, |_, _| {})
            .unwrap();

        assert_eq!(report.bytes_copied, 2 * BS, "{policy:?}");
        assert_eq!(report.bytes_skipped, 64 * BS, "{policy:?}");
        assert!(fs::read(&dest).unwrap() == content, "{policy:?}");
    }
}

/// How a [`FaultyTarget`] mistreats writes that touch its block.
#[derive(Clone, Copy, Debug)]
enum Fault {
    Corrupt,
    Fail,
}

/// A [`MemoryTarget`] that damages or refuses writes covering one block.
struct FaultyTarget {
    inner: MemoryTarget,
    block: u64,
    fault: Fault,
}

impl ReadAt for FaultyTarget {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.inner.read_at(buf, offset)
    }
}

impl DestinationTarget for FaultyTarget {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let pos = self.block * BS;
        if !(offset..offset + buf.len() as u64).contains(&pos) {
            return self.inner.write_at(buf, offset);
        }

        match self.fault {
            Fault::Corrupt => {
                let mut damaged = buf.to_vec();
                damaged[(pos - offset) as usize] ^= 0x80;
                self.inner.write_at(&damaged, offset)
            }
            Fault::Fail => Err(io::Error::other("Media error")),
        }
    }

    fn punch_hole(&self, offset: u64, len: u64) -> io::Result<()> {
        self.inner.punch_hole(offset, len)
    }

    fn capacity(&self) -> io::Result<u64> {
        self.inner.capacity()
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.inner.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.inner.sync()
    }

    fn is_pre_zeroed(&self) -> bool {
        false
    }
}

fn copy_onto_faulty_target(image: &Image, fault: Fault) -> CopyError {
    let target = FaultyTarget {
        inner: MemoryTarget::new((32 * BS) as usize),
        block: 8,
        fault,
    };
    let source = ImageSource::open(&image.path, None).unwrap();

    let mut progress = vec![];
    let err = CopyEngine::new(unsigned(), running())
        .copy(source, Some(&image.doc), &target, |done, _| progress.push(done))
        .unwrap_err();

    // Only the first range was reported before the failure.
    assert_eq!(progress, vec![3]);
    let data = target.inner.data.lock().unwrap();
    assert_eq!(&data[(2 * BS) as usize..(3 * BS) as usize], image.block(2));

    err
}

#[test]
fn corrupted_write_fails_copy_verification() {
    let image = Image::new(32, &[2, 8, 20]);
    assert_eq!(image.doc.ranges().len(), 3);

    let err = copy_onto_faulty_target(&image, Fault::Corrupt);
    assert_matches!(
        err.error,
        Error::ChecksumMismatch {
            index: 1,
            first: 8,
            last: 8,
            ..
        }
    );
    assert_eq!(err.exit_code(), 3);
    assert_eq!(err.completed_ranges, 1);
    assert_eq!(err.total_ranges, 3);
}

#[test]
fn failed_write_reports_completed_ranges() {
    let image = Image::new(32, &[2, 8, 20]);

    let err = copy_onto_faulty_target(&image, Fault::Fail);
    assert_matches!(err.error, Error::Io(_, ref e) if e.to_string() == "Media error");
    assert_eq!(err.exit_code(), 1);
    assert_eq!(err.completed_ranges, 1);
    assert_eq!(err.total_ranges, 3);
}

#[test]
fn destination_too_small() {
    let image = Image::new(32, &[4]);
    let target = MemoryTarget::new((16 * BS) as usize);
    let source = ImageSource::open(&image.path, None).unwrap();

    let err = CopyEngine::new(unsigned(), running())
        .copy(source, Some(&image.doc), &target, |_, _| {})
        .unwrap_err();

    assert_matches!(
        err.error,
        Error::DestinationTooSmall {
            capacity,
            required
        } if capacity == 16 * BS && required == 32 * BS
    );
    assert_eq!(err.completed_ranges, 0);
}

fn compress(compression: Compression, data: &[u8]) -> Vec<u8> {
    match compression {
        Compression::None => data.to_vec(),
        Compression::Gzip => {
            let mut e = flate2::write::GzEncoder::new(vec![], flate2::Compression::fast());
            e.write_all(data).unwrap();
            e.finish().unwrap()
        }
        Compression::Bzip2 => {
            let mut e = bzip2::write::BzEncoder::new(vec![], bzip2::Compression::fast());
            e.write_all(data).unwrap();
            e.finish().unwrap()
        }
        Compression::Xz => {
            let mut e = xz2::write::XzEncoder::new(vec![], 1);
            e.write_all(data).unwrap();
            e.finish().unwrap()
        }
        Compression::Zstd => zstd::encode_all(data, 1).unwrap(),
    }
}
