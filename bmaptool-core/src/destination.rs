//! Where an image is copied to.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::platform;
use crate::stream::{ReadAt, ZEROS};

/// What to do with the unmapped areas of the image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HolePolicy {
    /// Leave the destination untouched. Holes hold whatever was there before,
    /// which is zeros for a freshly created file. Copies without a block map
    /// still clear the zero runs of a destination that is not pre-zeroed.
    #[default]
    Skip,
    /// Deallocate (or zero) every hole that is not known to be zero already.
    Punch,
}

/// An offset-addressed sink for image data.
///
/// All methods take `&self` so that the writer and the verifier of a copy can
/// share one target across threads. Only one copy may use a target at a time.
pub trait DestinationTarget: ReadAt + Send + Sync {
    /// Writes all of `buf` at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Makes `len` bytes at `offset` read back as zeros, deallocating them
    /// where the storage allows.
    fn punch_hole(&self, offset: u64, len: u64) -> io::Result<()>;

    /// Number of bytes the target can hold.
    fn capacity(&self) -> io::Result<u64>;

    /// Sets the logical size. Targets with a fixed size ignore this.
    fn set_len(&self, len: u64) -> io::Result<()>;

    /// Flushes written data to stable storage.
    fn sync(&self) -> io::Result<()>;

    /// Whether unwritten areas are already known to read as zeros.
    fn is_pre_zeroed(&self) -> bool;
}

/// Writes `len` zero bytes at `offset`.
pub(crate) fn write_zeros(target: &(impl DestinationTarget + ?Sized), offset: u64, len: u64) -> io::Result<()> {
    let mut done = 0;
    while done < len {
        let n = (len - done).min(ZEROS.len() as u64) as usize;
        target.write_at(&ZEROS[..n], offset + done)?;
        done += n as u64;
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TargetKind {
    RegularFile,
    BlockDevice,
}

/// A regular file or a block device.
#[derive(Debug)]
pub struct FileTarget {
    file: File,
    path: PathBuf,
    kind: TargetKind,
    pre_zeroed: bool,
}

impl FileTarget {
    /// Prepares `path` to receive an image of `image_size` bytes.
    ///
    /// Regular files are created or truncated, then extended to the image size
    /// without writing anything, so every hole reads as zeros. Block devices
    /// are opened exclusively and must be at least `image_size` bytes long.
    pub fn create(path: &Path, image_size: u64) -> Result<Self> {
        let target = match Self::open_block_device(path)? {
            Some(target) => target,
            None => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(Error::io("Failed to create destination file"))?;
                file.set_len(image_size)
                    .map_err(Error::io("Failed to size destination file"))?;

                Self {
                    file,
                    path: path.to_path_buf(),
                    kind: TargetKind::RegularFile,
                    pre_zeroed: true,
                }
            }
        };

        let capacity = target
            .capacity()
            .map_err(Error::io("Failed to query destination size"))?;
        if capacity < image_size {
            return Err(Error::DestinationTooSmall {
                capacity,
                required: image_size,
            });
        }

        info!(path = ?target.path, kind = ?target.kind, capacity, "Destination ready");
        Ok(target)
    }

    /// Opens an already written destination as is, for verification.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(target) = Self::open_block_device(path)? {
            return Ok(target);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::io("Failed to open destination"))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            kind: TargetKind::RegularFile,
            pre_zeroed: false,
        })
    }

    fn open_block_device(path: &Path) -> Result<Option<Self>> {
        let is_block_device = match File::open(path) {
            Ok(f) => platform::is_block_device(&f).map_err(Error::io("Failed to stat destination"))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(Error::Io("Failed to open destination", e)),
        };
        if !is_block_device {
            return Ok(None);
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        // Refuse devices that are mounted or otherwise held open exclusively.
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_EXCL);
        }

        let file = options
            .open(path)
            .map_err(Error::io("Failed to open destination block device"))?;

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
            kind: TargetKind::BlockDevice,
            pre_zeroed: false,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_block_device(&self) -> bool {
        self.kind == TargetKind::BlockDevice
    }
}

impl ReadAt for FileTarget {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }
}

impl DestinationTarget for FileTarget {
    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            let n = std::os::windows::fs::FileExt::seek_write(&self.file, buf, offset)?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }

    fn punch_hole(&self, offset: u64, len: u64) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }

        match platform::punch_hole(&self.file, offset, len) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(path = ?self.path, offset, len, "Hole punching failed, writing zeros: {e}");
                write_zeros(self, offset, len)
            }
        }
    }

    fn capacity(&self) -> io::Result<u64> {
        match self.kind {
            TargetKind::RegularFile => Ok(self.file.metadata()?.len()),
            TargetKind::BlockDevice => platform::block_device_size(&self.file),
        }
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        match self.kind {
            TargetKind::RegularFile => self.file.set_len(len),
            TargetKind::BlockDevice => Ok(()),
        }
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn is_pre_zeroed(&self) -> bool {
        self.pre_zeroed
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn regular_file_is_sized_and_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.img");
        std::fs::write(&path, vec![0xffu8; 100_000]).unwrap();

        let target = FileTarget::create(&path, 40_000).unwrap();
        assert!(!target.is_block_device());
        assert!(target.is_pre_zeroed());
        assert_eq!(target.capacity().unwrap(), 40_000);

        target.write_at(b"data", 8192).unwrap();
        drop(target);

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 40_000);
        assert_eq!(&content[8192..8196], b"data");
        assert!(content[..8192].iter().all(|b| *b == 0));
        assert!(content[8196..].iter().all(|b| *b == 0));
    }

    #[test]
    fn punch_hole_zeroes_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.img");

        let target = FileTarget::create(&path, 3 * 65536).unwrap();
        target.write_at(&vec![0xaa; 3 * 65536], 0).unwrap();
        target.punch_hole(65536, 65536).unwrap();

        let mut buf = vec![0u8; 3 * 65536];
        target.read_exact_at(&mut buf, 0).unwrap();
        assert!(buf[..65536].iter().all(|b| *b == 0xaa));
        assert!(buf[65536..2 * 65536].iter().all(|b| *b == 0));
        assert!(buf[2 * 65536..].iter().all(|b| *b == 0xaa));
        assert_eq!(target.capacity().unwrap(), 3 * 65536);
    }

    #[test]
    fn write_zeros_spans_many_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.img");

        let target = FileTarget::create(&path, 0).unwrap();
        target.write_at(&[1u8; 10], 0).unwrap();
        write_zeros(&target, 5, 200_000).unwrap();

        assert_eq!(target.capacity().unwrap(), 200_005);
        let mut buf = [0u8; 6];
        target.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [1, 1, 1, 1, 1, 0]);
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            FileTarget::open(&dir.path().join("missing")),
            Err(Error::Io(_, _))
        );
    }
}
