use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::extent::{Extent, ExtentSource};

mod ioctl {
    use nix::{ioctl_read, ioctl_readwrite};

    use super::RawFiemap;

    ioctl_read!(blkgetsize64, 0x12, 114, u64);
    ioctl_readwrite!(fs_ioc_fiemap, b'f', 11, RawFiemap);
}

/// Sync the file before mapping it. Early FIEMAP implementations returned
/// stale results for dirty page cache data.
const FIEMAP_FLAG_SYNC: u32 = 0x0000_0001;
/// Set on the last extent of the file.
const FIEMAP_EXTENT_LAST: u32 = 0x0000_0001;
/// How many extents one FIEMAP call can return.
const FIEMAP_BATCH: usize = 512;

/// `struct fiemap` from `linux/fiemap.h`.
#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RawFiemap {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
}

/// `struct fiemap_extent` from `linux/fiemap.h`.
#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RawFiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

/// The header and the extent array must be contiguous in memory.
#[repr(C)]
struct FiemapRequest {
    header: RawFiemap,
    extents: [RawFiemapExtent; FIEMAP_BATCH],
}

fn unsupported(path: &Path, source: io::Error) -> Error {
    Error::UnsupportedFilesystem {
        path: path.to_path_buf(),
        source: Some(source),
    }
}

fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EOPNOTSUPP | libc::ENOTTY | libc::ENOSYS | libc::EINVAL)
    )
}

/// Extent discovery through the `FS_IOC_FIEMAP` ioctl.
pub struct Fiemap<'a> {
    file: &'a File,
    path: PathBuf,
    len: u64,
    request: Box<FiemapRequest>,
}

impl<'a> Fiemap<'a> {
    /// Probes FIEMAP support with a one-block query. Fails with
    /// [`Error::UnsupportedFilesystem`] if the filesystem cannot answer.
    pub fn new(file: &'a File, path: &Path) -> Result<Self> {
        let len = file
            .metadata()
            .map_err(Error::io("Failed to query image size"))?
            .len();

        let mut fiemap = Self {
            file,
            path: path.to_path_buf(),
            len,
            request: Box::new(FiemapRequest {
                header: RawFiemap::default(),
                extents: [RawFiemapExtent::default(); FIEMAP_BATCH],
            }),
        };
        fiemap.invoke(0, 1)?;

        Ok(fiemap)
    }

    /// Maps `length` bytes starting at `start` and returns how many extents
    /// the kernel filled in.
    fn invoke(&mut self, start: u64, length: u64) -> Result<usize> {
        self.request.header = RawFiemap {
            fm_start: start,
            fm_length: length,
            fm_flags: FIEMAP_FLAG_SYNC,
            fm_extent_count: FIEMAP_BATCH as u32,
            ..Default::default()
        };

        let ptr = (&mut *self.request as *mut FiemapRequest).cast::<RawFiemap>();
        // SAFETY: `ptr` points at a `struct fiemap` followed by room for
        // `fm_extent_count` extents, which is all the kernel writes to.
        let result = unsafe { ioctl::fs_ioc_fiemap(self.file.as_raw_fd(), ptr) };

        match result {
            Ok(_) => Ok(self.request.header.fm_mapped_extents as usize),
            Err(errno) => {
                let err = io::Error::from(errno);
                if is_unsupported(&err) {
                    Err(unsupported(&self.path, err))
                } else {
                    Err(Error::Io("FIEMAP ioctl failed", err))
                }
            }
        }
    }
}

impl ExtentSource for Fiemap<'_> {
    fn discover_extents(&mut self) -> Result<Vec<Extent>> {
        let mut extents = vec![];
        let mut start = 0;

        while start < self.len {
            let count = self.invoke(start, self.len - start)?;
            if count == 0 {
                break;
            }

            let mut last = false;
            for raw in &self.request.extents[..count] {
                extents.push(Extent {
                    offset: raw.fe_logical,
                    len: raw.fe_length,
                });
                start = raw.fe_logical + raw.fe_length;
                last |= raw.fe_flags & FIEMAP_EXTENT_LAST != 0;
            }

            if last {
                break;
            }
        }

        debug!(path = ?self.path, extents = extents.len(), "FIEMAP extents discovered");
        Ok(extents)
    }
}

/// Extent discovery through `lseek(SEEK_DATA)` and `lseek(SEEK_HOLE)`.
pub struct SeekHole<'a> {
    file: &'a File,
    path: PathBuf,
    len: u64,
}

impl<'a> SeekHole<'a> {
    pub fn new(file: &'a File, path: &Path) -> Result<Self> {
        let len = file
            .metadata()
            .map_err(Error::io("Failed to query image size"))?
            .len();

        let seek_hole = Self {
            file,
            path: path.to_path_buf(),
            len,
        };
        if len > 0 {
            seek_hole.lseek(0, libc::SEEK_HOLE)?;
        }

        Ok(seek_hole)
    }

    /// Returns `None` once there is no more data (or hole) after `offset`.
    fn lseek(&self, offset: u64, whence: libc::c_int) -> Result<Option<u64>> {
        // SAFETY: lseek does not touch memory.
        let pos = unsafe { libc::lseek(self.file.as_raw_fd(), offset as libc::off_t, whence) };
        if pos >= 0 {
            return Ok(Some(pos as u64));
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENXIO) => Ok(None),
            _ if is_unsupported(&err) => Err(unsupported(&self.path, err)),
            _ => Err(Error::Io("lseek failed", err)),
        }
    }
}

impl ExtentSource for SeekHole<'_> {
    fn discover_extents(&mut self) -> Result<Vec<Extent>> {
        let mut extents = vec![];
        let mut offset = 0;

        while offset < self.len {
            let Some(data) = self.lseek(offset, libc::SEEK_DATA)? else {
                break;
            };
            if data >= self.len {
                break;
            }
            let hole = self.lseek(data, libc::SEEK_HOLE)?.unwrap_or(self.len);
            let hole = hole.min(self.len);

            extents.push(Extent {
                offset: data,
                len: hole - data,
            });
            offset = hole;
        }

        debug!(path = ?self.path, extents = extents.len(), "SEEK_DATA extents discovered");
        Ok(extents)
    }
}

/// Picks the best extent source the filesystem supports: FIEMAP first, then
/// SEEK_DATA/SEEK_HOLE.
pub fn extent_source<'a>(file: &'a File, path: &Path) -> Result<Box<dyn ExtentSource + 'a>> {
    match Fiemap::new(file, path) {
        Ok(f) => Ok(Box::new(f)),
        Err(Error::UnsupportedFilesystem { .. }) => {
            debug!(?path, "FIEMAP unsupported, trying SEEK_DATA");
            Ok(Box::new(SeekHole::new(file, path)?))
        }
        Err(e) => Err(e),
    }
}

pub fn is_block_device(file: &File) -> io::Result<bool> {
    Ok(file.metadata()?.file_type().is_block_device())
}

/// Size of a block device in bytes.
pub fn block_device_size(file: &File) -> io::Result<u64> {
    let mut size_bytes: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64.
    unsafe {
        ioctl::blkgetsize64(file.as_raw_fd(), &mut size_bytes)?;
    }
    Ok(size_bytes)
}

/// Deallocates `len` bytes at `offset` without changing the file size. Reads
/// of the range return zeros afterwards.
pub fn punch_hole(file: &File, offset: u64, len: u64) -> io::Result<()> {
    let mode = libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE;
    // SAFETY: fallocate does not touch memory.
    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            mode,
            offset as libc::off_t,
            len as libc::off_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

const _: () = assert!(mem::size_of::<RawFiemap>() == 32);
const _: () = assert!(mem::size_of::<RawFiemapExtent>() == 56);

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::os::unix::fs::FileExt;

    use super::*;

    const MIB: u64 = 1024 * 1024;

    /// An 8 MiB file with one written block at 0 and one at 5 MiB.
    fn sparse_file(path: &Path) -> File {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap();
        file.set_len(8 * MIB).unwrap();
        file.write_all_at(&[0xaa; 4096], 0).unwrap();
        file.write_all_at(&[0x55; 4096], 5 * MIB).unwrap();
        file.sync_all().unwrap();
        file
    }

    fn check_layout(name: &str, extents: Result<Vec<Extent>>) {
        let extents = match extents {
            Ok(extents) => extents,
            Err(Error::UnsupportedFilesystem { .. }) => {
                eprintln!("{name} is not supported here, skipping");
                return;
            }
            Err(e) => panic!("{name}: {e}"),
        };

        for pair in extents.windows(2) {
            assert!(pair[0].end() <= pair[1].offset, "{name}: {extents:?}");
        }

        let covered = |pos: u64| extents.iter().any(|e| e.offset <= pos && pos < e.end());
        assert!(covered(0) && covered(4095), "{name}: {extents:?}");
        assert!(covered(5 * MIB) && covered(5 * MIB + 4095), "{name}: {extents:?}");

        // The holes between and after the written blocks stay unmapped.
        for hole in [MIB..4 * MIB, 6 * MIB..8 * MIB] {
            assert!(
                !extents.iter().any(|e| e.offset < hole.end && hole.start < e.end()),
                "{name}: {extents:?} maps part of {hole:?}",
            );
        }
    }

    #[test]
    fn fiemap_finds_written_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.img");
        let file = sparse_file(&path);

        check_layout(
            "FIEMAP",
            Fiemap::new(&file, &path).and_then(|mut f| f.discover_extents()),
        );
    }

    #[test]
    fn seek_hole_finds_written_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.img");
        let file = sparse_file(&path);

        check_layout(
            "SEEK_DATA",
            SeekHole::new(&file, &path).and_then(|mut s| s.discover_extents()),
        );
    }

    #[test]
    fn best_source_finds_written_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.img");
        let file = sparse_file(&path);

        check_layout(
            "extent_source",
            extent_source(&file, &path).and_then(|mut s| s.discover_extents()),
        );
    }

    #[test]
    fn unwritten_file_has_no_extents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.img");
        let file = File::create(&path).unwrap();
        file.set_len(MIB).unwrap();
        let file = File::open(&path).unwrap();

        for (name, extents) in [
            ("FIEMAP", Fiemap::new(&file, &path).and_then(|mut f| f.discover_extents())),
            ("SEEK_DATA", SeekHole::new(&file, &path).and_then(|mut s| s.discover_extents())),
        ] {
            match extents {
                Ok(extents) => assert!(extents.is_empty(), "{name}: {extents:?}"),
                Err(Error::UnsupportedFilesystem { .. }) => {}
                Err(e) => panic!("{name}: {e}"),
            }
        }
    }
}
