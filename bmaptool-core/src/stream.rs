//! Small I/O helpers shared by the generation and copy paths.

use std::fs::File;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};

/// All-zero buffer used for padding writes and hole fallbacks.
pub(crate) static ZEROS: [u8; 64 * 1024] = [0u8; 64 * 1024];

/// Positional reads that leave the file cursor alone, so that several threads
/// can read one file at once.
pub trait ReadAt {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("Reached EOF at offset {offset}"),
                    ));
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl ReadAt for File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

/// Reads and throws away `size` bytes, for streams that cannot seek.
pub(crate) fn read_discard_exact(reader: &mut impl Read, size: u64) -> io::Result<()> {
    let n = io::copy(&mut reader.take(size), &mut io::sink())?;
    if n != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("Expected to skip {size} bytes, but reached EOF after {n} bytes"),
        ));
    }
    Ok(())
}

/// Fails with an `Interrupted` error once `running` has been cleared.
#[inline]
pub(crate) fn check_running(running: &AtomicBool) -> io::Result<()> {
    if !running.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Operation cancelled by user",
        ));
    }
    Ok(())
}
