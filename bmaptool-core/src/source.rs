//! The byte stream an image is copied from.
//!
//! An [`ImageSource`] hides whether the image is a plain file, a pipe or a
//! compressed stream. Offsets always refer to the decompressed image, which is
//! the address space of the block map. Only plain files can seek; everything
//! else moves forward by decoding and discarding.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use tracing::debug;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::error::{Error, Result};
use crate::stream::{self, ReadAt};

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// How the image bytes are encoded on the way in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Compression {
    const MAGIC: &[(&[u8], Self)] = &[
        (b"\x1f\x8b", Self::Gzip),
        (b"BZh", Self::Bzip2),
        (b"\xfd7zXZ\x00", Self::Xz),
        (b"\x28\xb5\x2f\xfd", Self::Zstd),
    ];

    /// Guesses the encoding from the file name. Returns `None` when the
    /// extension says nothing, which is different from "not compressed".
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();

        match ext.as_str() {
            "gz" | "gzip" | "tgz" => Some(Self::Gzip),
            "bz2" | "tbz2" | "tbz" => Some(Self::Bzip2),
            "xz" | "txz" => Some(Self::Xz),
            "zst" | "zstd" | "tzst" => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Identifies the encoding from the first bytes of a stream.
    pub fn from_magic(head: &[u8]) -> Self {
        Self::MAGIC
            .iter()
            .find(|(magic, _)| head.starts_with(magic))
            .map_or(Self::None, |(_, c)| *c)
    }

    /// Wraps `reader` in the matching decoder.
    fn decoder<R: BufRead + Send + 'static>(self, reader: R) -> io::Result<Box<dyn Read + Send>> {
        Ok(match self {
            Self::None => Box::new(reader),
            Self::Gzip => Box::new(MultiGzDecoder::new(reader)),
            Self::Bzip2 => Box::new(MultiBzDecoder::new(reader)),
            Self::Xz => Box::new(XzDecoder::new_multi_decoder(reader)),
            Self::Zstd => Box::new(ZstdDecoder::with_buffer(reader)?),
        })
    }

    /// File name suffixes this encoding is known by, including the dot.
    pub fn suffixes(self) -> &'static [&'static str] {
        match self {
            Self::None => &[],
            Self::Gzip => &[".gz", ".gzip", ".tgz"],
            Self::Bzip2 => &[".bz2", ".tbz2", ".tbz"],
            Self::Xz => &[".xz", ".txz"],
            Self::Zstd => &[".zst", ".zstd", ".tzst"],
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        })
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            "bzip2" | "bz2" => Ok(Self::Bzip2),
            "xz" => Ok(Self::Xz),
            "zstd" | "zst" => Ok(Self::Zstd),
            _ => Err(format!("Unknown compression: {s:?}")),
        }
    }
}

enum Inner {
    Seekable(BufReader<File>),
    Sequential(Box<dyn Read + Send>),
}

/// A readable image, possibly compressed and possibly not seekable.
pub struct ImageSource {
    inner: Inner,
    compression: Compression,
    len: Option<u64>,
    position: u64,
}

impl ImageSource {
    /// Opens the image at `path`, or standard input when `path` is `-`.
    ///
    /// With `compression` unset, the encoding is taken from the extension and
    /// then from the magic bytes at the start of the data.
    pub fn open(path: &Path, compression: Option<Compression>) -> Result<Self> {
        if path == Path::new("-") {
            return Self::from_reader(io::stdin(), compression);
        }

        let file = File::open(path).map_err(Error::io("Failed to open image"))?;
        let compression = match compression.or_else(|| Compression::from_path(path)) {
            Some(c) => c,
            None => {
                let mut head = [0u8; 8];
                let n = file
                    .read_at(&mut head, 0)
                    .map_err(Error::io("Failed to read image header"))?;
                Compression::from_magic(&head[..n])
            }
        };

        debug!(?path, %compression, "Opened image source");
        Self::from_file(file, compression)
    }

    /// Reads an image from an open file.
    pub fn from_file(file: File, compression: Compression) -> Result<Self> {
        let metadata = file
            .metadata()
            .map_err(Error::io("Failed to query image size"))?;
        let reader = BufReader::with_capacity(BUFFER_SIZE, file);

        if compression != Compression::None {
            let decoder = compression
                .decoder(reader)
                .map_err(Error::io("Failed to set up decompressor"))?;
            return Ok(Self::sequential(decoder, compression));
        }

        if !metadata.is_file() {
            return Ok(Self::sequential(Box::new(reader), compression));
        }

        Ok(Self {
            inner: Inner::Seekable(reader),
            compression,
            len: Some(metadata.len()),
            position: 0,
        })
    }

    /// Reads an image from a stream that can only be read front to back.
    pub fn from_reader(reader: impl Read + Send + 'static, compression: Option<Compression>) -> Result<Self> {
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, reader);

        let compression = match compression {
            Some(c) => c,
            None => {
                let head = reader
                    .fill_buf()
                    .map_err(Error::io("Failed to read image header"))?;
                Compression::from_magic(head)
            }
        };

        let decoder = compression
            .decoder(reader)
            .map_err(Error::io("Failed to set up decompressor"))?;
        Ok(Self::sequential(decoder, compression))
    }

    fn sequential(reader: Box<dyn Read + Send>, compression: Compression) -> Self {
        Self {
            inner: Inner::Sequential(reader),
            compression,
            len: None,
            position: 0,
        }
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self.inner, Inner::Seekable(_))
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Length of the decompressed image, when known without reading it.
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    /// Logical offset of the next byte [`Read::read`] returns.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Moves forward `n` bytes without returning them. Seekable sources
    /// seek; others decode and throw the bytes away.
    pub fn skip(&mut self, n: u64) -> io::Result<()> {
        if n == 0 {
            return Ok(());
        }

        match &mut self.inner {
            Inner::Seekable(r) => {
                r.seek(SeekFrom::Start(self.position + n))?;
            }
            Inner::Sequential(r) => stream::read_discard_exact(r, n)?,
        }

        self.position += n;
        Ok(())
    }

    /// Moves to the logical `offset`. Only seekable sources can go back.
    pub fn advance_to(&mut self, offset: u64) -> io::Result<()> {
        if offset >= self.position {
            return self.skip(offset - self.position);
        }

        match &mut self.inner {
            Inner::Seekable(r) => {
                r.seek(SeekFrom::Start(offset))?;
                self.position = offset;
                Ok(())
            }
            Inner::Sequential(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Cannot move back from offset {} to {offset} in a sequential stream",
                    self.position,
                ),
            )),
        }
    }
}

impl Read for ImageSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match &mut self.inner {
            Inner::Seekable(r) => r.read(buf)?,
            Inner::Sequential(r) => r.read(buf)?,
        };
        self.position += n as u64;
        Ok(n)
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSource")
            .field("seekable", &self.is_seekable())
            .field("compression", &self.compression)
            .field("len", &self.len)
            .field("position", &self.position)
            .finish()
    }
}
