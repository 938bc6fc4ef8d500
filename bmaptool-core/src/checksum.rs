//! Digest computation for mapped ranges and whole images.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;

use rayon::prelude::*;
use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha512};
use tracing::debug;

use crate::document::Range;
use crate::error::{Error, Result};
use crate::stream::{self, ReadAt};

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    Sha1,
    #[default]
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// The name used in bmap documents.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(Error::MalformedDocument(format!(
                "Unknown checksum type: {other:?}"
            ))),
        }
    }
}

/// A digest tagged with the algorithm that produced it. Digests of different
/// algorithms never compare equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: ChecksumAlgorithm,
    value: Vec<u8>,
}

impl Digest {
    pub fn new(algorithm: ChecksumAlgorithm, value: Vec<u8>) -> Result<Self> {
        if value.len() != algorithm.output_len() {
            return Err(Error::MalformedDocument(format!(
                "{algorithm} digest must be {} bytes, but is {}",
                algorithm.output_len(),
                value.len(),
            )));
        }
        Ok(Self { algorithm, value })
    }

    pub fn from_hex(algorithm: ChecksumAlgorithm, hex_value: &str) -> Result<Self> {
        let value = hex::decode(hex_value.trim()).map_err(|e| {
            Error::MalformedDocument(format!("Invalid {algorithm} digest {hex_value:?}: {e}"))
        })?;
        Self::new(algorithm, value)
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.value)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

/// Incremental digest computation for any supported algorithm.
#[derive(Clone)]
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        let (algorithm, value) = match self {
            Self::Sha1(h) => (ChecksumAlgorithm::Sha1, h.finalize().to_vec()),
            Self::Sha256(h) => (ChecksumAlgorithm::Sha256, h.finalize().to_vec()),
            Self::Sha512(h) => (ChecksumAlgorithm::Sha512, h.finalize().to_vec()),
        };
        Digest { algorithm, value }
    }
}

/// Digests one-shot in-memory data.
pub fn digest_bytes(algorithm: ChecksumAlgorithm, data: &[u8]) -> Digest {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Digests `len` bytes of `source` starting at `offset`.
pub fn digest_at(
    source: &(impl ReadAt + ?Sized),
    offset: u64,
    len: u64,
    algorithm: ChecksumAlgorithm,
) -> std::io::Result<Digest> {
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; BUFFER_SIZE.min(len as usize)];
    let mut done = 0;

    while done < len {
        let n = (len - done).min(buf.len() as u64) as usize;
        source.read_exact_at(&mut buf[..n], offset + done)?;
        hasher.update(&buf[..n]);
        done += n as u64;
    }

    Ok(hasher.finalize())
}

/// Digests the bytes of one mapped range. Only the part of the range that lies
/// inside the `image_size` bytes of the image is read.
pub fn checksum_range(
    source: &File,
    range: &Range,
    block_size: u32,
    image_size: u64,
    algorithm: ChecksumAlgorithm,
) -> Result<Digest> {
    let (offset, len) = range.byte_span(block_size, image_size);
    digest_at(source, offset, len, algorithm).map_err(Error::io("Failed to read mapped range"))
}

/// Digests every range on rayon's global thread pool. The result at index `i`
/// belongs to `ranges[i]` regardless of which thread finished first.
pub fn checksum_ranges(
    source: &File,
    ranges: &[Range],
    block_size: u32,
    image_size: u64,
    algorithm: ChecksumAlgorithm,
    running: &AtomicBool,
) -> Result<Vec<Digest>> {
    debug!(ranges = ranges.len(), %algorithm, "Checksumming mapped ranges");

    ranges
        .par_iter()
        .map(|range| {
            stream::check_running(running).map_err(Error::io("Checksumming interrupted"))?;
            checksum_range(source, range, block_size, image_size, algorithm)
        })
        .collect()
}

/// Digests the entire file content. Holes read as zeros, so the result matches
/// a digest of a fully materialised copy of the image.
pub fn checksum_whole(
    mut source: impl Read,
    algorithm: ChecksumAlgorithm,
    running: &AtomicBool,
) -> Result<Digest> {
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        stream::check_running(running).map_err(Error::io("Checksumming interrupted"))?;

        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io("Failed to read image", e)),
        };
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}
