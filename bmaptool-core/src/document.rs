//! The in-memory block map model.
//!
//! A [`BmapDocument`] is validated when it is built and never changes after
//! that: generation produces one, parsing produces another.

use std::fmt;
use std::str::FromStr;

use crate::checksum::{ChecksumAlgorithm, Digest};
use crate::error::{Error, Result};

/// Block map format version, `major.minor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    /// The version written for newly generated documents.
    pub const CURRENT: Self = Self { major: 2, minor: 0 };

    /// The highest major version this crate understands. Any minor version
    /// within it is accepted and unknown fields are ignored.
    pub const MAX_MAJOR: u32 = 2;

    /// Format 1.4 introduced `ChecksumType` and the `chksum` attribute. Older
    /// documents only carry SHA1 digests in a `sha1` attribute.
    pub const CHECKSUM_TYPE: Self = Self { major: 1, minor: 4 };

    pub fn is_supported(self) -> bool {
        (1..=Self::MAX_MAJOR).contains(&self.major)
    }

    pub fn has_checksum_type(self) -> bool {
        self >= Self::CHECKSUM_TYPE
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::MalformedDocument(format!("Invalid format version: {s:?}"));
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;

        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// A run of mapped blocks, `[start_block, start_block + block_count)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Range {
    pub start_block: u64,
    pub block_count: u64,
    pub checksum: Option<Digest>,
}

impl Range {
    pub fn new(start_block: u64, block_count: u64) -> Self {
        Self {
            start_block,
            block_count,
            checksum: None,
        }
    }

    /// One past the last block.
    pub fn end_block(&self) -> u64 {
        self.start_block + self.block_count
    }

    /// The last block, inclusive.
    pub fn last_block(&self) -> u64 {
        self.end_block() - 1
    }

    /// Byte offset and length of this range inside an image of `image_size`
    /// bytes. The final block of an image whose size is not a multiple of
    /// the block size is only partially backed by data, so the span is
    /// clipped to the end of the image.
    pub fn byte_span(&self, block_size: u32, image_size: u64) -> (u64, u64) {
        let block_size = u64::from(block_size);
        let start = self.start_block * block_size;
        let end = (self.end_block() * block_size).min(image_size);
        (start, end.saturating_sub(start))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BmapDocument {
    version: Version,
    block_size: u32,
    image_size: u64,
    total_blocks: u64,
    mapped_block_count: u64,
    ranges: Vec<Range>,
    image_checksum: Option<Digest>,
}

impl BmapDocument {
    /// Builds a document from freshly generated ranges, deriving the block
    /// counts from them.
    pub fn new(
        block_size: u32,
        image_size: u64,
        ranges: Vec<Range>,
        image_checksum: Option<Digest>,
    ) -> Result<Self> {
        let total_blocks = blocks_for(image_size, block_size)?;
        let mapped_block_count = ranges.iter().map(|r| r.block_count).sum();

        Self::from_parts(
            Version::CURRENT,
            block_size,
            image_size,
            total_blocks,
            mapped_block_count,
            ranges,
            image_checksum,
        )
    }

    /// Builds a document from declared values, checking every invariant
    /// between them.
    pub fn from_parts(
        version: Version,
        block_size: u32,
        image_size: u64,
        total_blocks: u64,
        mapped_block_count: u64,
        ranges: Vec<Range>,
        image_checksum: Option<Digest>,
    ) -> Result<Self> {
        if !version.is_supported() {
            return Err(Error::MalformedDocument(format!(
                "Unsupported format version: {version}"
            )));
        }

        let expected_blocks = blocks_for(image_size, block_size)?;
        if total_blocks != expected_blocks {
            return Err(inconsistent(format!(
                "Image of {image_size} bytes has {expected_blocks} blocks of {block_size} bytes, \
                 but {total_blocks} are declared"
            )));
        }

        let mut prev_end = 0;
        let mut sum = 0u64;

        for (index, range) in ranges.iter().enumerate() {
            if range.block_count == 0 {
                return Err(inconsistent(format!("Range #{index} is empty")));
            }

            let end = range
                .start_block
                .checked_add(range.block_count)
                .ok_or_else(|| inconsistent(format!("Range #{index} overflows")))?;

            if range.start_block < prev_end {
                return Err(inconsistent(format!(
                    "Range #{index} starts at block {}, before the end of the previous range ({prev_end})",
                    range.start_block,
                )));
            } else if end > total_blocks {
                return Err(inconsistent(format!(
                    "Range #{index} ends at block {end}, past the last block ({total_blocks})"
                )));
            }

            prev_end = end;
            sum += range.block_count;
        }

        if sum != mapped_block_count {
            return Err(inconsistent(format!(
                "{mapped_block_count} mapped blocks declared, but ranges cover {sum}"
            )));
        }

        let doc = Self {
            version,
            block_size,
            image_size,
            total_blocks,
            mapped_block_count,
            ranges,
            image_checksum,
        };

        let algorithm = doc.checksum_algorithm();
        for digest in doc.digests() {
            if Some(digest.algorithm()) != algorithm {
                return Err(inconsistent(format!(
                    "Mixed checksum algorithms: {} and {}",
                    algorithm.map_or("none", ChecksumAlgorithm::name),
                    digest.algorithm().name(),
                )));
            }
        }
        if !version.has_checksum_type() && algorithm.is_some_and(|a| a != ChecksumAlgorithm::Sha1)
        {
            return Err(inconsistent(format!(
                "Format {version} only supports SHA1 digests"
            )));
        }

        Ok(doc)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn mapped_block_count(&self) -> u64 {
        self.mapped_block_count
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn image_checksum(&self) -> Option<&Digest> {
        self.image_checksum.as_ref()
    }

    /// Number of bytes covered by mapped ranges.
    pub fn mapped_bytes(&self) -> u64 {
        self.ranges
            .iter()
            .map(|r| r.byte_span(self.block_size, self.image_size).1)
            .sum()
    }

    /// The algorithm used by this document's digests, if it has any.
    pub fn checksum_algorithm(&self) -> Option<ChecksumAlgorithm> {
        self.digests().next().map(Digest::algorithm)
    }

    fn digests(&self) -> impl Iterator<Item = &Digest> {
        self.ranges
            .iter()
            .filter_map(|r| r.checksum.as_ref())
            .chain(self.image_checksum.as_ref())
    }

    /// Byte spans of the unmapped areas between and after the ranges.
    pub fn holes(&self) -> Vec<(u64, u64)> {
        let mut holes = vec![];
        let mut next = 0;

        for range in &self.ranges {
            if range.start_block > next {
                holes.push(Range::new(next, range.start_block - next));
            }
            next = range.end_block();
        }
        if next < self.total_blocks {
            holes.push(Range::new(next, self.total_blocks - next));
        }

        holes
            .iter()
            .map(|r| r.byte_span(self.block_size, self.image_size))
            .filter(|(_, len)| *len > 0)
            .collect()
    }
}

fn inconsistent(msg: String) -> Error {
    Error::InconsistentDocument(msg)
}

/// Number of blocks needed to hold `image_size` bytes.
pub(crate) fn blocks_for(image_size: u64, block_size: u32) -> Result<u64> {
    if block_size == 0 || !block_size.is_power_of_two() {
        return Err(inconsistent(format!(
            "Block size is not a power of two: {block_size}"
        )));
    }
    Ok(image_size.div_ceil(u64::from(block_size)))
}
