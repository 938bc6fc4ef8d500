//! Discovery of the byte extents of a file that actually hold data.

use std::fs::File;

use crate::error::{Error, Result};

/// A run of bytes reported by storage as allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub len: u64,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Something that can tell which parts of a file are not holes.
///
/// Implementations return extents in ascending order without overlaps. When
/// the underlying storage cannot answer, they fail with
/// [`Error::UnsupportedFilesystem`] and the caller falls back to
/// [`WholeFile`].
pub trait ExtentSource {
    fn discover_extents(&mut self) -> Result<Vec<Extent>>;
}

/// Treats the whole file as one mapped extent. Always correct, never sparse.
pub struct WholeFile {
    len: u64,
}

impl WholeFile {
    pub fn new(len: u64) -> Self {
        Self { len }
    }

    pub fn for_file(file: &File) -> Result<Self> {
        let len = file
            .metadata()
            .map_err(Error::io("Failed to query image size"))?
            .len();
        Ok(Self::new(len))
    }
}

impl ExtentSource for WholeFile {
    fn discover_extents(&mut self) -> Result<Vec<Extent>> {
        if self.len == 0 {
            return Ok(vec![]);
        }
        Ok(vec![Extent {
            offset: 0,
            len: self.len,
        }])
    }
}

/// Extents supplied up front, for callers that already know the layout.
impl ExtentSource for Vec<Extent> {
    fn discover_extents(&mut self) -> Result<Vec<Extent>> {
        Ok(self.clone())
    }
}
