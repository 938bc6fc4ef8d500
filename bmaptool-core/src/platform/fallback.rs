use std::fs::File;
use std::io;
use std::path::Path;

use crate::error::{Error, Result};
use crate::extent::ExtentSource;

pub fn extent_source<'a>(_file: &'a File, path: &Path) -> Result<Box<dyn ExtentSource + 'a>> {
    Err(Error::UnsupportedFilesystem {
        path: path.to_path_buf(),
        source: None,
    })
}

pub fn is_block_device(_file: &File) -> io::Result<bool> {
    Ok(false)
}

pub fn block_device_size(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.len())
}

pub fn punch_hole(_file: &File, _offset: u64, _len: u64) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}
