//! Provides platform-specific functionality.
//!
//! This module holds the pieces that need operating system support: asking a
//! filesystem where a file's data lives, querying block device capacity, and
//! deallocating byte ranges of a destination.
//!
//! Each submodule exposes the same API so that the rest of the library can use
//! it without caring which platform it runs on. Platforms without extent
//! queries report every file as [`Error::UnsupportedFilesystem`], and callers
//! fall back to [`crate::extent::WholeFile`].
//!
//! [`Error::UnsupportedFilesystem`]: crate::error::Error::UnsupportedFilesystem

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::{
    Fiemap, SeekHole, block_device_size, extent_source, is_block_device, punch_hole,
};

#[cfg(not(target_os = "linux"))]
mod fallback;
#[cfg(not(target_os = "linux"))]
pub use self::fallback::{block_device_size, extent_source, is_block_device, punch_hole};
