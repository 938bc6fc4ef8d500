//! The core, UI-agnostic library for the `bmaptool` block map utility.
//!
//! `bmaptool-core` generates block maps ("bmaps") for sparse disk images and
//! uses them to copy those images quickly: only the blocks that hold data are
//! read and written, and every copied range is checked against its digest. It
//! can be used by any front-end, whether it's a command-line interface (like
//! `bmaptool`) or something else.
//!
//! The library is structured into several key modules:
//! - [`extent`] and [`platform`]: find which parts of an image hold data.
//! - [`chunker`]: turns those extents into block-aligned ranges.
//! - [`checksum`]: digests ranges and whole images.
//! - [`document`], [`reader`] and [`writer`]: the block map model and its XML
//!   format.
//! - [`signature`]: checks detached and clear-signed block maps through a
//!   caller-provided trust store.
//! - [`source`] and [`destination`]: what an image is copied from and to.
//! - [`mod@create`]: generates a block map for an image file.
//! - [`mod@copy`]: the copy engine.
//!
//! The primary entry points are [`create::run`] and [`copy::run`]. They block
//! until done and report their progress via callbacks, allowing the calling
//! application to display progress in any way it chooses.
//!
//! ## Example: Copying an Image with Progress Reporting
//!
//! ```rust,no_run
//! use bmaptool_core::copy::{self, BmapInput, CopyOptions};
//! use std::path::Path;
//! use std::sync::{Arc, atomic::AtomicBool};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bmap = std::fs::read("image.bmap")?;
//!
//!     // A shared flag to allow for graceful cancellation.
//!     let running = Arc::new(AtomicBool::new(true));
//!
//!     // This example trusts the block map without checking a signature.
//!     let options = CopyOptions {
//!         verify_signature: false,
//!         ..Default::default()
//!     };
//!
//!     let report = copy::run(
//!         Path::new("image.img.xz"),
//!         Path::new("/dev/sdX"),
//!         Some(BmapInput { document: &bmap, signature: None }),
//!         &options,
//!         running,
//!         |_| {}, // on_copy_start
//!         |done, total| println!("{done} of {total:?} blocks"),
//!     )?;
//!
//!     println!("Copied {} bytes", report.bytes_copied);
//!
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod chunker;
pub mod copy;
pub mod create;
pub mod destination;
pub mod document;
pub mod error;
pub mod extent;
pub mod platform;
pub mod reader;
pub mod signature;
pub mod source;
mod stream;
pub mod writer;

pub use error::{CopyError, Error, Result};
pub use stream::ReadAt;
