//! vhdxtool Core Library
//!
//! This crate reads and writes dynamically expanding and differencing VHDX
//! disk images.
//!
//! # Overview
//!
//! A VHDX file stores a virtual disk sparsely: the Block Allocation Table
//! (BAT) maps each fixed-size block of the disk to storage in the file, and
//! differencing disks track individual sectors in a per-chunk bitmap and read
//! everything else from their parent. A write-ahead log is replayed once, at
//! open, to restore consistency after an unclean shutdown.
//!
//! The main entry point is [`DiskImageFile`], which opens or creates an image
//! and hands out its logical disk as a [`ContentStream`].
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`format`] - On-disk structures (headers, region table, metadata, BAT entries)
//! - [`image`] - Open orchestration, creation and inspection
//! - [`content`] - Logical disk reads and writes through the BAT
//! - [`chunk`] - BAT chunks and block allocation
//! - [`bitmap`] - Sector presence bitmaps
//! - [`free_space`] - Free-space tracking for the backing file
//! - [`log`] - Log entry parsing, active sequence discovery and replay
//! - [`disk`] - The logical disk trait and simple parent disks
//! - [`store`], [`snapshot`] - Backing stores and the replay overlay
//! - [`extent`] - Byte range arithmetic
//!
//! # Quick Start
//!
//! ```no_run
//! use vhdxtool_core::{CreateOptions, DiskImageFile, OpenOptions, VirtualDisk};
//!
//! let image = DiskImageFile::create_path("disk.vhdx", CreateOptions::new(1 << 30)).unwrap();
//! let mut disk = image.open_content(None);
//! disk.write_at(0, &[0xAA; 512]).unwrap();
//! drop(disk);
//!
//! let image = DiskImageFile::open_path("disk.vhdx", OpenOptions::read_only()).unwrap();
//! let mut disk = image.open_content(None);
//! let mut sector = [0u8; 512];
//! disk.read_at(0, &mut sector).unwrap();
//! assert_eq!(sector, [0xAA; 512]);
//! ```

pub mod bitmap;
pub mod chunk;
pub mod content;
pub mod disk;
pub mod error;
pub mod extent;
pub mod format;
pub mod free_space;
pub mod image;
pub mod log;
pub mod snapshot;
pub mod store;

pub use error::{Error, Result};

pub use content::ContentStream;
pub use disk::{FlatDisk, ParentDisk, VirtualDisk, ZeroDisk};
pub use extent::Extent;
pub use image::{
    Access, CreateOptions, DiskImageFile, DiskImageInfo, LogEntryInfo, OpenOptions, ParentInfo,
    DEFAULT_BLOCK_SIZE,
};
pub use snapshot::{LogicalStore, SnapshotOverlay};
pub use store::BackingStore;

/// Opens the logical disk of a non-differencing image held in `store`.
///
/// Differencing images opened this way read unstored sectors as zeros; use
/// [`DiskImageFile::open_content`] to supply the parent.
pub fn open<S: BackingStore>(
    store: S,
    options: OpenOptions,
) -> Result<ContentStream<LogicalStore<S>>> {
    Ok(DiskImageFile::open(store, options)?.open_content(None))
}
