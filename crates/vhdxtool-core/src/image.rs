//! VHDX image files: open orchestration, creation and inspection.
//!
//! Opening a file runs these steps in order, and any failure aborts the open:
//!
//! 1. Check the file identifier.
//! 2. Pick the active header.
//! 3. Replay the log, into an in-memory overlay when the file is read-only.
//! 4. Read the region table.
//! 5. Read the metadata.
//! 6. Reserve every structure and allocated block in the free-space table.
//! 7. On a writable open, bump both headers.
//!
//! All structures after step 3 are read through the replayed view of the file.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::{BatRegion, ChunkGeometry};
use crate::content::ContentStream;
use crate::disk::{ParentDisk, ZeroDisk};
use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::format::bat::BAT_ENTRY_SIZE;
use crate::format::header::{FILE_IDENTIFIER_SIZE, HEADER_SIZE};
use crate::format::metadata::chunk_ratio;
use crate::format::region::REGION_TABLE_SIZE;
use crate::format::{
    round_up, BatEntry, FileIdentifier, FileParameters, Metadata, ParentLocator, RegionEntry,
    RegionTable, VhdxHeader, BAT_REGION_GUID, FILE_IDENTIFIER_OFFSET, HEADER1_OFFSET,
    HEADER2_OFFSET, HEADER_AREA_SIZE, METADATA_REGION_GUID, MIB, REGION_TABLE1_OFFSET,
    REGION_TABLE2_OFFSET, SECTOR_BITMAP_BLOCK_SIZE,
};
use crate::free_space::FreeSpaceTable;
use crate::log::{find_active_sequence, LogRegion, LogSequence};
use crate::snapshot::{LogicalStore, SnapshotOverlay};
use crate::store::BackingStore;

/// Default block size for new disks (32 MiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 32 * MIB;

/// Default creator string written to the file identifier.
pub const DEFAULT_CREATOR: &str = "vhdxtool";

const LOG_OFFSET: u64 = MIB;
const LOG_LENGTH: u64 = MIB;
const METADATA_OFFSET: u64 = 2 * MIB;
const METADATA_LENGTH: u64 = MIB;
const BAT_OFFSET: u64 = 3 * MIB;

/// Whether an open may modify the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// Options for opening an existing image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenOptions {
    pub access: Access,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            access: Access::ReadOnly,
        }
    }

    pub fn read_write() -> Self {
        Self {
            access: Access::ReadWrite,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }
}

/// Options for creating a new image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    /// Virtual disk size in bytes.
    pub capacity: u64,
    /// Payload block size in bytes.
    pub block_size: u64,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    /// Written to the file identifier.
    pub creator: String,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            capacity: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            logical_sector_size: 512,
            physical_sector_size: 4096,
            creator: DEFAULT_CREATOR.to_string(),
        }
    }
}

impl CreateOptions {
    /// Default options for a disk of `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_logical_sector_size(mut self, size: u32) -> Self {
        self.logical_sector_size = size;
        self
    }

    pub fn with_physical_sector_size(mut self, size: u32) -> Self {
        self.physical_sector_size = size;
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    fn validate(&self) -> Result<()> {
        let block_size = self.block_size;
        if !block_size.is_power_of_two() || !(MIB..=256 * MIB).contains(&block_size) {
            return Err(Error::invalid_argument(format!(
                "block size {} must be a power of two between 1 MiB and 256 MiB",
                block_size
            )));
        }
        for (name, size) in [
            ("logical", self.logical_sector_size),
            ("physical", self.physical_sector_size),
        ] {
            if size != 512 && size != 4096 {
                return Err(Error::invalid_argument(format!(
                    "{} sector size {} must be 512 or 4096",
                    name, size
                )));
            }
        }
        if self.capacity == 0 || self.capacity % self.logical_sector_size as u64 != 0 {
            return Err(Error::invalid_argument(format!(
                "capacity {} must be a non-zero multiple of the logical sector size {}",
                self.capacity, self.logical_sector_size
            )));
        }
        Ok(())
    }
}

/// What a differencing child records about its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentInfo {
    /// The parent's data write GUID, stored as `parent_linkage`.
    pub data_write_guid: Uuid,
    pub capacity: u64,
    pub block_size: u64,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    pub relative_path: Option<String>,
    pub absolute_win32_path: Option<String>,
}

impl ParentInfo {
    pub fn with_relative_path(mut self, path: impl Into<String>) -> Self {
        self.relative_path = Some(path.into());
        self
    }

    pub fn with_absolute_win32_path(mut self, path: impl Into<String>) -> Self {
        self.absolute_win32_path = Some(path.into());
        self
    }

    fn locator(&self) -> ParentLocator {
        let mut entries = vec![(
            "parent_linkage".to_string(),
            self.data_write_guid.braced().to_string().to_uppercase(),
        )];
        if let Some(path) = &self.relative_path {
            entries.push(("relative_path".to_string(), path.clone()));
        }
        if let Some(path) = &self.absolute_win32_path {
            entries.push(("absolute_win32_path".to_string(), path.clone()));
        }
        ParentLocator::new(entries)
    }
}

/// One entry of the active log sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntryInfo {
    pub sequence_number: u64,
    pub position: u64,
    pub tail: u64,
    pub flushed_file_offset: u64,
    pub last_file_offset: u64,
    pub modified_extents: Vec<Extent>,
}

/// Everything `vhdxtool info` reports about a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImageInfo {
    pub creator: String,
    pub file_size: u64,
    /// Header 1 and header 2; `None` when that copy is invalid.
    pub headers: [Option<VhdxHeader>; 2],
    /// 1 or 2.
    pub active_header: u8,
    pub region_table: RegionTable,
    pub metadata: Metadata,
    /// The sequence found at open, oldest first.
    pub log_entries: Vec<LogEntryInfo>,
}

/// An opened VHDX file.
///
/// Holds the decoded structures and the free-space table. The logical disk
/// is reached through [`DiskImageFile::open_content`].
pub struct DiskImageFile<S> {
    store: LogicalStore<S>,
    access: Access,
    identifier: FileIdentifier,
    header: VhdxHeader,
    active_header: u8,
    region_table: RegionTable,
    metadata: Metadata,
    bat: BatRegion,
    free_space: FreeSpaceTable,
    log_sequence: LogSequence,
}

impl DiskImageFile<File> {
    /// Opens the file at `path`.
    pub fn open_path(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(options.is_writable())
            .open(path)
            .map_err(|e| Error::io(e, path))?;
        Self::open(file, options)
    }

    /// Creates a dynamic disk at `path`, failing if it already exists.
    pub fn create_path(path: impl AsRef<Path>, options: CreateOptions) -> Result<Self> {
        let file = create_new_file(path.as_ref())?;
        Self::create_dynamic(file, options)
    }

    /// Creates a differencing disk at `path`, failing if it already exists.
    pub fn create_differencing_path(
        path: impl AsRef<Path>,
        parent: &ParentInfo,
        options: CreateOptions,
    ) -> Result<Self> {
        let file = create_new_file(path.as_ref())?;
        Self::create_differencing(file, parent, options)
    }
}

fn create_new_file(path: &Path) -> Result<File> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| Error::io(e, path))
}

impl<S: BackingStore> DiskImageFile<S> {
    /// Opens an existing image held in `store`.
    pub fn open(mut store: S, options: OpenOptions) -> Result<Self> {
        let identifier = FileIdentifier::parse(&read_structure(
            &mut store,
            FILE_IDENTIFIER_OFFSET,
            FILE_IDENTIFIER_SIZE,
            "file identifier",
        )?)?;

        let (header, active_header) = select_header(&read_headers(&mut store)?)?;
        debug!(
            active_header,
            sequence = header.sequence_number,
            log_offset = header.log_offset,
            log_length = header.log_length,
            "selected VHDX header"
        );

        let (mut store, log_sequence) = replay_log(store, &header, options.access)?;

        let mut free_space = FreeSpaceTable::new(store.len()?);
        reserve_structure(&mut free_space, 0, HEADER_AREA_SIZE, "header area")?;
        reserve_structure(
            &mut free_space,
            header.log_offset,
            header.log_length as u64,
            "log",
        )?;

        let region_table = read_region_table(&mut store)?;
        for entry in &region_table.entries {
            if entry.is_required() && entry.well_known_name().is_none() {
                return Err(Error::format(format!(
                    "unrecognised required region {}",
                    entry.guid
                )));
            }
            reserve_structure(
                &mut free_space,
                entry.file_offset,
                entry.length as u64,
                "region",
            )?;
        }

        let metadata_region = region(&region_table, &METADATA_REGION_GUID, "metadata")?;
        let metadata = Metadata::read(&read_structure(
            &mut store,
            metadata_region.file_offset,
            metadata_region.length as usize,
            "metadata region",
        )?)?;
        debug!(
            block_size = metadata.file_parameters.block_size,
            disk_size = metadata.disk_size,
            logical_sector_size = metadata.logical_sector_size,
            has_parent = metadata.file_parameters.has_parent,
            "read metadata"
        );

        let bat_region = region(&region_table, &BAT_REGION_GUID, "BAT")?;
        let bat = BatRegion {
            offset: bat_region.file_offset,
            length: bat_region.length as u64,
        };
        reserve_bat_extents(&mut store, &mut free_space, bat, &metadata)?;

        let mut image = Self {
            store,
            access: options.access,
            identifier,
            header,
            active_header,
            region_table,
            metadata,
            bat,
            free_space,
            log_sequence,
        };

        if options.is_writable() {
            image.header.file_write_guid = Uuid::new_v4();
            if image.header.has_log() {
                image.header.log_guid = Uuid::nil();
            }
            image.write_header()?;
            info!(
                sequence = image.header.sequence_number,
                "opened VHDX for writing"
            );
        }

        Ok(image)
    }

    /// Writes an empty dynamic disk into `store` and opens it for writing.
    pub fn create_dynamic(store: S, options: CreateOptions) -> Result<Self> {
        options.validate()?;
        initialize(store, &options, None)
    }

    /// Writes an empty differencing disk over `parent` into `store` and opens it for writing.
    ///
    /// Capacity, block size and sector sizes come from `parent`; only the
    /// creator is taken from `options`.
    pub fn create_differencing(store: S, parent: &ParentInfo, options: CreateOptions) -> Result<Self> {
        let options = CreateOptions {
            capacity: parent.capacity,
            block_size: parent.block_size,
            logical_sector_size: parent.logical_sector_size,
            physical_sector_size: parent.physical_sector_size,
            creator: options.creator,
        };
        options.validate()?;
        initialize(store, &options, Some(&parent.locator()))
    }

    /// The logical disk. A differencing disk given no parent reads as if
    /// its parent were all zeros.
    pub fn open_content(self, parent: Option<ParentDisk>) -> ContentStream<LogicalStore<S>> {
        let capacity = self.capacity();
        let geometry = ChunkGeometry {
            block_size: self.block_size(),
            logical_sector_size: self.metadata.logical_sector_size,
            has_parent: self.is_differencing(),
        };
        let parent = parent.unwrap_or_else(|| ParentDisk::owned(ZeroDisk::new(capacity)));
        ContentStream::new(
            self.store,
            self.free_space,
            geometry,
            self.bat,
            capacity,
            parent,
            self.access == Access::ReadWrite,
        )
    }

    /// Gathers the identifier, both headers, regions, metadata and log.
    pub fn info(&mut self) -> Result<DiskImageInfo> {
        let headers = read_headers(&mut self.store)?;
        let log_entries = self
            .log_sequence
            .iter()
            .map(|entry| LogEntryInfo {
                sequence_number: entry.sequence_number(),
                position: entry.position(),
                tail: entry.tail(),
                flushed_file_offset: entry.flushed_file_offset(),
                last_file_offset: entry.last_file_offset(),
                modified_extents: entry.modified_extents(),
            })
            .collect();

        Ok(DiskImageInfo {
            creator: self.identifier.creator.clone(),
            file_size: self.store.len()?,
            headers,
            active_header: self.active_header,
            region_table: self.region_table.clone(),
            metadata: self.metadata.clone(),
            log_entries,
        })
    }

    /// Candidate locations of the parent file, most specific first.
    ///
    /// A `relative_path` entry is resolved against `base_dir` when given.
    pub fn parent_locations(&self, base_dir: Option<&Path>) -> Result<Vec<String>> {
        let locator = match &self.metadata.parent_locator {
            Some(locator) if self.is_differencing() => locator,
            _ => {
                return Err(Error::invalid_argument(
                    "only differencing disks have parent locations",
                ))
            }
        };

        let mut paths = Vec::new();
        if let Some(relative) = locator.get("relative_path") {
            paths.push(resolve_relative(relative, base_dir));
        }
        if let Some(volume) = locator.get("volume_path") {
            paths.push(volume.to_string());
        }
        if let Some(absolute) = locator.get("absolute_win32_path") {
            paths.push(absolute.to_string());
        }
        Ok(paths)
    }

    /// The parent's data write GUID, for differencing disks that record one.
    pub fn parent_unique_id(&self) -> Option<Uuid> {
        if !self.is_differencing() {
            return None;
        }
        let linkage = self.metadata.parent_locator.as_ref()?.get("parent_linkage")?;
        Uuid::parse_str(linkage).ok()
    }

    /// What a child of this disk needs to record.
    pub fn as_parent(&self) -> ParentInfo {
        ParentInfo {
            data_write_guid: self.unique_id(),
            capacity: self.capacity(),
            block_size: self.block_size(),
            logical_sector_size: self.metadata.logical_sector_size,
            physical_sector_size: self.metadata.physical_sector_size,
            relative_path: None,
            absolute_win32_path: None,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.metadata.disk_size
    }

    pub fn block_size(&self) -> u64 {
        self.metadata.file_parameters.block_size as u64
    }

    pub fn logical_sector_size(&self) -> u32 {
        self.metadata.logical_sector_size
    }

    pub fn physical_sector_size(&self) -> u32 {
        self.metadata.physical_sector_size
    }

    pub fn is_differencing(&self) -> bool {
        self.metadata.file_parameters.has_parent
    }

    /// The data write GUID; children link to it.
    pub fn unique_id(&self) -> Uuid {
        self.header.data_write_guid
    }

    pub fn header(&self) -> &VhdxHeader {
        &self.header
    }

    /// 1 or 2.
    pub fn active_header(&self) -> u8 {
        self.active_header
    }

    pub fn region_table(&self) -> &RegionTable {
        &self.region_table
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn free_space(&self) -> &FreeSpaceTable {
        &self.free_space
    }

    /// The log sequence found at open; empty for a clean log.
    pub fn log_sequence(&self) -> &LogSequence {
        &self.log_sequence
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// True when a read-only open replayed the log into memory.
    pub fn is_replayed_in_memory(&self) -> bool {
        self.store.is_overlay()
    }

    pub fn into_store(self) -> S {
        self.store.into_inner()
    }

    /// Bumps the sequence number into the inactive slot, then again into the active one.
    fn write_header(&mut self) -> Result<()> {
        let (first, second) = if self.active_header == 1 {
            (HEADER2_OFFSET, HEADER1_OFFSET)
        } else {
            (HEADER1_OFFSET, HEADER2_OFFSET)
        };

        for offset in [first, second] {
            self.header.sequence_number += 1;
            self.header.update_checksum();
            self.store.write_all_at(offset, &self.header.to_bytes())?;
            self.store.flush()?;
        }
        Ok(())
    }
}

impl<S> std::fmt::Debug for DiskImageFile<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageFile")
            .field("access", &self.access)
            .field("active_header", &self.active_header)
            .field("header", &self.header)
            .field("capacity", &self.metadata.disk_size)
            .field("block_size", &self.metadata.file_parameters.block_size)
            .field("bat", &self.bat)
            .finish()
    }
}

/// Lays out a new image and opens it for writing.
fn initialize<S: BackingStore>(
    mut store: S,
    options: &CreateOptions,
    parent_locator: Option<&ParentLocator>,
) -> Result<DiskImageFile<S>> {
    let block_size = options.block_size;
    let ratio = chunk_ratio(options.logical_sector_size, block_size);
    let data_blocks = options.capacity.div_ceil(block_size);
    // A differencing disk keeps a sector bitmap entry for every chunk, including the last.
    let bat_entries = if parent_locator.is_some() {
        data_blocks.div_ceil(ratio) * (ratio + 1)
    } else {
        data_blocks + (data_blocks - 1) / ratio
    };
    let bat_length = round_up(bat_entries * BAT_ENTRY_SIZE as u64, MIB);
    let bat_length = u32::try_from(bat_length).map_err(|_| {
        Error::invalid_argument(format!(
            "capacity {} needs a BAT of {} bytes",
            options.capacity, bat_length
        ))
    })?;

    let header1 = VhdxHeader::new(LOG_OFFSET, LOG_LENGTH as u32);
    let mut header2 = header1.clone();
    header2.sequence_number = 1;
    header2.update_checksum();

    let region_table = RegionTable::new(vec![
        RegionEntry::new(
            METADATA_REGION_GUID,
            METADATA_OFFSET,
            METADATA_LENGTH as u32,
            true,
        ),
        RegionEntry::new(BAT_REGION_GUID, BAT_OFFSET, bat_length, true),
    ]);
    let table_bytes = region_table.to_bytes();

    let file_parameters = FileParameters {
        block_size: block_size as u32,
        leave_blocks_allocated: false,
        has_parent: parent_locator.is_some(),
    };
    let metadata = Metadata::initialize(
        METADATA_LENGTH as usize,
        file_parameters,
        options.capacity,
        options.logical_sector_size,
        options.physical_sector_size,
        parent_locator,
    )?;

    let file_end = BAT_OFFSET + bat_length as u64;
    store.set_len(0)?;
    store.set_len(file_end)?;
    store.write_all_at(
        FILE_IDENTIFIER_OFFSET,
        &FileIdentifier::new(options.creator.as_str()).to_bytes(),
    )?;
    store.write_all_at(HEADER1_OFFSET, &header1.to_bytes())?;
    store.write_all_at(HEADER2_OFFSET, &header2.to_bytes())?;
    store.write_all_at(REGION_TABLE1_OFFSET, &table_bytes)?;
    store.write_all_at(REGION_TABLE2_OFFSET, &table_bytes)?;
    store.write_all_at(METADATA_OFFSET, &metadata)?;
    store.flush()?;

    debug!(
        capacity = options.capacity,
        block_size,
        bat_length,
        differencing = parent_locator.is_some(),
        "initialized VHDX layout"
    );

    DiskImageFile::open(store, OpenOptions::read_write())
}

/// Reads a fixed structure; a file too short to hold it is a format error.
fn read_structure<S: BackingStore + ?Sized>(
    store: &mut S,
    offset: u64,
    length: usize,
    what: &str,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; length];
    match store.read_exact_at(offset, &mut buf) {
        Ok(()) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::format(format!(
            "file too short to hold the {} at offset {}",
            what, offset
        ))),
        Err(e) => Err(e.into()),
    }
}

fn reserve_structure(free_space: &mut FreeSpaceTable, start: u64, length: u64, what: &str) -> Result<()> {
    free_space.reserve(start, length).map_err(|_| {
        Error::format(format!(
            "{} at offset {} length {} is not 1 MiB aligned",
            what, start, length
        ))
    })
}

fn read_headers<S: BackingStore + ?Sized>(store: &mut S) -> Result<[Option<VhdxHeader>; 2]> {
    let mut headers = [None, None];
    for (slot, offset) in [HEADER1_OFFSET, HEADER2_OFFSET].into_iter().enumerate() {
        let data = read_structure(store, offset, HEADER_SIZE, "header")?;
        headers[slot] = VhdxHeader::parse_valid(&data);
    }
    Ok(headers)
}

/// The valid header with the higher sequence number, and its slot (1 or 2).
fn select_header(headers: &[Option<VhdxHeader>; 2]) -> Result<(VhdxHeader, u8)> {
    match headers {
        [Some(h1), Some(h2)] if h2.sequence_number > h1.sequence_number => Ok((h2.clone(), 2)),
        [Some(h1), _] => Ok((h1.clone(), 1)),
        [None, Some(h2)] => Ok((h2.clone(), 2)),
        [None, None] => Err(Error::format("no valid VHDX header found")),
    }
}

/// Replays the active log sequence, if any, and returns the store to read everything else through.
fn replay_log<S: BackingStore>(
    mut store: S,
    header: &VhdxHeader,
    access: Access,
) -> Result<(LogicalStore<S>, LogSequence)> {
    if !header.has_log() {
        return Ok((LogicalStore::Direct(store), LogSequence::new()));
    }

    let log = LogRegion {
        offset: header.log_offset,
        length: header.log_length as u64,
    };
    let sequence = find_active_sequence(&mut store, log, header.log_guid)?;
    let Some(head) = sequence.head() else {
        return Err(Error::corrupt(
            "unable to replay log: no valid log sequence found",
        ));
    };

    let file_size = store.len()?;
    if head.flushed_file_offset() > file_size {
        return Err(Error::corrupt(format!(
            "truncated file: log expects at least {} bytes, file has {}",
            head.flushed_file_offset(),
            file_size
        )));
    }

    if sequence.len() == 1 && head.is_empty() {
        warn!(
            sequence = head.sequence_number(),
            "log is not empty but holds nothing to replay"
        );
        return Ok((LogicalStore::Direct(store), sequence));
    }

    let last_file_offset = head.last_file_offset();
    let mut logical = match access {
        Access::ReadWrite => LogicalStore::Direct(store),
        Access::ReadOnly => {
            warn!("file is read-only; replaying log into memory");
            LogicalStore::Overlay(SnapshotOverlay::new(store)?)
        }
    };

    info!(
        entries = sequence.len(),
        head_sequence = sequence.head().map(|h| h.sequence_number()),
        "replaying log"
    );
    for entry in &sequence {
        if entry.log_guid() != header.log_guid {
            return Err(Error::corrupt(format!(
                "log entry {} belongs to another log",
                entry.sequence_number()
            )));
        }
        if entry.is_empty() {
            continue;
        }
        entry.replay(&mut logical)?;
    }

    if logical.len()? < last_file_offset {
        debug!(size = last_file_offset, "extending file to the log's last offset");
        logical.set_len(last_file_offset)?;
    }
    logical.flush()?;

    Ok((logical, sequence))
}

/// Reads the first valid region table copy.
fn read_region_table<S: BackingStore + ?Sized>(store: &mut S) -> Result<RegionTable> {
    let primary = read_structure(store, REGION_TABLE1_OFFSET, REGION_TABLE_SIZE, "region table")?;
    match RegionTable::parse(&primary) {
        Ok(table) => Ok(table),
        Err(err) => {
            warn!(error = %err, "primary region table invalid, using the copy");
            let copy = read_structure(store, REGION_TABLE2_OFFSET, REGION_TABLE_SIZE, "region table")?;
            RegionTable::parse(&copy)
        }
    }
}

fn region<'t>(table: &'t RegionTable, guid: &Uuid, name: &str) -> Result<&'t RegionEntry> {
    table
        .find(guid)
        .ok_or_else(|| Error::format(format!("missing {} region", name)))
}

/// Reserves every block and sector bitmap block the BAT points at.
fn reserve_bat_extents<S: BackingStore + ?Sized>(
    store: &mut S,
    free_space: &mut FreeSpaceTable,
    bat: BatRegion,
    metadata: &Metadata,
) -> Result<()> {
    let data = read_structure(store, bat.offset, bat.length as usize, "BAT")?;
    let ratio = metadata.chunk_ratio();
    let block_size = metadata.file_parameters.block_size as u64;

    let mut reserved = 0usize;
    for (slot, raw) in data.chunks_exact(BAT_ENTRY_SIZE).enumerate() {
        let entry = BatEntry::read_from(raw, 0);
        let offset = entry.file_offset();
        if offset == 0 {
            continue;
        }
        let length = if slot as u64 % (ratio + 1) == ratio {
            SECTOR_BITMAP_BLOCK_SIZE
        } else {
            block_size
        };
        free_space.reserve(offset, length)?;
        reserved += 1;
    }
    debug!(reserved, "reserved BAT-controlled extents");
    Ok(())
}

fn resolve_relative(relative: &str, base_dir: Option<&Path>) -> String {
    let normalized = relative.replace('\\', "/");
    let trimmed = normalized.strip_prefix("./").unwrap_or(&normalized);
    match base_dir {
        Some(base) => PathBuf::from(base).join(trimmed).to_string_lossy().into_owned(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::VirtualDisk;
    use crate::format::metadata::METADATA_FLAG_REQUIRED;
    use std::io::Cursor;

    fn new_store() -> Cursor<Vec<u8>> {
        Cursor::new(Vec::new())
    }

    fn small() -> CreateOptions {
        CreateOptions::new(64 * MIB).with_block_size(MIB)
    }

    #[test]
    fn test_create_options_defaults() {
        let options = CreateOptions::new(MIB);
        assert_eq!(options.block_size, 32 * MIB);
        assert_eq!(options.logical_sector_size, 512);
        assert_eq!(options.physical_sector_size, 4096);
        assert_eq!(options.creator, "vhdxtool");
    }

    #[test]
    fn test_create_rejects_bad_geometry() {
        for options in [
            CreateOptions::new(MIB).with_block_size(3 * MIB),
            CreateOptions::new(MIB).with_block_size(512 * MIB),
            CreateOptions::new(MIB).with_logical_sector_size(1024),
            CreateOptions::new(0),
            CreateOptions::new(1000),
        ] {
            let err = DiskImageFile::create_dynamic(new_store(), options).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument { .. }), "{err}");
        }
    }

    #[test]
    fn test_create_layout() {
        let image = DiskImageFile::create_dynamic(new_store(), small()).unwrap();
        assert_eq!(image.capacity(), 64 * MIB);
        assert_eq!(image.block_size(), MIB);
        assert!(!image.is_differencing());

        let bat = image.region_table().find(&BAT_REGION_GUID).unwrap();
        assert_eq!(bat.file_offset, 3 * MIB);
        assert_eq!(bat.length as u64, MIB);
        let metadata = image.region_table().find(&METADATA_REGION_GUID).unwrap();
        assert_eq!(metadata.file_offset, 2 * MIB);

        // Header, log, metadata and BAT fill the whole file.
        assert!(image.free_space().free_extents().is_empty());
        assert_eq!(image.into_store().into_inner().len() as u64, 4 * MIB);
    }

    #[test]
    fn test_writable_open_bumps_headers() {
        let image = DiskImageFile::create_dynamic(new_store(), small()).unwrap();
        // Created with sequence 0 and 1; the open bumps twice.
        assert_eq!(image.header().sequence_number, 3);
        assert_eq!(image.active_header(), 2);
        let first_guid = image.header().file_write_guid;

        let store = image.into_store();
        let image = DiskImageFile::open(store, OpenOptions::read_write()).unwrap();
        assert_eq!(image.header().sequence_number, 5);
        assert_ne!(image.header().file_write_guid, first_guid);

        let mut image = DiskImageFile::open(image.into_store(), OpenOptions::read_only()).unwrap();
        assert_eq!(image.header().sequence_number, 5);
        let info = image.info().unwrap();
        let [Some(h1), Some(h2)] = &info.headers else {
            panic!("both headers should be valid");
        };
        assert_eq!((h1.sequence_number, h2.sequence_number), (4, 5));
    }

    #[test]
    fn test_open_rejects_bad_signature() {
        let err = DiskImageFile::open(Cursor::new(vec![0u8; 4 * MIB as usize]), OpenOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn test_open_rejects_short_file() {
        let err = DiskImageFile::open(Cursor::new(b"vhdxfile".to_vec()), OpenOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn test_falls_back_to_second_header_and_region_table() {
        let image = DiskImageFile::create_dynamic(new_store(), small()).unwrap();
        let mut bytes = image.into_store().into_inner();
        bytes[HEADER2_OFFSET as usize + 100] ^= 0xFF;
        bytes[REGION_TABLE1_OFFSET as usize + 20] ^= 0xFF;

        let image = DiskImageFile::open(Cursor::new(bytes), OpenOptions::read_only()).unwrap();
        assert_eq!(image.active_header(), 1);
        assert!(image.region_table().find(&BAT_REGION_GUID).is_some());
    }

    #[test]
    fn test_no_valid_header_is_format_error() {
        let image = DiskImageFile::create_dynamic(new_store(), small()).unwrap();
        let mut bytes = image.into_store().into_inner();
        bytes[HEADER1_OFFSET as usize] ^= 0xFF;
        bytes[HEADER2_OFFSET as usize] ^= 0xFF;

        let err = DiskImageFile::open(Cursor::new(bytes), OpenOptions::read_only()).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn test_unknown_required_region_is_format_error() {
        let image = DiskImageFile::create_dynamic(new_store(), small()).unwrap();
        let mut table = image.region_table().clone();
        let mut store = image.into_store();
        table
            .entries
            .push(RegionEntry::new(Uuid::new_v4(), 4 * MIB, MIB as u32, true));
        let bytes = table.to_bytes();
        store.write_all_at(REGION_TABLE1_OFFSET, &bytes).unwrap();
        store.write_all_at(REGION_TABLE2_OFFSET, &bytes).unwrap();

        let err = DiskImageFile::open(store, OpenOptions::read_only()).unwrap_err();
        assert!(matches!(err, Error::Format { .. }), "{err}");
    }

    #[test]
    fn test_allocated_blocks_are_reserved_on_open() {
        let image = DiskImageFile::create_dynamic(new_store(), small()).unwrap();
        let mut disk = image.open_content(None);
        disk.write_at(10 * MIB, &[1u8; 512]).unwrap();
        let store = disk.into_store().into_inner();

        let image = DiskImageFile::open(store, OpenOptions::read_only()).unwrap();
        assert!(image.free_space().free_extents().is_empty());
        assert_eq!(image.free_space().file_size(), 5 * MIB);
    }

    #[test]
    fn test_differencing_records_parent() {
        let parent = DiskImageFile::create_dynamic(new_store(), small()).unwrap();
        let info = parent
            .as_parent()
            .with_relative_path(".\\base.vhdx")
            .with_absolute_win32_path("C:\\disks\\base.vhdx");
        let child = DiskImageFile::create_differencing(new_store(), &info, CreateOptions::default())
            .unwrap();

        assert!(child.is_differencing());
        assert_eq!(child.capacity(), parent.capacity());
        assert_eq!(child.block_size(), parent.block_size());
        assert_eq!(child.parent_unique_id(), Some(parent.unique_id()));

        let entry = child
            .metadata()
            .table
            .find(&crate::format::PARENT_LOCATOR_GUID)
            .unwrap();
        assert_eq!(entry.flags & METADATA_FLAG_REQUIRED, METADATA_FLAG_REQUIRED);

        assert_eq!(
            child.parent_locations(Some(Path::new("/images"))).unwrap(),
            vec![
                "/images/base.vhdx".to_string(),
                "C:\\disks\\base.vhdx".to_string()
            ]
        );
    }

    #[test]
    fn test_differencing_bat_covers_last_chunk_bitmap() {
        // 130049 one-MiB blocks: 32 chunks of 4096 blocks, the last one mostly empty.
        let options = CreateOptions::new((128 * 1016 + 1) * MIB).with_block_size(MIB);
        let parent = DiskImageFile::create_dynamic(new_store(), options).unwrap();
        let dynamic_bat = parent.region_table().find(&BAT_REGION_GUID).unwrap().length;
        assert_eq!(dynamic_bat as u64, MIB);

        let child =
            DiskImageFile::create_differencing(new_store(), &parent.as_parent(), CreateOptions::default())
                .unwrap();
        let bat = child.region_table().find(&BAT_REGION_GUID).unwrap();
        assert!(bat.length as u64 >= 32 * 4097 * 8);
        assert_eq!(bat.length as u64, 2 * MIB);
        assert_eq!(child.into_store().into_inner().len() as u64, 5 * MIB);
    }

    #[test]
    fn test_parent_locations_on_dynamic_disk_is_misuse() {
        let image = DiskImageFile::create_dynamic(new_store(), small()).unwrap();
        let err = image.parent_locations(None).unwrap_err();
        assert!(err.is_misuse());
        assert_eq!(image.parent_unique_id(), None);
    }

    #[test]
    fn test_read_only_content_rejects_writes() {
        let image = DiskImageFile::create_dynamic(new_store(), small()).unwrap();
        let store = image.into_store();
        let image = DiskImageFile::open(store, OpenOptions::read_only()).unwrap();
        let mut disk = image.open_content(None);
        assert_eq!(disk.capacity(), 64 * MIB);
        assert!(matches!(disk.write_at(0, &[0u8; 512]), Err(Error::ReadOnly)));
    }
}
