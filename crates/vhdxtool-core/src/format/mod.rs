//! On-disk VHDX structures.
//!
//! Every structure is decoded from and encoded to a fixed-size byte slice
//! with explicit offsets; nothing is reinterpreted in place.
//!
//! ```text
//! +--------------------------------------+ 0
//! | File identifier ("vhdxfile")         |
//! +--------------------------------------+ 64 KiB
//! | Header 1                             |
//! +--------------------------------------+ 128 KiB
//! | Header 2                             |
//! +--------------------------------------+ 192 KiB
//! | Region table                         |
//! +--------------------------------------+ 256 KiB
//! | Region table (copy)                  |
//! +--------------------------------------+ 1 MiB
//! | Log, metadata region, BAT, payload   |
//! | and sector bitmap blocks, all at     |
//! | 1 MiB granularity                    |
//! +--------------------------------------+
//! ```

pub mod bat;
pub mod header;
pub mod metadata;
pub mod region;

pub use bat::{BatEntry, PayloadBlockStatus, SectorBitmapStatus};
pub use header::{FileIdentifier, VhdxHeader};
pub use metadata::{
    FileParameters, Metadata, MetadataEntry, MetadataTable, ParentLocator, FILE_PARAMETERS_GUID,
    LOGICAL_SECTOR_SIZE_GUID, PAGE83_DATA_GUID, PARENT_LOCATOR_GUID, PHYSICAL_SECTOR_SIZE_GUID,
    VIRTUAL_DISK_SIZE_GUID,
};
pub use region::{RegionEntry, RegionTable, BAT_REGION_GUID, METADATA_REGION_GUID};

use uuid::Uuid;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// Offset of the file identifier.
pub const FILE_IDENTIFIER_OFFSET: u64 = 0;
/// Offsets of the two header copies.
pub const HEADER1_OFFSET: u64 = 64 * KIB;
pub const HEADER2_OFFSET: u64 = 128 * KIB;
/// Offsets of the two region table copies.
pub const REGION_TABLE1_OFFSET: u64 = 192 * KIB;
pub const REGION_TABLE2_OFFSET: u64 = 256 * KIB;

/// Size of the header area reserved at the start of every file.
pub const HEADER_AREA_SIZE: u64 = MIB;

/// Number of logical sectors covered by one chunk (one sector bitmap block).
pub const SECTORS_PER_CHUNK: u64 = 1 << 23;

/// Size of a sector bitmap block.
pub const SECTOR_BITMAP_BLOCK_SIZE: u64 = MIB;

#[inline]
pub(crate) fn le_u16(data: &[u8], offset: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&data[offset..offset + 2]);
    u16::from_le_bytes(b)
}

#[inline]
pub(crate) fn le_u32(data: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(b)
}

#[inline]
pub(crate) fn le_u64(data: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(b)
}

/// Reads a GUID stored in the mixed-endian Windows layout.
#[inline]
pub(crate) fn le_guid(data: &[u8], offset: usize) -> Uuid {
    let mut b = [0u8; 16];
    b.copy_from_slice(&data[offset..offset + 16]);
    Uuid::from_bytes_le(b)
}

#[inline]
pub(crate) fn put_guid(data: &mut [u8], offset: usize, guid: &Uuid) {
    data[offset..offset + 16].copy_from_slice(&guid.to_bytes_le());
}

/// CRC-32C of `data` computed as if the u32 at `field` were zero.
pub(crate) fn checksum_with_zeroed_field(data: &[u8], field: usize) -> u32 {
    let crc = crc32c::crc32c(&data[..field]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &data[field + 4..])
}

/// Rounds `value` up to a multiple of `alignment`.
#[inline]
pub(crate) fn round_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}
