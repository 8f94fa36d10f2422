//! Region table: the directory of the BAT, metadata and any other regions.

use uuid::{uuid, Uuid};

use super::{checksum_with_zeroed_field, le_guid, le_u32, le_u64, put_guid, KIB};
use crate::error::{Error, Result};

/// "regi" as a little-endian u32.
pub const REGION_TABLE_SIGNATURE: u32 = 0x6967_6572;

/// Size of one region table copy (the checksum covers all of it).
pub const REGION_TABLE_SIZE: usize = 64 * KIB as usize;

/// Maximum number of region entries.
pub const MAX_REGION_ENTRIES: u32 = 2047;

const ENTRY_SIZE: usize = 32;
const ENTRIES_OFFSET: usize = 16;

/// Region flag: the region must be understood to open the file.
pub const REGION_FLAG_REQUIRED: u32 = 1;

pub const BAT_REGION_GUID: Uuid = uuid!("2DC27766-F623-4200-9D64-115E9BFD4A08");
pub const METADATA_REGION_GUID: Uuid = uuid!("8B7CA206-4790-4B9A-B8FE-575F050F886E");

/// One entry of the region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionEntry {
    /// Region type (BAT, metadata or unknown).
    pub guid: Uuid,
    /// File offset of the region; a multiple of 1 MiB.
    pub file_offset: u64,
    /// Region length in bytes; a multiple of 1 MiB.
    pub length: u32,
    /// Bit 0 marks the region as required.
    pub flags: u32,
}

impl RegionEntry {
    pub fn new(guid: Uuid, file_offset: u64, length: u32, required: bool) -> Self {
        Self {
            guid,
            file_offset,
            length,
            flags: if required { REGION_FLAG_REQUIRED } else { 0 },
        }
    }

    pub fn is_required(&self) -> bool {
        self.flags & REGION_FLAG_REQUIRED != 0
    }

    /// Human-readable name for the well-known regions.
    pub fn well_known_name(&self) -> Option<&'static str> {
        if self.guid == BAT_REGION_GUID {
            Some("BAT")
        } else if self.guid == METADATA_REGION_GUID {
            Some("Metadata Region")
        } else {
            None
        }
    }

    fn parse(data: &[u8]) -> Self {
        Self {
            guid: le_guid(data, 0),
            file_offset: le_u64(data, 16),
            length: le_u32(data, 24),
            flags: le_u32(data, 28),
        }
    }

    fn write_to(&self, data: &mut [u8]) {
        put_guid(data, 0, &self.guid);
        data[16..24].copy_from_slice(&self.file_offset.to_le_bytes());
        data[24..28].copy_from_slice(&self.length.to_le_bytes());
        data[28..32].copy_from_slice(&self.flags.to_le_bytes());
    }
}

/// Decoded region table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTable {
    pub checksum: u32,
    pub entries: Vec<RegionEntry>,
}

impl RegionTable {
    pub fn new(entries: Vec<RegionEntry>) -> Self {
        Self {
            checksum: 0,
            entries,
        }
    }

    /// Parse and validate a region table copy.
    ///
    /// Layout:
    /// - 0: signature "regi" (4)
    /// - 4: checksum over the full 64 KiB with this field zeroed (4)
    /// - 8: entry count (4)
    /// - 12: reserved (4)
    /// - 16: entries, 32 bytes each
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < REGION_TABLE_SIZE {
            return Err(Error::format("region table too short"));
        }
        let data = &data[..REGION_TABLE_SIZE];

        let signature = le_u32(data, 0);
        if signature != REGION_TABLE_SIGNATURE {
            return Err(Error::format(format!(
                "invalid region table signature: 0x{:08X}",
                signature
            )));
        }

        let checksum = le_u32(data, 4);
        let computed = checksum_with_zeroed_field(data, 4);
        if checksum != computed {
            return Err(Error::format(format!(
                "region table checksum mismatch: stored 0x{:08X}, computed 0x{:08X}",
                checksum, computed
            )));
        }

        let count = le_u32(data, 8);
        if count > MAX_REGION_ENTRIES {
            return Err(Error::format(format!(
                "region table entry count {} exceeds {}",
                count, MAX_REGION_ENTRIES
            )));
        }

        let entries = (0..count as usize)
            .map(|i| {
                let off = ENTRIES_OFFSET + i * ENTRY_SIZE;
                RegionEntry::parse(&data[off..off + ENTRY_SIZE])
            })
            .collect();

        Ok(Self { checksum, entries })
    }

    pub fn find(&self, guid: &Uuid) -> Option<&RegionEntry> {
        self.entries.iter().find(|e| e.guid == *guid)
    }

    /// Serializes to 64 KiB with a freshly computed checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; REGION_TABLE_SIZE];
        buf[0..4].copy_from_slice(&REGION_TABLE_SIGNATURE.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());

        for (i, entry) in self.entries.iter().enumerate() {
            let off = ENTRIES_OFFSET + i * ENTRY_SIZE;
            entry.write_to(&mut buf[off..off + ENTRY_SIZE]);
        }

        let checksum = checksum_with_zeroed_field(&buf, 4);
        buf[4..8].copy_from_slice(&checksum.to_le_bytes());
        buf
    }
}
