//! Metadata region: table of items plus the system items the engine needs.

use uuid::{uuid, Uuid};

use super::{le_guid, le_u16, le_u32, le_u64, put_guid, KIB, MIB};
use crate::error::{Error, Result};

/// "metadata" as a little-endian u64.
pub const METADATA_SIGNATURE: u64 = 0x6174_6164_6174_656D;

/// Size of the metadata table at the start of the region.
pub const METADATA_TABLE_SIZE: usize = 64 * KIB as usize;

pub const MAX_METADATA_ENTRIES: u16 = 2047;

const ENTRY_SIZE: usize = 32;
const ENTRIES_OFFSET: usize = 32;

pub const METADATA_FLAG_USER: u32 = 1;
pub const METADATA_FLAG_VIRTUAL_DISK: u32 = 2;
pub const METADATA_FLAG_REQUIRED: u32 = 4;

pub const FILE_PARAMETERS_GUID: Uuid = uuid!("CAA16737-FA36-4D43-B3B6-33F0AA44E76B");
pub const VIRTUAL_DISK_SIZE_GUID: Uuid = uuid!("2FA54224-CD1B-4876-B211-5DBED83BF4B8");
pub const PAGE83_DATA_GUID: Uuid = uuid!("BECA12AB-B2E6-4523-93EF-C309E000C746");
pub const LOGICAL_SECTOR_SIZE_GUID: Uuid = uuid!("8141BF1D-A96F-4709-BA47-F233A8FAAB5F");
pub const PHYSICAL_SECTOR_SIZE_GUID: Uuid = uuid!("CDA348C7-445D-4471-9CC9-E9885251C556");
pub const PARENT_LOCATOR_GUID: Uuid = uuid!("A8D35F2D-B30B-454D-ABF7-D3D84834AB0C");

/// Locator type of a VHDX parent.
pub const VHDX_PARENT_LOCATOR_TYPE: Uuid = uuid!("B04AEFB7-D19E-4A81-B789-25B8E9445913");

const KNOWN_SYSTEM_ITEMS: [(Uuid, &str); 6] = [
    (FILE_PARAMETERS_GUID, "File Parameters"),
    (VIRTUAL_DISK_SIZE_GUID, "Virtual Disk Size"),
    (PAGE83_DATA_GUID, "Page 83 Data"),
    (LOGICAL_SECTOR_SIZE_GUID, "Logical Sector Size"),
    (PHYSICAL_SECTOR_SIZE_GUID, "Physical Sector Size"),
    (PARENT_LOCATOR_GUID, "Parent Locator"),
];

/// One entry of the metadata table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataEntry {
    pub item_id: Uuid,
    /// Offset of the item relative to the start of the region.
    pub offset: u32,
    pub length: u32,
    pub flags: u32,
}

impl MetadataEntry {
    pub fn new(item_id: Uuid, offset: u32, length: u32, flags: u32) -> Self {
        Self {
            item_id,
            offset,
            length,
            flags,
        }
    }

    pub fn is_user(&self) -> bool {
        self.flags & METADATA_FLAG_USER != 0
    }

    pub fn is_virtual_disk(&self) -> bool {
        self.flags & METADATA_FLAG_VIRTUAL_DISK != 0
    }

    pub fn is_required(&self) -> bool {
        self.flags & METADATA_FLAG_REQUIRED != 0
    }

    /// Name of a well-known system item.
    pub fn well_known_name(&self) -> Option<&'static str> {
        if self.is_user() {
            return None;
        }
        KNOWN_SYSTEM_ITEMS
            .iter()
            .find(|(guid, _)| *guid == self.item_id)
            .map(|(_, name)| *name)
    }
}

/// The metadata table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataTable {
    pub entries: Vec<MetadataEntry>,
}

impl MetadataTable {
    /// Parse the table.
    ///
    /// Layout:
    /// - 0: signature "metadata" (8)
    /// - 8: reserved (2)
    /// - 10: entry count (2)
    /// - 12: reserved (20)
    /// - 32: entries of 32 bytes: item id (16), offset (4), length (4), flags (4), reserved (4)
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < METADATA_TABLE_SIZE {
            return Err(Error::format("metadata table too short"));
        }

        let signature = le_u64(data, 0);
        if signature != METADATA_SIGNATURE {
            return Err(Error::format(format!(
                "invalid metadata table signature: 0x{:016X}",
                signature
            )));
        }

        let count = le_u16(data, 10);
        if count > MAX_METADATA_ENTRIES {
            return Err(Error::format(format!(
                "metadata table entry count {} exceeds {}",
                count, MAX_METADATA_ENTRIES
            )));
        }

        let entries = (0..count as usize)
            .map(|i| {
                let off = ENTRIES_OFFSET + i * ENTRY_SIZE;
                MetadataEntry {
                    item_id: le_guid(data, off),
                    offset: le_u32(data, off + 16),
                    length: le_u32(data, off + 20),
                    flags: le_u32(data, off + 24),
                }
            })
            .collect();

        Ok(Self { entries })
    }

    /// Looks up a system (non-user) item.
    pub fn find(&self, item_id: &Uuid) -> Option<&MetadataEntry> {
        self.entries
            .iter()
            .find(|e| e.item_id == *item_id && !e.is_user())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; METADATA_TABLE_SIZE];
        buf[0..8].copy_from_slice(&METADATA_SIGNATURE.to_le_bytes());
        buf[10..12].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());

        for (i, entry) in self.entries.iter().enumerate() {
            let off = ENTRIES_OFFSET + i * ENTRY_SIZE;
            put_guid(&mut buf, off, &entry.item_id);
            buf[off + 16..off + 20].copy_from_slice(&entry.offset.to_le_bytes());
            buf[off + 20..off + 24].copy_from_slice(&entry.length.to_le_bytes());
            buf[off + 24..off + 28].copy_from_slice(&entry.flags.to_le_bytes());
        }
        buf
    }
}

/// The File Parameters item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileParameters {
    /// Payload block size in bytes.
    pub block_size: u32,
    /// Blocks keep their storage when trimmed.
    pub leave_blocks_allocated: bool,
    /// The disk is differencing.
    pub has_parent: bool,
}

impl FileParameters {
    pub const SIZE: usize = 8;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::format("file parameters item too short"));
        }
        let flags = le_u32(data, 4);
        Ok(Self {
            block_size: le_u32(data, 0),
            leave_blocks_allocated: flags & 1 != 0,
            has_parent: flags & 2 != 0,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flags = 0u32;
        if self.leave_blocks_allocated {
            flags |= 1;
        }
        if self.has_parent {
            flags |= 2;
        }
        let mut buf = vec![0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.block_size.to_le_bytes());
        buf[4..8].copy_from_slice(&flags.to_le_bytes());
        buf
    }
}

/// The Parent Locator item: a locator type and UTF-16 key/value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLocator {
    pub locator_type: Uuid,
    pub entries: Vec<(String, String)>,
}

impl ParentLocator {
    const HEADER_SIZE: usize = 20;
    const ENTRY_SIZE: usize = 12;

    pub fn new(entries: Vec<(String, String)>) -> Self {
        Self {
            locator_type: VHDX_PARENT_LOCATOR_TYPE,
            entries,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse the item.
    ///
    /// Layout:
    /// - 0: locator type GUID (16)
    /// - 16: reserved (2)
    /// - 18: key/value count (2)
    /// - 20: entries of 12 bytes: key offset (4), value offset (4), key length (2), value length (2)
    ///
    /// Offsets are relative to the start of the item.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(Error::format("parent locator item too short"));
        }

        let locator_type = le_guid(data, 0);
        let count = le_u16(data, 18) as usize;
        if Self::HEADER_SIZE + count * Self::ENTRY_SIZE > data.len() {
            return Err(Error::format(format!(
                "parent locator with {} entries does not fit in {} bytes",
                count,
                data.len()
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = Self::HEADER_SIZE + i * Self::ENTRY_SIZE;
            let key = utf16_at(data, le_u32(data, off) as usize, le_u16(data, off + 8) as usize)?;
            let value = utf16_at(
                data,
                le_u32(data, off + 4) as usize,
                le_u16(data, off + 10) as usize,
            )?;
            entries.push((key, value));
        }

        Ok(Self {
            locator_type,
            entries,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let table_end = Self::HEADER_SIZE + self.entries.len() * Self::ENTRY_SIZE;
        let mut buf = vec![0u8; table_end];
        put_guid(&mut buf, 0, &self.locator_type);
        buf[18..20].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());

        for (i, (key, value)) in self.entries.iter().enumerate() {
            let key_bytes = utf16_bytes(key);
            let value_bytes = utf16_bytes(value);

            let key_offset = buf.len();
            buf.extend_from_slice(&key_bytes);
            let value_offset = buf.len();
            buf.extend_from_slice(&value_bytes);

            let off = Self::HEADER_SIZE + i * Self::ENTRY_SIZE;
            buf[off..off + 4].copy_from_slice(&(key_offset as u32).to_le_bytes());
            buf[off + 4..off + 8].copy_from_slice(&(value_offset as u32).to_le_bytes());
            buf[off + 8..off + 10].copy_from_slice(&(key_bytes.len() as u16).to_le_bytes());
            buf[off + 10..off + 12].copy_from_slice(&(value_bytes.len() as u16).to_le_bytes());
        }
        buf
    }
}

fn utf16_at(data: &[u8], offset: usize, length: usize) -> Result<String> {
    let end = offset
        .checked_add(length)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| Error::format("parent locator string out of bounds"))?;
    let units: Vec<u16> = data[offset..end]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| Error::format("parent locator string is not UTF-16"))
}

fn utf16_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

/// Decoded contents of the metadata region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// The raw table, unknown items included.
    pub table: MetadataTable,
    pub file_parameters: FileParameters,
    /// Virtual disk capacity in bytes.
    pub disk_size: u64,
    /// Disk identity reported to the guest.
    pub page83_data: Uuid,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    /// Present only on differencing disks.
    pub parent_locator: Option<ParentLocator>,
}

impl Metadata {
    /// Decodes the metadata region held in `region`.
    pub fn read(region: &[u8]) -> Result<Self> {
        let table = MetadataTable::parse(region)?;

        for entry in &table.entries {
            if entry.is_required() && entry.well_known_name().is_none() {
                return Err(Error::format(format!(
                    "unknown required metadata item {}",
                    entry.item_id
                )));
            }
        }

        let file_parameters = FileParameters::parse(required_item(
            &table,
            region,
            &FILE_PARAMETERS_GUID,
            FileParameters::SIZE,
        )?)?;
        let disk_size = le_u64(
            required_item(&table, region, &VIRTUAL_DISK_SIZE_GUID, 8)?,
            0,
        );
        let logical_sector_size = le_u32(
            required_item(&table, region, &LOGICAL_SECTOR_SIZE_GUID, 4)?,
            0,
        );
        let physical_sector_size = match item(&table, region, &PHYSICAL_SECTOR_SIZE_GUID, 4)? {
            Some(data) => le_u32(data, 0),
            None => logical_sector_size,
        };
        let page83_data = match item(&table, region, &PAGE83_DATA_GUID, 16)? {
            Some(data) => le_guid(data, 0),
            None => Uuid::nil(),
        };
        let parent_locator = match item(&table, region, &PARENT_LOCATOR_GUID, 0)? {
            Some(data) => Some(ParentLocator::parse(data)?),
            None => None,
        };

        let metadata = Self {
            table,
            file_parameters,
            disk_size,
            page83_data,
            logical_sector_size,
            physical_sector_size,
            parent_locator,
        };
        metadata.validate()?;
        Ok(metadata)
    }

    fn validate(&self) -> Result<()> {
        let block_size = self.file_parameters.block_size as u64;
        if !block_size.is_power_of_two() || !(MIB..=256 * MIB).contains(&block_size) {
            return Err(Error::format(format!("invalid block size {}", block_size)));
        }
        if self.logical_sector_size != 512 && self.logical_sector_size != 4096 {
            return Err(Error::format(format!(
                "invalid logical sector size {}",
                self.logical_sector_size
            )));
        }
        if self.file_parameters.has_parent && self.parent_locator.is_none() {
            return Err(Error::format("differencing disk without a parent locator"));
        }
        Ok(())
    }

    /// Blocks per chunk: the number of payload blocks sharing one sector bitmap block.
    pub fn chunk_ratio(&self) -> u64 {
        chunk_ratio(
            self.logical_sector_size,
            self.file_parameters.block_size as u64,
        )
    }

    /// Builds a metadata region image of `region_length` bytes holding the
    /// standard items, laid out from 64 KiB onwards.
    pub fn initialize(
        region_length: usize,
        file_parameters: FileParameters,
        disk_size: u64,
        logical_sector_size: u32,
        physical_sector_size: u32,
        parent_locator: Option<&ParentLocator>,
    ) -> Result<Vec<u8>> {
        let required_vd = METADATA_FLAG_REQUIRED | METADATA_FLAG_VIRTUAL_DISK;
        let mut items: Vec<(Uuid, u32, Vec<u8>)> = vec![
            (
                FILE_PARAMETERS_GUID,
                METADATA_FLAG_REQUIRED,
                file_parameters.to_bytes(),
            ),
            (
                VIRTUAL_DISK_SIZE_GUID,
                required_vd,
                disk_size.to_le_bytes().to_vec(),
            ),
            (
                PAGE83_DATA_GUID,
                required_vd,
                Uuid::new_v4().to_bytes_le().to_vec(),
            ),
            (
                LOGICAL_SECTOR_SIZE_GUID,
                required_vd,
                logical_sector_size.to_le_bytes().to_vec(),
            ),
            (
                PHYSICAL_SECTOR_SIZE_GUID,
                required_vd,
                physical_sector_size.to_le_bytes().to_vec(),
            ),
        ];
        if let Some(locator) = parent_locator {
            items.push((PARENT_LOCATOR_GUID, METADATA_FLAG_REQUIRED, locator.to_bytes()));
        }

        let mut region = vec![0u8; region_length];
        let mut table = MetadataTable::default();
        let mut data_offset = METADATA_TABLE_SIZE;

        for (item_id, flags, data) in items {
            let end = data_offset + data.len();
            if end > region_length {
                return Err(Error::invalid_argument(format!(
                    "metadata items need {} bytes, region holds {}",
                    end, region_length
                )));
            }
            region[data_offset..end].copy_from_slice(&data);
            table.entries.push(MetadataEntry::new(
                item_id,
                data_offset as u32,
                data.len() as u32,
                flags,
            ));
            data_offset = end;
        }

        region[..METADATA_TABLE_SIZE].copy_from_slice(&table.to_bytes());
        Ok(region)
    }
}

/// Blocks per chunk for a geometry.
pub fn chunk_ratio(logical_sector_size: u32, block_size: u64) -> u64 {
    (super::SECTORS_PER_CHUNK * logical_sector_size as u64) / block_size
}

fn item<'a>(
    table: &MetadataTable,
    region: &'a [u8],
    item_id: &Uuid,
    min_length: usize,
) -> Result<Option<&'a [u8]>> {
    let Some(entry) = table.find(item_id) else {
        return Ok(None);
    };

    let start = entry.offset as usize;
    let end = start + entry.length as usize;
    if end > region.len() || (entry.length as usize) < min_length {
        return Err(Error::format(format!(
            "metadata item {} at {}+{} is out of bounds",
            item_id, entry.offset, entry.length
        )));
    }
    Ok(Some(&region[start..end]))
}

fn required_item<'a>(
    table: &MetadataTable,
    region: &'a [u8],
    item_id: &Uuid,
    min_length: usize,
) -> Result<&'a [u8]> {
    item(table, region, item_id, min_length)?
        .ok_or_else(|| Error::format(format!("missing metadata item {}", item_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(has_parent: bool) -> FileParameters {
        FileParameters {
            block_size: 32 * MIB as u32,
            leave_blocks_allocated: false,
            has_parent,
        }
    }

    #[test]
    fn test_signature_spells_metadata() {
        assert_eq!(&METADATA_SIGNATURE.to_le_bytes(), b"metadata");
    }

    #[test]
    fn test_initialize_then_read() {
        let region =
            Metadata::initialize(MIB as usize, params(false), 64 * MIB, 512, 4096, None).unwrap();
        let metadata = Metadata::read(&region).unwrap();

        assert_eq!(metadata.file_parameters, params(false));
        assert_eq!(metadata.disk_size, 64 * MIB);
        assert_eq!(metadata.logical_sector_size, 512);
        assert_eq!(metadata.physical_sector_size, 4096);
        assert!(metadata.parent_locator.is_none());
        assert_eq!(metadata.chunk_ratio(), 128);
        assert_eq!(metadata.table.entries.len(), 5);
        assert_eq!(metadata.table.entries[0].offset, 64 * 1024);
    }

    #[test]
    fn test_parent_locator_entries() {
        let locator = ParentLocator::new(vec![
            ("parent_linkage".into(), "{1234}".into()),
            ("relative_path".into(), ".\\base.vhdx".into()),
        ]);
        let bytes = locator.to_bytes();
        let parsed = ParentLocator::parse(&bytes).unwrap();
        assert_eq!(parsed, locator);
        assert_eq!(parsed.get("relative_path"), Some(".\\base.vhdx"));
        assert_eq!(parsed.get("volume_path"), None);

        let region = Metadata::initialize(
            MIB as usize,
            params(true),
            64 * MIB,
            512,
            4096,
            Some(&locator),
        )
        .unwrap();
        let metadata = Metadata::read(&region).unwrap();
        assert_eq!(metadata.parent_locator, Some(locator));
    }

    #[test]
    fn test_differencing_without_locator_rejected() {
        let region =
            Metadata::initialize(MIB as usize, params(true), 64 * MIB, 512, 4096, None).unwrap();
        assert!(matches!(
            Metadata::read(&region),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn test_unknown_required_item_rejected() {
        let mut region =
            Metadata::initialize(MIB as usize, params(false), 64 * MIB, 512, 4096, None).unwrap();
        let mut table = MetadataTable::parse(&region).unwrap();
        table.entries.push(MetadataEntry::new(
            Uuid::new_v4(),
            0x20000,
            4,
            METADATA_FLAG_REQUIRED,
        ));
        region[..METADATA_TABLE_SIZE].copy_from_slice(&table.to_bytes());

        let err = Metadata::read(&region).unwrap_err();
        assert!(err.to_string().contains("unknown required metadata item"));
    }

    #[test]
    fn test_missing_item_rejected() {
        let table = MetadataTable::default();
        let mut region = vec![0u8; MIB as usize];
        region[..METADATA_TABLE_SIZE].copy_from_slice(&table.to_bytes());
        assert!(Metadata::read(&region).is_err());
    }

    #[test]
    fn test_well_known_names() {
        let entry = MetadataEntry::new(LOGICAL_SECTOR_SIZE_GUID, 0, 4, 0);
        assert_eq!(entry.well_known_name(), Some("Logical Sector Size"));
        let user = MetadataEntry::new(LOGICAL_SECTOR_SIZE_GUID, 0, 4, METADATA_FLAG_USER);
        assert_eq!(user.well_known_name(), None);
    }
}
