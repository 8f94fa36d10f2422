//! BAT chunks: a run of payload block entries plus one sector bitmap entry.

use tracing::debug;

use crate::bitmap::BlockBitmap;
use crate::error::{Error, Result};
use crate::format::bat::BAT_ENTRY_SIZE;
use crate::format::{
    round_up, BatEntry, PayloadBlockStatus, MIB, SECTORS_PER_CHUNK, SECTOR_BITMAP_BLOCK_SIZE,
};
use crate::free_space::FreeSpaceTable;
use crate::store::BackingStore;

/// Addressing parameters shared by every chunk of a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    /// Payload block size in bytes.
    pub block_size: u64,
    /// Logical sector size in bytes (512 or 4096).
    pub logical_sector_size: u32,
    /// Whether the disk is differencing and so keeps sector bitmaps.
    pub has_parent: bool,
}

/// Position of a disk byte within the chunk/block/sector hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    /// Chunk index from the start of the disk.
    pub chunk: u64,
    /// Payload block index within the chunk.
    pub block: u64,
    /// Logical sector index within the block.
    pub sector: u64,
}

impl ChunkGeometry {
    /// Bytes of disk addressed by one chunk.
    pub fn chunk_size(&self) -> u64 {
        SECTORS_PER_CHUNK * self.logical_sector_size as u64
    }

    /// Payload blocks per chunk.
    pub fn chunk_ratio(&self) -> u64 {
        self.chunk_size() / self.block_size
    }

    /// Bytes of the sector bitmap block that belong to one payload block.
    pub fn bitmap_bytes_per_block(&self) -> u64 {
        SECTOR_BITMAP_BLOCK_SIZE / self.chunk_ratio()
    }

    /// Size of one chunk's slice of the BAT.
    pub fn bat_slice_len(&self) -> u64 {
        (self.chunk_ratio() + 1) * BAT_ENTRY_SIZE as u64
    }

    pub fn locate(&self, position: u64) -> BlockLocation {
        let chunk_size = self.chunk_size();
        let chunk_offset = position % chunk_size;
        let block_offset = chunk_offset % self.block_size;
        BlockLocation {
            chunk: position / chunk_size,
            block: chunk_offset / self.block_size,
            sector: block_offset / self.logical_sector_size as u64,
        }
    }
}

/// Location of the BAT within the (logical) file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatRegion {
    /// File offset of the first entry.
    pub offset: u64,
    /// Region length in bytes.
    pub length: u64,
}

/// Cached view of one chunk's BAT slice.
///
/// Mutations are written through to the BAT immediately. Two `Chunk`
/// values for the same index are not kept coherent.
#[derive(Debug)]
pub struct Chunk {
    index: u64,
    geometry: ChunkGeometry,
    bat: BatRegion,
    bat_data: Vec<u8>,
    sector_bitmap: Option<Vec<u8>>,
}

impl Chunk {
    /// Reads the chunk's BAT slice. Entries past the end of the BAT region read as zero.
    pub fn load<S: BackingStore + ?Sized>(
        store: &mut S,
        bat: BatRegion,
        geometry: ChunkGeometry,
        index: u64,
    ) -> Result<Self> {
        let slice_len = geometry.bat_slice_len();
        let slice_start = index * slice_len;
        let mut bat_data = vec![0u8; slice_len as usize];

        let in_region = bat.length.saturating_sub(slice_start).min(slice_len) as usize;
        if in_region > 0 {
            store.read_exact_at(bat.offset + slice_start, &mut bat_data[..in_region])?;
        }
        debug!(chunk = index, "loaded BAT chunk");

        Ok(Self {
            index,
            geometry,
            bat,
            bat_data,
            sector_bitmap: None,
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    fn entry(&self, slot: u64) -> BatEntry {
        BatEntry::read_from(&self.bat_data, slot as usize * BAT_ENTRY_SIZE)
    }

    fn set_entry(&mut self, slot: u64, entry: BatEntry) {
        entry.write_to(&mut self.bat_data, slot as usize * BAT_ENTRY_SIZE);
    }

    /// Whether `slot` of this chunk's slice lies inside the BAT region.
    fn slot_in_region(&self, slot: u64) -> bool {
        let end = self.index * self.geometry.bat_slice_len() + (slot + 1) * BAT_ENTRY_SIZE as u64;
        end <= self.bat.length
    }

    fn bitmap_entry(&self) -> BatEntry {
        self.entry(self.geometry.chunk_ratio())
    }

    pub fn has_sector_bitmap(&self) -> bool {
        self.bitmap_entry().bitmap_block_present()
    }

    pub fn sector_bitmap_position(&self) -> u64 {
        self.bitmap_entry().file_offset()
    }

    fn set_sector_bitmap_position(&mut self, position: u64) {
        let mut entry = BatEntry::default();
        entry.set_bitmap_block_present(position != 0);
        entry.set_file_offset_mb(position / MIB);
        self.set_entry(self.geometry.chunk_ratio(), entry);
    }

    /// File offset of the block's storage (0 when none is allocated).
    pub fn block_position(&self, block: u64) -> u64 {
        self.entry(block).file_offset()
    }

    pub fn block_status(&self, block: u64) -> PayloadBlockStatus {
        self.entry(block).payload_status()
    }

    /// The presence bitmap of `block`, loading the sector bitmap block on first use.
    pub fn block_bitmap<S: BackingStore + ?Sized>(
        &mut self,
        store: &mut S,
        block: u64,
    ) -> Result<BlockBitmap<'_>> {
        let per_block = self.geometry.bitmap_bytes_per_block() as usize;
        let start = per_block * block as usize;
        let data = self.load_sector_bitmap(store)?;
        Ok(BlockBitmap::new(&mut data[start..start + per_block]))
    }

    /// Writes the cached bitmap bytes of `block` back to the file.
    pub fn write_block_bitmap<S: BackingStore + ?Sized>(
        &self,
        store: &mut S,
        block: u64,
    ) -> Result<()> {
        let Some(bitmap) = self.sector_bitmap.as_ref() else {
            return Ok(());
        };
        let per_block = self.geometry.bitmap_bytes_per_block();
        let start = per_block * block;
        store.write_all_at(
            self.sector_bitmap_position() + start,
            &bitmap[start as usize..(start + per_block) as usize],
        )?;
        Ok(())
    }

    /// Ensures `block` has storage and a stored state, returning the new state.
    ///
    /// Blocks of a differencing disk become `PartiallyPresent` (allocating the
    /// chunk's sector bitmap block if needed); other blocks become `FullyPresent`.
    /// The BAT slice is written back only if an entry changed.
    pub fn allocate_space_for_block<S: BackingStore + ?Sized>(
        &mut self,
        store: &mut S,
        free_space: &mut FreeSpaceTable,
        block: u64,
    ) -> Result<PayloadBlockStatus> {
        let bitmap_slot = self.geometry.chunk_ratio();
        if !self.slot_in_region(block)
            || (self.geometry.has_parent && !self.slot_in_region(bitmap_slot))
        {
            return Err(Error::unsupported(format!(
                "BAT of {} bytes has no room for chunk {} block {}",
                self.bat.length, self.index, block
            )));
        }

        let mut modified = false;
        let mut entry = self.entry(block);

        if entry.file_offset_mb() == 0 {
            let position = allocate_space(store, free_space, self.geometry.block_size, false)?;
            entry.set_file_offset_mb(position / MIB);
            modified = true;
            debug!(chunk = self.index, block, position, "allocated payload block");
        }

        if !entry.payload_status().is_stored() {
            if self.geometry.has_parent {
                if !self.has_sector_bitmap() {
                    let position =
                        allocate_space(store, free_space, SECTOR_BITMAP_BLOCK_SIZE, true)?;
                    self.set_sector_bitmap_position(position);
                    self.sector_bitmap = None;
                    debug!(chunk = self.index, position, "allocated sector bitmap block");
                }
                entry.set_payload_status(PayloadBlockStatus::PartiallyPresent);
            } else {
                entry.set_payload_status(PayloadBlockStatus::FullyPresent);
            }
            modified = true;
        }

        if modified {
            self.set_entry(block, entry);
            self.write_bat(store)?;
        }
        Ok(entry.payload_status())
    }

    fn write_bat<S: BackingStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        let slice_start = self.index * self.geometry.bat_slice_len();
        let in_region = self
            .bat
            .length
            .saturating_sub(slice_start)
            .min(self.bat_data.len() as u64) as usize;
        if self.bat_data[in_region..].iter().any(|&b| b != 0) {
            return Err(Error::corrupt(format!(
                "chunk {} has BAT entries past the end of the BAT region",
                self.index
            )));
        }
        if in_region > 0 {
            store.write_all_at(self.bat.offset + slice_start, &self.bat_data[..in_region])?;
        }
        Ok(())
    }

    fn load_sector_bitmap<S: BackingStore + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> Result<&mut Vec<u8>> {
        if self.sector_bitmap.is_none() {
            let position = self.sector_bitmap_position();
            if position == 0 {
                return Err(Error::corrupt(format!(
                    "chunk {} has partially present blocks but no sector bitmap",
                    self.index
                )));
            }
            let mut data = vec![0u8; SECTOR_BITMAP_BLOCK_SIZE as usize];
            store.read_exact_at(position, &mut data)?;
            self.sector_bitmap = Some(data);
        }
        match self.sector_bitmap.as_mut() {
            Some(data) => Ok(data),
            None => Err(Error::corrupt("sector bitmap not loaded")),
        }
    }

    /// Indices of blocks in this chunk that reference file storage.
    pub fn stored_blocks(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.geometry.chunk_ratio())
            .filter(move |&block| self.block_status(block).is_stored())
    }
}

/// Finds `size` bytes of file space, extending the file when the free list has none.
fn allocate_space<S: BackingStore + ?Sized>(
    store: &mut S,
    free_space: &mut FreeSpaceTable,
    size: u64,
    zero: bool,
) -> Result<u64> {
    match free_space.try_allocate(size)? {
        Some(position) => {
            if zero {
                store.write_zeros_at(position, size)?;
            }
            Ok(position)
        }
        None => {
            let position = round_up(store.len()?, MIB);
            store.set_len(position + size)?;
            free_space.extend_to(position + size, false)?;
            debug!(position, size, "extended file");
            Ok(position)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const BAT_OFFSET: u64 = 3 * MIB;

    fn geometry(has_parent: bool) -> ChunkGeometry {
        ChunkGeometry {
            block_size: 32 * MIB,
            logical_sector_size: 512,
            has_parent,
        }
    }

    fn setup(size: u64) -> (Cursor<Vec<u8>>, FreeSpaceTable) {
        let store = Cursor::new(vec![0u8; size as usize]);
        let mut free = FreeSpaceTable::new(size);
        free.reserve(0, size).unwrap();
        (store, free)
    }

    fn bat() -> BatRegion {
        BatRegion {
            offset: BAT_OFFSET,
            length: MIB,
        }
    }

    #[test]
    fn test_geometry() {
        let g = geometry(false);
        assert_eq!(g.chunk_size(), 4 * 1024 * MIB);
        assert_eq!(g.chunk_ratio(), 128);
        assert_eq!(g.bitmap_bytes_per_block(), 8192);
        assert_eq!(g.bat_slice_len(), 129 * 8);

        let loc = g.locate(4 * 1024 * MIB + 33 * MIB + 1024);
        assert_eq!(
            loc,
            BlockLocation {
                chunk: 1,
                block: 1,
                sector: 2 * 1024 + 2
            }
        );
    }

    #[test]
    fn test_allocate_dynamic_block_extends_file() {
        let (mut store, mut free) = setup(4 * MIB);
        let mut chunk = Chunk::load(&mut store, bat(), geometry(false), 0).unwrap();
        assert_eq!(chunk.block_status(5), PayloadBlockStatus::NotPresent);

        let status = chunk
            .allocate_space_for_block(&mut store, &mut free, 5)
            .unwrap();
        assert_eq!(status, PayloadBlockStatus::FullyPresent);
        assert_eq!(chunk.block_position(5), 4 * MIB);
        assert_eq!(store.get_ref().len() as u64, 36 * MIB);
        assert!(!chunk.has_sector_bitmap());

        let reloaded = Chunk::load(&mut store, bat(), geometry(false), 0).unwrap();
        assert_eq!(reloaded.block_status(5), PayloadBlockStatus::FullyPresent);
        assert_eq!(reloaded.block_position(5), 4 * MIB);
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let (mut store, mut free) = setup(4 * MIB);
        let mut chunk = Chunk::load(&mut store, bat(), geometry(false), 0).unwrap();
        chunk.allocate_space_for_block(&mut store, &mut free, 0).unwrap();
        let len = store.get_ref().len();
        let bat_bytes = store.get_ref()[BAT_OFFSET as usize..(BAT_OFFSET + MIB) as usize].to_vec();

        chunk.allocate_space_for_block(&mut store, &mut free, 0).unwrap();
        assert_eq!(store.get_ref().len(), len);
        assert_eq!(
            &store.get_ref()[BAT_OFFSET as usize..(BAT_OFFSET + MIB) as usize],
            &bat_bytes[..]
        );
    }

    #[test]
    fn test_allocate_differencing_block_uses_free_space() {
        let (mut store, mut free) = setup(4 * MIB);
        store.get_mut().resize(40 * MIB as usize, 0xEE);
        free.extend_to(40 * MIB, true).unwrap();

        let mut chunk = Chunk::load(&mut store, bat(), geometry(true), 0).unwrap();
        let status = chunk
            .allocate_space_for_block(&mut store, &mut free, 2)
            .unwrap();
        assert_eq!(status, PayloadBlockStatus::PartiallyPresent);
        assert_eq!(chunk.block_position(2), 4 * MIB);
        assert!(chunk.has_sector_bitmap());
        assert_eq!(chunk.sector_bitmap_position(), 36 * MIB);

        // Bitmap space reused from the free list is cleared.
        let bitmap_start = 36 * MIB as usize;
        assert!(store.get_ref()[bitmap_start..bitmap_start + MIB as usize]
            .iter()
            .all(|&b| b == 0));

        let mut bitmap = chunk.block_bitmap(&mut store, 2).unwrap();
        assert_eq!(bitmap.contiguous_sectors(0), (65536, false));
        assert!(bitmap.mark_sectors_present(0, 8));
        chunk.write_block_bitmap(&mut store, 2).unwrap();
        assert_eq!(store.get_ref()[bitmap_start + 2 * 8192], 0xFF);
    }

    #[test]
    fn test_slice_past_bat_end_reads_zero() {
        let (mut store, _) = setup(4 * MIB);
        let short = BatRegion {
            offset: BAT_OFFSET,
            length: 100 * 8,
        };
        store.get_mut()[BAT_OFFSET as usize..BAT_OFFSET as usize + 8]
            .copy_from_slice(&BatEntry::new(6, 9).raw().to_le_bytes());
        let chunk = Chunk::load(&mut store, short, geometry(false), 0).unwrap();
        assert_eq!(chunk.block_position(0), 9 * MIB);
        assert_eq!(chunk.block_status(120), PayloadBlockStatus::NotPresent);
    }

    #[test]
    fn test_allocate_past_bat_end_is_unsupported() {
        let (mut store, mut free) = setup(4 * MIB);
        // Room for the payload entries of chunk 0 but not its bitmap entry.
        let short = BatRegion {
            offset: BAT_OFFSET,
            length: 128 * 8,
        };

        let mut chunk = Chunk::load(&mut store, short, geometry(true), 0).unwrap();
        let err = chunk
            .allocate_space_for_block(&mut store, &mut free, 3)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedLayout { .. }), "{err}");
        assert_eq!(chunk.block_status(3), PayloadBlockStatus::NotPresent);
        assert_eq!(store.get_ref().len() as u64, 4 * MIB);

        // The same BAT is enough for a dynamic disk.
        let mut chunk = Chunk::load(&mut store, short, geometry(false), 0).unwrap();
        let status = chunk
            .allocate_space_for_block(&mut store, &mut free, 3)
            .unwrap();
        assert_eq!(status, PayloadBlockStatus::FullyPresent);
    }
}
