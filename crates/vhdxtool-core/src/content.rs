//! The logical content of a VHDX disk, mapped through the BAT.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::chunk::{BatRegion, Chunk, ChunkGeometry};
use crate::disk::{clamp_read, ParentDisk, VirtualDisk};
use crate::error::{Error, Result};
use crate::extent::{self, Extent};
use crate::format::PayloadBlockStatus;
use crate::free_space::FreeSpaceTable;
use crate::store::BackingStore;

/// Logical disk stream of a dynamic or differencing VHDX.
///
/// Each block is served according to its BAT state:
/// - `FullyPresent`: from the block's storage in this file.
/// - `PartiallyPresent`: per run of the sector bitmap, from this file or the parent.
/// - `NotPresent`: from the parent.
/// - anything else: zeros.
///
/// Writes allocate block storage on first touch. Chunks are cached by index
/// in an unbounded map and never evicted.
pub struct ContentStream<S> {
    store: S,
    free_space: FreeSpaceTable,
    geometry: ChunkGeometry,
    bat: BatRegion,
    capacity: u64,
    chunks: HashMap<u64, Chunk>,
    parent: ParentDisk,
    writable: bool,
}

impl<S: BackingStore> ContentStream<S> {
    pub fn new(
        store: S,
        free_space: FreeSpaceTable,
        geometry: ChunkGeometry,
        bat: BatRegion,
        capacity: u64,
        parent: ParentDisk,
        writable: bool,
    ) -> Self {
        Self {
            store,
            free_space,
            geometry,
            bat,
            capacity,
            chunks: HashMap::new(),
            parent,
            writable,
        }
    }

    pub fn logical_sector_size(&self) -> u32 {
        self.geometry.logical_sector_size
    }

    pub fn block_size(&self) -> u64 {
        self.geometry.block_size
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn free_space(&self) -> &FreeSpaceTable {
        &self.free_space
    }

    /// Number of chunks currently cached.
    pub fn cached_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()?;
        Ok(())
    }

    fn check_alignment(&self, offset: u64, length: usize) -> Result<()> {
        let sector_size = self.geometry.logical_sector_size;
        if offset % sector_size as u64 != 0 || length as u64 % sector_size as u64 != 0 {
            return Err(Error::Misaligned {
                offset,
                length: length as u64,
                sector_size,
            });
        }
        Ok(())
    }

    fn read_content(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let total = clamp_read(offset, buf.len(), self.capacity)?;
        if total == 0 {
            return Ok(0);
        }
        self.check_alignment(offset, buf.len())?;

        let sector_size = self.geometry.logical_sector_size as u64;
        let mut done = 0usize;
        while done < total {
            let pos = offset + done as u64;
            let loc = self.geometry.locate(pos);
            let block_offset = loc.sector * sector_size;
            let block_remaining = self.geometry.block_size - block_offset;
            let remaining = (total - done) as u64;

            let chunk = chunk_at(
                &mut self.chunks,
                &mut self.store,
                self.bat,
                self.geometry,
                loc.chunk,
            )?;

            let n = match chunk.block_status(loc.block) {
                PayloadBlockStatus::FullyPresent => {
                    let n = block_remaining.min(remaining) as usize;
                    let position = chunk.block_position(loc.block) + block_offset;
                    self.store.read_exact_at(position, &mut buf[done..done + n])?;
                    n
                }
                PayloadBlockStatus::PartiallyPresent => {
                    let position = chunk.block_position(loc.block) + block_offset;
                    let (sectors, present) = chunk
                        .block_bitmap(&mut self.store, loc.block)?
                        .contiguous_sectors(loc.sector);
                    let n = (sectors * sector_size).min(remaining) as usize;
                    if present {
                        self.store.read_exact_at(position, &mut buf[done..done + n])?;
                    } else {
                        self.parent.read_filled(pos, &mut buf[done..done + n])?;
                    }
                    n
                }
                PayloadBlockStatus::NotPresent => {
                    let n = block_remaining.min(remaining) as usize;
                    self.parent.read_filled(pos, &mut buf[done..done + n])?;
                    n
                }
                _ => {
                    let n = block_remaining.min(remaining) as usize;
                    buf[done..done + n].fill(0);
                    n
                }
            };
            done += n;
        }
        Ok(total)
    }

    /// Writes `data` at `offset`, allocating block storage as needed.
    ///
    /// `offset` and `data.len()` must be multiples of the logical sector size.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.check_alignment(offset, data.len())?;
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > self.capacity) {
            return Err(Error::OutOfRange {
                offset,
                length: data.len() as u64,
                capacity: self.capacity,
            });
        }

        let sector_size = self.geometry.logical_sector_size as u64;
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let loc = self.geometry.locate(pos);
            let block_offset = loc.sector * sector_size;
            let block_remaining = self.geometry.block_size - block_offset;

            let chunk = chunk_at(
                &mut self.chunks,
                &mut self.store,
                self.bat,
                self.geometry,
                loc.chunk,
            )?;

            let mut status = chunk.block_status(loc.block);
            if !status.is_stored() {
                status =
                    chunk.allocate_space_for_block(&mut self.store, &mut self.free_space, loc.block)?;
            }

            let n = block_remaining.min((data.len() - done) as u64) as usize;
            let position = chunk.block_position(loc.block) + block_offset;
            self.store.write_all_at(position, &data[done..done + n])?;

            if status == PayloadBlockStatus::PartiallyPresent {
                let changed = chunk
                    .block_bitmap(&mut self.store, loc.block)?
                    .mark_sectors_present(loc.sector, n as u64 / sector_size);
                if changed {
                    chunk.write_block_bitmap(&mut self.store, loc.block)?;
                }
            }
            done += n;
        }
        Ok(())
    }

    /// Whole blocks of `[start, end)`'s chunks that reference storage in this file.
    fn stored_extents(&mut self, start: u64, end: u64) -> Result<Vec<Extent>> {
        let chunk_size = self.geometry.chunk_size();
        let block_size = self.geometry.block_size;
        let mut extents = Vec::new();

        let mut pos = start - start % chunk_size;
        while pos < end {
            let chunk = chunk_at(
                &mut self.chunks,
                &mut self.store,
                self.bat,
                self.geometry,
                pos / chunk_size,
            )?;
            extents.extend(
                chunk
                    .stored_blocks()
                    .map(|block| Extent::new(pos + block * block_size, block_size)),
            );
            pos += chunk_size;
        }
        Ok(extents)
    }
}

impl<S: BackingStore> VirtualDisk for ContentStream<S> {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.read_content(offset, buf)
    }

    fn extents_in_range(&mut self, start: u64, length: u64) -> Result<Vec<Extent>> {
        let end = start.saturating_add(length).min(self.capacity);
        if start >= end {
            return Ok(Vec::new());
        }
        let range = Extent::new(start, end - start);
        let own = self.stored_extents(start, end)?;
        let parent = self.parent.extents_in_range(start, range.length)?;
        Ok(extent::intersect(&extent::union(&own, &parent), range))
    }
}

impl<S> std::fmt::Debug for ContentStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStream")
            .field("geometry", &self.geometry)
            .field("bat", &self.bat)
            .field("capacity", &self.capacity)
            .field("cached_chunks", &self.chunks.len())
            .field("writable", &self.writable)
            .finish()
    }
}

/// Returns the cached chunk `index`, loading it on first access.
fn chunk_at<'c, S: BackingStore + ?Sized>(
    chunks: &'c mut HashMap<u64, Chunk>,
    store: &mut S,
    bat: BatRegion,
    geometry: ChunkGeometry,
    index: u64,
) -> Result<&'c mut Chunk> {
    match chunks.entry(index) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => Ok(entry.insert(Chunk::load(store, bat, geometry, index)?)),
    }
}
