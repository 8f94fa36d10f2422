//! The logical disk contract and the simple disks that can serve as parents.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::store::BackingStore;

/// A byte-addressed logical disk.
pub trait VirtualDisk {
    /// Size of the disk in bytes.
    fn capacity(&self) -> u64;

    /// Reads up to `buf.len()` bytes at `offset`, returning the number read.
    ///
    /// Reading at `capacity()` returns 0; reading past it is an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Byte ranges within `[start, start + length)` that hold stored data.
    fn extents_in_range(&mut self, start: u64, length: u64) -> Result<Vec<Extent>>;
}

/// Clamps a read of `len` bytes at `offset` to a disk of `capacity` bytes.
pub(crate) fn clamp_read(offset: u64, len: usize, capacity: u64) -> Result<usize> {
    if offset > capacity {
        return Err(Error::OutOfRange {
            offset,
            length: len as u64,
            capacity,
        });
    }
    Ok(std::cmp::min(len as u64, capacity - offset) as usize)
}

/// A disk of zeros. Stands in as the parent of a disk without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroDisk {
    capacity: u64,
}

impl ZeroDisk {
    pub fn new(capacity: u64) -> Self {
        Self { capacity }
    }
}

impl VirtualDisk for ZeroDisk {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let n = clamp_read(offset, buf.len(), self.capacity)?;
        buf[..n].fill(0);
        Ok(n)
    }

    fn extents_in_range(&mut self, _start: u64, _length: u64) -> Result<Vec<Extent>> {
        Ok(Vec::new())
    }
}

/// A raw image where every byte is stored.
pub struct FlatDisk<S> {
    store: S,
    capacity: u64,
}

impl<S: BackingStore> FlatDisk<S> {
    pub fn new(mut store: S) -> Result<Self> {
        let capacity = store.len()?;
        Ok(Self { store, capacity })
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S: BackingStore> VirtualDisk for FlatDisk<S> {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let n = clamp_read(offset, buf.len(), self.capacity)?;
        self.store.read_exact_at(offset, &mut buf[..n])?;
        Ok(n)
    }

    fn extents_in_range(&mut self, start: u64, length: u64) -> Result<Vec<Extent>> {
        let end = std::cmp::min(start.saturating_add(length), self.capacity);
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(vec![Extent::new(start, end - start)])
    }
}

/// The parent of a differencing disk, with explicit ownership.
pub enum ParentDisk {
    /// Dropped together with the child.
    Owned(Box<dyn VirtualDisk>),
    /// Borrowed; several children may share it.
    Shared(Rc<RefCell<dyn VirtualDisk>>),
}

impl ParentDisk {
    pub fn owned(disk: impl VirtualDisk + 'static) -> Self {
        Self::Owned(Box::new(disk))
    }

    pub fn capacity(&self) -> u64 {
        match self {
            Self::Owned(disk) => disk.capacity(),
            Self::Shared(disk) => disk.borrow().capacity(),
        }
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Owned(disk) => disk.read_at(offset, buf),
            Self::Shared(disk) => disk.borrow_mut().read_at(offset, buf),
        }
    }

    /// Fills `buf` from the parent; bytes beyond the parent's end read as zeros.
    pub fn read_filled(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let capacity = self.capacity();
        let mut done = 0;
        if offset < capacity {
            while done < buf.len() {
                let n = self.read_at(offset + done as u64, &mut buf[done..])?;
                if n == 0 {
                    break;
                }
                done += n;
            }
        }
        buf[done..].fill(0);
        Ok(())
    }

    pub fn extents_in_range(&mut self, start: u64, length: u64) -> Result<Vec<Extent>> {
        match self {
            Self::Owned(disk) => disk.extents_in_range(start, length),
            Self::Shared(disk) => disk.borrow_mut().extents_in_range(start, length),
        }
    }
}

impl std::fmt::Debug for ParentDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Owned(_) => "Owned",
            Self::Shared(_) => "Shared",
        };
        f.debug_struct("ParentDisk")
            .field("ownership", &kind)
            .field("capacity", &self.capacity())
            .finish()
    }
}
