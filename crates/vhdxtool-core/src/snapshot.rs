//! In-memory copy-on-write overlay used to replay a log without touching the file.

use std::collections::BTreeMap;
use std::io;

use crate::store::BackingStore;

const PAGE_SIZE: u64 = 4096;

/// Copy-on-write page overlay over a backing store.
///
/// Reads consult the overlay first and fall back to the inner store. Writes
/// land only in the overlay, so the inner store is never modified.
pub struct SnapshotOverlay<S> {
    inner: S,
    pages: BTreeMap<u64, Box<[u8]>>,
    inner_len: u64,
    len: u64,
}

impl<S: BackingStore> SnapshotOverlay<S> {
    pub fn new(mut inner: S) -> io::Result<Self> {
        let inner_len = inner.len()?;
        Ok(Self {
            inner,
            pages: BTreeMap::new(),
            inner_len,
            len: inner_len,
        })
    }

    /// Number of pages that diverge from the inner store.
    #[cfg(test)]
    fn dirty_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Reads a page as the inner store currently holds it, zero-filling past its end.
    fn load_page(&mut self, index: u64) -> io::Result<Box<[u8]>> {
        let mut page = vec![0u8; PAGE_SIZE as usize].into_boxed_slice();
        let start = index * PAGE_SIZE;
        if start < self.inner_len {
            let avail = std::cmp::min(PAGE_SIZE, self.inner_len - start) as usize;
            self.inner.read_exact_at(start, &mut page[..avail])?;
        }
        Ok(page)
    }
}

impl<S: BackingStore> BackingStore for SnapshotOverlay<S> {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        if end > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of snapshot",
            ));
        }

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let index = pos / PAGE_SIZE;
            let within = (pos % PAGE_SIZE) as usize;
            let n = std::cmp::min(PAGE_SIZE as usize - within, buf.len() - done);

            match self.pages.get(&index) {
                Some(page) => buf[done..done + n].copy_from_slice(&page[within..within + n]),
                None if pos >= self.inner_len => buf[done..done + n].fill(0),
                None => {
                    let avail = std::cmp::min(n as u64, self.inner_len - pos) as usize;
                    self.inner.read_exact_at(pos, &mut buf[done..done + avail])?;
                    buf[done + avail..done + n].fill(0);
                }
            }
            done += n;
        }
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let index = pos / PAGE_SIZE;
            let within = (pos % PAGE_SIZE) as usize;
            let n = std::cmp::min(PAGE_SIZE as usize - within, data.len() - done);

            if !self.pages.contains_key(&index) {
                let page = self.load_page(index)?;
                self.pages.insert(index, page);
            }
            if let Some(page) = self.pages.get_mut(&index) {
                page[within..within + n].copy_from_slice(&data[done..done + n]);
            }
            done += n;
        }

        self.len = std::cmp::max(self.len, offset + data.len() as u64);
        Ok(())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.len)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        if len < self.len {
            // Drop whole pages past the new end and clear the tail of the last one.
            let first_dead = len.div_ceil(PAGE_SIZE);
            self.pages.split_off(&first_dead);
            if len % PAGE_SIZE != 0 {
                let index = len / PAGE_SIZE;
                if !self.pages.contains_key(&index) {
                    let page = self.load_page(index)?;
                    self.pages.insert(index, page);
                }
                if let Some(page) = self.pages.get_mut(&index) {
                    page[(len % PAGE_SIZE) as usize..].fill(0);
                }
            }
            self.inner_len = std::cmp::min(self.inner_len, len);
        }
        self.len = len;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The store all structures are read through once any log has been replayed.
///
/// A writable file is replayed in place and used directly; a read-only file
/// is replayed into a [`SnapshotOverlay`] so the file itself stays untouched.
pub enum LogicalStore<S> {
    Direct(S),
    Overlay(SnapshotOverlay<S>),
}

impl<S: BackingStore> LogicalStore<S> {
    pub fn is_overlay(&self) -> bool {
        matches!(self, Self::Overlay(_))
    }

    /// The underlying file, dropping any overlay pages.
    pub fn into_inner(self) -> S {
        match self {
            Self::Direct(store) => store,
            Self::Overlay(overlay) => overlay.into_inner(),
        }
    }
}

impl<S: BackingStore> BackingStore for LogicalStore<S> {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        match self {
            Self::Direct(store) => store.read_exact_at(offset, buf),
            Self::Overlay(overlay) => overlay.read_exact_at(offset, buf),
        }
    }

    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Direct(store) => store.write_all_at(offset, data),
            Self::Overlay(overlay) => overlay.write_all_at(offset, data),
        }
    }

    fn len(&mut self) -> io::Result<u64> {
        match self {
            Self::Direct(store) => store.len(),
            Self::Overlay(overlay) => overlay.len(),
        }
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        match self {
            Self::Direct(store) => store.set_len(len),
            Self::Overlay(overlay) => overlay.set_len(len),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Direct(store) => store.flush(),
            Self::Overlay(overlay) => overlay.flush(),
        }
    }
}
