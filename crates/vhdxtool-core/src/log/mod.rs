//! The VHDX metadata log.
//!
//! The log is a circular buffer of entries. Each entry carries descriptors
//! that rewrite parts of the file (headers excepted). After an unclean
//! shutdown the newest complete run of entries is found and replayed once,
//! at open, before any other access.

mod entry;
mod sequence;

pub use entry::{
    Descriptor, LogEntry, LogEntryBuilder, LogEntryHeader, DATA_DESCRIPTOR_SIGNATURE,
    DATA_SECTOR_SIGNATURE, LOG_ENTRY_SIGNATURE, ZERO_DESCRIPTOR_SIGNATURE,
};
pub use sequence::{find_active_sequence, LogSequence};

use std::io;

use crate::format::KIB;
use crate::store::BackingStore;

/// Log entries are aligned to and sized in 4 KiB sectors.
pub const LOG_SECTOR_SIZE: u64 = 4 * KIB;

/// The log's byte range in the file; positions within it wrap around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRegion {
    /// File offset of the log.
    pub offset: u64,
    /// Log length in bytes; a multiple of 1 MiB.
    pub length: u64,
}

impl LogRegion {
    /// Reads `buf.len()` bytes starting at log position `position`, wrapping at the end.
    pub fn read<S: BackingStore + ?Sized>(
        &self,
        store: &mut S,
        position: u64,
        buf: &mut [u8],
    ) -> io::Result<()> {
        self.for_each_piece(position, buf.len(), |file_offset, range| {
            store.read_exact_at(file_offset, &mut buf[range])
        })
    }

    /// Writes `data` starting at log position `position`, wrapping at the end.
    pub fn write<S: BackingStore + ?Sized>(
        &self,
        store: &mut S,
        position: u64,
        data: &[u8],
    ) -> io::Result<()> {
        self.for_each_piece(position, data.len(), |file_offset, range| {
            store.write_all_at(file_offset, &data[range])
        })
    }

    fn for_each_piece<F>(&self, position: u64, len: usize, mut f: F) -> io::Result<()>
    where
        F: FnMut(u64, std::ops::Range<usize>) -> io::Result<()>,
    {
        if self.length == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty log region"));
        }
        let mut done = 0usize;
        while done < len {
            let within = (position + done as u64) % self.length;
            let n = std::cmp::min((self.length - within) as usize, len - done);
            f(self.offset + within, done..done + n)?;
            done += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_region_wraps() {
        let log = LogRegion {
            offset: 100,
            length: 10,
        };
        let mut store = Cursor::new(vec![0u8; 120]);
        log.write(&mut store, 7, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(&store.get_ref()[100..110], &[4, 5, 0, 0, 0, 0, 0, 1, 2, 3]);

        let mut buf = [0u8; 5];
        log.read(&mut store, 17, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }
}
