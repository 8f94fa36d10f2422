//! Positional byte I/O over the file that holds a VHDX image.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// A seekable, resizable byte store backing a VHDX file.
///
/// All offsets are absolute. Reads that run past the end of the store fail
/// with [`io::ErrorKind::UnexpectedEof`]; writes past the end grow it.
pub trait BackingStore {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    fn len(&mut self) -> io::Result<u64>;

    fn set_len(&mut self, len: u64) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Writes `length` zero bytes at `offset` in bounded pieces.
    fn write_zeros_at(&mut self, offset: u64, length: u64) -> io::Result<()> {
        const ZERO_CHUNK: usize = 64 * 1024;
        let zeros = [0u8; ZERO_CHUNK];
        let mut done = 0u64;
        while done < length {
            let n = std::cmp::min(length - done, ZERO_CHUNK as u64) as usize;
            self.write_all_at(offset + done, &zeros[..n])?;
            done += n as u64;
        }
        Ok(())
    }
}

fn seek_read<T: Read + Seek>(inner: &mut T, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    inner.seek(SeekFrom::Start(offset))?;
    inner.read_exact(buf)
}

fn seek_write<T: Write + Seek>(inner: &mut T, offset: u64, data: &[u8]) -> io::Result<()> {
    inner.seek(SeekFrom::Start(offset))?;
    inner.write_all(data)
}

impl BackingStore for File {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        seek_read(self, offset, buf)
    }

    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        seek_write(self, offset, data)
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }
}

impl BackingStore for Cursor<Vec<u8>> {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        seek_read(self, offset, buf)
    }

    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        seek_write(self, offset, data)
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length exceeds memory"))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: BackingStore + ?Sized> BackingStore for Box<S> {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_all_at(offset, data)
    }

    fn len(&mut self) -> io::Result<u64> {
        (**self).len()
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        (**self).set_len(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}
