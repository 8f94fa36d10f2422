//! Per-sector presence bits for one payload block of a differencing disk.

/// A view over the slice of a sector bitmap block that belongs to one payload block.
///
/// Bit `n` (LSB-first within each byte) is set when sector `n` of the block
/// is stored in this file, clear when it falls through to the parent.
#[derive(Debug)]
pub struct BlockBitmap<'a> {
    data: &'a mut [u8],
}

impl<'a> BlockBitmap<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Number of sectors tracked.
    pub fn sector_count(&self) -> u64 {
        self.data.len() as u64 * 8
    }

    pub fn is_present(&self, sector: u64) -> bool {
        let byte = self.data[(sector / 8) as usize];
        byte & (1 << (sector % 8)) != 0
    }

    /// Length of the run of sectors starting at `first` that share its
    /// presence bit, together with that bit.
    pub fn contiguous_sectors(&self, first: u64) -> (u64, bool) {
        let total = self.sector_count();
        let state = self.is_present(first);
        let full = if state { 0xFF } else { 0x00 };

        let mut sector = first;
        while sector < total {
            if sector % 8 == 0 && self.data[(sector / 8) as usize] == full {
                sector += 8;
            } else if self.is_present(sector) == state {
                sector += 1;
            } else {
                break;
            }
        }
        (sector - first, state)
    }

    /// Sets the bits of `count` sectors from `first`. Returns true if any bit changed.
    pub fn mark_sectors_present(&mut self, first: u64, count: u64) -> bool {
        let end = first + count;
        let mut changed = false;

        let mut sector = first;
        while sector < end {
            let index = (sector / 8) as usize;
            if sector % 8 == 0 && end - sector >= 8 {
                changed |= self.data[index] != 0xFF;
                self.data[index] = 0xFF;
                sector += 8;
            } else {
                let mask = 1u8 << (sector % 8);
                changed |= self.data[index] & mask == 0;
                self.data[index] |= mask;
                sector += 1;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_absent_run() {
        let mut data = [0u8; 4];
        data[2] = 0b0000_0100;
        let bitmap = BlockBitmap::new(&mut data);
        assert_eq!(bitmap.contiguous_sectors(0), (18, false));
        assert_eq!(bitmap.contiguous_sectors(18), (1, true));
        assert_eq!(bitmap.contiguous_sectors(19), (13, false));
    }

    #[test]
    fn test_contiguous_present_run_stops_at_end() {
        let mut data = [0xFFu8; 2];
        let bitmap = BlockBitmap::new(&mut data);
        assert_eq!(bitmap.contiguous_sectors(3), (13, true));
    }

    #[test]
    fn test_mark_reports_change_once() {
        let mut data = [0u8; 4];
        let mut bitmap = BlockBitmap::new(&mut data);
        assert!(bitmap.mark_sectors_present(3, 14));
        assert!(!bitmap.mark_sectors_present(3, 14));
        assert!(!bitmap.mark_sectors_present(8, 8));
        assert_eq!(bitmap.contiguous_sectors(3), (14, true));
        assert_eq!(bitmap.contiguous_sectors(0), (3, false));
        assert_eq!(data, [0b1111_1000, 0xFF, 0b0000_0001, 0]);
    }

    #[test]
    fn test_mark_whole_bytes() {
        let mut data = [0u8; 3];
        let mut bitmap = BlockBitmap::new(&mut data);
        assert!(bitmap.mark_sectors_present(8, 16));
        assert_eq!(data, [0, 0xFF, 0xFF]);
    }
}
