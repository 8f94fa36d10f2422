//! Free-space tracking for the backing file.

use crate::error::{Error, Result};
use crate::extent::{self, Extent};
use crate::format::MIB;

/// Unallocated byte ranges of the backing file, at 1 MiB granularity.
///
/// Invariants:
/// - Free extents are sorted, disjoint and non-adjacent.
/// - Every extent lies inside `[0, file_size)`.
/// - Every boundary is a multiple of 1 MiB, except that an extent may end at
///   a `file_size` that is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSpaceTable {
    free: Vec<Extent>,
    file_size: u64,
}

impl FreeSpaceTable {
    /// A table where all of `[0, file_size)` is free.
    pub fn new(file_size: u64) -> Self {
        Self {
            free: extent::normalize(vec![Extent::new(0, file_size)]),
            file_size,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn free_extents(&self) -> &[Extent] {
        &self.free
    }

    /// Marks `[start, start + length)` as in use.
    pub fn reserve(&mut self, start: u64, length: u64) -> Result<()> {
        self.validate_range(start, length)?;
        self.free = extent::subtract(&self.free, &[Extent::new(start, length)]);
        Ok(())
    }

    /// Marks `[start, start + length)` as free again.
    pub fn release(&mut self, start: u64, length: u64) -> Result<()> {
        self.validate_range(start, length)?;
        let end = std::cmp::min(start + length, self.file_size);
        if start < end {
            self.free = extent::union(&self.free, &[Extent::new(start, end - start)]);
        }
        Ok(())
    }

    /// Grows the tracked file size, optionally marking the new tail free.
    pub fn extend_to(&mut self, new_size: u64, is_free: bool) -> Result<()> {
        if new_size % MIB != 0 {
            return Err(Error::invalid_argument(format!(
                "new file size {} is not a multiple of 1 MiB",
                new_size
            )));
        }
        if new_size < self.file_size {
            return Err(Error::invalid_argument(format!(
                "cannot shrink free space table from {} to {}",
                self.file_size, new_size
            )));
        }

        let old_size = self.file_size;
        self.file_size = new_size;
        if is_free && new_size > old_size {
            self.free = extent::union(&self.free, &[Extent::new(old_size, new_size - old_size)]);
        }
        Ok(())
    }

    /// First-fit allocation of `length` bytes; `None` when no free extent is big enough.
    pub fn try_allocate(&mut self, length: u64) -> Result<Option<u64>> {
        if length == 0 || length % MIB != 0 {
            return Err(Error::invalid_argument(format!(
                "allocation length {} is not a non-zero multiple of 1 MiB",
                length
            )));
        }

        let Some(index) = self.free.iter().position(|e| e.length >= length) else {
            return Ok(None);
        };

        let start = self.free[index].start;
        if self.free[index].length == length {
            self.free.remove(index);
        } else {
            let e = &mut self.free[index];
            e.start += length;
            e.length -= length;
        }
        Ok(Some(start))
    }

    fn validate_range(&self, start: u64, length: u64) -> Result<()> {
        if start % MIB != 0 {
            return Err(Error::invalid_argument(format!(
                "range start {} is not a multiple of 1 MiB",
                start
            )));
        }
        let end = start
            .checked_add(length)
            .ok_or_else(|| Error::invalid_argument("range end overflows"))?;
        if length % MIB != 0 && end != self.file_size {
            return Err(Error::invalid_argument(format!(
                "range length {} is not a multiple of 1 MiB",
                length
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_fit_takes_low_end() {
        let mut table = FreeSpaceTable::new(10 * MIB);
        table.reserve(0, MIB).unwrap();
        table.reserve(3 * MIB, MIB).unwrap();

        assert_eq!(table.try_allocate(MIB).unwrap(), Some(MIB));
        assert_eq!(table.try_allocate(2 * MIB).unwrap(), Some(4 * MIB));
        assert_eq!(table.try_allocate(MIB).unwrap(), Some(2 * MIB));
        assert_eq!(table.free_extents(), &[Extent::new(6 * MIB, 4 * MIB)]);
    }

    #[test]
    fn test_allocate_exhausted() {
        let mut table = FreeSpaceTable::new(2 * MIB);
        assert_eq!(table.try_allocate(2 * MIB).unwrap(), Some(0));
        assert_eq!(table.try_allocate(MIB).unwrap(), None);
        assert!(table.free_extents().is_empty());
    }

    #[test]
    fn test_unaligned_length_rejected() {
        let mut table = FreeSpaceTable::new(8 * MIB);
        assert!(matches!(
            table.try_allocate(4096),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(table.reserve(4096, MIB).unwrap_err().is_misuse());
        assert!(table.reserve(0, 4096).is_err());
    }

    #[test]
    fn test_reserve_tail_of_unaligned_file() {
        let mut table = FreeSpaceTable::new(3 * MIB + 512);
        table.reserve(3 * MIB, 512).unwrap();
        assert_eq!(table.free_extents(), &[Extent::new(0, 3 * MIB)]);
    }

    #[test]
    fn test_release_coalesces() {
        let mut table = FreeSpaceTable::new(4 * MIB);
        table.reserve(0, 4 * MIB).unwrap();
        table.release(MIB, MIB).unwrap();
        table.release(2 * MIB, MIB).unwrap();
        assert_eq!(table.free_extents(), &[Extent::new(MIB, 2 * MIB)]);
    }

    #[test]
    fn test_extend_to() {
        let mut table = FreeSpaceTable::new(2 * MIB);
        table.reserve(0, 2 * MIB).unwrap();

        table.extend_to(3 * MIB, false).unwrap();
        assert!(table.free_extents().is_empty());

        table.extend_to(5 * MIB, true).unwrap();
        assert_eq!(table.free_extents(), &[Extent::new(3 * MIB, 2 * MIB)]);
        assert_eq!(table.file_size(), 5 * MIB);

        assert!(table.extend_to(4 * MIB, true).is_err());
        assert!(table.extend_to(5 * MIB + 1, true).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(u64, u64),
        Release(u64, u64),
        Allocate(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..32, 1u64..8).prop_map(|(s, l)| Op::Reserve(s * MIB, l * MIB)),
            (0u64..32, 1u64..8).prop_map(|(s, l)| Op::Release(s * MIB, l * MIB)),
            (1u64..8).prop_map(|l| Op::Allocate(l * MIB)),
        ]
    }

    proptest! {
        #[test]
        fn prop_free_and_used_partition_file(ops in prop::collection::vec(op(), 0..40)) {
            let size = 32 * MIB;
            let mut table = FreeSpaceTable::new(size);
            let mut used: Vec<Extent> = Vec::new();

            for op in ops {
                match op {
                    Op::Reserve(s, l) => {
                        table.reserve(s, l).unwrap();
                        let end = std::cmp::min(s + l, size);
                        if s < end {
                            used = extent::union(&used, &[Extent::new(s, end - s)]);
                        }
                    }
                    Op::Release(s, l) => {
                        table.release(s, l).unwrap();
                        used = extent::subtract(&used, &[Extent::new(s, l)]);
                    }
                    Op::Allocate(l) => {
                        if let Some(start) = table.try_allocate(l).unwrap() {
                            prop_assert!(extent::intersect(&used, Extent::new(start, l)).is_empty());
                            used = extent::union(&used, &[Extent::new(start, l)]);
                        }
                    }
                }

                let free = table.free_extents();
                prop_assert!(used.iter().all(|u| extent::intersect(free, *u).is_empty()));
                prop_assert_eq!(extent::union(free, &used), vec![Extent::new(0, size)]);
            }
        }
    }
}
