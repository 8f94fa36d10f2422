//! Byte extents and set operations over sorted extent lists.

use std::cmp::{max, min};

/// A half-open byte range `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Extent {
    /// First byte of the range.
    pub start: u64,
    /// Number of bytes in the range.
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// First byte past the extent.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Sorts and merges overlapping or touching extents, dropping empty ones.
pub fn normalize(mut extents: Vec<Extent>) -> Vec<Extent> {
    extents.retain(|e| !e.is_empty());
    extents.sort();

    let mut out: Vec<Extent> = Vec::with_capacity(extents.len());
    for e in extents {
        match out.last_mut() {
            Some(last) if e.start <= last.end() => {
                let end = max(last.end(), e.end());
                last.length = end - last.start;
            }
            _ => out.push(e),
        }
    }
    out
}

/// Union of two extent sets.
pub fn union(a: &[Extent], b: &[Extent]) -> Vec<Extent> {
    let mut all = Vec::with_capacity(a.len() + b.len());
    all.extend_from_slice(a);
    all.extend_from_slice(b);
    normalize(all)
}

/// Intersection of an extent set with a single range.
pub fn intersect(extents: &[Extent], range: Extent) -> Vec<Extent> {
    let mut out = Vec::new();
    for e in extents {
        let start = max(e.start, range.start);
        let end = min(e.end(), range.end());
        if start < end {
            out.push(Extent::new(start, end - start));
        }
    }
    normalize(out)
}

/// Removes every byte covered by `remove` from `from`.
pub fn subtract(from: &[Extent], remove: &[Extent]) -> Vec<Extent> {
    let remove = normalize(remove.to_vec());
    let mut out = Vec::with_capacity(from.len());

    for e in normalize(from.to_vec()) {
        let mut cursor = e.start;
        let end = e.end();
        for r in &remove {
            if r.end() <= cursor {
                continue;
            }
            if r.start >= end {
                break;
            }
            if r.start > cursor {
                out.push(Extent::new(cursor, r.start - cursor));
            }
            cursor = max(cursor, r.end());
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            out.push(Extent::new(cursor, end - cursor));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_merges_adjacent() {
        let a = [Extent::new(0, 10), Extent::new(20, 5)];
        let b = [Extent::new(10, 10)];
        assert_eq!(union(&a, &b), vec![Extent::new(0, 25)]);
    }

    #[test]
    fn test_subtract_splits() {
        let from = [Extent::new(0, 100)];
        let remove = [Extent::new(25, 50)];
        assert_eq!(
            subtract(&from, &remove),
            vec![Extent::new(0, 25), Extent::new(75, 25)]
        );
    }

    #[test]
    fn test_subtract_overlapping_removals() {
        let from = [Extent::new(0, 10), Extent::new(20, 10)];
        let remove = [Extent::new(5, 20), Extent::new(8, 4)];
        assert_eq!(
            subtract(&from, &remove),
            vec![Extent::new(0, 5), Extent::new(25, 5)]
        );
    }

    #[test]
    fn test_intersect_clips() {
        let extents = [Extent::new(0, 10), Extent::new(20, 10)];
        assert_eq!(
            intersect(&extents, Extent::new(5, 20)),
            vec![Extent::new(5, 5), Extent::new(20, 5)]
        );
    }

    #[test]
    fn test_normalize_drops_empty() {
        let extents = vec![Extent::new(5, 0), Extent::new(1, 2)];
        assert_eq!(normalize(extents), vec![Extent::new(1, 2)]);
    }
}
