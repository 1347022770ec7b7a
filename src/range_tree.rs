use crate::base_types::highbit64;
use more_asserts::*;
use std::collections::{BTreeMap, BTreeSet};

pub const HISTOGRAM_BITS: usize = 64;

/// A set of non-overlapping, non-adjacent extents, indexed by offset and,
/// in parallel, by size. The two indices and the power-of-two histogram are
/// kept coherent internally, so callers never wire up observers.
///
/// The caller provides whatever locking the tree needs; a tree is only ever
/// owned by one metaslab and mutated under that metaslab's lock.
pub struct RangeTree {
    tree: BTreeMap<u64, u64>,      // start -> size
    by_size: BTreeSet<(u64, u64)>, // (size, start)
    space: u64,
    histogram: [u64; HISTOGRAM_BITS], // bucket i counts extents with highbit64(size) == i+1
}

impl Default for RangeTree {
    fn default() -> RangeTree {
        RangeTree::new()
    }
}

impl RangeTree {
    pub fn new() -> RangeTree {
        RangeTree {
            tree: BTreeMap::new(),
            by_size: BTreeSet::new(),
            space: 0,
            histogram: [0; HISTOGRAM_BITS],
        }
    }

    fn insert_seg(&mut self, start: u64, size: u64) {
        let existing = self.tree.insert(start, size);
        assert!(existing.is_none());
        assert!(self.by_size.insert((size, start)));
        self.space += size;
        self.histogram[highbit64(size) as usize - 1] += 1;
    }

    fn remove_seg(&mut self, start: u64, size: u64) {
        let removed = self.tree.remove(&start);
        assert_eq!(removed, Some(size));
        assert!(self.by_size.remove(&(size, start)));
        self.space -= size;
        self.histogram[highbit64(size) as usize - 1] -= 1;
    }

    /// Add an extent, merging with any abutting neighbors. Panics if any
    /// part of the range is already present.
    pub fn add(&mut self, start: u64, size: u64) {
        if size == 0 {
            return;
        }

        let end = start + size;
        let before = self.tree.range(..end).next_back().map(|(&s, &z)| (s, z));
        let after = self.tree.range(start..).next().map(|(&s, &z)| (s, z));

        let merge_before = match before {
            Some((before_start, before_size)) => {
                assert_le!(before_start + before_size, start, "overlapping add");
                before_start + before_size == start
            }
            None => false,
        };
        let merge_after = match after {
            Some((after_start, _)) => {
                assert_ge!(after_start, end, "overlapping add");
                after_start == end
            }
            None => false,
        };

        match (merge_before, merge_after) {
            (true, true) => {
                let (before_start, before_size) = before.unwrap();
                let (after_start, after_size) = after.unwrap();
                self.remove_seg(before_start, before_size);
                self.remove_seg(after_start, after_size);
                self.insert_seg(before_start, before_size + size + after_size);
            }
            (true, false) => {
                let (before_start, before_size) = before.unwrap();
                self.remove_seg(before_start, before_size);
                self.insert_seg(before_start, before_size + size);
            }
            (false, true) => {
                let (after_start, after_size) = after.unwrap();
                self.remove_seg(after_start, after_size);
                self.insert_seg(start, size + after_size);
            }
            (false, false) => self.insert_seg(start, size),
        }
    }

    /// Remove a range that lies wholly within one existing extent, splitting
    /// it as needed. Panics otherwise.
    pub fn remove(&mut self, start: u64, size: u64) {
        assert_ne!(size, 0);

        let end = start + size;
        let (existing_start, existing_size) = self
            .tree
            .range(..end)
            .next_back()
            .map(|(&s, &z)| (s, z))
            .unwrap_or_else(|| panic!("removing absent range [{:#x}, {:#x})", start, end));
        let existing_end = existing_start + existing_size;
        assert_le!(existing_start, start, "removing absent range");
        assert_ge!(existing_end, end, "removing absent range");

        self.remove_seg(existing_start, existing_size);
        if existing_start != start {
            self.insert_seg(existing_start, start - existing_start);
        }
        if existing_end != end {
            self.insert_seg(end, existing_end - end);
        }
    }

    /// Exact membership: the whole range lies within one extent.
    pub fn contains(&self, start: u64, size: u64) -> bool {
        match self.tree.range(..=start).next_back() {
            Some((&s, &z)) => s + z >= start + size,
            None => false,
        }
    }

    /// Panics if the range is present; used to catch double frees.
    pub fn verify_absent(&self, start: u64, size: u64) {
        assert!(
            !self.contains(start, size),
            "range [{:#x}, {:#x}) unexpectedly present",
            start,
            start + size
        );
    }

    pub fn space(&self) -> u64 {
        self.space
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn num_segs(&self) -> u64 {
        self.tree.len() as u64
    }

    /// Size of the largest extent, or 0 when empty.
    pub fn max_size(&self) -> u64 {
        self.by_size.iter().next_back().map_or(0, |&(size, _)| size)
    }

    /// Largest extent as (start, size).
    pub fn largest(&self) -> Option<(u64, u64)> {
        self.by_size.iter().next_back().map(|&(size, start)| (start, size))
    }

    /// Smallest extent of at least `size`, favoring lower offsets among
    /// equal sizes.
    pub fn smallest_at_least(&self, size: u64) -> Option<(u64, u64)> {
        self.by_size
            .range((size, 0)..)
            .next()
            .map(|&(size, start)| (start, size))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.tree.iter().map(|(&s, &z)| (s, z))
    }

    /// In-offset-order iteration.
    pub fn walk(&self, mut f: impl FnMut(u64, u64)) {
        for (&start, &size) in self.tree.iter() {
            f(start, size);
        }
    }

    /// Extents from the one covering `cursor` (if any) onward.
    pub fn iter_from(&self, cursor: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        let covering = self
            .tree
            .range(..cursor)
            .next_back()
            .filter(|&(&s, &z)| s + z > cursor)
            .map(|(&s, &z)| (s, z));
        covering
            .into_iter()
            .chain(self.tree.range(cursor..).map(|(&s, &z)| (s, z)))
    }

    /// The extent overlapping the window [lo, hi), if one exists.
    pub fn seg_overlapping(&self, lo: u64, hi: u64) -> Option<(u64, u64)> {
        self.tree
            .range(..hi)
            .next_back()
            .filter(|&(&s, &z)| s + z > lo)
            .map(|(&s, &z)| (s, z))
    }

    /// Move every extent into `into` (when given) and leave this tree empty,
    /// reinitializing the secondary index wholesale instead of removing
    /// nodes one at a time.
    pub fn vacate(&mut self, mut into: Option<&mut RangeTree>) {
        let old = std::mem::take(&mut self.tree);
        self.by_size.clear();
        self.space = 0;
        self.histogram = [0; HISTOGRAM_BITS];
        if let Some(dst) = into.as_deref_mut() {
            for (start, size) in old {
                dst.add(start, size);
            }
        }
    }

    /// O(1) exchange of both indices with `other`.
    pub fn swap(&mut self, other: &mut RangeTree) {
        std::mem::swap(self, other);
    }

    pub fn histogram(&self) -> &[u64; HISTOGRAM_BITS] {
        &self.histogram
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn add_coalesces_both_sides() {
        let mut rt = RangeTree::new();
        rt.add(0, 0x1000);
        rt.add(0x2000, 0x1000);
        assert_eq!(rt.num_segs(), 2);
        rt.add(0x1000, 0x1000);
        assert_eq!(rt.num_segs(), 1);
        assert_eq!(rt.iter().collect::<Vec<_>>(), vec![(0, 0x3000)]);
        assert_eq!(rt.space(), 0x3000);
        assert_eq!(rt.max_size(), 0x3000);
    }

    #[test]
    fn remove_splits() {
        let mut rt = RangeTree::new();
        rt.add(0, 0x3000);
        rt.remove(0x1000, 0x1000);
        assert_eq!(
            rt.iter().collect::<Vec<_>>(),
            vec![(0, 0x1000), (0x2000, 0x1000)]
        );
        assert_eq!(rt.space(), 0x2000);
        assert!(rt.contains(0x2000, 0x800));
        assert!(!rt.contains(0x1000, 0x800));
        rt.verify_absent(0x1800, 0x200);
    }

    #[test]
    #[should_panic]
    fn overlapping_add_panics() {
        let mut rt = RangeTree::new();
        rt.add(0, 0x1000);
        rt.add(0x800, 0x1000);
    }

    #[test]
    #[should_panic]
    fn straddling_remove_panics() {
        let mut rt = RangeTree::new();
        rt.add(0, 0x1000);
        rt.add(0x2000, 0x1000);
        rt.remove(0x800, 0x1900);
    }

    #[test]
    fn size_index_tracks_mutations() {
        let mut rt = RangeTree::new();
        rt.add(0, 0x400);
        rt.add(0x1000, 0x200);
        rt.add(0x2000, 0x800);
        assert_eq!(rt.largest(), Some((0x2000, 0x800)));
        assert_eq!(rt.smallest_at_least(0x300), Some((0, 0x400)));
        assert_eq!(rt.smallest_at_least(0x801), None);
        rt.remove(0x2000, 0x800);
        assert_eq!(rt.max_size(), 0x400);
    }

    #[test]
    fn vacate_moves_everything() {
        let mut src = RangeTree::new();
        let mut dst = RangeTree::new();
        src.add(0, 0x1000);
        src.add(0x2000, 0x1000);
        src.vacate(Some(&mut dst));
        assert!(src.is_empty());
        assert_eq!(src.space(), 0);
        assert_eq!(dst.space(), 0x2000);
        assert_eq!(src.max_size(), 0);
    }

    #[test]
    fn iter_from_starts_at_covering_seg() {
        let mut rt = RangeTree::new();
        rt.add(0, 0x1000);
        rt.add(0x2000, 0x1000);
        let v: Vec<_> = rt.iter_from(0x800).collect();
        assert_eq!(v, vec![(0, 0x1000), (0x2000, 0x1000)]);
        let v: Vec<_> = rt.iter_from(0x1000).collect();
        assert_eq!(v, vec![(0x2000, 0x1000)]);
        assert_eq!(rt.seg_overlapping(0x1800, 0x1900), None);
        assert_eq!(rt.seg_overlapping(0x1800, 0x2100), Some((0x2000, 0x1000)));
    }

    const UNITS: usize = 256;

    fn model_extents(model: &[bool; UNITS]) -> Vec<(u64, u64)> {
        let mut extents = Vec::new();
        let mut i = 0;
        while i < UNITS {
            if model[i] {
                let start = i;
                while i < UNITS && model[i] {
                    i += 1;
                }
                extents.push((start as u64, (i - start) as u64));
            } else {
                i += 1;
            }
        }
        extents
    }

    proptest! {
        /// Random adds and removes agree with a bitmap model: same space,
        /// same maximal runs, coherent size index and histogram.
        #[test]
        fn matches_bitmap_model(ops in proptest::collection::vec(
            (0..2u8, 0..UNITS as u64, 1..17u64), 1..200)) {
            let mut rt = RangeTree::new();
            let mut model = [false; UNITS];
            for (kind, start, len) in ops {
                let len = len.min(UNITS as u64 - start);
                if len == 0 {
                    continue;
                }
                let range = start as usize..(start + len) as usize;
                if kind == 0 {
                    if model[range.clone()].iter().any(|&b| b) {
                        continue; // would overlap
                    }
                    rt.add(start, len);
                    model[range].iter_mut().for_each(|b| *b = true);
                } else {
                    if model[range.clone()].iter().any(|&b| !b) {
                        continue; // not fully present
                    }
                    rt.remove(start, len);
                    model[range].iter_mut().for_each(|b| *b = false);
                }
            }

            let extents = model_extents(&model);
            prop_assert_eq!(rt.iter().collect::<Vec<_>>(), extents.clone());
            prop_assert_eq!(rt.space(), model.iter().filter(|&&b| b).count() as u64);
            prop_assert_eq!(
                rt.max_size(),
                extents.iter().map(|&(_, z)| z).max().unwrap_or(0)
            );
            let mut histogram = [0u64; HISTOGRAM_BITS];
            for &(_, z) in &extents {
                histogram[highbit64(z) as usize - 1] += 1;
            }
            prop_assert_eq!(rt.histogram(), &histogram);
        }
    }
}
