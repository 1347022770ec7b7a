use crate::base_types::OnDisk;
use crate::error::{AllocError, Result};
use crate::mos::{MetaObjectStore, Tx};
use crate::range_tree::{RangeTree, HISTOGRAM_BITS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SM_HISTOGRAM_SIZE: usize = 32;

/// Longest run, in sectors, that one log entry can describe. Larger extents
/// are split across consecutive entries when written out.
pub const SM_RUN_MAX: u64 = 0x7fff;

#[derive(Debug, Serialize, Deserialize, Copy, Clone)]
enum SpaceMapEntry {
    Alloc { offset: u64, size: u64 },
    Free { offset: u64, size: u64 },
}
impl OnDisk for SpaceMapEntry {}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SmKind {
    Alloc,
    Free,
}

/// Encoded size of one log entry; the unit of the space map's length
/// bookkeeping and of the condense arithmetic.
pub fn sm_entry_size() -> u64 {
    bincode::serialized_size(&SpaceMapEntry::Alloc { offset: 0, size: 0 }).unwrap()
}

/// An append-only log of ALLOC/FREE records covering one metaslab's address
/// range. Replaying the log in order reconstructs the allocated set.
///
/// `allocated()` reports the value as of the last `update()` (the last
/// committed txg); `alloc_delta()` is what this txg's writes have changed it
/// by so far.
pub struct SpaceMap {
    mos: Arc<MetaObjectStore>,
    object: u64,
    start: u64,
    size: u64,
    shift: u32,
    length: u64,
    alloc_phys: u64,
    alloc_synced: u64,
    histogram: [u64; SM_HISTOGRAM_SIZE],
}

impl SpaceMap {
    /// Allocate a fresh on-disk object covering [start, start+size).
    pub fn create(
        mos: Arc<MetaObjectStore>,
        start: u64,
        size: u64,
        shift: u32,
        tx: &Tx,
    ) -> SpaceMap {
        let object = mos.create_object(tx);
        SpaceMap {
            mos,
            object,
            start,
            size,
            shift,
            length: 0,
            alloc_phys: 0,
            alloc_synced: 0,
            histogram: [0; SM_HISTOGRAM_SIZE],
        }
    }

    /// Open an existing object, rebuilding the length and allocated-space
    /// bookkeeping from the log. The histogram starts empty; it is brought
    /// up to date the next time the owning metaslab syncs while loaded.
    pub fn open(
        mos: Arc<MetaObjectStore>,
        object: u64,
        start: u64,
        size: u64,
        shift: u32,
    ) -> Result<SpaceMap> {
        let entries: Vec<SpaceMapEntry> =
            mos.read_entries(object).map_err(AllocError::Io)?;
        let mut alloc: u64 = 0;
        for entry in &entries {
            match entry {
                SpaceMapEntry::Alloc { size, .. } => alloc += size,
                SpaceMapEntry::Free { size, .. } => alloc -= size,
            }
        }
        Ok(SpaceMap {
            mos,
            object,
            start,
            size,
            shift,
            length: entries.len() as u64 * sm_entry_size(),
            alloc_phys: alloc,
            alloc_synced: alloc,
            histogram: [0; SM_HISTOGRAM_SIZE],
        })
    }

    pub fn object(&self) -> u64 {
        self.object
    }

    /// Replay the log into a fresh range tree of free space: the full
    /// coverage minus ALLOC records plus FREE records, in order.
    pub fn load(&self) -> Result<RangeTree> {
        let entries: Vec<SpaceMapEntry> =
            self.mos.read_entries(self.object).map_err(AllocError::Io)?;
        let mut rt = RangeTree::new();
        rt.add(self.start, self.size);
        for entry in entries {
            match entry {
                SpaceMapEntry::Alloc { offset, size } => rt.remove(offset, size),
                SpaceMapEntry::Free { offset, size } => rt.add(offset, size),
            }
        }
        assert_eq!(rt.space(), self.size - self.alloc_phys);
        Ok(rt)
    }

    /// Append every extent of `tree` as records of the given kind.
    pub fn write(&mut self, tree: &RangeTree, kind: SmKind, tx: &Tx) {
        if tree.is_empty() {
            return;
        }

        let mut entries = Vec::new();
        let run_max = SM_RUN_MAX << self.shift;
        for (start, size) in tree.iter() {
            let mut offset = start;
            let mut remaining = size;
            while remaining > 0 {
                let run = remaining.min(run_max);
                entries.push(match kind {
                    SmKind::Alloc => SpaceMapEntry::Alloc { offset, size: run },
                    SmKind::Free => SpaceMapEntry::Free { offset, size: run },
                });
                offset += run;
                remaining -= run;
            }
        }
        self.mos.append_chunk(self.object, &entries, tx);
        self.length += entries.len() as u64 * sm_entry_size();
        match kind {
            SmKind::Alloc => self.alloc_phys += tree.space(),
            SmKind::Free => self.alloc_phys -= tree.space(),
        }
    }

    /// Discard the log. The caller rewrites the full state in the same
    /// transaction (condense).
    pub fn truncate(&mut self, tx: &Tx) {
        self.mos.truncate_object(self.object, tx);
        self.length = 0;
        self.alloc_phys = 0;
    }

    /// Bytes of entries currently on disk.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Allocated bytes as of the last committed txg.
    pub fn allocated(&self) -> u64 {
        self.alloc_synced
    }

    /// Change in allocated bytes written this txg but not yet committed.
    pub fn alloc_delta(&self) -> i64 {
        self.alloc_phys as i64 - self.alloc_synced as i64
    }

    /// Commit this txg's writes into `allocated()`.
    pub fn update(&mut self) {
        self.alloc_synced = self.alloc_phys;
    }

    pub fn histogram(&self) -> &[u64; SM_HISTOGRAM_SIZE] {
        &self.histogram
    }

    pub fn histogram_clear(&mut self) {
        self.histogram = [0; SM_HISTOGRAM_SIZE];
    }

    /// Fold a range tree's extent-size histogram into ours, re-bucketed by
    /// the sector shift.
    pub fn histogram_add(&mut self, tree: &RangeTree) {
        for bit in 0..HISTOGRAM_BITS {
            let count = tree.histogram()[bit];
            if count == 0 {
                continue;
            }
            let idx = (bit as i64 - self.shift as i64)
                .max(0)
                .min(SM_HISTOGRAM_SIZE as i64 - 1) as usize;
            self.histogram[idx] += count;
        }
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_types::Txg;

    fn new_sm(size: u64) -> SpaceMap {
        let mos = Arc::new(MetaObjectStore::new());
        let tx = Tx::assigned(Txg(1), 1);
        SpaceMap::create(mos, 0, size, 9, &tx)
    }

    #[test]
    fn load_replays_in_order() {
        let mut sm = new_sm(1 << 20);
        let tx = Tx::assigned(Txg(1), 1);

        let mut allocs = RangeTree::new();
        allocs.add(0, 0x4000);
        allocs.add(0x8000, 0x1000);
        sm.write(&allocs, SmKind::Alloc, &tx);

        let mut frees = RangeTree::new();
        frees.add(0x1000, 0x1000);
        sm.write(&frees, SmKind::Free, &tx);

        let rt = sm.load().unwrap();
        assert_eq!(rt.space(), (1 << 20) - 0x4000);
        assert!(rt.contains(0x1000, 0x1000));
        assert!(!rt.contains(0x8000, 0x200));
        assert_eq!(sm.alloc_delta(), 0x4000);
        sm.update();
        assert_eq!(sm.allocated(), 0x4000);
        assert_eq!(sm.alloc_delta(), 0);
    }

    #[test]
    fn long_runs_are_split() {
        // 64 MiB at ashift 9 is four SM_RUN_MAX runs plus change.
        let mut sm = new_sm(64 << 20);
        let tx = Tx::assigned(Txg(1), 1);
        let mut allocs = RangeTree::new();
        allocs.add(0, 64 << 20);
        sm.write(&allocs, SmKind::Alloc, &tx);
        let runs = (64 << 20 >> 9) / SM_RUN_MAX + 1;
        assert_eq!(sm.length(), runs * sm_entry_size());
        let rt = sm.load().unwrap();
        assert_eq!(rt.space(), 0);
    }

    #[test]
    fn truncate_resets_bookkeeping() {
        let mut sm = new_sm(1 << 20);
        let tx = Tx::assigned(Txg(1), 1);
        let mut allocs = RangeTree::new();
        allocs.add(0, 0x2000);
        sm.write(&allocs, SmKind::Alloc, &tx);
        sm.truncate(&tx);
        assert_eq!(sm.length(), 0);
        let rt = sm.load().unwrap();
        assert_eq!(rt.space(), 1 << 20);
    }

    #[test]
    fn corrupt_log_fails_load() {
        let mos = Arc::new(MetaObjectStore::new());
        let tx = Tx::assigned(Txg(1), 1);
        let mut sm = SpaceMap::create(mos.clone(), 0, 1 << 20, 9, &tx);
        let mut allocs = RangeTree::new();
        allocs.add(0, 0x2000);
        sm.write(&allocs, SmKind::Alloc, &tx);
        mos.append_raw(sm.object(), b"garbage");
        match sm.load() {
            Err(AllocError::Io(_)) => {}
            other => panic!("expected Io error, got {:?}", other.map(|rt| rt.space())),
        }
    }
}
