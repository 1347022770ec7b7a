use crate::base_types::*;
use crate::group::MetaslabGroup;
use crate::metaslab::Metaslab;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum VdevState {
    Faulted = 0,
    Degraded = 1,
    Healthy = 2,
}

/// The slice of a device the allocator cares about: geometry, health, space
/// accounting, and the per-txg dirty metaslab sets.
pub struct Vdev {
    pub id: VdevId,
    pub ashift: u32,
    pub ms_shift: u32,

    asize: AtomicU64,
    ms_count: AtomicU64,
    state: AtomicU8,
    write_errors: AtomicU64,

    // bytes under metaslab management / allocated / held in defer trees
    space: AtomicU64,
    alloc: AtomicU64,
    deferred: AtomicU64,

    metaslabs: RwLock<Vec<Arc<Metaslab>>>,
    group: RwLock<Weak<MetaslabGroup>>,
    dirty: [Mutex<BTreeSet<u64>>; TXG_SIZE],
}

impl Vdev {
    pub fn new(id: VdevId, asize: u64, ashift: u32, ms_shift: u32) -> Arc<Vdev> {
        assert!(ms_shift > ashift);
        Arc::new(Vdev {
            id,
            ashift,
            ms_shift,
            asize: AtomicU64::new(asize),
            ms_count: AtomicU64::new(asize >> ms_shift),
            state: AtomicU8::new(VdevState::Healthy as u8),
            write_errors: AtomicU64::new(0),
            space: AtomicU64::new(0),
            alloc: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            metaslabs: RwLock::new(Vec::new()),
            group: RwLock::new(Weak::new()),
            dirty: Default::default(),
        })
    }

    pub(crate) fn set_group(&self, mg: &Arc<MetaslabGroup>) {
        *self.group.write() = Arc::downgrade(mg);
    }

    pub fn group(&self) -> Arc<MetaslabGroup> {
        self.group.read().upgrade().expect("group outlives vdev")
    }

    pub fn asize(&self) -> u64 {
        self.asize.load(Ordering::Relaxed)
    }

    /// Record a device grow; new metaslabs are the pool's job.
    pub(crate) fn expand(&self, new_asize: u64) {
        self.asize.store(new_asize, Ordering::Relaxed);
        self.ms_count
            .store(new_asize >> self.ms_shift, Ordering::Relaxed);
    }

    pub fn state(&self) -> VdevState {
        match self.state.load(Ordering::Relaxed) {
            0 => VdevState::Faulted,
            1 => VdevState::Degraded,
            _ => VdevState::Healthy,
        }
    }

    pub fn set_state(&self, state: VdevState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    pub fn note_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the device can take writes at all. Degraded devices can;
    /// the allocator applies its own single-copy policy on top.
    pub fn allocatable(&self) -> bool {
        self.state() != VdevState::Faulted
    }

    pub fn psize_to_asize(&self, psize: u64) -> u64 {
        p2roundup(psize, 1 << self.ashift)
    }

    /// Metaslab count per the device's size; set ahead of metaslab creation
    /// so weights are computed against the final count.
    pub fn ms_count(&self) -> u64 {
        self.ms_count.load(Ordering::Relaxed)
    }

    pub fn metaslab(&self, id: u64) -> Option<Arc<Metaslab>> {
        self.metaslabs.read().get(id as usize).cloned()
    }

    pub(crate) fn add_metaslab(&self, msp: &Arc<Metaslab>) {
        let mut metaslabs = self.metaslabs.write();
        assert_eq!(metaslabs.len() as u64, msp.id());
        metaslabs.push(msp.clone());
    }

    pub(crate) fn clear_metaslabs(&self) {
        self.metaslabs.write().clear();
    }

    /// Mark a metaslab as having per-txg state to sync in `txg`.
    pub(crate) fn dirty(&self, ms_id: u64, txg: Txg) {
        self.dirty[txg.slot()].lock().insert(ms_id);
    }

    pub(crate) fn take_dirty(&self, txg: Txg) -> Vec<u64> {
        let mut set = self.dirty[txg.slot()].lock();
        let ids: Vec<u64> = set.iter().copied().collect();
        set.clear();
        ids
    }

    pub fn space(&self) -> u64 {
        self.space.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> u64 {
        self.alloc.load(Ordering::Relaxed)
    }

    pub fn defer_space(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    /// Apply deltas to the device's space accounting and forward them to the
    /// owning class.
    pub(crate) fn space_update(&self, alloc_delta: i64, defer_delta: i64, space_delta: i64) {
        self.alloc.fetch_add(alloc_delta as u64, Ordering::Relaxed);
        self.deferred.fetch_add(defer_delta as u64, Ordering::Relaxed);
        self.space.fetch_add(space_delta as u64, Ordering::Relaxed);

        let mg = self.group();
        mg.class()
            .space_update(alloc_delta, defer_delta, space_delta, space_delta);
    }
}
