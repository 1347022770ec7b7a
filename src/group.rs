use crate::base_types::*;
use crate::class::MetaslabClass;
use crate::config::AllocConfig;
use crate::metaslab::{
    Metaslab, TryAlloc, METASLAB_ACTIVE_MASK, METASLAB_WEIGHT_PRIMARY,
    METASLAB_WEIGHT_SECONDARY,
};
use crate::mos::MetaObjectStore;
use crate::taskq::Taskq;
use crate::vdev::Vdev;
use log::*;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Sort key for the group's metaslab set: heaviest first, ties broken by
/// offset for uniqueness.
#[derive(PartialEq, Eq, Clone, Copy)]
struct MsKey {
    weight: u64,
    start: u64,
}

impl Ord for MsKey {
    fn cmp(&self, other: &MsKey) -> CmpOrdering {
        other
            .weight
            .cmp(&self.weight)
            .then(self.start.cmp(&other.start))
    }
}

impl PartialOrd for MsKey {
    fn partial_cmp(&self, other: &MsKey) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct GroupInner {
    by_weight: BTreeMap<MsKey, Arc<Metaslab>>,
}

/// One device's set of metaslabs, weight-ordered, plus the preload taskq
/// and the allocatability bookkeeping the class consults.
pub struct MetaslabGroup {
    vd: Arc<Vdev>,
    class: Weak<MetaslabClass>,
    mos: Arc<MetaObjectStore>,
    cfg: Arc<AllocConfig>,

    inner: Mutex<GroupInner>,
    taskq: Taskq,

    aliquot: AtomicU64,
    bias: AtomicI64,
    allocatable: AtomicBool,
    free_capacity: AtomicU64,
    activation_count: AtomicI64,
    /// Slot in the class's rotor list, usize::MAX while unlinked. Written
    /// only under the class's rotor write lock.
    rotor_slot: AtomicUsize,
}

impl MetaslabGroup {
    pub fn new(
        class: &Arc<MetaslabClass>,
        vd: Arc<Vdev>,
        mos: Arc<MetaObjectStore>,
        cfg: Arc<AllocConfig>,
    ) -> Arc<MetaslabGroup> {
        let mg = Arc::new(MetaslabGroup {
            vd: vd.clone(),
            class: Arc::downgrade(class),
            mos,
            cfg: cfg.clone(),
            inner: Mutex::new(GroupInner {
                by_weight: BTreeMap::new(),
            }),
            taskq: Taskq::new("metaslab_group_taskq", cfg.preload_taskq_threads),
            aliquot: AtomicU64::new(0),
            bias: AtomicI64::new(0),
            allocatable: AtomicBool::new(false),
            free_capacity: AtomicU64::new(0),
            activation_count: AtomicI64::new(0),
            rotor_slot: AtomicUsize::new(usize::MAX),
        });
        vd.set_group(&mg);
        mg
    }

    pub fn vdev(&self) -> &Arc<Vdev> {
        &self.vd
    }

    pub fn class(&self) -> Arc<MetaslabClass> {
        self.class.upgrade().expect("class outlives group")
    }

    pub(crate) fn mos(&self) -> &Arc<MetaObjectStore> {
        &self.mos
    }

    pub(crate) fn cfg(&self) -> &Arc<AllocConfig> {
        &self.cfg
    }

    pub fn aliquot(&self) -> u64 {
        self.aliquot.load(Ordering::Relaxed)
    }

    pub(crate) fn bias(&self) -> i64 {
        self.bias.load(Ordering::Relaxed)
    }

    pub(crate) fn set_bias(&self, bias: i64) {
        self.bias.store(bias, Ordering::Relaxed);
    }

    pub fn free_capacity(&self) -> u64 {
        self.free_capacity.load(Ordering::Relaxed)
    }

    pub fn activation_count(&self) -> i64 {
        self.activation_count.load(Ordering::Relaxed)
    }

    pub(crate) fn rotor_slot(&self) -> usize {
        self.rotor_slot.load(Ordering::Relaxed)
    }

    pub(crate) fn set_rotor_slot(&self, slot: usize) {
        self.rotor_slot.store(slot, Ordering::Relaxed);
    }

    pub(crate) fn add(&self, msp: &Arc<Metaslab>) {
        let mut inner = self.inner.lock();
        msp.set_weight(0);
        let existing = inner.by_weight.insert(
            MsKey {
                weight: 0,
                start: msp.start(),
            },
            msp.clone(),
        );
        assert!(existing.is_none());
    }

    pub(crate) fn remove(&self, msp: &Metaslab) {
        let mut inner = self.inner.lock();
        let key = MsKey {
            weight: msp.weight(),
            start: msp.start(),
        };
        inner.by_weight.remove(&key).expect("metaslab in group");
    }

    /// Re-sort a metaslab under a new weight. The metaslab's shadow weight
    /// is the old sort key, so this is the only place it changes.
    pub(crate) fn sort(&self, msp: &Metaslab, weight: u64) {
        let mut inner = self.inner.lock();
        let old_key = MsKey {
            weight: msp.weight(),
            start: msp.start(),
        };
        let arc = inner.by_weight.remove(&old_key).expect("metaslab in group");
        msp.set_weight(weight);
        inner.by_weight.insert(
            MsKey {
                weight,
                start: msp.start(),
            },
            arc,
        );
    }

    /// Recompute free capacity and the allocatable flag, keeping the
    /// class's count of above-threshold groups in step.
    pub(crate) fn alloc_update(&self) {
        let _inner = self.inner.lock();
        let class = self.class();

        let space = self.vd.space();
        let alloc = self.vd.allocated();
        let free_capacity = space.saturating_sub(alloc) * 100 / (space + 1);
        self.free_capacity.store(free_capacity, Ordering::Relaxed);

        let was_allocatable = self.allocatable.load(Ordering::Relaxed);
        let now_allocatable = free_capacity > self.cfg.mg_noalloc_threshold;
        self.allocatable.store(now_allocatable, Ordering::Relaxed);

        // The class tracks how many groups still sit above the threshold;
        // when that count hits zero every group opens up again, which is
        // the pool-wide balance point.
        if was_allocatable && !now_allocatable {
            class.alloc_groups_dec();
        } else if !was_allocatable && now_allocatable {
            class.alloc_groups_inc();
        }
    }

    /// Whether the allocator should consider this group at all.
    pub fn allocatable(&self) -> bool {
        let class = self.class();
        self.free_capacity() > self.cfg.mg_noalloc_threshold
            || !class.is_normal()
            || class.alloc_groups() == 0
    }

    /// Link into the class rotor. Balances a prior passivation when the
    /// activation count was driven negative.
    pub fn activate(self: &Arc<Self>) {
        let count = self.activation_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= 0 {
            return;
        }
        self.aliquot.store(self.cfg.aliquot, Ordering::Relaxed);
        self.alloc_update();
        self.class().rotor_insert(self);
    }

    /// Unlink from the rotor, draining the preload taskq first.
    pub fn passivate(self: &Arc<Self>) {
        let count = self.activation_count.fetch_sub(1, Ordering::Relaxed) - 1;
        if count != 0 {
            assert!(count < 0);
            return;
        }
        self.taskq.wait();
        self.class().rotor_remove(self);
    }

    /// Find an offset for `asize` bytes in this group. Walks metaslabs in
    /// weight order; secondary activations additionally keep their distance
    /// from replicas already placed on this device.
    pub fn group_alloc(
        &self,
        psize: u64,
        asize: u64,
        txg: Txg,
        min_distance: u64,
        prior_dvas: &[Dva],
    ) -> Option<u64> {
        let activation_weight = if prior_dvas.iter().any(|d| d.vdev == self.vd.id.0) {
            METASLAB_WEIGHT_SECONDARY
        } else {
            METASLAB_WEIGHT_PRIMARY
        };

        loop {
            let candidate = {
                let inner = self.inner.lock();
                let mut found = None;
                for (key, msp) in inner.by_weight.iter() {
                    if key.weight < asize {
                        debug!(
                            "vdev {}: failed to meet weight requirement: txg {}, \
                             metaslab {}, psize {}, asize {}, weight {}",
                            self.vd.id, txg, msp.id(), psize, asize, key.weight
                        );
                        return None;
                    }

                    // Mid-condense metaslabs are untouchable.
                    if msp.is_condensing() {
                        continue;
                    }

                    let was_active = key.weight & METASLAB_ACTIVE_MASK != 0;
                    if activation_weight == METASLAB_WEIGHT_PRIMARY {
                        found = Some((msp.clone(), was_active));
                        break;
                    }

                    // Never-used metaslabs must spread half again as far.
                    let target_distance = min_distance
                        + if msp.allocated_lockless() != 0 {
                            0
                        } else {
                            min_distance / 2
                        };
                    if prior_dvas
                        .iter()
                        .all(|dva| msp.distance(dva) >= target_distance)
                    {
                        found = Some((msp.clone(), was_active));
                        break;
                    }
                }
                found
            };

            let (msp, was_active) = candidate?;
            match msp.try_alloc(asize, txg, activation_weight, was_active) {
                TryAlloc::Success(offset) => return Some(offset),
                TryAlloc::Retry => continue,
            }
        }
    }

    /// Schedule background loads for the next most-attractive metaslabs.
    fn preload(&self, syncing_txg: u64, shutting_down: bool) {
        if shutting_down || !self.cfg.preload_enabled {
            self.taskq.wait();
            return;
        }

        let inner = self.inner.lock();
        for (_, msp) in inner.by_weight.iter().take(self.cfg.preload_limit) {
            let msp = msp.clone();
            self.taskq.dispatch(move || msp.preload(syncing_txg));
        }
    }

    /// Post-sync housekeeping: refresh allocatability, then warm the cache.
    pub fn sync_reassess(&self, syncing_txg: u64, shutting_down: bool) {
        self.alloc_update();
        self.preload(syncing_txg, shutting_down);
    }

    /// Walk all metaslabs (test support).
    pub fn metaslabs(&self) -> Vec<Arc<Metaslab>> {
        self.inner.lock().by_weight.values().cloned().collect()
    }
}
