use crate::group::MetaslabGroup;
use crate::strategy::AllocStrategy;
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClassKind {
    Normal,
    Log,
    Dedup,
}

pub(crate) struct RotorEntry {
    mg: Arc<MetaslabGroup>,
    next: usize,
    prev: usize,
}

/// The rotor as a doubly-linked ring threaded through a slot vector; the
/// class owns the vector, groups remember their slot.
pub(crate) struct RotorList {
    entries: Vec<Option<RotorEntry>>,
}

impl RotorList {
    pub fn group(&self, slot: usize) -> &Arc<MetaslabGroup> {
        &self.entries[slot].as_ref().unwrap().mg
    }

    pub fn next(&self, slot: usize) -> usize {
        self.entries[slot].as_ref().unwrap().next
    }
}

/// An allocation class: the ring of groups its rotor walks plus the
/// class-wide space counters.
///
/// The rotor position and aliquot are plain atomics on purpose: a lost
/// update costs at most one aliquot of imbalance, and allocations never
/// block on them.
pub struct MetaslabClass {
    kind: ClassKind,
    ops: AllocStrategy,

    rotor_list: RwLock<RotorList>,
    rotor: AtomicUsize,
    aliquot: AtomicU64,

    alloc: AtomicU64,
    deferred: AtomicU64,
    space: AtomicU64,
    dspace: AtomicU64,
    alloc_groups: AtomicI64,
}

impl MetaslabClass {
    pub fn new(kind: ClassKind, ops: AllocStrategy) -> Arc<MetaslabClass> {
        Arc::new(MetaslabClass {
            kind,
            ops,
            rotor_list: RwLock::new(RotorList {
                entries: Vec::new(),
            }),
            rotor: AtomicUsize::new(usize::MAX),
            aliquot: AtomicU64::new(0),
            alloc: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            space: AtomicU64::new(0),
            dspace: AtomicU64::new(0),
            alloc_groups: AtomicI64::new(0),
        })
    }

    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    pub fn is_normal(&self) -> bool {
        self.kind == ClassKind::Normal
    }

    pub(crate) fn ops(&self) -> AllocStrategy {
        self.ops
    }

    pub(crate) fn rotor_list(&self) -> RwLockReadGuard<'_, RotorList> {
        self.rotor_list.read()
    }

    /// Current rotor slot; usize::MAX when the class has no groups.
    pub(crate) fn rotor_slot(&self) -> usize {
        self.rotor.load(Ordering::Relaxed)
    }

    pub(crate) fn set_rotor(&self, slot: usize) {
        self.rotor.store(slot, Ordering::Relaxed);
    }

    pub(crate) fn aliquot(&self) -> u64 {
        self.aliquot.load(Ordering::Relaxed)
    }

    /// Add to the running aliquot, returning the new value.
    pub(crate) fn add_aliquot(&self, asize: u64) -> u64 {
        self.aliquot.fetch_add(asize, Ordering::Relaxed) + asize
    }

    pub(crate) fn reset_aliquot(&self) {
        self.aliquot.store(0, Ordering::Relaxed);
    }

    /// Splice a newly-activated group in at the rotor.
    pub(crate) fn rotor_insert(&self, mg: &Arc<MetaslabGroup>) {
        let mut list = self.rotor_list.write();

        let slot = match list.entries.iter().position(|e| e.is_none()) {
            Some(slot) => slot,
            None => {
                list.entries.push(None);
                list.entries.len() - 1
            }
        };

        let rotor = self.rotor.load(Ordering::Relaxed);
        if rotor == usize::MAX {
            list.entries[slot] = Some(RotorEntry {
                mg: mg.clone(),
                next: slot,
                prev: slot,
            });
        } else {
            let next = list.entries[rotor].as_ref().unwrap().next;
            list.entries[slot] = Some(RotorEntry {
                mg: mg.clone(),
                next,
                prev: rotor,
            });
            list.entries[rotor].as_mut().unwrap().next = slot;
            list.entries[next].as_mut().unwrap().prev = slot;
        }
        mg.set_rotor_slot(slot);
        self.rotor.store(slot, Ordering::Relaxed);
    }

    pub(crate) fn rotor_remove(&self, mg: &Arc<MetaslabGroup>) {
        let mut list = self.rotor_list.write();
        let slot = mg.rotor_slot();
        let entry = list.entries[slot].take().unwrap();
        assert!(Arc::ptr_eq(&entry.mg, mg));

        if entry.next == slot {
            self.rotor.store(usize::MAX, Ordering::Relaxed);
        } else {
            list.entries[entry.prev].as_mut().unwrap().next = entry.next;
            list.entries[entry.next].as_mut().unwrap().prev = entry.prev;
            self.rotor.store(entry.next, Ordering::Relaxed);
        }
        mg.set_rotor_slot(usize::MAX);
    }

    /// Sanity-check the ring: every linked group belongs to this class and
    /// is active.
    pub fn validate(self: &Arc<Self>) {
        let list = self.rotor_list.read();
        let rotor = self.rotor.load(Ordering::Relaxed);
        if rotor == usize::MAX {
            return;
        }
        let mut slot = rotor;
        loop {
            let mg = list.group(slot);
            assert!(Arc::ptr_eq(&mg.class(), self));
            assert!(mg.activation_count() > 0);
            slot = list.next(slot);
            if slot == rotor {
                break;
            }
        }
    }

    pub(crate) fn alloc_groups_inc(&self) {
        self.alloc_groups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn alloc_groups_dec(&self) {
        self.alloc_groups.fetch_sub(1, Ordering::Relaxed);
    }

    /// Groups in this class still above the no-alloc threshold.
    pub fn alloc_groups(&self) -> i64 {
        self.alloc_groups.load(Ordering::Relaxed)
    }

    pub(crate) fn space_update(
        &self,
        alloc_delta: i64,
        defer_delta: i64,
        space_delta: i64,
        dspace_delta: i64,
    ) {
        self.alloc.fetch_add(alloc_delta as u64, Ordering::Relaxed);
        self.deferred.fetch_add(defer_delta as u64, Ordering::Relaxed);
        self.space.fetch_add(space_delta as u64, Ordering::Relaxed);
        self.dspace.fetch_add(dspace_delta as u64, Ordering::Relaxed);
    }

    pub fn get_alloc(&self) -> u64 {
        self.alloc.load(Ordering::Relaxed)
    }

    pub fn get_deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    pub fn get_space(&self) -> u64 {
        self.space.load(Ordering::Relaxed)
    }

    /// Deflated space; with no deflation modeled it tracks `get_space`.
    pub fn get_dspace(&self) -> u64 {
        self.dspace.load(Ordering::Relaxed)
    }
}
