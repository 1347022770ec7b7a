use crate::base_types::*;
use crate::config::AllocConfig;
use crate::error::{AllocError, Result};
use crate::group::MetaslabGroup;
use crate::mos::Tx;
use crate::range_tree::RangeTree;
use crate::space_map::{sm_entry_size, SmKind, SpaceMap, SM_RUN_MAX};
use crate::strategy::{AllocStrategy, MAX_LBAS};
use crate::vdev::Vdev;
use log::*;
use more_asserts::*;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub const METASLAB_WEIGHT_PRIMARY: u64 = 1 << 63;
pub const METASLAB_WEIGHT_SECONDARY: u64 = 1 << 62;
pub const METASLAB_ACTIVE_MASK: u64 = METASLAB_WEIGHT_PRIMARY | METASLAB_WEIGHT_SECONDARY;

/// Per-txg views of in-flight state. Created lazily on the first sync_done
/// so that new space is detected there and any earlier use faults loudly.
struct TxgTrees {
    alloc: [RangeTree; TXG_SIZE],
    free: [RangeTree; TXG_SIZE],
    defer: [RangeTree; TXG_DEFER_SIZE],
}

impl Default for TxgTrees {
    fn default() -> TxgTrees {
        TxgTrees {
            alloc: Default::default(),
            free: Default::default(),
            defer: Default::default(),
        }
    }
}

struct MsInner {
    sm: Option<SpaceMap>,
    /// Free space; valid only while loaded.
    tree: RangeTree,
    txgs: Option<Box<TxgTrees>>,
    loaded: bool,
    loading: bool,
    /// Last txg an allocation was served from here, plus the unload delay.
    access_txg: u64,
    /// Bytes sitting in defer trees, not yet usable.
    deferspace: i64,
    /// Per-size-bucket cursors owned by the strategy.
    lbas: [u64; MAX_LBAS],
    /// Histogram weight bonus as last computed; diagnostic.
    factor: u64,
}

/// A fixed-size slice of one device: the unit of allocation bookkeeping.
///
/// `weight` shadows the group's sort key and is only written by
/// `MetaslabGroup::sort` (under the group lock); everything else lives
/// behind the metaslab mutex. `condensing` is an atomic so the group walk
/// can skip a condensing metaslab without taking its lock.
pub struct Metaslab {
    id: u64,
    start: u64,
    size: u64,
    ops: AllocStrategy,
    cfg: Arc<AllocConfig>,
    group: Weak<MetaslabGroup>,

    weight: AtomicU64,
    allocated: AtomicU64,
    condensing: AtomicBool,

    inner: Mutex<MsInner>,
    load_cv: Condvar,
}

pub(crate) enum TryAlloc {
    /// Allocation landed at this offset.
    Success(u64),
    /// State changed underneath us or the metaslab came up empty;
    /// re-walk the group.
    Retry,
}

impl Metaslab {
    /// Create a metaslab; with a nonzero `sm_object`, open its existing
    /// space map. Registered with both the vdev and the group before return.
    pub fn new(
        mg: &Arc<MetaslabGroup>,
        id: u64,
        sm_object: u64,
        txg: Txg,
    ) -> Result<Arc<Metaslab>> {
        let vd = mg.vdev().clone();
        let start = id << vd.ms_shift;
        let size = 1u64 << vd.ms_shift;

        // We only open space map objects that already exist; everything
        // else gets an object on its first sync.
        let sm = if sm_object != 0 {
            Some(SpaceMap::open(
                mg.mos().clone(),
                sm_object,
                start,
                size,
                vd.ashift,
            )?)
        } else {
            None
        };
        let allocated = sm.as_ref().map_or(0, |sm| sm.allocated());

        let msp = Arc::new(Metaslab {
            id,
            start,
            size,
            ops: mg.class().ops(),
            cfg: mg.cfg().clone(),
            group: Arc::downgrade(mg),
            weight: AtomicU64::new(0),
            allocated: AtomicU64::new(allocated),
            condensing: AtomicBool::new(false),
            inner: Mutex::new(MsInner {
                sm,
                tree: RangeTree::new(),
                txgs: None,
                loaded: false,
                loading: false,
                access_txg: 0,
                deferspace: 0,
                lbas: [0; MAX_LBAS],
                factor: 0,
            }),
            load_cv: Condvar::new(),
        });

        vd.add_metaslab(&msp);
        mg.add(&msp);

        // Opening or creating a pool makes the space available right away;
        // space added later shows up only after its txg syncs.
        if txg.0 <= TXG_INITIAL {
            msp.sync_done(Txg(0));
        }

        if msp.cfg.debug_load && msp.has_space_map() {
            msp.load()?;
        }

        if txg.0 != 0 {
            vd.dirty(id, txg);
        }

        Ok(msp)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn weight(&self) -> u64 {
        self.weight.load(Ordering::Relaxed)
    }

    pub(crate) fn set_weight(&self, weight: u64) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    /// Space-map allocated bytes as of the last committed txg, readable
    /// without the metaslab lock.
    pub(crate) fn allocated_lockless(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub(crate) fn is_condensing(&self) -> bool {
        self.condensing.load(Ordering::Relaxed)
    }

    fn group(&self) -> Arc<MetaslabGroup> {
        self.group.upgrade().expect("group outlives metaslab")
    }

    fn vdev(&self) -> Arc<Vdev> {
        self.group().vdev().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.lock().loaded
    }

    pub fn has_space_map(&self) -> bool {
        self.inner.lock().sm.is_some()
    }

    pub fn space_map_object(&self) -> u64 {
        self.inner.lock().sm.as_ref().map_or(0, |sm| sm.object())
    }

    pub fn space_map_length(&self) -> u64 {
        self.inner.lock().sm.as_ref().map_or(0, |sm| sm.length())
    }

    /// Largest contiguous run, or 0 when unloaded.
    pub fn max_size(&self) -> u64 {
        self.inner.lock().tree.max_size()
    }

    pub fn free_space(&self) -> u64 {
        self.inner.lock().tree.space()
    }

    pub fn defer_space(&self) -> u64 {
        let inner = self.inner.lock();
        match inner.txgs.as_ref() {
            Some(txgs) => txgs.defer.iter().map(|t| t.space()).sum(),
            None => 0,
        }
    }

    /// Snapshot of the free tree's extents, offset-ordered.
    pub fn free_extents(&self) -> Vec<(u64, u64)> {
        let inner = self.inner.lock();
        assert!(inner.loaded);
        inner.tree.iter().collect()
    }

    fn load_wait(&self, inner: &mut MutexGuard<MsInner>) {
        while inner.loading {
            assert!(!inner.loaded);
            self.load_cv.wait(inner);
        }
    }

    fn load_impl(&self, inner: &mut MutexGuard<MsInner>) -> Result<()> {
        assert!(!inner.loaded);
        assert!(!inner.loading);

        inner.loading = true;
        debug!("loading metaslab {} on vdev {}", self.id, self.vdev().id);

        // With no space map yet, the whole metaslab is free.
        let result = match inner.sm.as_ref() {
            Some(sm) => sm.load(),
            None => {
                let mut rt = RangeTree::new();
                rt.add(self.start, self.size);
                Ok(rt)
            }
        };

        inner.loading = false;
        let result = result.map(|rt| {
            inner.tree = rt;
            inner.loaded = true;

            // Deferred frees are not usable yet.
            let MsInner { tree, txgs, .. } = &mut **inner;
            if let Some(txgs) = txgs {
                for defer in txgs.defer.iter() {
                    for (start, size) in defer.iter() {
                        tree.remove(start, size);
                    }
                }
            }
        });
        self.load_cv.notify_all();
        result
    }

    /// Bring the free tree into memory, waiting out any load already in
    /// flight. Fails with an i/o error if the space map cannot be read.
    pub fn load(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.load_wait(&mut inner);
        if inner.loaded {
            return Ok(());
        }
        self.load_impl(&mut inner)
    }

    fn unload_locked(&self, inner: &mut MsInner) {
        inner.tree.vacate(None);
        inner.loaded = false;
    }

    /// Discard the free tree; the on-disk space map remains the source of
    /// truth. Defer and per-txg trees are preserved.
    pub fn unload(&self) {
        let mut inner = self.inner.lock();
        self.unload_locked(&mut inner);
        let mg = self.group();
        mg.sort(self, self.weight() & !METASLAB_ACTIVE_MASK);
    }

    /// Background load on behalf of the group taskq; pushes the unload
    /// clock out so the work is not immediately wasted.
    pub(crate) fn preload(&self, syncing_txg: u64) {
        if let Err(e) = self.load() {
            warn!("preload of metaslab {} failed: {}", self.id, e);
            return;
        }
        let mut inner = self.inner.lock();
        inner.access_txg = syncing_txg + self.cfg.unload_delay + 1;
    }

    fn activate_locked(
        &self,
        inner: &mut MutexGuard<MsInner>,
        activation_weight: u64,
    ) -> Result<()> {
        if self.weight() & METASLAB_ACTIVE_MASK == 0 {
            self.load_wait(inner);
            if !inner.loaded {
                if let Err(e) = self.load_impl(inner) {
                    self.group().sort(self, 0);
                    return Err(e);
                }
            }
            let weight = self.weight();
            self.group().sort(self, weight | activation_weight);
        }
        assert!(inner.loaded);
        assert_ne!(self.weight() & METASLAB_ACTIVE_MASK, 0);
        Ok(())
    }

    /// Load if cold and mark active with the given weight bit.
    pub fn activate(&self, activation_weight: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        self.activate_locked(&mut inner, activation_weight)
    }

    fn passivate_locked(&self, inner: &MsInner, size: u64) {
        // A weight below the minimum block size means we will never
        // allocate from this metaslab again; it had better be empty.
        assert!(size >= SPA_MINBLOCKSIZE || inner.tree.space() == 0);
        self.group().sort(self, self.weight().min(size));
        assert_eq!(self.weight() & METASLAB_ACTIVE_MASK, 0);
    }

    /// Clear the active bits and re-sort by what this metaslab can still
    /// serve.
    pub fn passivate(&self, size: u64) {
        let inner = self.inner.lock();
        self.passivate_locked(&inner, size);
    }

    fn weight_factor(&self, inner: &MsInner) -> u64 {
        let vd = self.vdev();

        // No space map: the whole metaslab is one free run.
        let sm = match inner.sm.as_ref() {
            None => {
                let exp = highbit64(self.size) as u64 - 1;
                let sectors = self.size >> vd.ashift;
                return sectors * exp * vd.ashift as u64;
            }
            Some(sm) => sm,
        };

        let mut factor = 0;
        for (i, &count) in sm.histogram().iter().enumerate() {
            if count == 0 {
                continue;
            }
            let sectors = count << i;
            factor += (i as u64 + sm.shift() as u64) * sectors;
        }
        factor * sm.shift() as u64
    }

    fn compute_weight(&self, inner: &mut MsInner) -> u64 {
        let vd = self.vdev();

        // Baseline is free space, biased toward low-numbered metaslabs:
        // outer tracks have roughly twice the bandwidth of inner ones, so
        // prefer free bandwidth over raw free space.
        let space = self.size - inner.sm.as_ref().map_or(0, |sm| sm.allocated());
        let mut weight = 2 * space - (self.id * space) / vd.ms_count();
        assert_le!(space, weight);
        assert_le!(weight, 2 * space);

        let factor = self.weight_factor(inner);
        inner.factor = factor;
        if self.cfg.weight_factor_enable {
            weight += factor;
        }

        if inner.loaded && !self.ops.fragmented(&inner.tree, self.size, &self.cfg) {
            // Actively-used metaslab with good runs left: keep it sorted
            // above every inactive one so we polish it off.
            weight |= self.weight() & METASLAB_ACTIVE_MASK;
        }
        weight
    }

    fn alloc_block_locked(&self, inner: &mut MsInner, size: u64, txg: Txg) -> Option<u64> {
        assert!(!self.is_condensing());
        assert!(inner.loaded);
        let vd = self.vdev();

        let MsInner {
            tree,
            lbas,
            txgs,
            access_txg,
            ..
        } = inner;

        let start = self.ops.alloc(tree, lbas, self.size, size, &self.cfg)?;

        assert_eq!(p2phase(start, 1 << vd.ashift), 0);
        assert_eq!(p2phase(size, 1 << vd.ashift), 0);
        assert_ge!(tree.space(), size);
        tree.remove(start, size);

        let txgs = txgs.as_mut().expect("allocating before first sync_done");
        let alloc_tree = &mut txgs.alloc[txg.slot()];
        if alloc_tree.is_empty() {
            vd.dirty(self.id, txg);
        }
        alloc_tree.add(start, size);
        *access_txg = txg.0 + self.cfg.unload_delay;

        Some(start)
    }

    /// Delegate to the strategy and record the allocation in this txg's
    /// alloc tree. None when the metaslab cannot satisfy the request.
    pub fn alloc_block(&self, size: u64, txg: Txg) -> Option<u64> {
        let mut inner = self.inner.lock();
        self.alloc_block_locked(&mut inner, size, txg)
    }

    /// The group-walk allocation step: re-verify the candidate now that we
    /// hold its lock, activate it, and try the strategy.
    pub(crate) fn try_alloc(
        &self,
        asize: u64,
        txg: Txg,
        activation_weight: u64,
        was_active: bool,
    ) -> TryAlloc {
        let mut inner = self.inner.lock();

        // Another thread may have changed the weight while we were
        // blocked on the metaslab lock.
        let weight = self.weight();
        if weight < asize
            || (was_active
                && weight & METASLAB_ACTIVE_MASK == 0
                && activation_weight == METASLAB_WEIGHT_PRIMARY)
        {
            return TryAlloc::Retry;
        }

        // Someone made this metaslab their secondary while we wanted it as
        // primary; knock it back and pick again.
        if weight & METASLAB_WEIGHT_SECONDARY != 0
            && activation_weight == METASLAB_WEIGHT_PRIMARY
        {
            self.passivate_locked(&inner, weight & !METASLAB_ACTIVE_MASK);
            return TryAlloc::Retry;
        }

        if self.activate_locked(&mut inner, activation_weight).is_err() {
            return TryAlloc::Retry;
        }

        // Became condensing while we waited; hands off until it commits.
        if self.is_condensing() {
            return TryAlloc::Retry;
        }

        match self.alloc_block_locked(&mut inner, asize, txg) {
            Some(offset) => TryAlloc::Success(offset),
            None => {
                let max_size = inner.tree.max_size();
                self.passivate_locked(&inner, max_size);
                TryAlloc::Retry
            }
        }
    }

    /// Record a free. The normal path defers the space through this txg's
    /// free tree; `now` is the same-txg rewind path, which returns the
    /// range to the free tree immediately.
    pub fn free_block(&self, offset: u64, size: u64, txg: Txg, now: bool) {
        let mut inner = self.inner.lock();
        let vd = self.vdev();
        let MsInner { tree, txgs, .. } = &mut *inner;
        let txgs = txgs.as_mut().expect("freeing before first sync_done");

        if now {
            txgs.alloc[txg.slot()].remove(offset, size);
            assert!(!self.condensing.load(Ordering::Relaxed));
            assert_ge!(offset, self.start);
            assert_le!(offset + size, self.start + self.size);
            assert_eq!(p2phase(offset, 1 << vd.ashift), 0);
            assert_eq!(p2phase(size, 1 << vd.ashift), 0);
            assert_le!(tree.space() + size, self.size);
            tree.add(offset, size);
        } else {
            let free_tree = &mut txgs.free[txg.slot()];
            if free_tree.is_empty() {
                vd.dirty(self.id, txg);
            }
            free_tree.add(offset, size);
        }
    }

    /// Intent-log recovery: mark a range allocated if it is still free.
    /// `txg == 0` is a dry run. On a non-writable pool the range leaves the
    /// free tree but nothing is dirtied or logged.
    pub fn claim_block(&self, offset: u64, size: u64, txg: Txg, writable: bool) -> Result<()> {
        let mut inner = self.inner.lock();

        if (txg.0 != 0 && writable) || !inner.loaded {
            self.activate_locked(&mut inner, METASLAB_WEIGHT_SECONDARY)?;
        }

        if !inner.tree.contains(offset, size) {
            return Err(AllocError::NotFound);
        }
        if txg.0 == 0 {
            return Ok(());
        }

        assert!(!self.is_condensing());
        let vd = self.vdev();
        assert_eq!(p2phase(offset, 1 << vd.ashift), 0);
        assert_eq!(p2phase(size, 1 << vd.ashift), 0);
        inner.tree.remove(offset, size);

        if writable {
            let txgs = inner.txgs.as_mut().unwrap();
            let alloc_tree = &mut txgs.alloc[txg.slot()];
            if alloc_tree.is_empty() {
                vd.dirty(self.id, txg);
            }
            alloc_tree.add(offset, size);
        }
        Ok(())
    }

    /// How far this metaslab sits from a previously-placed replica, in
    /// bytes of metaslab-granular distance. Other devices are infinitely
    /// far away.
    pub(crate) fn distance(&self, dva: &Dva) -> u64 {
        let vd = self.vdev();
        if vd.id.0 != dva.vdev {
            return 1 << 63;
        }
        let offset = dva.offset >> vd.ms_shift;
        let start = self.id;
        if offset < start {
            (start - offset) << vd.ms_shift
        } else {
            (offset - start) << vd.ms_shift
        }
    }

    /// The on-disk log is worth rewriting when the minimal representation
    /// is substantially smaller: the largest free segment must already be
    /// expressible in no more space than the current log, and the log must
    /// exceed condense_pct/100 of one entry per in-core segment.
    fn should_condense(&self, inner: &MsInner) -> bool {
        assert!(inner.loaded);
        let sm = inner.sm.as_ref().unwrap();

        let (_, largest) = match inner.tree.largest() {
            Some(seg) => seg,
            None => return true,
        };

        let sectors = largest >> sm.shift();
        let entries = sectors / sectors.min(SM_RUN_MAX);
        let segsz = entries * sm_entry_size();

        segsz <= sm.length()
            && sm.length()
                >= self.cfg.condense_pct * sm_entry_size() * inner.tree.num_segs() / 100
    }

    /// Rewrite the space map as (everything allocated minus this txg's
    /// frees, deferred frees, and future-txg allocations) followed by the
    /// free tree. The metaslab lock is dropped for the truncate; the
    /// condensing flag keeps allocators away in the meantime.
    fn condense<'a>(
        &'a self,
        mut inner: MutexGuard<'a, MsInner>,
        txg: Txg,
        tx: &Tx,
    ) -> MutexGuard<'a, MsInner> {
        assert!(inner.loaded);
        assert_eq!(tx.sync_pass, 1);

        debug!(
            "condensing: txg {}, metaslab {}, length {}, segments {}",
            txg,
            self.id,
            inner.sm.as_ref().unwrap().length(),
            inner.tree.num_segs()
        );

        let mut condense_tree = RangeTree::new();
        condense_tree.add(self.start, self.size);
        {
            let txgs = inner.txgs.as_ref().unwrap();
            for (start, size) in txgs.free[txg.slot()].iter() {
                condense_tree.remove(start, size);
            }
            for defer in txgs.defer.iter() {
                for (start, size) in defer.iter() {
                    condense_tree.remove(start, size);
                }
            }
            for t in 1..TXG_CONCURRENT_STATES as u64 {
                for (start, size) in txgs.alloc[Txg(txg.0 + t).slot()].iter() {
                    condense_tree.remove(start, size);
                }
            }
        }

        self.condensing.store(true, Ordering::Relaxed);
        let mut sm = inner.sm.take().unwrap();
        drop(inner);

        // The truncate goes to the meta object store without our lock held.
        sm.truncate(tx);

        let mut inner = self.inner.lock();
        assert!(self.is_condensing());
        // Writing the exact allocated set would mean subtracting the whole
        // free tree from condense_tree; a small ALLOC tree followed by the
        // free tree as FREE records is nearly as small and far cheaper.
        sm.write(&condense_tree, SmKind::Alloc, tx);
        sm.write(&inner.tree, SmKind::Free, tx);
        inner.sm = Some(sm);
        self.condensing.store(false, Ordering::Relaxed);
        inner
    }

    /// Write this txg's activity out to the space map.
    pub fn sync(&self, txg: Txg, tx: &Tx) {
        let mg = self.group();
        let vd = mg.vdev().clone();
        let mut inner = self.inner.lock();

        // Just added; nothing can have happened yet.
        if inner.txgs.is_none() {
            return;
        }

        let slot = txg.slot();
        {
            let txgs = inner.txgs.as_ref().unwrap();
            if txgs.alloc[slot].is_empty() && txgs.free[slot].is_empty() {
                return;
            }
        }

        if inner.sm.is_none() {
            inner.sm = Some(SpaceMap::create(
                mg.mos().clone(),
                self.start,
                self.size,
                vd.ashift,
                tx,
            ));
        }

        if inner.loaded && tx.sync_pass == 1 && self.should_condense(&inner) {
            inner = self.condense(inner, txg, tx);
        } else {
            let MsInner { sm, txgs, .. } = &mut *inner;
            let sm = sm.as_mut().unwrap();
            let txgs = txgs.as_mut().unwrap();
            sm.write(&txgs.alloc[slot], SmKind::Alloc, tx);
            sm.write(&txgs.free[slot], SmKind::Free, tx);
        }

        let MsInner {
            sm, txgs, tree, loaded, ..
        } = &mut *inner;
        let sm = sm.as_mut().unwrap();
        let txgs = txgs.as_mut().unwrap();

        txgs.alloc[slot].vacate(None);

        if *loaded {
            // The in-core tree has the accurate picture; rebuild.
            sm.histogram_clear();
            sm.histogram_add(tree);
        } else {
            // Cold: fold in what was freed this txg. Not exact, but close
            // enough for allocation decisions.
            sm.histogram_add(&txgs.free[slot]);
        }

        // On the first pass the clean slot is guaranteed empty, so a swap
        // beats walking the tree.
        let clean = txg.clean_slot();
        if tx.sync_pass == 1 {
            assert!(txgs.free[clean].is_empty());
            txgs.free.swap(slot, clean);
        } else {
            let (from, to) = two_mut(&mut txgs.free, slot, clean);
            from.vacate(Some(to));
        }

        assert!(txgs.alloc[slot].is_empty());
        assert!(txgs.free[slot].is_empty());
    }

    /// Post-commit promotion: freed space moves into the defer wheel, the
    /// displaced defer slot rejoins the free tree, and the weight is
    /// recomputed.
    pub fn sync_done(&self, txg: Txg) {
        let mg = self.group();
        let vd = mg.vdev().clone();
        let mut inner = self.inner.lock();

        // First sync_done: this metaslab's space comes online now.
        if inner.txgs.is_none() {
            inner.txgs = Some(Box::new(TxgTrees::default()));
            vd.space_update(0, 0, self.size as i64);
        }

        let clean = txg.clean_slot();
        let defer_slot = txg.defer_slot();

        let alloc_delta = inner.sm.as_ref().map_or(0, |sm| sm.alloc_delta());
        let defer_delta = {
            let txgs = inner.txgs.as_ref().unwrap();
            assert!(txgs.alloc[txg.slot()].is_empty());
            assert!(txgs.free[txg.slot()].is_empty());
            txgs.free[clean].space() as i64 - txgs.defer[defer_slot].space() as i64
        };
        vd.space_update(alloc_delta + defer_delta, defer_delta, 0);

        // A load may be mid-flight; get a consistent view before touching
        // the free tree.
        self.load_wait(&mut inner);

        {
            let MsInner { tree, txgs, loaded, .. } = &mut *inner;
            let txgs = txgs.as_mut().unwrap();
            let defer = &mut txgs.defer[defer_slot];
            defer.vacate(if *loaded { Some(tree) } else { None });
            std::mem::swap(&mut txgs.free[clean], &mut txgs.defer[defer_slot]);
        }

        if let Some(sm) = inner.sm.as_mut() {
            sm.update();
        }
        self.allocated.store(
            inner.sm.as_ref().map_or(0, |sm| sm.allocated()),
            Ordering::Relaxed,
        );

        inner.deferspace += defer_delta;
        assert_ge!(inner.deferspace, 0);
        assert_le!(inner.deferspace, self.size as i64);
        if inner.deferspace != 0 {
            // Keep syncing until all deferred frees are back in circulation.
            vd.dirty(self.id, txg.next());
        }

        if inner.loaded && inner.access_txg < txg.0 {
            for t in 1..TXG_CONCURRENT_STATES as u64 {
                assert!(inner.txgs.as_ref().unwrap().alloc[Txg(txg.0 + t).slot()].is_empty());
            }
            if !self.cfg.debug_unload {
                self.unload_locked(&mut inner);
            }
        }

        let weight = self.compute_weight(&mut inner);
        mg.sort(self, weight);
    }

    /// Tear down at device removal. The caller has stopped all traffic.
    pub(crate) fn fini(&self) {
        let mg = self.group();
        mg.remove(self);

        let mut inner = self.inner.lock();
        let vd = mg.vdev().clone();
        let allocated = inner.sm.as_ref().map_or(0, |sm| sm.allocated());
        vd.space_update(-(allocated as i64), 0, -(self.size as i64));
        self.unload_locked(&mut inner);
        assert_eq!(inner.deferspace, 0);
    }

    /// Conservation check, valid at quiescent points (after sync_done):
    /// every byte is exactly one of free, in-flight, deferred, or
    /// allocated on disk.
    pub fn verify_space(&self) {
        let inner = self.inner.lock();
        if !inner.loaded {
            return;
        }
        let txgs = match inner.txgs.as_ref() {
            Some(txgs) => txgs,
            None => return,
        };
        let allocs: u64 = txgs.alloc.iter().map(|t| t.space()).sum();
        let frees: u64 = txgs.free.iter().map(|t| t.space()).sum();
        let defers: u64 = txgs.defer.iter().map(|t| t.space()).sum();
        let allocated = inner.sm.as_ref().map_or(0, |sm| sm.allocated());
        assert_eq!(
            inner.tree.space() + allocs + frees + defers + allocated,
            self.size
        );
    }

    /// Panic if any part of the range is free or pending free; catches
    /// double frees before they hit a tree assertion later.
    pub fn verify_not_free(&self, offset: u64, size: u64) {
        let inner = self.inner.lock();
        if inner.loaded {
            inner.tree.verify_absent(offset, size);
        }
        if let Some(txgs) = inner.txgs.as_ref() {
            for tree in txgs.free.iter() {
                tree.verify_absent(offset, size);
            }
            for tree in txgs.defer.iter() {
                tree.verify_absent(offset, size);
            }
        }
    }
}

fn two_mut<T>(slice: &mut [T], i: usize, j: usize) -> (&mut T, &mut T) {
    assert_ne!(i, j);
    if i < j {
        let (a, b) = slice.split_at_mut(j);
        (&mut a[i], &mut b[0])
    } else {
        let (a, b) = slice.split_at_mut(i);
        (&mut b[0], &mut a[j])
    }
}
