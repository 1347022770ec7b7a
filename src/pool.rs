use crate::base_types::*;
use crate::class::{ClassKind, MetaslabClass};
use crate::config::AllocConfig;
use crate::error::{AllocError, Result};
use crate::group::MetaslabGroup;
use crate::metaslab::Metaslab;
use crate::mos::{MetaObjectStore, Tx};
use crate::strategy::AllocStrategy;
use crate::vdev::{Vdev, VdevState};
use bitflags::bitflags;
use log::*;
use more_asserts::*;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

bitflags! {
    pub struct AllocFlags: u32 {
        const GANG_HEADER = 1 << 0;
        const GANG_CHILD = 1 << 1;
        const GANG_AVOID = 1 << 2;
        const HINTBP_FAVOR = 1 << 3;
        const HINTBP_AVOID = 1 << 4;
    }
}

/// Gang-related requests must not take the fast-gang shortcut; they need an
/// exhaustive search before giving up.
fn can_fastgang(flags: AllocFlags) -> bool {
    !flags.intersects(AllocFlags::GANG_HEADER | AllocFlags::GANG_CHILD | AllocFlags::GANG_AVOID)
}

/// The allocator's top level: devices, their groups, and the three
/// allocation classes. The transactional block layer above calls `alloc`,
/// `free`, and `claim`; the syncing context drives `sync`.
pub struct Pool {
    cfg: Arc<AllocConfig>,
    mos: Arc<MetaObjectStore>,

    normal: Arc<MetaslabClass>,
    log: Arc<MetaslabClass>,
    dedup: Arc<MetaslabClass>,

    vdevs: RwLock<BTreeMap<u32, Arc<Vdev>>>,
    syncing_txg: AtomicU64,
    writable: AtomicBool,
    shutting_down: AtomicBool,
}

impl Pool {
    pub fn create(cfg: AllocConfig) -> Arc<Pool> {
        Pool::create_with_ops(cfg, AllocStrategy::default())
    }

    pub fn create_with_ops(cfg: AllocConfig, ops: AllocStrategy) -> Arc<Pool> {
        Arc::new(Pool {
            cfg: Arc::new(cfg),
            mos: Arc::new(MetaObjectStore::new()),
            normal: MetaslabClass::new(ClassKind::Normal, ops),
            log: MetaslabClass::new(ClassKind::Log, ops),
            dedup: MetaslabClass::new(ClassKind::Dedup, ops),
            vdevs: RwLock::new(BTreeMap::new()),
            syncing_txg: AtomicU64::new(0),
            writable: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn cfg(&self) -> &Arc<AllocConfig> {
        &self.cfg
    }

    pub fn mos(&self) -> &Arc<MetaObjectStore> {
        &self.mos
    }

    pub fn class(&self, kind: ClassKind) -> &Arc<MetaslabClass> {
        match kind {
            ClassKind::Normal => &self.normal,
            ClassKind::Log => &self.log,
            ClassKind::Dedup => &self.dedup,
        }
    }

    pub fn vdev(&self, id: VdevId) -> Option<Arc<Vdev>> {
        self.vdevs.read().get(&id.0).cloned()
    }

    pub fn writable(&self) -> bool {
        self.writable.load(Ordering::Relaxed)
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Relaxed);
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    pub fn syncing_txg(&self) -> Txg {
        Txg(self.syncing_txg.load(Ordering::Relaxed))
    }

    /// Bring a device into a class: carve it into metaslabs and link its
    /// group into the rotor.
    pub fn add_vdev(
        &self,
        kind: ClassKind,
        asize: u64,
        ashift: u32,
        ms_shift: u32,
        txg: Txg,
    ) -> Result<Arc<Vdev>> {
        let id = {
            let mut vdevs = self.vdevs.write();
            let id = vdevs.keys().next_back().map_or(0, |id| id + 1);
            let vd = Vdev::new(VdevId(id), asize, ashift, ms_shift);
            vdevs.insert(id, vd);
            id
        };
        let vd = self.vdev(VdevId(id)).unwrap();

        let class = self.class(kind).clone();
        let mg = MetaslabGroup::new(&class, vd.clone(), self.mos.clone(), self.cfg.clone());

        let ms_count = asize >> ms_shift;
        assert_gt!(ms_count, 0);
        info!(
            "vdev {}: {} metaslabs of {} bytes each",
            vd.id,
            ms_count,
            1u64 << ms_shift
        );
        for ms_id in 0..ms_count {
            Metaslab::new(&mg, ms_id, 0, txg)?;
        }

        mg.activate();
        Ok(vd)
    }

    /// Grow a device; the new metaslabs come online once `txg` syncs.
    pub fn expand_vdev(&self, id: VdevId, new_asize: u64, txg: Txg) -> Result<()> {
        let vd = self
            .vdev(id)
            .ok_or_else(|| AllocError::Invalid(format!("vdev {} does not exist", id)))?;
        assert_ge!(new_asize, vd.asize());
        vd.expand(new_asize);
        let mg = vd.group();
        for ms_id in vd.ms_count()..(new_asize >> vd.ms_shift) {
            Metaslab::new(&mg, ms_id, 0, txg)?;
        }
        Ok(())
    }

    /// Retire a device. Its metaslabs must hold no deferred frees.
    pub fn remove_vdev(&self, id: VdevId) -> Result<()> {
        let vd = self
            .vdevs
            .write()
            .remove(&id.0)
            .ok_or_else(|| AllocError::Invalid(format!("vdev {} does not exist", id)))?;
        let mg = vd.group();
        mg.passivate();
        for msp in mg.metaslabs() {
            msp.fini();
        }
        vd.clear_metaslabs();
        info!("removed vdev {}", id);
        Ok(())
    }

    /// Allocate `ndvas` replicas of a `psize`-byte block. On failure no
    /// state changes: already-placed replicas are freed back immediately.
    /// The caller sets the birth txgs on the returned block pointer.
    pub fn alloc(
        &self,
        kind: ClassKind,
        psize: u64,
        ndvas: usize,
        txg: Txg,
        hintbp: Option<&BlockPtr>,
        flags: AllocFlags,
    ) -> Result<BlockPtr> {
        let class = self.class(kind);

        assert!(ndvas > 0 && ndvas <= SPA_DVAS_PER_BP);
        if let Some(hbp) = hintbp {
            assert_le!(ndvas, hbp.ndvas());
        }

        // No vdevs in this class.
        if class.rotor_slot() == usize::MAX {
            return Err(AllocError::NoSpace);
        }

        let mut bp = BlockPtr::default();
        for d in 0..ndvas {
            if let Err(e) = self.alloc_dva(class, psize, &mut bp.dvas, d, hintbp, txg, flags) {
                for unwind in (0..d).rev() {
                    self.free_dva(&bp.dvas[unwind], txg, true)
                        .expect("unwinding freshly placed replica");
                    bp.dvas[unwind].clear();
                }
                return Err(e);
            }
        }
        assert_eq!(bp.ndvas(), ndvas);
        Ok(bp)
    }

    fn alloc_dva(
        &self,
        class: &Arc<MetaslabClass>,
        psize: u64,
        dvas: &mut [Dva; SPA_DVAS_PER_BP],
        d: usize,
        hintbp: Option<&BlockPtr>,
        txg: Txg,
        flags: AllocFlags,
    ) -> Result<()> {
        assert!(!dvas[d].is_valid());

        // Test feature: make some oversized writes gang on purpose so the
        // split path stays exercised.
        if psize >= self.cfg.gang_bang && rand::thread_rng().gen_range(0..4) == 0 {
            return Err(AllocError::NoSpace);
        }

        let list = class.rotor_list();

        // Starting group: hinted vdev (or its successor when avoiding it),
        // the group after the previous replica's, or the class rotor. Hints
        // into the wrong class or a passivated group fall back to the rotor.
        let mut start_slot = usize::MAX;
        if let Some(hbp) = hintbp {
            if let Some(vd) = self.vdev(VdevId(hbp.dvas[d].vdev)) {
                let mg = vd.group();
                if Arc::ptr_eq(&mg.class(), class) && mg.activation_count() > 0 {
                    start_slot = mg.rotor_slot();
                    if start_slot != usize::MAX && flags.contains(AllocFlags::HINTBP_AVOID) {
                        start_slot = list.next(start_slot);
                    }
                }
            }
        } else if d != 0 {
            let vd = self
                .vdev(VdevId(dvas[d - 1].vdev))
                .expect("previous replica names a live vdev");
            let mg = vd.group();
            if Arc::ptr_eq(&mg.class(), class) && mg.rotor_slot() != usize::MAX {
                start_slot = list.next(mg.rotor_slot());
            }
        }
        if start_slot == usize::MAX {
            start_slot = class.rotor_slot();
        }
        if start_slot == usize::MAX {
            return Err(AllocError::NoSpace);
        }

        let rotor_start = start_slot;
        let mut dshift: u32 = 3;
        let mut allow_degraded = false;

        loop {
            let mut all_zero = true;
            let mut health_skipped = false;
            let mut slot = rotor_start;

            loop {
                let mg = list.group(slot).clone();
                let vd = mg.vdev().clone();

                let mut allocatable = vd.allocatable();

                // Below-threshold groups are skipped unless the request is
                // gang-sized; suspending the pool over an avoidable ENOSPC
                // would be worse than imbalance.
                if allocatable && can_fastgang(flags) && psize > SPA_GANGBLOCKSIZE {
                    allocatable = mg.allocatable();
                }

                let mut skip = !allocatable;

                // Keep single-copy data off failing devices on the first
                // pass, unless degraded writes are permitted.
                if !skip
                    && (vd.write_errors() > 0 || vd.state() < VdevState::Healthy)
                    && d == 0
                    && dshift == 3
                    && !((allow_degraded || self.cfg.write_to_degraded)
                        && vd.state() == VdevState::Degraded)
                {
                    health_skipped = true;
                    all_zero = false;
                    skip = true;
                }

                if !skip {
                    let mut distance = vd.asize() >> dshift;
                    if distance <= (1u64 << vd.ms_shift) {
                        distance = 0;
                    } else {
                        all_zero = false;
                    }

                    let asize = vd.psize_to_asize(psize);
                    assert_eq!(p2phase(asize, 1 << vd.ashift), 0);

                    if let Some(offset) =
                        mg.group_alloc(psize, asize, txg, distance, &dvas[..d])
                    {
                        // First allocation since this group was selected:
                        // bias the aliquot by how over- or under-used the
                        // device is relative to the class.
                        if class.aliquot() == 0 {
                            let vd_used = (vd.allocated() * 100 / (vd.space() + 1)) as i64;
                            let class_used =
                                (class.get_alloc() * 100 / (class.get_space() + 1)) as i64;
                            mg.set_bias((class_used - vd_used) * mg.aliquot() as i64 / 100);
                        }

                        if class.add_aliquot(asize)
                            >= (mg.aliquot() as i64 + mg.bias()) as u64
                        {
                            class.set_rotor(list.next(slot));
                            class.reset_aliquot();
                        }

                        dvas[d] = Dva {
                            vdev: vd.id.0,
                            offset,
                            asize,
                            gang: flags.contains(AllocFlags::GANG_HEADER),
                        };
                        return Ok(());
                    }
                }

                class.set_rotor(list.next(slot));
                class.reset_aliquot();
                slot = list.next(slot);
                if slot == rotor_start {
                    break;
                }
            }

            // Device health disqualified a group; retry once accepting
            // degraded devices before relaxing anything else.
            if health_skipped && !allow_degraded {
                dshift = 3;
                allow_degraded = true;
                continue;
            }

            // Some group still had distance to give up; halve the spread
            // requirement and go around again.
            if !all_zero {
                dshift += 1;
                assert_lt!(dshift, 64);
                continue;
            }

            dvas[d].clear();
            return Err(AllocError::NoSpace);
        }
    }

    fn dva_metaslab(&self, dva: &Dva) -> Result<(Arc<Vdev>, Arc<Metaslab>)> {
        let vd = self.vdev(VdevId(dva.vdev)).ok_or_else(|| {
            warn!("bad DVA {}:{:#x}", dva.vdev, dva.offset);
            AllocError::Invalid(format!("vdev {} does not exist", dva.vdev))
        })?;
        let msp = vd.metaslab(dva.offset >> vd.ms_shift).ok_or_else(|| {
            warn!("bad DVA {}:{:#x}", dva.vdev, dva.offset);
            AllocError::Invalid(format!(
                "offset {:#x} is beyond vdev {}",
                dva.offset, dva.vdev
            ))
        })?;
        Ok((vd, msp))
    }

    fn dva_size(vd: &Vdev, dva: &Dva) -> u64 {
        if dva.gang {
            vd.psize_to_asize(SPA_GANGBLOCKSIZE)
        } else {
            dva.asize
        }
    }

    /// Free a block. The normal path holds the space in this txg's free
    /// tree until the defer delay expires; `now` returns it immediately
    /// (same-txg rewind only).
    pub fn free(&self, bp: &BlockPtr, txg: Txg, now: bool) -> Result<()> {
        assert!(!bp.is_hole());
        if self.cfg.debug_check_free {
            self.check_free(bp);
        }
        for dva in bp.dvas.iter().filter(|dva| dva.is_valid()) {
            self.free_dva(dva, txg, now)?;
        }
        Ok(())
    }

    fn free_dva(&self, dva: &Dva, txg: Txg, now: bool) -> Result<()> {
        let (vd, msp) = self.dva_metaslab(dva)?;
        msp.free_block(dva.offset, Pool::dva_size(&vd, dva), txg, now);
        Ok(())
    }

    /// Intent-log recovery: re-mark every DVA of `bp` as allocated. A dry
    /// run across all DVAs goes first so partial failures never need
    /// unwinding; `txg == 0` performs only the dry run.
    pub fn claim(&self, bp: &BlockPtr, txg: Txg) -> Result<()> {
        assert!(!bp.is_hole());
        if txg.0 != 0 {
            self.claim_impl(bp, Txg(0))?;
        }
        self.claim_impl(bp, txg)
    }

    fn claim_impl(&self, bp: &BlockPtr, txg: Txg) -> Result<()> {
        for dva in bp.dvas.iter().filter(|dva| dva.is_valid()) {
            let (vd, msp) = self.dva_metaslab(dva)?;
            msp.claim_block(dva.offset, Pool::dva_size(&vd, dva), txg, self.writable())?;
        }
        Ok(())
    }

    /// Verify none of `bp`'s ranges are already free or pending free.
    pub fn check_free(&self, bp: &BlockPtr) {
        for dva in bp.dvas.iter().filter(|dva| dva.is_valid()) {
            if let Ok((vd, msp)) = self.dva_metaslab(dva) {
                msp.verify_not_free(dva.offset, Pool::dva_size(&vd, dva));
            }
        }
    }

    /// Sync one txg: write out every dirty metaslab, promote the committed
    /// frees, and reassess the groups. Stands in for the syncing context.
    pub fn sync(&self, txg: Txg) {
        self.syncing_txg.store(txg.0, Ordering::Relaxed);
        let tx = Tx::assigned(txg, 1);
        let vdevs: Vec<Arc<Vdev>> = self.vdevs.read().values().cloned().collect();

        for vd in &vdevs {
            let dirty = vd.take_dirty(txg);
            if !dirty.is_empty() {
                debug!(
                    "txg {}: syncing {} metaslabs on vdev {}",
                    txg,
                    dirty.len(),
                    vd.id
                );
            }
            for ms_id in &dirty {
                vd.metaslab(*ms_id).unwrap().sync(txg, &tx);
            }
            for ms_id in &dirty {
                vd.metaslab(*ms_id).unwrap().sync_done(txg);
            }
        }

        let shutting_down = self.shutting_down.load(Ordering::Relaxed);
        for vd in &vdevs {
            vd.group().sync_reassess(txg.0, shutting_down);
        }
    }
}
