//! Sync-path behavior: space-map write-out, the defer window, condense,
//! unload, preload, and space conservation under a random workload.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Once;
use std::time::Duration;
use zettaslab::base_types::*;
use zettaslab::space_map::sm_entry_size;
use zettaslab::{AllocConfig, AllocError, AllocFlags, ClassKind, Pool};

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| zettaslab::init::setup_logging(0, None));
}

fn quiet_config() -> AllocConfig {
    AllocConfig {
        preload_enabled: false,
        ..AllocConfig::default()
    }
}

const MIB: u64 = 1024 * 1024;

fn alloc_one(pool: &Pool, psize: u64, txg: Txg) -> BlockPtr {
    pool.alloc(ClassKind::Normal, psize, 1, txg, None, AllocFlags::empty())
        .unwrap()
}

#[test]
fn churn_triggers_condense_and_reload_matches() {
    init_logging();
    let pool = Pool::create(quiet_config());
    let vd = pool
        .add_vdev(ClassKind::Normal, MIB, 9, 20, Txg(0))
        .unwrap();
    let msp = vd.metaslab(0).unwrap();
    let entry = sm_entry_size();

    // txg 4: one allocation, one ALLOC record
    let a = alloc_one(&pool, 16 * 1024, Txg(4));
    pool.sync(Txg(4));
    assert_eq!(msp.space_map_length(), entry);

    // txg 5: free a, allocate b; the log grows to three records, still
    // under the condense threshold (two entries' worth per segment)
    pool.free(&a, Txg(5), false).unwrap();
    let b = alloc_one(&pool, 16 * 1024, Txg(5));
    pool.sync(Txg(5));
    let len_before = msp.space_map_length();
    assert_eq!(len_before, 3 * entry);

    // txg 6: more churn pushes the log past its minimal form; this sync
    // must rewrite it as one ALLOC run plus one FREE run
    pool.free(&b, Txg(6), false).unwrap();
    let c = alloc_one(&pool, 16 * 1024, Txg(6));
    pool.sync(Txg(6));
    let len_after = msp.space_map_length();
    assert!(len_after < len_before, "{} >= {}", len_after, len_before);
    assert_eq!(len_after, 2 * entry);

    // drain the deferred frees of a and b
    pool.sync(Txg(7));
    pool.sync(Txg(8));
    msp.verify_space();
    assert_eq!(msp.free_space(), MIB - 16 * 1024);

    // the on-disk form reproduces the in-core tree exactly
    let extents_before = msp.free_extents();
    msp.unload();
    msp.load().unwrap();
    assert_eq!(msp.free_extents(), extents_before);
    assert_eq!(c.dvas[0].offset, 32 * 1024);
}

#[test]
fn frees_wait_out_the_defer_window() {
    init_logging();
    let pool = Pool::create(quiet_config());
    let vd = pool
        .add_vdev(ClassKind::Normal, MIB, 9, 20, Txg(0))
        .unwrap();
    let msp = vd.metaslab(0).unwrap();

    let bp = alloc_one(&pool, 64 * 1024, Txg(4));
    pool.sync(Txg(4));

    pool.free(&bp, Txg(5), false).unwrap();

    // the freed range is out of the free tree and pending
    pool.sync(Txg(5));
    assert_eq!(msp.free_space(), MIB - 64 * 1024);
    assert_eq!(msp.defer_space(), 64 * 1024);

    pool.sync(Txg(6));
    assert_eq!(msp.free_space(), MIB - 64 * 1024);

    // after TXG_DEFER_SIZE sync-dones the space is usable again
    pool.sync(Txg(7));
    assert_eq!(msp.free_space(), MIB);
    assert_eq!(msp.defer_space(), 0);
    msp.verify_space();

    // and an allocation can actually take it
    let bp2 = alloc_one(&pool, MIB.min(128 * 1024), Txg(8));
    assert!(bp2.dvas[0].is_valid());
}

#[test]
fn idle_metaslabs_unload_and_reload_identically() {
    init_logging();
    let pool = Pool::create(quiet_config());
    let vd = pool
        .add_vdev(ClassKind::Normal, MIB, 9, 20, Txg(0))
        .unwrap();
    let msp = vd.metaslab(0).unwrap();

    let keep = alloc_one(&pool, 32 * 1024, Txg(4));
    let drop_me = alloc_one(&pool, 32 * 1024, Txg(4));
    assert_eq!(keep.dvas[0].offset, 0);
    assert_eq!(drop_me.dvas[0].offset, 32 * 1024);
    pool.sync(Txg(4));
    assert!(msp.is_loaded());

    // nothing touches the metaslab until well past the unload delay; the
    // free at txg 13 dirties it and that sync_done drops the tree
    pool.free(&drop_me, Txg(13), false).unwrap();
    pool.sync(Txg(13));
    assert!(!msp.is_loaded());

    // the deferred free drains while unloaded
    pool.sync(Txg(14));
    pool.sync(Txg(15));

    // reload: everything but `keep` is one free run again
    msp.load().unwrap();
    assert_eq!(msp.free_space(), MIB - 32 * 1024);
    assert_eq!(msp.free_extents(), vec![(32 * 1024, MIB - 32 * 1024)]);
    msp.verify_space();
}

#[test]
fn debug_unload_pins_metaslabs() {
    init_logging();
    let cfg = AllocConfig {
        debug_unload: true,
        ..quiet_config()
    };
    let pool = Pool::create(cfg);
    let vd = pool
        .add_vdev(ClassKind::Normal, MIB, 9, 20, Txg(0))
        .unwrap();
    let msp = vd.metaslab(0).unwrap();

    let bp = alloc_one(&pool, 32 * 1024, Txg(4));
    pool.sync(Txg(4));
    pool.free(&bp, Txg(13), false).unwrap();
    pool.sync(Txg(13));
    assert!(msp.is_loaded());
}

#[test]
fn preload_warms_metaslabs_in_the_background() {
    init_logging();
    // preload on: after a sync the heaviest metaslabs get loaded by the
    // group taskq
    let pool = Pool::create(AllocConfig::default());
    let vd = pool
        .add_vdev(ClassKind::Normal, 4 * MIB, 9, 20, Txg(0))
        .unwrap();

    alloc_one(&pool, 32 * 1024, Txg(4));
    pool.sync(Txg(4));

    let mg = vd.group();
    let mut loaded = 0;
    for _ in 0..500 {
        loaded = mg.metaslabs().iter().filter(|m| m.is_loaded()).count();
        if loaded >= 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(loaded >= 2, "only {} metaslabs loaded", loaded);
}

#[test]
fn corrupted_space_map_fails_load() {
    init_logging();
    let pool = Pool::create(quiet_config());
    let vd = pool
        .add_vdev(ClassKind::Normal, MIB, 9, 20, Txg(0))
        .unwrap();
    let msp = vd.metaslab(0).unwrap();

    alloc_one(&pool, 16 * 1024, Txg(4));
    pool.sync(Txg(4));
    msp.unload();

    pool.mos().append_raw(msp.space_map_object(), b"scribble");
    match msp.load() {
        Err(AllocError::Io(_)) => {}
        Ok(()) => panic!("load of corrupted space map succeeded"),
        Err(other) => panic!("expected Io, got {:?}", other),
    }
    assert!(!msp.is_loaded());
}

#[test]
fn conservation_under_random_churn() {
    init_logging();
    let pool = Pool::create(quiet_config());
    let vd = pool
        .add_vdev(ClassKind::Normal, 4 * MIB, 9, 20, Txg(0))
        .unwrap();
    let mg = vd.group();

    let mut rng = StdRng::seed_from_u64(42);
    let mut live: Vec<(BlockPtr, u64)> = Vec::new();

    for t in 4..24u64 {
        let txg = Txg(t);

        for _ in 0..rng.gen_range(1..8) {
            let psize = 512 * rng.gen_range(1u64..65);
            match pool.alloc(ClassKind::Normal, psize, 1, txg, None, AllocFlags::empty()) {
                Ok(bp) => live.push((bp, t)),
                Err(AllocError::NoSpace) => {}
                Err(e) => panic!("alloc failed: {:?}", e),
            }
        }

        // free ~30% of the blocks born in earlier txgs
        let mut i = 0;
        while i < live.len() {
            if live[i].1 < t && rng.gen_bool(0.3) {
                let (bp, _) = live.swap_remove(i);
                pool.free(&bp, txg, false).unwrap();
            } else {
                i += 1;
            }
        }

        pool.sync(txg);
        for msp in mg.metaslabs() {
            msp.verify_space();
        }
    }

    // drain all deferred frees
    for t in 24..28u64 {
        pool.sync(Txg(t));
    }

    let outstanding: u64 = live.iter().map(|(bp, _)| bp.dvas[0].asize).sum();
    assert_eq!(vd.allocated(), outstanding);
    assert_eq!(pool.class(ClassKind::Normal).get_alloc(), outstanding);
    assert_eq!(pool.class(ClassKind::Normal).get_deferred(), 0);
    assert_eq!(pool.class(ClassKind::Normal).get_space(), 4 * MIB);

    for msp in mg.metaslabs() {
        msp.verify_space();
        if msp.is_loaded() {
            let before = msp.free_extents();
            msp.unload();
            msp.load().unwrap();
            assert_eq!(msp.free_extents(), before);
        }
    }
}
