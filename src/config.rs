use crate::base_types::*;

/// Pool-wide allocator tuning. Constructed once at pool open and read by
/// reference afterwards; none of these are meant to change at steady state.
#[derive(Debug, Clone)]
pub struct AllocConfig {
    /// Bytes the rotor tries to allocate from one group before moving on.
    pub aliquot: u64,

    /// Sizes at or above this sometimes fail on purpose to force gang
    /// blocks; a fragmentation-resilience test feature.
    pub gang_bang: u64,

    /// How much larger the on-disk space map must be than its minimal form
    /// before a sync condenses it, in percent.
    pub condense_pct: u64,

    /// Free-capacity percentage below which a group stops taking
    /// allocations, as long as some other group in the class is above it.
    pub mg_noalloc_threshold: u64,

    /// Load every metaslab with a space map at init, to verify frees.
    pub debug_load: bool,
    /// Never unload metaslabs.
    pub debug_unload: bool,
    /// Verify ranges against free/defer trees before every free.
    pub debug_check_free: bool,

    /// Once a metaslab's largest run drops below this, dynamic-fit switches
    /// from first-fit to best-fit.
    pub df_alloc_threshold: u64,
    /// Same switch, but on percent free.
    pub df_free_pct: u64,

    /// A metaslab counts as fragmented for cursor-fit once its largest run
    /// is below this.
    pub min_alloc_size: u64,

    /// Txgs a loaded metaslab may sit idle before its free tree is dropped.
    pub unload_delay: u64,

    /// Top-weighted metaslabs per group scheduled for background load after
    /// each sync.
    pub preload_limit: usize,
    pub preload_enabled: bool,
    /// Workers in each group's preload taskq.
    pub preload_taskq_threads: usize,

    /// New-dynamic-fit looks for runs up to 2^(highbit(size)+clump_shift).
    pub ndf_clump_shift: u32,

    /// Add the space-map histogram bonus to metaslab weights. Off by
    /// default; the bonus needs more investigation before it earns its keep.
    pub weight_factor_enable: bool,

    /// Permit single-copy writes to degraded devices.
    pub write_to_degraded: bool,
}

impl Default for AllocConfig {
    fn default() -> AllocConfig {
        AllocConfig {
            aliquot: 512 * 1024,
            gang_bang: SPA_MAXBLOCKSIZE + 1,
            condense_pct: 200,
            mg_noalloc_threshold: 0,
            debug_load: false,
            debug_unload: false,
            debug_check_free: false,
            df_alloc_threshold: SPA_MAXBLOCKSIZE,
            df_free_pct: 4,
            min_alloc_size: 10 * 1024 * 1024,
            unload_delay: TXG_SIZE as u64 * 2,
            preload_limit: SPA_DVAS_PER_BP,
            preload_enabled: true,
            preload_taskq_threads: 2,
            ndf_clump_shift: 4,
            weight_factor_enable: false,
            write_to_degraded: false,
        }
    }
}
