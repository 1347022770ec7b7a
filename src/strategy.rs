use crate::base_types::{highbit64, p2roundup};
use crate::config::AllocConfig;
use crate::range_tree::RangeTree;
use more_asserts::*;

/// Per-size-bucket allocation cursors; one per power of two.
pub const MAX_LBAS: usize = 64;

/// In-metaslab placement policy. The cursor state lives in the metaslab
/// (`lbas`); the strategy is pure policy and can be swapped per class.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocStrategy {
    /// Scan the offset tree from a per-alignment cursor; first fit wins.
    FirstFit,
    /// First-fit until space runs low, then best-fit from the size tree.
    DynamicFit,
    /// Chew through the largest extent sequentially, then pick the next.
    CursorFit,
    /// Cursor over the offset tree with a clump-sized fallback to the size
    /// tree.
    NewDynamicFit,
}

impl Default for AllocStrategy {
    fn default() -> AllocStrategy {
        AllocStrategy::DynamicFit
    }
}

/// Walk `rt` in offset order starting at `*cursor`; return the first extent
/// whose aligned start still fits `size`, advancing the cursor past the
/// allocation. One wraparound retry from offset 0 before giving up.
fn block_picker(rt: &RangeTree, cursor: &mut u64, size: u64, align: u64) -> Option<u64> {
    for (seg_start, seg_size) in rt.iter_from(*cursor) {
        let offset = p2roundup(seg_start, align);
        if offset + size <= seg_start + seg_size {
            *cursor = offset + size;
            return Some(offset);
        }
    }

    // Searched from the beginning already; there is nothing to find.
    if *cursor == 0 {
        return None;
    }
    *cursor = 0;
    block_picker(rt, cursor, size, align)
}

fn ff_alloc(rt: &RangeTree, lbas: &mut [u64; MAX_LBAS], size: u64) -> Option<u64> {
    // Largest power of two dividing the size: allocations of similar
    // alignment share a cursor and therefore a region of the metaslab.
    let align = size & size.wrapping_neg();
    let cursor = &mut lbas[highbit64(align) as usize - 1];
    block_picker(rt, cursor, size, align)
}

fn df_alloc(
    rt: &RangeTree,
    lbas: &mut [u64; MAX_LBAS],
    ms_size: u64,
    size: u64,
    cfg: &AllocConfig,
) -> Option<u64> {
    let align = size & size.wrapping_neg();
    let cursor = &mut lbas[highbit64(align) as usize - 1];
    let max_size = rt.max_size();
    let free_pct = rt.space() * 100 / ms_size;

    if max_size < size {
        return None;
    }

    // Low on space or out of big runs: abandon the cursor and take the
    // smallest extent that still fits.
    if max_size < cfg.df_alloc_threshold || free_pct < cfg.df_free_pct {
        *cursor = 0;
        let (start, _) = rt.smallest_at_least(size)?;
        *cursor = start + size;
        return Some(start);
    }

    block_picker(rt, cursor, size, 1)
}

fn cf_alloc(rt: &RangeTree, lbas: &mut [u64; MAX_LBAS], size: u64) -> Option<u64> {
    let (head, tail) = lbas.split_at_mut(1);
    let cursor = &mut head[0];
    let cursor_end = &mut tail[0];
    assert_ge!(*cursor_end, *cursor);

    if *cursor + size > *cursor_end {
        let (start, seg_size) = match rt.largest() {
            Some(seg) => seg,
            None => return None,
        };
        if seg_size < size {
            return None;
        }
        *cursor = start;
        *cursor_end = start + seg_size;
    }

    let offset = *cursor;
    *cursor += size;
    Some(offset)
}

fn ndf_alloc(
    rt: &RangeTree,
    lbas: &mut [u64; MAX_LBAS],
    size: u64,
    cfg: &AllocConfig,
) -> Option<u64> {
    let hbit = highbit64(size);
    let cursor = &mut lbas[hbit as usize - 1];
    let max_size = rt.max_size();

    if max_size < size {
        return None;
    }

    let mut seg = rt.seg_overlapping(*cursor, *cursor + size);
    if seg.map_or(true, |(_, seg_size)| seg_size < size) {
        let clump = 1u64
            .checked_shl(hbit + cfg.ndf_clump_shift)
            .unwrap_or(u64::MAX);
        seg = rt.smallest_at_least(max_size.min(clump));
        assert!(seg.is_some());
    }

    let (start, seg_size) = seg.unwrap();
    if seg_size >= size {
        *cursor = start + size;
        Some(start)
    } else {
        None
    }
}

fn df_fragmented(rt: &RangeTree, ms_size: u64, cfg: &AllocConfig) -> bool {
    let free_pct = rt.space() * 100 / ms_size;
    !(rt.max_size() >= cfg.df_alloc_threshold && free_pct >= cfg.df_free_pct)
}

impl AllocStrategy {
    /// Pick an offset for `size` bytes, or None if this metaslab cannot
    /// satisfy the request. Does not mutate the tree; the caller removes
    /// the chosen range.
    pub fn alloc(
        &self,
        rt: &RangeTree,
        lbas: &mut [u64; MAX_LBAS],
        ms_size: u64,
        size: u64,
        cfg: &AllocConfig,
    ) -> Option<u64> {
        match self {
            AllocStrategy::FirstFit => ff_alloc(rt, lbas, size),
            AllocStrategy::DynamicFit => df_alloc(rt, lbas, ms_size, size, cfg),
            AllocStrategy::CursorFit => cf_alloc(rt, lbas, size),
            AllocStrategy::NewDynamicFit => ndf_alloc(rt, lbas, size, cfg),
        }
    }

    /// Whether the higher layers should treat this metaslab as fragmented
    /// for weighting purposes.
    pub fn fragmented(&self, rt: &RangeTree, ms_size: u64, cfg: &AllocConfig) -> bool {
        match self {
            AllocStrategy::FirstFit => true,
            AllocStrategy::DynamicFit => df_fragmented(rt, ms_size, cfg),
            AllocStrategy::CursorFit => rt.max_size() < cfg.min_alloc_size,
            AllocStrategy::NewDynamicFit => {
                let clump = cfg
                    .min_alloc_size
                    .checked_shl(cfg.ndf_clump_shift)
                    .unwrap_or(u64::MAX);
                rt.max_size() <= clump
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lbas() -> [u64; MAX_LBAS] {
        [0; MAX_LBAS]
    }

    #[test]
    fn picker_advances_and_wraps() {
        let mut rt = RangeTree::new();
        rt.add(0, 0x800);
        rt.add(0x4000, 0x800);
        let mut cursor = 0x1000; // past the head run
        assert_eq!(block_picker(&rt, &mut cursor, 0x800, 0x800), Some(0x4000));
        assert_eq!(cursor, 0x4800);
        rt.remove(0x4000, 0x800);
        // nothing at or after the cursor; wraps to 0 and finds the head run
        assert_eq!(block_picker(&rt, &mut cursor, 0x800, 0x800), Some(0));
        assert_eq!(cursor, 0x800);
        rt.remove(0, 0x800);
        assert_eq!(block_picker(&rt, &mut cursor, 0x800, 0x800), None);
    }

    #[test]
    fn picker_honors_alignment() {
        let mut rt = RangeTree::new();
        rt.add(0x600, 0x2000);
        let mut cursor = 0;
        assert_eq!(block_picker(&rt, &mut cursor, 0x1000, 0x1000), Some(0x1000));
    }

    #[test]
    fn df_switches_to_best_fit_when_low() {
        let cfg = AllocConfig::default();
        let ms_size = 1 << 20;
        let mut rt = RangeTree::new();
        // 2% free, several small runs and one big one
        rt.add(0x0000, 0x1000);
        rt.add(0x3000, 0x1000);
        rt.add(0x10000, 0x3000);
        let mut lbas = lbas();
        lbas[highbit64(0x2000) as usize - 1] = 0x50000; // stale first-fit cursor
        let offset =
            AllocStrategy::DynamicFit.alloc(&rt, &mut lbas, ms_size, 0x2000, &cfg);
        // best-fit: ignores the cursor, picks the smallest extent that fits
        assert_eq!(offset, Some(0x10000));
        assert!(AllocStrategy::DynamicFit.fragmented(&rt, ms_size, &cfg));
    }

    #[test]
    fn df_first_fit_when_roomy() {
        let mut cfg = AllocConfig::default();
        cfg.df_alloc_threshold = 0x1000;
        cfg.df_free_pct = 0;
        let ms_size = 1 << 20;
        let mut rt = RangeTree::new();
        rt.add(0, 1 << 20);
        let mut lbas = lbas();
        let first = AllocStrategy::DynamicFit.alloc(&rt, &mut lbas, ms_size, 0x2000, &cfg);
        assert_eq!(first, Some(0));
        assert!(!AllocStrategy::DynamicFit.fragmented(&rt, ms_size, &cfg));
    }

    #[test]
    fn cf_chews_largest_then_moves_on() {
        let cfg = AllocConfig::default();
        let mut rt = RangeTree::new();
        rt.add(0x1000, 0x800);
        rt.add(0x8000, 0x2000);
        let mut lbas = lbas();
        let strategy = AllocStrategy::CursorFit;
        for expected in &[0x8000u64, 0x8800, 0x9000, 0x9800] {
            assert_eq!(
                strategy.alloc(&rt, &mut lbas, 1 << 20, 0x800, &cfg),
                Some(*expected)
            );
            rt.remove(*expected, 0x800);
        }
        // big run exhausted; the 0x800 run at 0x1000 is the largest left
        assert_eq!(strategy.alloc(&rt, &mut lbas, 1 << 20, 0x800, &cfg), Some(0x1000));
        rt.remove(0x1000, 0x800);
        assert_eq!(strategy.alloc(&rt, &mut lbas, 1 << 20, 0x800, &cfg), None);
    }

    #[test]
    fn ndf_falls_back_to_clump_sized_runs() {
        let mut cfg = AllocConfig::default();
        cfg.ndf_clump_shift = 2;
        let mut rt = RangeTree::new();
        rt.add(0x1000, 0x400);
        rt.add(0x10000, 0x8000);
        let mut lbas = lbas();
        let strategy = AllocStrategy::NewDynamicFit;
        // cursor at 0: no extent covers [0, 0x400), fall back to the size
        // tree looking for ~2^(11+2) and land on the big run
        let offset = strategy.alloc(&rt, &mut lbas, 1 << 20, 0x400, &cfg);
        assert_eq!(offset, Some(0x10000));
        rt.remove(0x10000, 0x400);
        // cursor now inside the big run; sequential from there
        let offset = strategy.alloc(&rt, &mut lbas, 1 << 20, 0x400, &cfg);
        assert_eq!(offset, Some(0x10400));
    }
}
