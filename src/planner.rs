//! Range planning for the ingestion loop.

/// Plans the next batch of block numbers to fetch.
///
/// Forward progress (blocks above `newest`) has strict priority over
/// backfill (blocks below `oldest`). With no stored blocks the planner
/// bootstraps by backfilling exactly one batch ending at `tip`. Repeated
/// application against an advancing tip converges on `[0, tip]`.
pub fn plan(tip: u64, newest: Option<u64>, oldest: Option<u64>, batch: usize) -> Vec<u64> {
    let mut numbers = Vec::with_capacity(batch);
    if batch == 0 {
        return numbers;
    }

    // Forward window: everything above the newest stored block, capped at
    // the tip. On bootstrap the window is the last `batch` blocks up to the
    // tip, clipped at genesis.
    let forward_start = match newest {
        Some(newest) => newest.saturating_add(1),
        None => (i128::from(tip) - batch as i128 + 1).max(0) as u64,
    };
    let mut next = forward_start;
    while next <= tip && numbers.len() < batch {
        numbers.push(next);
        next += 1;
    }

    // Backward window: fill the remainder below the oldest stored block,
    // stopping at genesis.
    if let Some(oldest) = oldest {
        let mut next = oldest;
        while next > 0 && numbers.len() < batch {
            next -= 1;
            numbers.push(next);
        }
    }

    numbers
}
