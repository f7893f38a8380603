//! Price-range sharding.
//!
//! The site truncates any filtered query to [`TRUNCATION_THRESHOLD`]
//! results. Coverage beyond the cap comes from partitioning the price axis:
//! an up-front fan-out into fixed-width shards, then reactive bisection of
//! any shard whose reported total still meets the cap.

use crate::records::ShardTask;

/// Site-side cap on returned results for one filtered query.
pub const TRUNCATION_THRESHOLD: u64 = 1000;

/// A shard narrower than this is never bisected further.
pub const MIN_SHARD_WIDTH: u32 = 10;

/// Bound on bisection recursion.
pub const MAX_SPLIT_DEPTH: u32 = 10;

/// Split `[min, max]` into contiguous intervals of width `step`, the final
/// interval clipped to `max`.
pub fn split_range(min: u32, max: u32, step: u32) -> Vec<(u32, u32)> {
    if step == 0 || min > max {
        return vec![(min, max.max(min))];
    }
    let mut shards = Vec::new();
    let mut lo = min;
    while lo <= max {
        let hi = lo.saturating_add(step - 1).min(max);
        shards.push((lo, hi));
        if hi == max {
            break;
        }
        lo = hi + 1;
    }
    shards
}

/// Whether a shard's reported total calls for bisection: the count meets the
/// truncation threshold, the shard is still wide enough to split, and the
/// recursion depth is below the cap. An unbounded shard is never bisected;
/// it has no real upper edge to halve against.
pub fn should_bisect(shard: &ShardTask, total_count: u64) -> bool {
    !shard.is_unbounded()
        && total_count >= TRUNCATION_THRESHOLD
        && shard.width() > MIN_SHARD_WIDTH
        && shard.split_depth < MAX_SPLIT_DEPTH
}

/// Bisect at the integer midpoint. Children start from page one (no cursor)
/// with the split depth advanced by one.
pub fn bisect(shard: &ShardTask) -> (ShardTask, ShardTask) {
    let mid = shard.min_price + shard.width() / 2;
    let left = ShardTask {
        min_price: shard.min_price,
        max_price: mid,
        split_depth: shard.split_depth + 1,
        cursor: None,
    };
    let right = ShardTask {
        min_price: mid + 1,
        max_price: shard.max_price,
        split_depth: shard.split_depth + 1,
        cursor: None,
    };
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_range_clips_final_interval() {
        assert_eq!(
            split_range(0, 23, 5),
            vec![(0, 4), (5, 9), (10, 14), (15, 19), (20, 23)]
        );
    }

    #[test]
    fn split_range_single_interval() {
        assert_eq!(split_range(10, 12, 100), vec![(10, 12)]);
    }

    #[test]
    fn truncated_shard_bisected() {
        let shard = ShardTask::new(0, 999);
        assert!(should_bisect(&shard, 1200));
        let (left, right) = bisect(&shard);
        assert_eq!((left.min_price, left.max_price), (0, 499));
        assert_eq!((right.min_price, right.max_price), (500, 999));
        assert_eq!(left.split_depth, 1);
        assert_eq!(right.split_depth, 1);
    }

    #[test]
    fn narrow_shard_not_bisected() {
        let shard = ShardTask::new(100, 109);
        assert!(!should_bisect(&shard, 5000));
    }

    #[test]
    fn depth_cap_stops_bisection() {
        let mut shard = ShardTask::new(0, 10_000);
        shard.split_depth = MAX_SPLIT_DEPTH;
        assert!(!should_bisect(&shard, 5000));
    }

    #[test]
    fn below_threshold_not_bisected() {
        assert!(!should_bisect(&ShardTask::new(0, 999), 999));
    }

    #[test]
    fn unbounded_shard_never_bisected() {
        assert!(!should_bisect(&ShardTask::unbounded(0), 5000));
        assert!(!should_bisect(&ShardTask::unbounded(300), TRUNCATION_THRESHOLD));
    }
}
