use std::num::NonZeroUsize;
use std::ops::Range;

/// The part of `total` items that belongs to `rank` out of `world_size`.
///
/// Parts are contiguous, rank ordered and cover `0..total`. Their sizes
/// differ by at most one, the lower ranks taking the remainder.
///
/// Splits both datasets and the parameters of sharded training.
pub fn shard_range(total: usize, rank: usize, world_size: usize) -> Range<usize> {
    assert!(rank < world_size, "rank {rank} out of a world of {world_size}");

    let (size, remainder) = (total / world_size, total % world_size);
    let start = rank * size + rank.min(remainder);

    start..start + size + usize::from(rank < remainder)
}

/// Which part of the data a worker reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub worker_id: usize,
    pub num_workers: NonZeroUsize,
}

impl ShardSpec {
    pub fn new(worker_id: usize, num_workers: NonZeroUsize) -> Self {
        assert!(worker_id < num_workers.get(), "worker_id out of range");
        Self {
            worker_id,
            num_workers,
        }
    }

    /// Everything, for a world of one.
    pub fn single() -> Self {
        Self::new(0, NonZeroUsize::MIN)
    }

    #[inline]
    pub fn range(self, total: usize) -> Range<usize> {
        shard_range(total, self.worker_id, self.num_workers.get())
    }

    /// The range of every rank, indexed by rank.
    pub fn all_ranges(total: usize, num_workers: NonZeroUsize) -> Vec<Range<usize>> {
        (0..num_workers.get())
            .map(|rank| shard_range(total, rank, num_workers.get()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remainders_go_to_the_lower_ranks() {
        let parts: Vec<_> = (0..3).map(|rank| shard_range(11, rank, 3)).collect();
        assert_eq!(parts, [0..4, 4..8, 8..11]);
    }

    #[test]
    fn small_totals_leave_trailing_ranks_empty() {
        assert_eq!(shard_range(1, 0, 2), 0..1);
        assert!(shard_range(1, 1, 2).is_empty());
    }

    #[test]
    fn all_ranges_tile_the_total() {
        let ranges = ShardSpec::all_ranges(11, NonZeroUsize::new(4).unwrap());
        assert_eq!(ranges, [0..3, 3..6, 6..9, 9..11]);

        let spec = ShardSpec::new(2, NonZeroUsize::new(4).unwrap());
        assert_eq!(spec.range(11), 6..9);
    }
}
