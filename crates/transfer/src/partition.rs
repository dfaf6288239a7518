//! Splitting a transfer into tasks and blocks.

use crate::config::TransferConfig;
use crate::types::ByteRange;

/// Decides how many concurrent tasks should move `total` bytes.
///
/// `requested > 0` is honoured as-is unless the endpoint cannot take
/// parallel writes. The result is always within `1..=max(1, total)`.
pub fn task_count(
    total: i64,
    requested: usize,
    config: &TransferConfig,
    parallel_capable: bool,
) -> usize {
    let count = if !parallel_capable {
        1
    } else if requested > 0 {
        requested
    } else if total <= config.min_task_size {
        1
    } else {
        let min_task = config.min_task_size.max(1);
        let by_size = (total + min_task - 1) / min_task;
        (by_size as usize).min(config.max_task_count.max(1))
    };

    let upper = total.max(1) as usize;
    count.clamp(1, upper)
}

/// Splits `[0, total)` into `task_count` contiguous ranges.
///
/// Ranges are floor-sized and the last one absorbs the remainder, so
/// their lengths always sum to `total`.
pub fn partition_ranges(total: i64, task_count: usize) -> Vec<ByteRange> {
    if total <= 0 {
        return Vec::new();
    }

    let count = (task_count.max(1) as i64).min(total);
    let size = total / count;

    (0..count)
        .map(|i| {
            let offset = i * size;
            let length = if i == count - 1 { total - offset } else { size };
            ByteRange::new(offset, length)
        })
        .collect()
}

/// Returns the start offset of every block of `block_size` within `total`.
pub fn block_offsets(total: i64, block_size: i64) -> Vec<i64> {
    if total <= 0 || block_size <= 0 {
        return Vec::new();
    }
    (0..total).step_by(block_size as usize).collect()
}

/// Length of the block starting at `offset`, clamped at end of file.
pub fn block_length(total: i64, block_size: i64, offset: i64) -> i64 {
    (total - offset).clamp(0, block_size)
}
