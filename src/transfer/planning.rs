//! Chunk planning and strategy selection — pure functions, grounded on
//! `other_examples/900509d2` (`parallel_sync.rs`)'s chunked-transfer sizing
//! and reused here for the exact formulas distilled §4.6 specifies.

use super::{Chunk, ChunkStatus, Direction, Strategy, PARALLEL_DOWNLOAD_MIN_SIZE, PARALLEL_UPLOAD_MIN_SIZE};

/// Selects a transfer strategy for one file, per distilled §4.6:
///
/// - compression && parallel -> compressed+parallel pipeline
/// - compression only -> compressed pipeline
/// - parallel && size >= threshold (10 MiB download / 50 MiB upload) -> parallel
/// - otherwise -> basic streaming
pub fn select_strategy(
    size: u64,
    compression: bool,
    parallel: bool,
    direction: Direction,
) -> Strategy {
    let threshold = match direction {
        Direction::Upload => PARALLEL_UPLOAD_MIN_SIZE,
        Direction::Download => PARALLEL_DOWNLOAD_MIN_SIZE,
    };

    match (compression, parallel) {
        (true, true) => Strategy::CompressedParallel,
        (true, false) => Strategy::Compressed,
        (false, true) if size >= threshold => Strategy::Parallel,
        _ => Strategy::Basic,
    }
}

/// Optimal chunk count heuristic for downloads, per distilled §4.6,
/// clamped by the user-configured max. Uploads use the configured value
/// unchanged (not run through this heuristic).
pub fn optimal_download_chunk_count(size: u64, max_chunks: usize) -> usize {
    const MIB: u64 = 1024 * 1024;
    let suggested = if size < 5 * MIB {
        1
    } else if size < 50 * MIB {
        8
    } else if size < 200 * MIB {
        12
    } else {
        30
    };
    suggested.min(max_chunks.max(1))
}

/// Partitions `[0, size)` into `chunk_count` chunks: `chunkSize =
/// ceil(size / chunk_count)`, chunk `i` spans `[i*chunkSize,
/// min((i+1)*chunkSize, size))`. Empty trailing chunks are dropped.
///
/// Invariant (distilled §8): the returned chunks partition `[0, size)`
/// exactly — no overlap, no gap.
pub fn plan_chunks(size: u64, chunk_count: usize) -> Vec<Chunk> {
    if size == 0 {
        return Vec::new();
    }
    let chunk_count = chunk_count.max(1) as u64;
    let chunk_size = size.div_ceil(chunk_count);

    let mut chunks = Vec::new();
    let mut start = 0u64;
    let mut id = 0usize;
    while start < size {
        let end = (start + chunk_size).min(size);
        chunks.push(Chunk {
            id,
            start,
            end,
            status: ChunkStatus::Pending,
            transferred: 0,
            retry_count: 0,
        });
        start = end;
        id += 1;
    }
    chunks
}

/// Rebuilds chunk state after a resume, per distilled §4.6 "Resume
/// semantics": chunks wholly below `resume_position` are marked completed;
/// the chunk straddling it has `transferred = resume_position - chunk.start`.
pub fn resume_chunks(mut chunks: Vec<Chunk>, resume_position: u64) -> Vec<Chunk> {
    for chunk in &mut chunks {
        if chunk.end <= resume_position {
            chunk.status = ChunkStatus::Completed;
            chunk.transferred = chunk.len();
        } else if chunk.start < resume_position {
            chunk.transferred = resume_position - chunk.start;
            chunk.status = ChunkStatus::Running;
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_chunks_partitions_exactly() {
        let chunks = plan_chunks(1000, 3);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, 1000);
        for window in chunks.windows(2) {
            assert_eq!(window[0].end, window[1].start);
        }
    }

    #[test]
    fn plan_chunks_drops_empty_trailing_chunk() {
        // size=10, chunk_count=7 -> chunk_size=2 -> 5 chunks of 2, no
        // trailing empty chunk even though 7 was requested.
        let chunks = plan_chunks(10, 7);
        assert!(chunks.iter().all(|c| !c.is_empty()));
        assert_eq!(chunks.last().unwrap().end, 10);
    }

    #[test]
    fn plan_chunks_zero_size_yields_no_chunks() {
        assert!(plan_chunks(0, 8).is_empty());
    }

    #[test]
    fn plan_chunks_last_chunk_shorter_when_not_divisible() {
        let chunks = plan_chunks(1025, 4);
        let last = chunks.last().unwrap();
        assert!(last.len() < chunks[0].len());
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<u64>(), 1025);
    }

    #[test]
    fn optimal_download_chunk_count_matches_thresholds() {
        const MIB: u64 = 1024 * 1024;
        assert_eq!(optimal_download_chunk_count(4 * MIB, 30), 1);
        assert_eq!(optimal_download_chunk_count(40 * MIB, 30), 8);
        assert_eq!(optimal_download_chunk_count(150 * MIB, 30), 12);
        assert_eq!(optimal_download_chunk_count(500 * MIB, 30), 30);
    }

    #[test]
    fn optimal_download_chunk_count_is_clamped_by_user_max() {
        const MIB: u64 = 1024 * 1024;
        assert_eq!(optimal_download_chunk_count(500 * MIB, 4), 4);
    }

    #[test]
    fn select_strategy_prefers_compression_over_parallel() {
        assert_eq!(
            select_strategy(1, true, true, Direction::Download),
            Strategy::CompressedParallel
        );
        assert_eq!(
            select_strategy(1, true, false, Direction::Download),
            Strategy::Compressed
        );
    }

    #[test]
    fn select_strategy_parallel_respects_direction_thresholds() {
        assert_eq!(
            select_strategy(20 * 1024 * 1024, false, true, Direction::Download),
            Strategy::Parallel
        );
        assert_eq!(
            select_strategy(20 * 1024 * 1024, false, true, Direction::Upload),
            Strategy::Basic
        );
    }

    #[test]
    fn resume_chunks_marks_prefix_complete_and_straddle_partial() {
        let chunks = plan_chunks(1000, 4); // chunk_size=250
        let resumed = resume_chunks(chunks, 300);
        assert_eq!(resumed[0].status, ChunkStatus::Completed);
        assert_eq!(resumed[1].status, ChunkStatus::Running);
        assert_eq!(resumed[1].transferred, 50);
        assert_eq!(resumed[2].status, ChunkStatus::Pending);
    }
}
