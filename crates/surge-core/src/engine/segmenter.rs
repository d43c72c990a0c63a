//! Segment planning
//!
//! Splits a resource into contiguous byte ranges. The plan is computed once
//! per job and never recomputed after a segment has started, so resume
//! offsets stay meaningful across restarts.

use surge_types::Segment;

/// Plan the segments for a resource.
///
/// With an unknown (or zero) size the whole stream becomes a single open
/// segment. Otherwise `[0, total_size - 1]` is divided into
/// `min(concurrency, ceil(total_size / min_segment_size))` ranges whose sizes
/// differ by at most one byte, larger ranges first.
pub fn plan(total_size: Option<u64>, concurrency: u32, min_segment_size: u64) -> Vec<Segment> {
    let total_size = match total_size {
        Some(size) if size > 0 => size,
        _ => return vec![Segment::open(0, 0)],
    };

    let by_min_size = total_size.div_ceil(min_segment_size.max(1));
    let count = (concurrency.max(1) as u64).min(by_min_size).max(1);

    let base = total_size / count;
    let remainder = total_size % count;

    let mut segments = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for i in 0..count {
        let len = base + u64::from(i < remainder);
        segments.push(Segment::new(i as u32, start, start + len - 1));
        start += len;
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_contiguous(segments: &[Segment], total: u64) {
        assert_eq!(segments.first().map(|s| s.start), Some(0));
        assert_eq!(segments.last().map(|s| s.end), Some(total - 1));
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.index as usize, i);
            assert_eq!(segment.bytes_received, 0);
        }
    }

    #[test]
    fn ten_megabytes_in_four_segments() {
        let segments = plan(Some(10_000_000), 4, 1_000_000);
        assert_eq!(segments.len(), 4);
        assert!(segments.iter().all(|s| s.size() == Some(2_500_000)));
        assert_contiguous(&segments, 10_000_000);
    }

    #[test]
    fn unknown_size_yields_single_open_segment() {
        let segments = plan(None, 8, 1024);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].is_unknown_size());
        assert_eq!(segments[0].start, 0);

        assert_eq!(plan(Some(0), 8, 1024), segments);
    }

    #[test]
    fn min_segment_size_caps_the_count() {
        let segments = plan(Some(2_500_000), 16, 1_000_000);
        assert_eq!(segments.len(), 3);
        assert_contiguous(&segments, 2_500_000);

        let segments = plan(Some(10), 4, 1_000_000);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].size(), Some(10));
    }

    #[test]
    fn uneven_sizes_differ_by_at_most_one_byte() {
        for total in [7u64, 1001, 65_537, 9_999_999] {
            for concurrency in 1..=9 {
                let segments = plan(Some(total), concurrency, 1);
                assert_contiguous(&segments, total);
                let sizes: Vec<u64> = segments.iter().filter_map(Segment::size).collect();
                let max = sizes.iter().max().copied().unwrap_or(0);
                let min = sizes.iter().min().copied().unwrap_or(0);
                assert!(max - min <= 1, "total={} concurrency={}", total, concurrency);
                assert_eq!(sizes.iter().sum::<u64>(), total);
            }
        }
    }

    #[test]
    fn plan_is_deterministic() {
        assert_eq!(plan(Some(123_456), 5, 1000), plan(Some(123_456), 5, 1000));
    }
}
