//! Contiguous work partitioning for fork-join workers.

use std::ops::Range;

/// Splits `start..end` into at most `parts` contiguous, disjoint, non-empty
/// ranges whose lengths differ by at most one.
///
/// Earlier ranges get the extra element, and the ranges are returned in
/// ascending order so concatenating per-range results preserves order.
#[must_use]
pub fn split_range(range: Range<usize>, parts: usize) -> Vec<Range<usize>> {
    let len = range.end.saturating_sub(range.start);
    if len == 0 {
        return Vec::new();
    }
    let parts = parts.clamp(1, len);
    let base = len / parts;
    let extra = len % parts;

    let mut start = range.start;
    (0..parts)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let part = start..start + size;
            start += size;
            part
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_split() {
        assert_eq!(split_range(0..8, 4), vec![0..2, 2..4, 4..6, 6..8]);
    }

    #[test]
    fn test_uneven_split() {
        assert_eq!(split_range(10..17, 3), vec![10..13, 13..15, 15..17]);
    }

    #[test]
    fn test_more_parts_than_items() {
        assert_eq!(split_range(0..2, 8), vec![0..1, 1..2]);
        assert!(split_range(5..5, 4).is_empty());
    }

    #[test]
    fn test_zero_parts_is_one_part() {
        assert_eq!(split_range(0..3, 0), vec![0..3]);
    }
}
