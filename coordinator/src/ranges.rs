//! Interval arithmetic over reading ids.
//!
//! Owner links are stored as inclusive `(start, end)` runs of reading ids, so
//! storage grows with the number of contiguous runs rather than with the number
//! of readings an owner consumes.

use serde::{Deserialize, Serialize};

/// Inclusive run of ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdRange {
    pub start: i64,
    pub end: i64,
}

impl IdRange {
    pub fn new(start: i64, end: i64) -> Option<Self> {
        (end >= start).then_some(Self { start, end })
    }

    pub fn single(id: i64) -> Self {
        Self { start: id, end: id }
    }

    pub fn count(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, id: i64) -> bool {
        self.start <= id && id <= self.end
    }

    /// True when the two runs overlap or touch, i.e. their union is one run.
    pub fn joins(&self, other: &IdRange) -> bool {
        self.start <= other.end.saturating_add(1) && other.start <= self.end.saturating_add(1)
    }
}

/// Builds the minimal list of inclusive runs covering `ids`.
///
/// Input order and duplicates do not matter; output is sorted and no two runs
/// are adjacent or overlapping.
pub fn compress<I>(ids: I) -> Vec<IdRange>
where
    I: IntoIterator<Item = i64>,
{
    let mut sorted: Vec<i64> = ids.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return out;
    };

    let mut current = IdRange::single(first);
    for id in iter {
        if current.end.checked_add(1) == Some(id) {
            current.end = id;
        } else {
            out.push(current);
            current = IdRange::single(id);
        }
    }
    out.push(current);
    out
}

/// Collapses overlapping or adjacent runs. Coverage is unchanged.
pub fn merge<I>(ranges: I) -> Vec<IdRange>
where
    I: IntoIterator<Item = IdRange>,
{
    let mut sorted: Vec<IdRange> = ranges.into_iter().collect();
    sorted.sort_unstable();

    let mut out: Vec<IdRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match out.last_mut() {
            Some(last) if last.joins(&range) => last.end = last.end.max(range.end),
            _ => out.push(range),
        }
    }
    out
}

/// Ids from `ids` that no run in `ranges` covers.
pub fn uncovered<'a, I>(ids: I, ranges: &'a [IdRange]) -> impl Iterator<Item = i64> + 'a
where
    I: IntoIterator<Item = i64>,
    I::IntoIter: 'a,
{
    ids.into_iter()
        .filter(move |id| !ranges.iter().any(|r| r.contains(*id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::BTreeSet;

    fn expand(ranges: &[IdRange]) -> Vec<i64> {
        ranges.iter().flat_map(|r| r.start..=r.end).collect()
    }

    #[test]
    fn test_compress_two_runs() {
        let ranges = compress(vec![10, 11, 12, 15, 16]);
        assert_eq!(
            ranges,
            vec![IdRange { start: 10, end: 12 }, IdRange { start: 15, end: 16 }]
        );
    }

    #[test]
    fn test_compress_unsorted_with_duplicates() {
        let ranges = compress(vec![5, 3, 4, 4, 9, 3]);
        assert_eq!(
            ranges,
            vec![IdRange { start: 3, end: 5 }, IdRange { start: 9, end: 9 }]
        );
    }

    #[test]
    fn test_compress_empty() {
        assert!(compress(Vec::new()).is_empty());
    }

    #[test]
    fn test_compress_does_not_overflow() {
        let ranges = compress(vec![i64::MAX, i64::MAX - 1]);
        assert_eq!(ranges, vec![IdRange { start: i64::MAX - 1, end: i64::MAX }]);
    }

    #[test]
    fn test_compress_covers_exactly_and_is_minimal() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(0..60);
            let ids: Vec<i64> = (0..len).map(|_| rng.gen_range(1..80)).collect();
            let ranges = compress(ids.clone());

            let expected: Vec<i64> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
            assert_eq!(expand(&ranges), expected);

            for pair in ranges.windows(2) {
                assert!(pair[0].end + 1 < pair[1].start, "adjacent runs {:?}", pair);
            }

            // Deterministic and idempotent
            assert_eq!(compress(expand(&ranges)), ranges);
        }
    }

    #[test]
    fn test_merge_overlapping_and_adjacent() {
        let merged = merge(vec![
            IdRange { start: 7, end: 9 },
            IdRange { start: 1, end: 3 },
            IdRange { start: 4, end: 4 },
            IdRange { start: 2, end: 5 },
            IdRange { start: 11, end: 12 },
        ]);
        assert_eq!(
            merged,
            vec![
                IdRange { start: 1, end: 5 },
                IdRange { start: 7, end: 9 },
                IdRange { start: 11, end: 12 }
            ]
        );
    }

    #[test]
    fn test_uncovered_filters_known_ids() {
        let ranges = vec![IdRange { start: 10, end: 12 }];
        let left: Vec<i64> = uncovered(vec![9, 10, 12, 13], &ranges).collect();
        assert_eq!(left, vec![9, 13]);
    }

    #[test]
    fn test_new_rejects_inverted() {
        assert!(IdRange::new(5, 4).is_none());
        assert_eq!(IdRange::new(4, 5).map(|r| r.count()), Some(2));
    }
}
