//! Column partitioning across workers
//!
//! Columns are dealt out in contiguous ranges in worker-index order. When the
//! column count doesn't divide evenly, the first `total_cols % worker_count`
//! workers take one extra column each.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Contiguous column range assigned to one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Worker position in the pool (0-indexed)
    pub worker_index: usize,
    /// First column (inclusive)
    pub column_offset: usize,
    /// Number of columns, possibly zero
    pub column_count: usize,
}

impl Partition {
    /// End column (exclusive)
    pub fn column_end(&self) -> usize {
        self.column_offset + self.column_count
    }

    pub fn column_range(&self) -> Range<usize> {
        self.column_offset..self.column_end()
    }

    /// Check if a column is in this partition
    pub fn contains_column(&self, column: usize) -> bool {
        self.column_range().contains(&column)
    }

    /// Elements carried per payload for this partition
    pub fn element_count(&self, rows: usize) -> usize {
        self.column_count * rows
    }

    pub fn is_empty(&self) -> bool {
        self.column_count == 0
    }
}

/// Split `total_cols` columns of a `row_count`-row matrix across workers.
///
/// The row count does not affect the split; it only scales transfer sizes
/// (see [`Partition::element_count`]).
///
/// Every worker gets an entry, including workers left with zero columns when
/// `worker_count > total_cols`; they still take part in the exchange.
///
/// # Panics
/// Panics if `worker_count` is zero.
pub fn partition(total_cols: usize, worker_count: usize, _row_count: usize) -> Vec<Partition> {
    assert!(worker_count > 0, "Number of workers must be positive");

    let base = total_cols / worker_count;
    let remainder = total_cols % worker_count;

    let mut offset = 0;
    (0..worker_count)
        .map(|worker_index| {
            let column_count = base + usize::from(worker_index < remainder);
            let part = Partition {
                worker_index,
                column_offset: offset,
                column_count,
            };
            offset += column_count;
            part
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widths(parts: &[Partition]) -> Vec<usize> {
        parts.iter().map(|p| p.column_count).collect()
    }

    #[test]
    fn test_partition_even() {
        let parts = partition(10, 5, 3);
        assert_eq!(widths(&parts), vec![2, 2, 2, 2, 2]);
        assert_eq!(parts[3].column_offset, 6);
        assert_eq!(parts[3].element_count(3), 6);
    }

    #[test]
    fn test_partition_remainder_goes_first() {
        // base = 1, remainder = 1
        let parts = partition(4, 3, 2);
        assert_eq!(widths(&parts), vec![2, 1, 1]);
        assert_eq!(
            parts.iter().map(|p| p.column_offset).collect::<Vec<_>>(),
            vec![0, 2, 3]
        );
    }

    #[test]
    fn test_partition_one_column_each() {
        let parts = partition(5, 5, 3);
        for (i, p) in parts.iter().enumerate() {
            assert_eq!(p.worker_index, i);
            assert_eq!(p.column_range(), i..i + 1);
        }
    }

    #[test]
    fn test_more_workers_than_columns() {
        let parts = partition(2, 5, 4);
        assert_eq!(parts.len(), 5);
        assert_eq!(widths(&parts), vec![1, 1, 0, 0, 0]);
        assert!(parts[4].is_empty());
        assert_eq!(parts[4].element_count(4), 0);
        assert_eq!(parts[4].column_offset, 2);
    }

    #[test]
    fn test_zero_columns() {
        let parts = partition(0, 3, 7);
        assert_eq!(widths(&parts), vec![0, 0, 0]);
    }

    #[test]
    #[should_panic(expected = "Number of workers must be positive")]
    fn test_zero_workers_panics() {
        partition(4, 0, 1);
    }

    #[test]
    fn test_contains_column() {
        let p = Partition {
            worker_index: 1,
            column_offset: 2,
            column_count: 3,
        };
        assert!(p.contains_column(2));
        assert!(p.contains_column(4));
        assert!(!p.contains_column(5));
    }

    #[test]
    fn test_partition_property_exact_cover() {
        // Property: ranges are contiguous, non-overlapping and cover [0, cols)
        for total_cols in 0..=40 {
            for worker_count in 1..=12 {
                let parts = partition(total_cols, worker_count, 3);
                assert_eq!(parts.len(), worker_count);

                let mut next = 0;
                for (i, p) in parts.iter().enumerate() {
                    assert_eq!(p.worker_index, i);
                    assert_eq!(
                        p.column_offset, next,
                        "gap or overlap at worker {} for cols={}, workers={}",
                        i, total_cols, worker_count
                    );
                    next = p.column_end();
                }
                assert_eq!(next, total_cols);
            }
        }
    }

    #[test]
    fn test_partition_property_remainder_count() {
        for total_cols in 0..=40 {
            for worker_count in 1..=12 {
                let base = total_cols / worker_count;
                let remainder = total_cols % worker_count;
                let parts = partition(total_cols, worker_count, 1);

                let wide = parts.iter().filter(|p| p.column_count == base + 1).count();
                let narrow = parts.iter().filter(|p| p.column_count == base).count();
                assert_eq!(wide, remainder);
                assert_eq!(wide + narrow, worker_count);
            }
        }
    }
}
