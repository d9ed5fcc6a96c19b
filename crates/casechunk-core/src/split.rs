//! Page-range planning.
//!
//! Divides `1..=total_pages` into contiguous, non-overlapping ranges of at
//! most `chunk_size` pages, ordered by chunk index. Only the last range may
//! be short: 422 pages at 25 per chunk gives 16 ranges of 25 and one of 22.

use serde::{Deserialize, Serialize};

use crate::error::SplitError;

/// One planned page range. Pages are 1-based and inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub index: u32,
    pub first_page: u32,
    pub last_page: u32,
}

impl ChunkPlan {
    pub fn page_count(&self) -> u32 {
        self.last_page - self.first_page + 1
    }
}

/// Plan `ceil(total_pages / chunk_size)` ranges covering the whole document.
pub fn plan_chunks(total_pages: u32, chunk_size: u32) -> Result<Vec<ChunkPlan>, SplitError> {
    if total_pages == 0 {
        return Err(SplitError::EmptyDocument);
    }
    if chunk_size == 0 {
        return Err(SplitError::ZeroChunkSize);
    }

    let count = total_pages.div_ceil(chunk_size);
    let plans = (0..count)
        .map(|index| {
            let first_page = index * chunk_size + 1;
            let last_page = (first_page + chunk_size - 1).min(total_pages);
            ChunkPlan {
                index,
                first_page,
                last_page,
            }
        })
        .collect();

    Ok(plans)
}

/// Check that `ranges` (in index order) tile `1..=total_pages` exactly.
///
/// Returns a description of the first gap or overlap found.
pub fn check_coverage(ranges: &[(u32, u32)], total_pages: u32) -> Result<(), String> {
    let mut expected = 1u32;
    for &(first, last) in ranges {
        if first != expected {
            return Err(if first < expected {
                format!("range {}-{} overlaps page {}", first, last, expected - 1)
            } else {
                format!("pages {}-{} are not covered", expected, first - 1)
            });
        }
        if last < first {
            return Err(format!("range {}-{} is inverted", first, last));
        }
        expected = last + 1;
    }
    if expected != total_pages + 1 {
        return Err(format!(
            "ranges end at page {} but document has {} pages",
            expected - 1,
            total_pages
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_422_pages_at_25() {
        let plans = plan_chunks(422, 25).unwrap();
        assert_eq!(plans.len(), 17);
        for plan in &plans[..16] {
            assert_eq!(plan.page_count(), 25);
        }
        let last = plans.last().unwrap();
        assert_eq!((last.first_page, last.last_page), (401, 422));
        assert_eq!(last.page_count(), 22);
    }

    #[test]
    fn test_count_is_ceiling_and_ranges_tile() {
        for total in 1..=120u32 {
            for size in [1u32, 7, 25, 50, 200] {
                let plans = plan_chunks(total, size).unwrap();
                assert_eq!(plans.len() as u32, total.div_ceil(size));
                let ranges: Vec<(u32, u32)> =
                    plans.iter().map(|p| (p.first_page, p.last_page)).collect();
                check_coverage(&ranges, total).unwrap();
                for (i, p) in plans.iter().enumerate() {
                    assert_eq!(p.index, i as u32);
                }
            }
        }
    }

    #[test]
    fn test_small_document_single_chunk() {
        let plans = plan_chunks(3, 25).unwrap();
        assert_eq!(
            plans,
            vec![ChunkPlan {
                index: 0,
                first_page: 1,
                last_page: 3
            }]
        );
    }

    #[test]
    fn test_zero_pages_and_zero_size_fail() {
        assert_eq!(plan_chunks(0, 25), Err(SplitError::EmptyDocument));
        assert_eq!(plan_chunks(10, 0), Err(SplitError::ZeroChunkSize));
    }

    #[test]
    fn test_coverage_detects_gap_and_overlap() {
        assert!(check_coverage(&[(1, 10), (12, 20)], 20).is_err());
        assert!(check_coverage(&[(1, 10), (10, 20)], 20).is_err());
        assert!(check_coverage(&[(1, 10)], 20).is_err());
        assert!(check_coverage(&[(1, 10), (11, 20)], 20).is_ok());
    }
}
