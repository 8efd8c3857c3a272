//! Frame synchronization across sub-streams
//!
//! Every sub-stream decodes independently; a stereo image can only be
//! composed from frames sharing the same id. The most recent common id wins.
//! There is no interpolation and no waiting.

/// Pick the frame id to compose this tick.
///
/// `sets` holds the retained frame ids of every sub-stream. The answer is the
/// greatest id present in every set that is not newer than `preferred`;
/// failing that, the greatest id present in every set. `None` when there is
/// no common id, or no sub-stream at all.
pub fn common_frame(sets: &[Vec<u64>], preferred: u64) -> Option<u64> {
    let (first, rest) = sets.split_first()?;

    let mut best_preferred = None;
    let mut best_any = None;
    for &id in first {
        if !rest.iter().all(|set| set.contains(&id)) {
            continue;
        }
        if best_any.is_none_or(|best| id > best) {
            best_any = Some(id);
        }
        if id <= preferred && best_preferred.is_none_or(|best| id > best) {
            best_preferred = Some(id);
        }
    }

    best_preferred.or(best_any)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_common_frame() {
        let sets = vec![vec![5, 6, 7], vec![6, 7, 8]];
        assert_eq!(common_frame(&sets, 7), Some(7));
    }

    #[test]
    fn test_disjoint_sets() {
        let sets = vec![vec![5, 6], vec![7, 8]];
        assert_eq!(common_frame(&sets, 7), None);
    }

    #[test]
    fn test_falls_back_to_newest_common() {
        let sets = vec![vec![5, 6, 7], vec![5, 6, 7]];
        assert_eq!(common_frame(&sets, 4), Some(7));
    }

    #[test]
    fn test_no_streams() {
        assert_eq!(common_frame(&[], 10), None);
    }

    #[test]
    fn test_single_stream_and_empty_set() {
        assert_eq!(common_frame(&[vec![3, 1, 2]], 2), Some(2));
        assert_eq!(common_frame(&[vec![3, 1, 2]], u64::MAX), Some(3));
        assert_eq!(common_frame(&[vec![1, 2], vec![]], 2), None);
    }

    #[test]
    fn test_picks_greatest_below_preferred() {
        let sets = vec![vec![1, 3, 5, 9], vec![1, 3, 5, 9], vec![3, 5, 9]];
        assert_eq!(common_frame(&sets, 8), Some(5));
        assert_eq!(common_frame(&sets, 9), Some(9));
        assert_eq!(common_frame(&sets, 2), Some(9));
    }
}
