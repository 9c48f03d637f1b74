use crate::brief::hamming_distance;
use imreg_core::config::validate_ratio;
use imreg_core::{Descriptors, DetectorKind, FeatureMatch, RegError, RegResult};
use rayon::prelude::*;
use tracing::debug;

/// Brute-force k-nearest-neighbour search of every query row among the train rows.
///
/// Neighbours are ordered by increasing distance; ties go to the lower train index.
pub fn knn_match(query: &Descriptors, train: &Descriptors, k: usize) -> RegResult<Vec<Vec<FeatureMatch>>> {
    if k == 0 {
        return Err(RegError::invalid("k", "must be positive"));
    }
    match (query, train) {
        (Descriptors::Binary(q), Descriptors::Binary(t)) => {
            check_row_lengths(q, t)?;
            Ok(knn_rows(q, t, k, |a, b| hamming_distance(a, b) as f32))
        }
        (Descriptors::Real(q), Descriptors::Real(t)) => {
            check_row_lengths(q, t)?;
            Ok(knn_rows(q, t, k, l2_distance))
        }
        _ => Err(RegError::DescriptorMismatch {
            expected: query.norm(),
            actual: train.norm(),
        }),
    }
}

fn check_row_lengths<T>(q: &[Vec<T>], t: &[Vec<T>]) -> RegResult<()> {
    let expected = q.first().or(t.first()).map_or(0, Vec::len);
    if let Some(row) = q.iter().chain(t).find(|row| row.len() != expected) {
        return Err(RegError::invalid(
            "descriptors",
            format!("row of length {} among rows of length {}", row.len(), expected),
        ));
    }
    Ok(())
}

fn knn_rows<T, F>(query: &[Vec<T>], train: &[Vec<T>], k: usize, distance: F) -> Vec<Vec<FeatureMatch>>
where
    T: Sync,
    F: Fn(&[T], &[T]) -> f32 + Sync,
{
    query
        .par_iter()
        .enumerate()
        .map(|(query_idx, q)| {
            let mut best: Vec<FeatureMatch> = Vec::with_capacity(k + 1);
            for (train_idx, t) in train.iter().enumerate() {
                let d = distance(q.as_slice(), t.as_slice());
                if best.len() == k && d >= best[k - 1].distance {
                    continue;
                }
                // Equal distances keep the earlier train index first
                let pos = best.partition_point(|m| m.distance <= d);
                best.insert(
                    pos,
                    FeatureMatch {
                        query_idx,
                        train_idx,
                        distance: d,
                    },
                );
                best.truncate(k);
            }
            best
        })
        .collect()
}

/// Euclidean distance between two float rows
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Lowe's ratio test: keep the nearest neighbour only when it is clearly closer than the second
pub fn ratio_test(knn: &[Vec<FeatureMatch>], ratio: f32) -> Vec<FeatureMatch> {
    knn.iter()
        .filter_map(|neighbours| match neighbours.as_slice() {
            [m, n, ..] if m.distance < ratio * n.distance => Some(*m),
            _ => None,
        })
        .collect()
}

/// Match two descriptor sets with k = 2 and the ratio test.
///
/// A missing set on either side yields no matches. The descriptor kind must agree with the
/// norm of `kind`.
pub fn match_features(
    desc1: Option<&Descriptors>,
    desc2: Option<&Descriptors>,
    kind: DetectorKind,
    ratio: f32,
) -> RegResult<Vec<FeatureMatch>> {
    validate_ratio(ratio)?;
    let (d1, d2) = match (desc1, desc2) {
        (Some(d1), Some(d2)) => (d1, d2),
        _ => return Ok(Vec::new()),
    };
    for d in [d1, d2] {
        if d.norm() != kind.norm() {
            return Err(RegError::DescriptorMismatch {
                expected: kind.norm(),
                actual: d.norm(),
            });
        }
    }

    let knn = knn_match(d1, d2, 2)?;
    let good = ratio_test(&knn, ratio);
    debug!(
        method = %kind,
        candidates = knn.len(),
        kept = good.len(),
        ratio,
        "ratio test applied"
    );
    Ok(good)
}

/// Summary of a match set, optionally restricted by an inlier mask
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchStatistics {
    pub num_matches: usize,
    pub num_inliers: usize,
    pub inlier_percentage: f64,
    pub mean_distance: f64,
    pub std_distance: f64,
}

impl MatchStatistics {
    pub fn compute(matches: &[FeatureMatch], inlier_mask: Option<&[bool]>) -> Self {
        let num_matches = matches.len();
        let num_inliers = match inlier_mask {
            Some(mask) => mask.iter().filter(|&&m| m).count(),
            None => num_matches,
        };
        let inlier_percentage = if num_matches > 0 {
            100.0 * num_inliers as f64 / num_matches as f64
        } else {
            0.0
        };

        let (mean_distance, std_distance) = if num_matches > 0 {
            let n = num_matches as f64;
            let mean = matches.iter().map(|m| m.distance as f64).sum::<f64>() / n;
            let var = matches
                .iter()
                .map(|m| (m.distance as f64 - mean).powi(2))
                .sum::<f64>()
                / n;
            (mean, var.sqrt())
        } else {
            (0.0, 0.0)
        };

        Self {
            num_matches,
            num_inliers,
            inlier_percentage,
            mean_distance,
            std_distance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imreg_core::DistanceNorm;
    use proptest::prelude::*;

    fn binary(rows: &[&[u8]]) -> Descriptors {
        Descriptors::Binary(rows.iter().map(|r| r.to_vec()).collect())
    }

    #[test]
    fn test_knn_orders_by_distance() {
        let query = binary(&[&[0b0000_0000]]);
        let train = binary(&[&[0b1111_0000], &[0b0000_0001], &[0b0000_0011]]);
        let knn = knn_match(&query, &train, 2).unwrap();
        assert_eq!(knn.len(), 1);
        assert_eq!(knn[0][0].train_idx, 1);
        assert_eq!(knn[0][0].distance, 1.0);
        assert_eq!(knn[0][1].train_idx, 2);
        assert_eq!(knn[0][1].distance, 2.0);
    }

    #[test]
    fn test_knn_ties_prefer_lower_train_index() {
        let query = binary(&[&[0]]);
        let train = binary(&[&[1], &[2], &[4]]);
        let knn = knn_match(&query, &train, 2).unwrap();
        assert_eq!(knn[0][0].train_idx, 0);
        assert_eq!(knn[0][1].train_idx, 1);
    }

    #[test]
    fn test_knn_with_single_train_row() {
        let query = Descriptors::Real(vec![vec![0.0, 0.0]]);
        let train = Descriptors::Real(vec![vec![3.0, 4.0]]);
        let knn = knn_match(&query, &train, 2).unwrap();
        assert_eq!(knn[0].len(), 1);
        assert!((knn[0][0].distance - 5.0).abs() < 1e-6);
        // A lone neighbour can never pass the ratio test
        assert!(ratio_test(&knn, 1.0).is_empty());
    }

    #[test]
    fn test_knn_rejects_mixed_kinds() {
        let query = binary(&[&[0]]);
        let train = Descriptors::Real(vec![vec![0.0]]);
        assert!(matches!(
            knn_match(&query, &train, 2),
            Err(RegError::DescriptorMismatch { .. })
        ));
    }

    #[test]
    fn test_ratio_test_filters_ambiguous() {
        let fm = |q, t, d| FeatureMatch {
            query_idx: q,
            train_idx: t,
            distance: d,
        };
        let knn = vec![
            vec![fm(0, 3, 10.0), fm(0, 4, 100.0)],
            vec![fm(1, 5, 50.0), fm(1, 6, 55.0)],
            vec![fm(2, 7, 1.0)],
        ];
        let good = ratio_test(&knn, 0.75);
        assert_eq!(good, vec![fm(0, 3, 10.0)]);
    }

    #[test]
    fn test_match_features_missing_descriptors() {
        let d = binary(&[&[1, 2]]);
        assert!(match_features(None, Some(&d), DetectorKind::Orb, 0.75).unwrap().is_empty());
        assert!(match_features(Some(&d), None, DetectorKind::Orb, 0.75).unwrap().is_empty());
    }

    #[test]
    fn test_match_features_checks_norm_and_ratio() {
        let d = binary(&[&[1, 2]]);
        match match_features(Some(&d), Some(&d), DetectorKind::Sift, 0.75) {
            Err(RegError::DescriptorMismatch { expected, actual }) => {
                assert_eq!(expected, DistanceNorm::L2);
                assert_eq!(actual, DistanceNorm::Hamming);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            match_features(Some(&d), Some(&d), DetectorKind::Orb, 0.0),
            Err(RegError::InvalidParameter { name: "ratio_test", .. })
        ));
        assert!(match_features(Some(&d), Some(&d), DetectorKind::Orb, 1.5).is_err());
    }

    #[test]
    fn test_match_features_finds_distinct_rows() {
        let d1 = binary(&[&[0x00, 0x00], &[0xff, 0xff], &[0x0f, 0xf0]]);
        let d2 = binary(&[&[0xff, 0xfe], &[0x0f, 0xf0], &[0x00, 0x01]]);
        let matches = match_features(Some(&d1), Some(&d2), DetectorKind::Akaze, 0.75).unwrap();
        let pairs: Vec<(usize, usize)> = matches.iter().map(|m| (m.query_idx, m.train_idx)).collect();
        assert_eq!(pairs, vec![(0, 2), (1, 0), (2, 1)]);
    }

    #[test]
    fn test_match_statistics() {
        let matches: Vec<FeatureMatch> = [2.0f32, 4.0, 6.0, 8.0]
            .iter()
            .enumerate()
            .map(|(i, &d)| FeatureMatch {
                query_idx: i,
                train_idx: i,
                distance: d,
            })
            .collect();
        let stats = MatchStatistics::compute(&matches, Some(&[true, false, true, true][..]));
        assert_eq!(stats.num_matches, 4);
        assert_eq!(stats.num_inliers, 3);
        assert!((stats.inlier_percentage - 75.0).abs() < 1e-9);
        assert!((stats.mean_distance - 5.0).abs() < 1e-9);
        assert!((stats.std_distance - 5.0f64.sqrt()).abs() < 1e-9);

        let empty = MatchStatistics::compute(&[], None);
        assert_eq!(empty.num_matches, 0);
        assert_eq!(empty.inlier_percentage, 0.0);
    }

    proptest! {
        #[test]
        fn prop_lower_ratio_keeps_subset(
            rows1 in prop::collection::vec(prop::collection::vec(any::<u8>(), 4), 1..12),
            rows2 in prop::collection::vec(prop::collection::vec(any::<u8>(), 4), 2..12),
            r1 in 0.05f32..1.0,
            r2 in 0.05f32..1.0,
        ) {
            let (lo, hi) = if r1 <= r2 { (r1, r2) } else { (r2, r1) };
            let d1 = Descriptors::Binary(rows1);
            let d2 = Descriptors::Binary(rows2);
            let strict = match_features(Some(&d1), Some(&d2), DetectorKind::Orb, lo).unwrap();
            let loose = match_features(Some(&d1), Some(&d2), DetectorKind::Orb, hi).unwrap();
            prop_assert!(strict.len() <= loose.len());
            for m in &strict {
                prop_assert!(loose.contains(m));
            }
        }
    }
}
