use imreg_core::{ensure_same_shape, GrayImage, RegResult, SearchConfig, SimilarityMetric};
use imreg_geometry::{similarity, warp_affine, AffineMatrix};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

/// Score of one translation candidate
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchSample {
    pub tx: i32,
    pub ty: i32,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Pure translation by the best `(tx, ty)`
    pub transform: AffineMatrix,
    pub tx: i32,
    pub ty: i32,
    pub score: f64,
    pub metric: SimilarityMetric,
    /// Every candidate in evaluation order (tx outer, ty inner)
    pub history: Vec<SearchSample>,
}

/// Candidate translations in canonical order
fn candidates(cfg: &SearchConfig) -> Vec<(i32, i32)> {
    let xs = SearchConfig::offsets(cfg.range_x, cfg.step);
    let ys = SearchConfig::offsets(cfg.range_y, cfg.step);
    xs.iter().flat_map(|&tx| ys.iter().map(move |&ty| (tx, ty))).collect()
}

/// Grid search over integer translations of `moving`, scoring each against `fixed`.
///
/// Candidates are scored in parallel and reduced in canonical order, so ties keep the
/// first candidate exactly as a sequential scan would.
pub fn exhaustive_search(fixed: &GrayImage, moving: &GrayImage, cfg: &SearchConfig) -> RegResult<SearchResult> {
    cfg.validate()?;
    ensure_same_shape(fixed.dimensions(), moving.dimensions())?;

    let grid = candidates(cfg);
    debug!(candidates = grid.len(), metric = %cfg.metric, "starting exhaustive search");

    let history: Vec<SearchSample> = grid
        .par_iter()
        .map(|&(tx, ty)| {
            let shifted = warp_affine(moving, &AffineMatrix::translation(tx as f64, ty as f64))?;
            let score = similarity(fixed, &shifted, cfg.metric)?;
            Ok(SearchSample { tx, ty, score })
        })
        .collect::<RegResult<Vec<_>>>()?;

    let mut best = SearchSample {
        tx: 0,
        ty: 0,
        score: cfg.metric.worst_score(),
    };
    for sample in &history {
        if cfg.metric.improves(sample.score, best.score) {
            best = *sample;
        }
    }
    info!(tx = best.tx, ty = best.ty, score = best.score, metric = %cfg.metric, "best translation");

    Ok(SearchResult {
        transform: AffineMatrix::translation(best.tx as f64, best.ty as f64),
        tx: best.tx,
        ty: best.ty,
        score: best.score,
        metric: cfg.metric,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{create_synthetic, SyntheticPattern};
    use imreg_core::{RegError, TransformKind, TransformParams};
    use imreg_geometry::apply_transformation;

    fn grid(range: i32, metric: SimilarityMetric) -> SearchConfig {
        SearchConfig {
            range_x: (-range, range),
            range_y: (-range, range),
            step: 1,
            metric,
        }
    }

    #[test]
    fn test_recovers_known_translation() {
        let base = create_synthetic(128, SyntheticPattern::Checkerboard).unwrap();
        let (fixed, _) =
            apply_transformation(&base, TransformKind::Translation, &TransformParams::translation(3.0, -2.0)).unwrap();

        let result = exhaustive_search(&fixed, &base, &grid(5, SimilarityMetric::Mse)).unwrap();
        assert_eq!((result.tx, result.ty), (3, -2));
        assert_eq!(result.score, 0.0);
        assert_eq!(result.transform, AffineMatrix::translation(3.0, -2.0));
        assert_eq!(result.history.len(), 121);
        for s in &result.history {
            if (s.tx, s.ty) != (3, -2) {
                assert!(s.score > result.score);
            }
        }
    }

    #[test]
    fn test_ncc_is_maximised() {
        let base = create_synthetic(160, SyntheticPattern::Rectangles).unwrap();
        let (fixed, _) =
            apply_transformation(&base, TransformKind::Translation, &TransformParams::translation(-1.0, 2.0)).unwrap();
        let result = exhaustive_search(&fixed, &base, &grid(3, SimilarityMetric::Ncc)).unwrap();
        assert_eq!((result.tx, result.ty), (-1, 2));
        assert!((result.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_history_order_and_ties() {
        // Identical flat images score equally everywhere; the first candidate wins
        let flat = GrayImage::from_pixel(16, 16, image::Luma([0]));
        let cfg = SearchConfig {
            range_x: (-2, 2),
            range_y: (0, 4),
            step: 2,
            metric: SimilarityMetric::Mse,
        };
        let result = exhaustive_search(&flat, &flat, &cfg).unwrap();
        assert_eq!((result.tx, result.ty), (-2, 0));
        let order: Vec<(i32, i32)> = result.history.iter().map(|s| (s.tx, s.ty)).collect();
        assert_eq!(
            order,
            vec![(-2, 0), (-2, 2), (-2, 4), (0, 0), (0, 2), (0, 4), (2, 0), (2, 2), (2, 4)]
        );
    }

    #[test]
    fn test_invalid_search_arguments() {
        let a = GrayImage::new(8, 8);
        let b = GrayImage::new(8, 9);
        assert!(matches!(
            exhaustive_search(&a, &b, &grid(1, SimilarityMetric::Mse)),
            Err(RegError::ShapeMismatch { .. })
        ));
        let zero_step = SearchConfig {
            step: 0,
            ..grid(1, SimilarityMetric::Mse)
        };
        assert!(matches!(
            exhaustive_search(&a, &a, &zero_step),
            Err(RegError::InvalidParameter { name: "step", .. })
        ));
    }
}
