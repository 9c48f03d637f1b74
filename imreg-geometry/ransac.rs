use crate::homography::{estimate_homography_dlt, has_collinear_triple, reprojection_error};
use crate::transform::Transform;
use imreg_core::{FeatureMatch, Keypoint, RansacConfig};
use nalgebra::Matrix3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, warn};

const SAMPLE_SIZE: usize = 4;

/// Homography accepted by consensus, with the matches that support it
#[derive(Debug, Clone, PartialEq)]
pub struct HomographyFit {
    pub transform: Transform,
    /// Parallel to the input correspondences
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
}

fn score(h: &Matrix3<f64>, src: &[[f64; 2]], dst: &[[f64; 2]], thresh: f64) -> (Vec<bool>, usize) {
    let mask: Vec<bool> = src
        .par_iter()
        .zip(dst.par_iter())
        .map(|(s, d)| reprojection_error(h, s, d) <= thresh)
        .collect();
    let count = mask.iter().filter(|&&m| m).count();
    (mask, count)
}

/// Iterations needed to draw an all-inlier sample with the given confidence
fn required_iterations(inlier_ratio: f64, confidence: f64, cap: usize) -> usize {
    let p = inlier_ratio.powi(SAMPLE_SIZE as i32);
    if p >= 1.0 {
        return 1;
    }
    if p <= 0.0 {
        return cap;
    }
    let k = (1.0 - confidence).ln() / (1.0 - p).ln();
    if k.is_finite() && k >= 0.0 {
        (k.ceil() as usize).min(cap)
    } else {
        cap
    }
}

/// Robust homography with `dst ≈ H * src`. `None` when there are fewer than four
/// correspondences or no well-conditioned model exists.
pub fn find_homography_ransac(src: &[[f64; 2]], dst: &[[f64; 2]], cfg: &RansacConfig) -> Option<HomographyFit> {
    let n = src.len();
    if n < SAMPLE_SIZE || dst.len() != n {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut best: Option<(Matrix3<f64>, Vec<bool>, usize)> = None;
    let mut iterations = cfg.max_iters;
    let mut iter = 0;

    while iter < iterations {
        iter += 1;
        let idx = rand::seq::index::sample(&mut rng, n, SAMPLE_SIZE);
        let s4: Vec<[f64; 2]> = idx.iter().map(|i| src[i]).collect();
        let d4: Vec<[f64; 2]> = idx.iter().map(|i| dst[i]).collect();
        if has_collinear_triple(&s4) || has_collinear_triple(&d4) {
            continue;
        }
        let h = match estimate_homography_dlt(&s4, &d4) {
            Ok(h) => h,
            Err(_) => continue,
        };

        let (mask, count) = score(&h, src, dst, cfg.reproj_thresh);
        if best.as_ref().map_or(true, |(_, _, c)| count > *c) {
            iterations = iterations.min(required_iterations(count as f64 / n as f64, cfg.confidence, cfg.max_iters));
            best = Some((h, mask, count));
        }
    }

    let (h, mask, count) = best?;
    debug!(iterations = iter, inliers = count, total = n, "ransac consensus");

    // Refit on the consensus set and keep it when it does not lose support
    let (h, mask, count) = if count > SAMPLE_SIZE {
        let (s, d): (Vec<[f64; 2]>, Vec<[f64; 2]>) = src
            .iter()
            .zip(dst)
            .zip(&mask)
            .filter(|(_, m)| **m)
            .map(|((s, d), _)| (*s, *d))
            .unzip();
        match estimate_homography_dlt(&s, &d) {
            Ok(refit) => {
                let (refit_mask, refit_count) = score(&refit, src, dst, cfg.reproj_thresh);
                if refit_count >= count {
                    (refit, refit_mask, refit_count)
                } else {
                    (h, mask, count)
                }
            }
            Err(_) => (h, mask, count),
        }
    } else {
        (h, mask, count)
    };

    if h.determinant().abs() < 1e-12 {
        warn!("consensus homography is singular");
        return None;
    }

    Some(HomographyFit {
        transform: Transform::Homography(h),
        inlier_mask: mask,
        num_inliers: count,
    })
}

/// Fit the homography mapping image B onto image A from matches whose query side indexes
/// `kp_a` and train side indexes `kp_b`.
pub fn filter_matches_ransac(
    kp_a: &[Keypoint],
    kp_b: &[Keypoint],
    matches: &[FeatureMatch],
    cfg: &RansacConfig,
) -> Option<HomographyFit> {
    if matches.len() < SAMPLE_SIZE {
        return None;
    }
    let mut src = Vec::with_capacity(matches.len());
    let mut dst = Vec::with_capacity(matches.len());
    for m in matches {
        let (a, b) = match (kp_a.get(m.query_idx), kp_b.get(m.train_idx)) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                warn!(query = m.query_idx, train = m.train_idx, "match references a missing keypoint");
                return None;
            }
        };
        src.push([b.x as f64, b.y as f64]);
        dst.push([a.x as f64, a.y as f64]);
    }
    find_homography_ransac(&src, &dst, cfg)
}
