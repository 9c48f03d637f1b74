use crate::brief::BriefPattern;
use crate::pyramid::{ImagePyramid, ScaleLevel};
use crate::refinement::KeypointRefinement;
use crate::FeatureExtractor;
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use imreg_core::{DetectionConfig, Descriptors, DetectorKind, GrayImage, Keypoint, RegError, RegResult};
use rayon::prelude::*;
use tracing::debug;

const HARRIS_BLOCK: u32 = 7;
const HARRIS_K: f32 = 0.04;
const NMS_DISTANCE: f32 = 3.0;
const ORIENTATION_RADIUS: i32 = 15;
const DESCRIPTOR_SIGMA: f32 = 2.0;

/// Oriented FAST keypoints with rotated BRIEF descriptors over a scale pyramid
#[derive(Debug, Clone)]
pub struct OrbExtractor {
    pub max_features: usize,
    pub n_levels: usize,
    pub scale_factor: f32,
    pub fast_threshold: u8,
    /// Keypoints closer than this to a level border are dropped
    pub edge_threshold: u32,
    pub patch_size: u32,
    pattern: BriefPattern,
}

impl OrbExtractor {
    pub fn new(max_features: usize) -> Self {
        Self {
            max_features,
            n_levels: 8,
            scale_factor: 1.2,
            fast_threshold: 20,
            edge_threshold: 31,
            patch_size: 31,
            pattern: BriefPattern::orb(),
        }
    }

    pub fn from_config(cfg: &DetectionConfig) -> Self {
        Self {
            n_levels: cfg.n_levels,
            scale_factor: cfg.scale_factor,
            fast_threshold: cfg.fast_threshold,
            ..Self::new(cfg.max_features)
        }
    }

    /// Number of features requested from each pyramid level, decaying geometrically
    fn level_quotas(&self, n_levels: usize) -> Vec<usize> {
        if n_levels == 0 {
            return Vec::new();
        }
        let f = 1.0 / self.scale_factor as f64;
        let denom = 1.0 - f.powi(n_levels as i32);
        let mut per_level = self.max_features as f64 * (1.0 - f) / denom;
        let mut quotas = Vec::with_capacity(n_levels);
        let mut assigned = 0usize;
        for _ in 0..n_levels - 1 {
            let q = per_level.round() as usize;
            quotas.push(q);
            assigned += q;
            per_level *= f;
        }
        quotas.push(self.max_features.saturating_sub(assigned));
        quotas
    }

    fn detect_at_level(
        &self,
        level_img: &GrayImage,
        level: &ScaleLevel,
        quota: usize,
    ) -> (Vec<Keypoint>, Vec<Vec<u8>>) {
        if quota == 0 {
            return (Vec::new(), Vec::new());
        }
        let (w, h) = level_img.dimensions();
        let border = self.edge_threshold;

        let candidates: Vec<Keypoint> = corners_fast9(level_img, self.fast_threshold)
            .into_iter()
            .filter(|c| c.x >= border && c.y >= border && c.x + border < w && c.y + border < h)
            .map(|c| Keypoint {
                response: KeypointRefinement::harris_response(level_img, c.x, c.y, HARRIS_BLOCK, HARRIS_K),
                ..Keypoint::new(c.x as f32, c.y as f32)
            })
            .collect();

        let mut kept = KeypointRefinement::non_maximum_suppression(&candidates, NMS_DISTANCE);
        kept.truncate(quota);
        if kept.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let smoothed = gaussian_blur_f32(level_img, DESCRIPTOR_SIGMA);
        kept.into_iter()
            .map(|kp| {
                let angle = KeypointRefinement::compute_orientation(level_img, kp.x, kp.y, ORIENTATION_RADIUS);
                let descriptor = self.pattern.describe(&smoothed, kp.x, kp.y, angle);
                let keypoint = Keypoint {
                    x: kp.x * level.scale,
                    y: kp.y * level.scale,
                    size: self.patch_size as f32 * level.scale,
                    angle,
                    response: kp.response,
                    octave: level.level as u8,
                };
                (keypoint, descriptor)
            })
            .unzip()
    }
}

impl FeatureExtractor for OrbExtractor {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Orb
    }

    fn detect_and_compute(&self, img: &GrayImage) -> RegResult<(Vec<Keypoint>, Descriptors)> {
        if self.max_features == 0 {
            return Err(RegError::invalid("max_features", "must be positive"));
        }
        let (w, h) = img.dimensions();
        let min_size = 2 * self.edge_threshold + 1;
        let levels = ImagePyramid::generate_scale_levels(w, h, self.n_levels, self.scale_factor, min_size);
        if levels.is_empty() {
            debug!(width = w, height = h, "image smaller than the ORB patch, no keypoints");
            return Ok((Vec::new(), Descriptors::Binary(Vec::new())));
        }

        let pyramid = ImagePyramid::build_image_pyramid(img, &levels);
        let quotas = self.level_quotas(levels.len());

        let per_level: Vec<(Vec<Keypoint>, Vec<Vec<u8>>)> = levels
            .par_iter()
            .zip(pyramid.par_iter())
            .zip(quotas.par_iter())
            .map(|((level, level_img), &quota)| self.detect_at_level(level_img, level, quota))
            .collect();

        let mut keypoints = Vec::new();
        let mut rows = Vec::new();
        for (kps, descs) in per_level {
            keypoints.extend(kps);
            rows.extend(descs);
        }
        let (keypoints, rows) = KeypointRefinement::retain_best(keypoints, rows, self.max_features);
        debug!(levels = levels.len(), keypoints = keypoints.len(), "orb extraction finished");
        Ok((keypoints, Descriptors::Binary(rows)))
    }
}
