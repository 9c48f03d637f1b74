use crate::refinement::KeypointRefinement;
use crate::scale_space::Plane;
use crate::FeatureExtractor;
use imreg_core::{Descriptors, DetectorKind, GrayImage, Keypoint, RegError, RegResult};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use std::f32::consts::{PI, SQRT_2};
use tracing::debug;

/// Blur already present in a camera image
const INITIAL_SIGMA: f32 = 0.5;
const IMAGE_BORDER: usize = 5;
const MAX_INTERP_STEPS: usize = 5;

const ORI_HIST_BINS: usize = 36;
const ORI_SIG_FCTR: f32 = 1.5;
const ORI_RADIUS: f32 = 3.0 * ORI_SIG_FCTR;
const ORI_PEAK_RATIO: f32 = 0.8;

const DESCR_WIDTH: usize = 4;
const DESCR_HIST_BINS: usize = 8;
const DESCR_SCL_FCTR: f32 = 3.0;
const DESCR_MAG_THR: f32 = 0.2;

/// Length of a SIFT descriptor row
pub const SIFT_DESCRIPTOR_LEN: usize = DESCR_WIDTH * DESCR_WIDTH * DESCR_HIST_BINS;

/// Difference-of-Gaussians keypoints with gradient histogram descriptors
#[derive(Debug, Clone)]
pub struct SiftExtractor {
    pub max_features: usize,
    /// Scales sampled per octave
    pub n_intervals: usize,
    pub sigma: f32,
    pub contrast_threshold: f32,
    /// Principal curvature ratio above which extrema are treated as edges
    pub edge_threshold: f32,
}

struct Octave {
    gaussians: Vec<Plane>,
    dogs: Vec<Plane>,
}

/// Refined scale-space extremum in octave-local coordinates
#[derive(Debug, Clone, Copy)]
struct Extremum {
    octave: usize,
    layer: usize,
    x: f32,
    y: f32,
    layer_offset: f32,
    contrast: f32,
}

impl SiftExtractor {
    pub fn new(max_features: usize) -> Self {
        Self {
            max_features,
            n_intervals: 3,
            sigma: 1.6,
            contrast_threshold: 0.04,
            edge_threshold: 10.0,
        }
    }

    fn build_octaves(&self, img: &GrayImage) -> Vec<Octave> {
        let (w, h) = img.dimensions();
        let n_octaves = ((w.min(h) as f32).log2() - 3.0).floor().max(0.0) as usize;
        if n_octaves == 0 {
            return Vec::new();
        }

        let s = self.n_intervals;
        let k = 2f32.powf(1.0 / s as f32);
        let increments: Vec<f32> = (0..s + 3)
            .map(|i| {
                if i == 0 {
                    self.sigma
                } else {
                    let prev = self.sigma * k.powi(i as i32 - 1);
                    let total = prev * k;
                    (total * total - prev * prev).sqrt()
                }
            })
            .collect();

        let init = (self.sigma * self.sigma - INITIAL_SIGMA * INITIAL_SIGMA).max(0.01).sqrt();
        let mut base = Plane::from_gray(img).gaussian_blur(init);
        let mut octaves = Vec::with_capacity(n_octaves);

        for _ in 0..n_octaves {
            let mut gaussians = Vec::with_capacity(s + 3);
            gaussians.push(base);
            for increment in &increments[1..] {
                let next = gaussians[gaussians.len() - 1].gaussian_blur(*increment);
                gaussians.push(next);
            }
            let dogs: Vec<Plane> = gaussians.windows(2).map(|p| p[1].difference(&p[0])).collect();
            base = gaussians[s].downsample();
            octaves.push(Octave { gaussians, dogs });
        }
        octaves
    }

    fn find_extrema(&self, octave_idx: usize, octave: &Octave) -> Vec<Extremum> {
        let threshold = 0.5 * self.contrast_threshold / self.n_intervals as f32;
        let per_layer: Vec<Vec<Extremum>> = (1..=self.n_intervals)
            .into_par_iter()
            .map(|layer| {
                let dog = &octave.dogs[layer];
                let (w, h) = (dog.width, dog.height);
                let mut found = Vec::new();
                if w <= 2 * IMAGE_BORDER || h <= 2 * IMAGE_BORDER {
                    return found;
                }
                for y in IMAGE_BORDER..h - IMAGE_BORDER {
                    for x in IMAGE_BORDER..w - IMAGE_BORDER {
                        let v = dog.get(x, y);
                        if v.abs() <= threshold || !is_extremum(&octave.dogs, layer, x, y, v) {
                            continue;
                        }
                        if let Some(e) = self.refine(octave_idx, octave, layer, x, y) {
                            found.push(e);
                        }
                    }
                }
                found
            })
            .collect();
        per_layer.into_iter().flatten().collect()
    }

    /// Quadratic interpolation of the extremum location, with contrast and edge rejection
    fn refine(&self, octave_idx: usize, octave: &Octave, layer: usize, x: usize, y: usize) -> Option<Extremum> {
        let dogs = &octave.dogs;
        let s = self.n_intervals as isize;
        let (w, h) = (dogs[0].width as isize, dogs[0].height as isize);
        let border = IMAGE_BORDER as isize;
        let (mut xi, mut yi, mut li) = (x as isize, y as isize, layer as isize);

        let mut converged = None;
        for _ in 0..MAX_INTERP_STEPS {
            let (grad, hess) = derivatives(dogs, li as usize, xi, yi);
            let offset = -(hess.try_inverse()? * grad);
            if offset.iter().all(|o| o.abs() < 0.5) {
                converged = Some((grad, hess, offset));
                break;
            }
            xi += offset[0].round() as isize;
            yi += offset[1].round() as isize;
            li += offset[2].round() as isize;
            if li < 1 || li > s || xi < border || yi < border || xi >= w - border || yi >= h - border {
                return None;
            }
        }
        let (grad, hess, offset) = converged?;

        let contrast = dogs[li as usize].at(xi, yi) + 0.5 * grad.dot(&offset);
        if contrast.abs() * (self.n_intervals as f32) < self.contrast_threshold {
            return None;
        }

        let (dxx, dyy, dxy) = (hess[(0, 0)], hess[(1, 1)], hess[(0, 1)]);
        let trace = dxx + dyy;
        let det = dxx * dyy - dxy * dxy;
        let r = self.edge_threshold;
        if det <= 0.0 || trace * trace * r >= (r + 1.0) * (r + 1.0) * det {
            return None;
        }

        Some(Extremum {
            octave: octave_idx,
            layer: li as usize,
            x: xi as f32 + offset[0],
            y: yi as f32 + offset[1],
            layer_offset: offset[2],
            contrast,
        })
    }

    /// Octave-local scale of an extremum
    fn local_scale(&self, e: &Extremum) -> f32 {
        self.sigma * 2f32.powf((e.layer as f32 + e.layer_offset) / self.n_intervals as f32)
    }

    /// Dominant gradient directions around the extremum, in radians within [0, 2π)
    fn orientations(&self, gauss: &Plane, e: &Extremum) -> Vec<f32> {
        let scale = self.local_scale(e);
        let radius = (ORI_RADIUS * scale).round() as isize;
        let denom = 2.0 * (ORI_SIG_FCTR * scale).powi(2);
        let (w, h) = (gauss.width as isize, gauss.height as isize);
        let (cx, cy) = (e.x.round() as isize, e.y.round() as isize);

        let mut hist = [0f32; ORI_HIST_BINS];
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let (px, py) = (cx + dx, cy + dy);
                if px <= 0 || py <= 0 || px >= w - 1 || py >= h - 1 {
                    continue;
                }
                let (gx, gy) = gauss.gradient(px, py);
                let magnitude = (gx * gx + gy * gy).sqrt();
                let weight = (-((dx * dx + dy * dy) as f32) / denom).exp();
                let bin = (gy.atan2(gx) / (2.0 * PI) * ORI_HIST_BINS as f32).round() as isize;
                hist[bin.rem_euclid(ORI_HIST_BINS as isize) as usize] += weight * magnitude;
            }
        }

        let n = ORI_HIST_BINS;
        let smooth: Vec<f32> = (0..n)
            .map(|i| {
                (hist[(i + n - 2) % n] + hist[(i + 2) % n]) / 16.0
                    + (hist[(i + n - 1) % n] + hist[(i + 1) % n]) * 4.0 / 16.0
                    + hist[i] * 6.0 / 16.0
            })
            .collect();
        let max = smooth.iter().cloned().fold(0.0f32, f32::max);
        if max <= 0.0 {
            return Vec::new();
        }

        (0..n)
            .filter_map(|i| {
                let (l, c, r) = (smooth[(i + n - 1) % n], smooth[i], smooth[(i + 1) % n]);
                if c > l && c > r && c >= ORI_PEAK_RATIO * max {
                    let interp = 0.5 * (l - r) / (l - 2.0 * c + r);
                    let bin = i as f32 + interp;
                    Some((bin * 2.0 * PI / n as f32).rem_euclid(2.0 * PI))
                } else {
                    None
                }
            })
            .collect()
    }

    /// 4x4 spatial cells of 8-bin gradient histograms, trilinearly accumulated
    fn describe(&self, gauss: &Plane, x: f32, y: f32, scale: f32, angle: f32) -> Vec<f32> {
        let d = DESCR_WIDTH as f32;
        let hist_width = DESCR_SCL_FCTR * scale;
        let max_radius = ((gauss.width * gauss.width + gauss.height * gauss.height) as f32).sqrt();
        let radius = (hist_width * SQRT_2 * (d + 1.0) * 0.5).round().min(max_radius) as isize;
        let (sin_t, cos_t) = angle.sin_cos();
        let bins_per_rad = DESCR_HIST_BINS as f32 / (2.0 * PI);
        let exp_scale = -1.0 / (0.5 * d * d);
        let (w, h) = (gauss.width as isize, gauss.height as isize);
        let (cx, cy) = (x.round() as isize, y.round() as isize);

        let mut hist = vec![0f32; SIFT_DESCRIPTOR_LEN];
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let (fx, fy) = (dx as f32, dy as f32);
                let u = (cos_t * fx + sin_t * fy) / hist_width;
                let v = (-sin_t * fx + cos_t * fy) / hist_width;
                let rbin = v + d / 2.0 - 0.5;
                let cbin = u + d / 2.0 - 0.5;
                if rbin <= -1.0 || rbin >= d || cbin <= -1.0 || cbin >= d {
                    continue;
                }
                let (px, py) = (cx + dx, cy + dy);
                if px <= 0 || py <= 0 || px >= w - 1 || py >= h - 1 {
                    continue;
                }
                let (gx, gy) = gauss.gradient(px, py);
                let magnitude = (gx * gx + gy * gy).sqrt();
                let ori = (gy.atan2(gx) - angle).rem_euclid(2.0 * PI);
                let weight = ((u * u + v * v) * exp_scale).exp();
                accumulate(&mut hist, rbin, cbin, ori * bins_per_rad, magnitude * weight);
            }
        }

        normalize(&mut hist);
        for v in hist.iter_mut() {
            *v = v.min(DESCR_MAG_THR);
        }
        normalize(&mut hist);
        hist
    }
}

fn is_extremum(dogs: &[Plane], layer: usize, x: usize, y: usize, v: f32) -> bool {
    let mut is_max = true;
    let mut is_min = true;
    for plane in &dogs[layer - 1..=layer + 1] {
        for yy in y - 1..=y + 1 {
            for xx in x - 1..=x + 1 {
                let n = plane.get(xx, yy);
                if n > v {
                    is_max = false;
                }
                if n < v {
                    is_min = false;
                }
            }
        }
        if !is_max && !is_min {
            return false;
        }
    }
    true
}

/// Gradient and Hessian of the DoG stack in (x, y, scale)
fn derivatives(dogs: &[Plane], l: usize, x: isize, y: isize) -> (Vector3<f32>, Matrix3<f32>) {
    let (prev, cur, next) = (&dogs[l - 1], &dogs[l], &dogs[l + 1]);
    let v = cur.at(x, y);

    let dx = 0.5 * (cur.at(x + 1, y) - cur.at(x - 1, y));
    let dy = 0.5 * (cur.at(x, y + 1) - cur.at(x, y - 1));
    let ds = 0.5 * (next.at(x, y) - prev.at(x, y));

    let dxx = cur.at(x + 1, y) + cur.at(x - 1, y) - 2.0 * v;
    let dyy = cur.at(x, y + 1) + cur.at(x, y - 1) - 2.0 * v;
    let dss = next.at(x, y) + prev.at(x, y) - 2.0 * v;
    let dxy = 0.25 * (cur.at(x + 1, y + 1) - cur.at(x - 1, y + 1) - cur.at(x + 1, y - 1) + cur.at(x - 1, y - 1));
    let dxs = 0.25 * (next.at(x + 1, y) - next.at(x - 1, y) - prev.at(x + 1, y) + prev.at(x - 1, y));
    let dys = 0.25 * (next.at(x, y + 1) - next.at(x, y - 1) - prev.at(x, y + 1) + prev.at(x, y - 1));

    (
        Vector3::new(dx, dy, ds),
        Matrix3::new(dxx, dxy, dxs, dxy, dyy, dys, dxs, dys, dss),
    )
}

fn accumulate(hist: &mut [f32], rbin: f32, cbin: f32, obin: f32, value: f32) {
    let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
    let (dr, dc, dor) = (rbin - r0, cbin - c0, obin - o0);
    let o0 = o0 as usize;

    for (ri, wr) in [(r0 as isize, 1.0 - dr), (r0 as isize + 1, dr)] {
        if ri < 0 || ri >= DESCR_WIDTH as isize {
            continue;
        }
        for (ci, wc) in [(c0 as isize, 1.0 - dc), (c0 as isize + 1, dc)] {
            if ci < 0 || ci >= DESCR_WIDTH as isize {
                continue;
            }
            let cell = (ri as usize * DESCR_WIDTH + ci as usize) * DESCR_HIST_BINS;
            for (oi, wo) in [(o0 % DESCR_HIST_BINS, 1.0 - dor), ((o0 + 1) % DESCR_HIST_BINS, dor)] {
                hist[cell + oi] += value * wr * wc * wo;
            }
        }
    }
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

impl FeatureExtractor for SiftExtractor {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Sift
    }

    fn detect_and_compute(&self, img: &GrayImage) -> RegResult<(Vec<Keypoint>, Descriptors)> {
        if self.max_features == 0 {
            return Err(RegError::invalid("max_features", "must be positive"));
        }
        let octaves = self.build_octaves(img);
        if octaves.is_empty() {
            debug!(dimensions = ?img.dimensions(), "image too small for a DoG pyramid");
            return Ok((Vec::new(), Descriptors::Real(Vec::new())));
        }

        let extrema: Vec<Extremum> = octaves
            .iter()
            .enumerate()
            .flat_map(|(o, octave)| self.find_extrema(o, octave))
            .collect();
        debug!(octaves = octaves.len(), extrema = extrema.len(), "sift extrema located");

        let oriented: Vec<(Extremum, f32)> = extrema
            .par_iter()
            .map(|e| {
                let gauss = &octaves[e.octave].gaussians[e.layer];
                self.orientations(gauss, e)
                    .into_iter()
                    .map(|angle| (*e, angle))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect();

        let (keypoints, rows): (Vec<Keypoint>, Vec<Vec<f32>>) = oriented
            .par_iter()
            .map(|(e, angle)| {
                let gauss = &octaves[e.octave].gaussians[e.layer];
                let scale = self.local_scale(e);
                let factor = (1u32 << e.octave) as f32;
                let keypoint = Keypoint {
                    x: e.x * factor,
                    y: e.y * factor,
                    size: 2.0 * scale * factor,
                    angle: *angle,
                    response: e.contrast.abs(),
                    octave: e.octave as u8,
                };
                (keypoint, self.describe(gauss, e.x, e.y, scale, *angle))
            })
            .unzip();

        let (keypoints, rows) = KeypointRefinement::retain_best(keypoints, rows, self.max_features);
        Ok((keypoints, Descriptors::Real(rows)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn blob_image() -> GrayImage {
        let centres = [(40.0f32, 40.0f32, 7.0f32), (90.0, 50.0, 10.0), (60.0, 100.0, 6.0)];
        GrayImage::from_fn(128, 128, |x, y| {
            let inside = centres.iter().any(|&(cx, cy, r)| {
                let (dx, dy) = (x as f32 - cx, y as f32 - cy);
                dx * dx + dy * dy <= r * r
            });
            if inside {
                Luma([230])
            } else {
                Luma([60])
            }
        })
    }

    #[test]
    fn test_sift_finds_blobs() {
        let img = blob_image();
        let (kps, desc) = SiftExtractor::new(200).detect_and_compute(&img).unwrap();
        assert!(!kps.is_empty());
        assert_eq!(desc.len(), kps.len());
        assert_eq!(desc.row_len(), SIFT_DESCRIPTOR_LEN);

        let near_blob = kps.iter().any(|kp| {
            let (dx, dy) = (kp.x - 90.0, kp.y - 50.0);
            (dx * dx + dy * dy).sqrt() < 5.0
        });
        assert!(near_blob, "no keypoint near the large blob");
    }

    #[test]
    fn test_sift_descriptors_are_unit_length() {
        let img = blob_image();
        let (_, desc) = SiftExtractor::new(50).detect_and_compute(&img).unwrap();
        if let Descriptors::Real(rows) = desc {
            for row in rows {
                let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
                assert!((norm - 1.0).abs() < 1e-3 || norm == 0.0);
                assert!(row.iter().all(|&v| v >= 0.0));
            }
        } else {
            panic!("sift must produce real descriptors");
        }
    }

    #[test]
    fn test_sift_flat_and_tiny_images() {
        let flat = GrayImage::from_pixel(64, 64, Luma([128]));
        let (kps, desc) = SiftExtractor::new(10).detect_and_compute(&flat).unwrap();
        assert!(kps.is_empty());
        assert!(matches!(desc, Descriptors::Real(ref r) if r.is_empty()));

        let tiny = GrayImage::from_pixel(12, 12, Luma([10]));
        let (kps, _) = SiftExtractor::new(10).detect_and_compute(&tiny).unwrap();
        assert!(kps.is_empty());
    }

    #[test]
    fn test_sift_respects_max_features() {
        let img = blob_image();
        let (kps, desc) = SiftExtractor::new(2).detect_and_compute(&img).unwrap();
        assert!(kps.len() <= 2);
        assert_eq!(desc.len(), kps.len());
    }

    #[test]
    fn test_trilinear_accumulate_conserves_mass() {
        let mut hist = vec![0f32; SIFT_DESCRIPTOR_LEN];
        accumulate(&mut hist, 1.3, 2.6, 7.5, 2.0);
        assert!((hist.iter().sum::<f32>() - 2.0).abs() < 1e-5);
        // Orientation bin wraps from 7 to 0
        let cell = (DESCR_WIDTH + 2) * DESCR_HIST_BINS;
        assert!(hist[cell] > 0.0);
        assert!(hist[cell + 7] > 0.0);
    }
}
