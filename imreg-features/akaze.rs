use crate::refinement::KeypointRefinement;
use crate::scale_space::Plane;
use crate::FeatureExtractor;
use imreg_core::{Descriptors, DetectorKind, GrayImage, Keypoint, RegError, RegResult};
use nalgebra::{Matrix2, Vector2};
use rayon::prelude::*;
use std::f32::consts::{FRAC_PI_3, PI};
use tracing::debug;

const INITIAL_SIGMA: f32 = 0.5;
const MIN_OCTAVE_SIZE: usize = 32;
const DETECT_BORDER: usize = 5;
const DUPLICATE_DISTANCE: f32 = 2.0;

/// Orientation samples lie within this many scale units of the keypoint
const ORI_SAMPLE_RADIUS: isize = 6;
const ORI_WEIGHT_SIGMA: f32 = 2.5;
const ORI_WINDOW_STEP: f32 = 0.15;

/// Half-width of the described patch in scale units
const PATTERN_SIZE: f32 = 10.0;
const GRIDS: [usize; 3] = [2, 3, 4];
const CELL_SAMPLES: usize = 4;

/// Bits in an M-LDB descriptor: three comparisons for every cell pair of the 2x2, 3x3 and 4x4 grids
pub const AKAZE_DESCRIPTOR_BITS: usize = 3 * (6 + 36 + 120);
pub const AKAZE_DESCRIPTOR_BYTES: usize = (AKAZE_DESCRIPTOR_BITS + 7) / 8;

/// Determinant-of-Hessian keypoints over a Gaussian scale space with binary M-LDB descriptors
#[derive(Debug, Clone)]
pub struct AkazeExtractor {
    pub max_features: usize,
    pub n_octaves: usize,
    pub n_sublevels: usize,
    pub base_sigma: f32,
    /// Minimum scale-normalised Hessian response
    pub threshold: f32,
}

struct Evolution {
    octave: usize,
    /// Octave-local scale
    sigma: f32,
    image: Plane,
    response: Plane,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    evolution: usize,
    x: f32,
    y: f32,
    response: f32,
}

impl AkazeExtractor {
    pub fn new(max_features: usize) -> Self {
        Self {
            max_features,
            n_octaves: 4,
            n_sublevels: 4,
            base_sigma: 1.6,
            threshold: 0.001,
        }
    }

    fn build_evolutions(&self, img: &GrayImage) -> Vec<Evolution> {
        let (w, h) = img.dimensions();
        if (w.min(h) as usize) < MIN_OCTAVE_SIZE {
            return Vec::new();
        }
        let init = (self.base_sigma * self.base_sigma - INITIAL_SIGMA * INITIAL_SIGMA).sqrt();
        let mut base = Plane::from_gray(img).gaussian_blur(init);
        let mut evolutions = Vec::with_capacity(self.n_octaves * self.n_sublevels);

        for octave in 0..self.n_octaves {
            if base.width.min(base.height) < MIN_OCTAVE_SIZE {
                break;
            }
            let mut level = base;
            let mut level_sigma = self.base_sigma;
            for i in 0..self.n_sublevels {
                let sigma = self.base_sigma * 2f32.powf(i as f32 / self.n_sublevels as f32);
                if i > 0 {
                    level = level.gaussian_blur((sigma * sigma - level_sigma * level_sigma).sqrt());
                    level_sigma = sigma;
                }
                evolutions.push(Evolution {
                    octave,
                    sigma,
                    response: hessian_response(&level, sigma),
                    image: level.clone(),
                });
            }
            let doubled = 2.0 * self.base_sigma;
            base = level
                .gaussian_blur((doubled * doubled - level_sigma * level_sigma).sqrt())
                .downsample();
        }
        evolutions
    }

    fn find_candidates(&self, evolutions: &[Evolution]) -> Vec<Candidate> {
        let per_level: Vec<Vec<Candidate>> = (0..evolutions.len())
            .into_par_iter()
            .map(|k| {
                let ev = &evolutions[k];
                let r = &ev.response;
                let mut found = Vec::new();
                if r.width <= 2 * DETECT_BORDER || r.height <= 2 * DETECT_BORDER {
                    return found;
                }
                let neighbours: Vec<&Plane> = [k.checked_sub(1), Some(k + 1)]
                    .into_iter()
                    .flatten()
                    .filter_map(|j| evolutions.get(j))
                    .filter(|other| other.octave == ev.octave)
                    .map(|other| &other.response)
                    .collect();

                for y in DETECT_BORDER..r.height - DETECT_BORDER {
                    for x in DETECT_BORDER..r.width - DETECT_BORDER {
                        let v = r.get(x, y);
                        if v <= self.threshold || !is_local_maximum(r, &neighbours, x, y, v) {
                            continue;
                        }
                        if let Some((ox, oy)) = subpixel_offset(r, x as isize, y as isize) {
                            found.push(Candidate {
                                evolution: k,
                                x: x as f32 + ox,
                                y: y as f32 + oy,
                                response: v,
                            });
                        }
                    }
                }
                found
            })
            .collect();
        per_level.into_iter().flatten().collect()
    }
}

/// Scale-normalised determinant of the Hessian
fn hessian_response(plane: &Plane, sigma: f32) -> Plane {
    let norm = sigma.powi(4);
    let (w, h) = (plane.width, plane.height);
    let mut data = vec![0f32; w * h];
    data.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let y = y as isize;
        for (x, out) in row.iter_mut().enumerate() {
            let x = x as isize;
            let c = plane.at(x, y);
            let lxx = plane.at(x + 1, y) + plane.at(x - 1, y) - 2.0 * c;
            let lyy = plane.at(x, y + 1) + plane.at(x, y - 1) - 2.0 * c;
            let lxy = 0.25
                * (plane.at(x + 1, y + 1) - plane.at(x - 1, y + 1) - plane.at(x + 1, y - 1)
                    + plane.at(x - 1, y - 1));
            *out = (lxx * lyy - lxy * lxy) * norm;
        }
    });
    Plane {
        width: w,
        height: h,
        data,
    }
}

fn is_local_maximum(r: &Plane, neighbours: &[&Plane], x: usize, y: usize, v: f32) -> bool {
    for yy in y - 1..=y + 1 {
        for xx in x - 1..=x + 1 {
            if (xx != x || yy != y) && r.get(xx, yy) >= v {
                return false;
            }
            if neighbours.iter().any(|n| n.get(xx, yy) >= v) {
                return false;
            }
        }
    }
    true
}

/// Quadratic fit of the response around an integer maximum
fn subpixel_offset(r: &Plane, x: isize, y: isize) -> Option<(f32, f32)> {
    let v = r.at(x, y);
    let dx = 0.5 * (r.at(x + 1, y) - r.at(x - 1, y));
    let dy = 0.5 * (r.at(x, y + 1) - r.at(x, y - 1));
    let dxx = r.at(x + 1, y) + r.at(x - 1, y) - 2.0 * v;
    let dyy = r.at(x, y + 1) + r.at(x, y - 1) - 2.0 * v;
    let dxy = 0.25 * (r.at(x + 1, y + 1) - r.at(x - 1, y + 1) - r.at(x + 1, y - 1) + r.at(x - 1, y - 1));

    let offset = -(Matrix2::new(dxx, dxy, dxy, dyy).try_inverse()? * Vector2::new(dx, dy));
    if offset.x.abs() > 1.0 || offset.y.abs() > 1.0 {
        return None;
    }
    Some((offset.x, offset.y))
}

/// Dominant direction of Gaussian-weighted gradients, found with a sliding π/3 window
fn dominant_orientation(image: &Plane, x: f32, y: f32, sigma: f32) -> f32 {
    let step = sigma.round().max(1.0) as isize;
    let (cx, cy) = (x.round() as isize, y.round() as isize);
    let denom = 2.0 * ORI_WEIGHT_SIGMA * ORI_WEIGHT_SIGMA;

    let mut samples = Vec::new();
    for j in -ORI_SAMPLE_RADIUS..=ORI_SAMPLE_RADIUS {
        for i in -ORI_SAMPLE_RADIUS..=ORI_SAMPLE_RADIUS {
            if i * i + j * j >= ORI_SAMPLE_RADIUS * ORI_SAMPLE_RADIUS {
                continue;
            }
            let (gx, gy) = image.gradient(cx + i * step, cy + j * step);
            let weight = (-((i * i + j * j) as f32) / denom).exp();
            let (rx, ry) = (weight * gx, weight * gy);
            samples.push((ry.atan2(rx).rem_euclid(2.0 * PI), rx, ry));
        }
    }

    let mut best = (0.0f32, 0.0f32, 0.0f32);
    let mut start = 0.0f32;
    while start < 2.0 * PI {
        let end = start + FRAC_PI_3;
        let (mut sx, mut sy) = (0.0f32, 0.0f32);
        for &(a, rx, ry) in &samples {
            let inside = if end < 2.0 * PI {
                a >= start && a < end
            } else {
                a >= start || a < end - 2.0 * PI
            };
            if inside {
                sx += rx;
                sy += ry;
            }
        }
        let energy = sx * sx + sy * sy;
        if energy > best.0 {
            best = (energy, sx, sy);
        }
        start += ORI_WINDOW_STEP;
    }

    if best.0 == 0.0 {
        0.0
    } else {
        best.2.atan2(best.1).rem_euclid(2.0 * PI)
    }
}

/// Modified local difference binary descriptor over rotated 2x2, 3x3 and 4x4 grids
fn describe(image: &Plane, x: f32, y: f32, sigma: f32, angle: f32) -> Vec<u8> {
    let (sin_a, cos_a) = angle.sin_cos();
    let half = PATTERN_SIZE * sigma;
    let mut desc = vec![0u8; AKAZE_DESCRIPTOR_BYTES];
    let mut bit = 0usize;

    for &grid in &GRIDS {
        let cell = 2.0 * half / grid as f32;
        let cells: Vec<[f32; 3]> = (0..grid * grid)
            .map(|c| {
                let (row, col) = ((c / grid) as f32, (c % grid) as f32);
                let mut acc = [0f32; 3];
                for sj in 0..CELL_SAMPLES {
                    for si in 0..CELL_SAMPLES {
                        let u = -half + (col + (si as f32 + 0.5) / CELL_SAMPLES as f32) * cell;
                        let v = -half + (row + (sj as f32 + 0.5) / CELL_SAMPLES as f32) * cell;
                        let px = x + u * cos_a - v * sin_a;
                        let py = y + u * sin_a + v * cos_a;
                        let gx = 0.5 * (image.bilinear(px + 1.0, py) - image.bilinear(px - 1.0, py));
                        let gy = 0.5 * (image.bilinear(px, py + 1.0) - image.bilinear(px, py - 1.0));
                        acc[0] += image.bilinear(px, py);
                        acc[1] += gx * cos_a + gy * sin_a;
                        acc[2] += -gx * sin_a + gy * cos_a;
                    }
                }
                acc
            })
            .collect();

        for i in 0..cells.len() {
            for j in i + 1..cells.len() {
                for channel in 0..3 {
                    if cells[i][channel] > cells[j][channel] {
                        desc[bit / 8] |= 1 << (bit % 8);
                    }
                    bit += 1;
                }
            }
        }
    }
    desc
}

impl FeatureExtractor for AkazeExtractor {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Akaze
    }

    fn detect_and_compute(&self, img: &GrayImage) -> RegResult<(Vec<Keypoint>, Descriptors)> {
        if self.max_features == 0 {
            return Err(RegError::invalid("max_features", "must be positive"));
        }
        let evolutions = self.build_evolutions(img);
        if evolutions.is_empty() {
            debug!(dimensions = ?img.dimensions(), "image too small for the AKAZE scale space");
            return Ok((Vec::new(), Descriptors::Binary(Vec::new())));
        }

        let candidates = self.find_candidates(&evolutions);
        let located: Vec<Keypoint> = candidates
            .iter()
            .map(|c| {
                let ev = &evolutions[c.evolution];
                let factor = (1u32 << ev.octave) as f32;
                Keypoint {
                    x: c.x * factor,
                    y: c.y * factor,
                    size: 2.0 * ev.sigma * factor,
                    angle: 0.0,
                    response: c.response,
                    octave: ev.octave as u8,
                }
            })
            .collect();
        let kept = KeypointRefinement::non_maximum_suppression(&located, DUPLICATE_DISTANCE);
        debug!(
            evolutions = evolutions.len(),
            candidates = candidates.len(),
            kept = kept.len(),
            "akaze responses located"
        );

        let (keypoints, rows): (Vec<Keypoint>, Vec<Vec<u8>>) = kept
            .par_iter()
            .map(|kp| {
                let octave = kp.octave as usize;
                let factor = (1u32 << octave) as f32;
                let sigma = kp.size / (2.0 * factor);
                let ev = evolutions
                    .iter()
                    .filter(|e| e.octave == octave)
                    .min_by(|a, b| (a.sigma - sigma).abs().total_cmp(&(b.sigma - sigma).abs()))
                    .unwrap_or(&evolutions[0]);
                let (lx, ly) = (kp.x / factor, kp.y / factor);
                let angle = dominant_orientation(&ev.image, lx, ly, ev.sigma);
                let keypoint = Keypoint { angle, ..*kp };
                (keypoint, describe(&ev.image, lx, ly, ev.sigma, angle))
            })
            .unzip();

        let (keypoints, rows) = KeypointRefinement::retain_best(keypoints, rows, self.max_features);
        Ok((keypoints, Descriptors::Binary(rows)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn blob_image() -> GrayImage {
        GrayImage::from_fn(160, 160, |x, y| {
            let blobs = [(40.0f32, 40.0f32, 6.0f32), (112.0, 60.0, 6.0), (70.0, 120.0, 5.0)];
            let inside = blobs.iter().any(|&(cx, cy, r)| {
                let (dx, dy) = (x as f32 - cx, y as f32 - cy);
                dx * dx + dy * dy <= r * r
            });
            if inside {
                Luma([220])
            } else {
                Luma([40])
            }
        })
    }

    #[test]
    fn test_descriptor_layout() {
        assert_eq!(AKAZE_DESCRIPTOR_BITS, 486);
        assert_eq!(AKAZE_DESCRIPTOR_BYTES, 61);
    }

    #[test]
    fn test_akaze_finds_blobs() {
        let img = blob_image();
        let (kps, desc) = AkazeExtractor::new(100).detect_and_compute(&img).unwrap();
        assert!(!kps.is_empty());
        assert_eq!(desc.len(), kps.len());
        assert_eq!(desc.row_len(), AKAZE_DESCRIPTOR_BYTES);
        let near = kps.iter().any(|kp| {
            let (dx, dy) = (kp.x - 112.0, kp.y - 60.0);
            (dx * dx + dy * dy).sqrt() < 5.0
        });
        assert!(near, "no keypoint near the large blob");
    }

    #[test]
    fn test_akaze_flat_image_is_empty() {
        let img = GrayImage::from_pixel(96, 96, Luma([128]));
        let (kps, desc) = AkazeExtractor::new(50).detect_and_compute(&img).unwrap();
        assert!(kps.is_empty());
        assert!(desc.is_empty());
    }

    #[test]
    fn test_akaze_degenerate_dimensions_are_empty() {
        for (w, h) in [(0, 64), (64, 0), (0, 0), (20, 200)] {
            let img = GrayImage::new(w, h);
            let (kps, desc) = AkazeExtractor::new(50).detect_and_compute(&img).unwrap();
            assert!(kps.is_empty(), "{}x{}", w, h);
            assert!(desc.is_empty());
        }
    }

    #[test]
    fn test_flat_patch_descriptor_has_no_bits() {
        let plane = Plane::from_gray(&GrayImage::from_pixel(64, 64, Luma([77])));
        let d = describe(&plane, 32.0, 32.0, 1.6, 0.7);
        assert_eq!(d.len(), AKAZE_DESCRIPTOR_BYTES);
        assert!(d.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_orientation_follows_gradient() {
        // Intensity increases along +y
        let img = GrayImage::from_fn(64, 64, |_, y| Luma([(y * 3) as u8]));
        let plane = Plane::from_gray(&img);
        let angle = dominant_orientation(&plane, 32.0, 32.0, 1.6);
        assert!((angle - PI / 2.0).abs() < 0.2, "angle {}", angle);
    }
}
