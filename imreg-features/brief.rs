use imreg_core::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 256 binary tests packed into 32 bytes
pub const DESCRIPTOR_BYTES: usize = 32;
const N_TESTS: usize = DESCRIPTOR_BYTES * 8;
const PATTERN_SEED: u64 = 0x0b71_ef5e_ed00_0256;

/// Sampling pattern for steered BRIEF.
///
/// Test points are drawn once, uniformly inside a disc, from a fixed seed so that
/// descriptors are comparable across runs and images.
#[derive(Debug, Clone)]
pub struct BriefPattern {
    pairs: Vec<[(f32, f32); 2]>,
}

impl BriefPattern {
    pub fn new(radius: i32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let r2 = radius * radius;
        let sample_point = |rng: &mut StdRng| loop {
            let x = rng.gen_range(-radius..=radius);
            let y = rng.gen_range(-radius..=radius);
            if x * x + y * y <= r2 {
                return (x, y);
            }
        };

        let mut pairs = Vec::with_capacity(N_TESTS);
        while pairs.len() < N_TESTS {
            let p1 = sample_point(&mut rng);
            let p2 = sample_point(&mut rng);
            if p1 != p2 {
                pairs.push([(p1.0 as f32, p1.1 as f32), (p2.0 as f32, p2.1 as f32)]);
            }
        }

        Self { pairs }
    }

    /// Pattern used by the ORB extractor (31 px patch)
    pub fn orb() -> Self {
        Self::new(13, PATTERN_SEED)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Steered BRIEF descriptor of the (smoothed) image around `(cx, cy)`
    pub fn describe(&self, img: &GrayImage, cx: f32, cy: f32, angle: f32) -> Vec<u8> {
        let (s, c) = angle.sin_cos();
        let mut d = vec![0u8; DESCRIPTOR_BYTES];

        for (i, [(dx1, dy1), (dx2, dy2)]) in self.pairs.iter().enumerate() {
            // Apply rotation and translation for subpixel coordinates
            let (rx1, ry1) = (cx + c * dx1 - s * dy1, cy + s * dx1 + c * dy1);
            let (rx2, ry2) = (cx + c * dx2 - s * dy2, cy + s * dx2 + c * dy2);

            let val1 = bilinear_sample(img, rx1, ry1);
            let val2 = bilinear_sample(img, rx2, ry2);

            let bit = (val1 < val2) as u8;
            d[i / 8] |= bit << (i % 8);
        }
        d
    }
}

/// Bilinear interpolation for subpixel sampling, clamping at the border
pub fn bilinear_sample(img: &GrayImage, x: f32, y: f32) -> f32 {
    let (w, h) = img.dimensions();
    let x0 = x.floor();
    let y0 = y.floor();
    let x1 = x0 + 1.0;
    let y1 = y0 + 1.0;

    if x0 < 0.0 || y0 < 0.0 || x1 >= w as f32 || y1 >= h as f32 {
        let cx = x.round().clamp(0.0, (w - 1) as f32) as u32;
        let cy = y.round().clamp(0.0, (h - 1) as f32) as u32;
        return img.get_pixel(cx, cy)[0] as f32;
    }

    let dx = x - x0;
    let dy = y - y0;
    let (x0, y0, x1, y1) = (x0 as u32, y0 as u32, x1 as u32, y1 as u32);

    let p00 = img.get_pixel(x0, y0)[0] as f32;
    let p10 = img.get_pixel(x1, y0)[0] as f32;
    let p01 = img.get_pixel(x0, y1)[0] as f32;
    let p11 = img.get_pixel(x1, y1)[0] as f32;

    let top = p00 * (1.0 - dx) + p10 * dx;
    let bottom = p01 * (1.0 - dx) + p11 * dx;

    top * (1.0 - dy) + bottom * dy
}

/// Number of differing bits between two packed descriptors
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}
