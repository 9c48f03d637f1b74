use imreg_core::GrayImage;
use rayon::prelude::*;

/// Row-major single-channel float image with intensities scaled to [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Plane {
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn from_gray(img: &GrayImage) -> Self {
        let (w, h) = img.dimensions();
        Self {
            width: w as usize,
            height: h as usize,
            data: img.as_raw().iter().map(|&v| v as f32 / 255.0).collect(),
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Sample with replicated borders
    #[inline]
    pub fn at(&self, x: isize, y: isize) -> f32 {
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        self.data[cy * self.width + cx]
    }

    /// Bilinear sample with replicated borders
    pub fn bilinear(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (xi, yi) = (x0 as isize, y0 as isize);
        let top = self.at(xi, yi) * (1.0 - fx) + self.at(xi + 1, yi) * fx;
        let bottom = self.at(xi, yi + 1) * (1.0 - fx) + self.at(xi + 1, yi + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Central-difference gradient `(dx, dy)` at integer coordinates
    #[inline]
    pub fn gradient(&self, x: isize, y: isize) -> (f32, f32) {
        (
            0.5 * (self.at(x + 1, y) - self.at(x - 1, y)),
            0.5 * (self.at(x, y + 1) - self.at(x, y - 1)),
        )
    }

    /// Separable Gaussian blur, rows processed in parallel
    pub fn gaussian_blur(&self, sigma: f32) -> Plane {
        if sigma <= 0.0 || self.width == 0 || self.height == 0 {
            return self.clone();
        }
        let kernel = gaussian_kernel(sigma);
        let radius = (kernel.len() / 2) as isize;
        let (w, h) = (self.width, self.height);

        let mut tmp = vec![0.0f32; w * h];
        tmp.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    acc += weight * self.at(x as isize + k as isize - radius, y as isize);
                }
                *out = acc;
            }
        });

        let horizontal = Plane {
            width: w,
            height: h,
            data: tmp,
        };
        let mut data = vec![0.0f32; w * h];
        data.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    acc += weight * horizontal.at(x as isize, y as isize + k as isize - radius);
                }
                *out = acc;
            }
        });

        Plane {
            width: w,
            height: h,
            data,
        }
    }

    /// Keep every second pixel in both directions
    pub fn downsample(&self) -> Plane {
        let w = (self.width / 2).max(1);
        let h = (self.height / 2).max(1);
        let mut data = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                data.push(self.get((2 * x).min(self.width - 1), (2 * y).min(self.height - 1)));
            }
        }
        Plane {
            width: w,
            height: h,
            data,
        }
    }

    /// Pixelwise `self - other`
    pub fn difference(&self, other: &Plane) -> Plane {
        Plane {
            width: self.width,
            height: self.height,
            data: self.data.iter().zip(&other.data).map(|(a, b)| a - b).collect(),
        }
    }
}

/// Normalised 1-D Gaussian kernel with radius `ceil(3 * sigma)`
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as i32;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-((i * i) as f32) / denom).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= sum;
    }
    kernel
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_blur_of_empty_plane_is_empty() {
        for (w, h) in [(0, 16), (16, 0)] {
            let blurred = Plane::zeros(w, h).gaussian_blur(1.6);
            assert_eq!((blurred.width, blurred.height), (w, h));
            assert!(blurred.data.is_empty());
        }
    }

    #[test]
    fn test_kernel_is_normalised_and_symmetric() {
        let k = gaussian_kernel(1.6);
        assert_eq!(k.len() % 2, 1);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        for i in 0..k.len() / 2 {
            assert!((k[i] - k[k.len() - 1 - i]).abs() < 1e-7);
        }
    }

    #[test]
    fn test_blur_preserves_constant_plane() {
        let img = GrayImage::from_pixel(16, 12, Luma([128]));
        let plane = Plane::from_gray(&img).gaussian_blur(2.0);
        for v in &plane.data {
            assert!((v - 128.0 / 255.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_blur_spreads_impulse() {
        let mut plane = Plane::zeros(21, 21);
        plane.data[10 * 21 + 10] = 1.0;
        let blurred = plane.gaussian_blur(1.5);
        let total: f32 = blurred.data.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!(blurred.get(10, 10) < 1.0);
        assert!(blurred.get(11, 10) > 0.0);
        assert!((blurred.get(9, 10) - blurred.get(11, 10)).abs() < 1e-6);
    }

    #[test]
    fn test_downsample_and_difference() {
        let img = GrayImage::from_fn(8, 6, |x, y| Luma([(x + 10 * y) as u8]));
        let plane = Plane::from_gray(&img);
        let half = plane.downsample();
        assert_eq!((half.width, half.height), (4, 3));
        assert_eq!(half.get(1, 1), plane.get(2, 2));

        let zero = plane.difference(&plane);
        assert!(zero.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_gradient_and_bilinear() {
        let img = GrayImage::from_fn(10, 10, |x, _| Luma([(x * 20) as u8]));
        let plane = Plane::from_gray(&img);
        let (gx, gy) = plane.gradient(5, 5);
        assert!((gx - 20.0 / 255.0).abs() < 1e-6);
        assert_eq!(gy, 0.0);
        assert!((plane.bilinear(2.5, 3.0) - 50.0 / 255.0).abs() < 1e-6);
    }
}
