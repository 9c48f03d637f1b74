use image::imageops::{self, FilterType};
use imreg_core::GrayImage;

/// Scale information for pyramid levels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleLevel {
    pub level: usize,
    /// Factor mapping level coordinates back to the base image
    pub scale: f32,
    pub width: u32,
    pub height: u32,
}

/// Image pyramid operations for multi-scale feature detection
pub struct ImagePyramid;

impl ImagePyramid {
    /// Generate up to `n_levels` scale levels, stopping once a level would be smaller than `min_size`
    pub fn generate_scale_levels(
        width: u32,
        height: u32,
        n_levels: usize,
        scale_factor: f32,
        min_size: u32,
    ) -> Vec<ScaleLevel> {
        let mut levels = Vec::with_capacity(n_levels);
        let mut current_scale = 1.0f32;

        for level in 0..n_levels {
            let scaled_width = (width as f32 / current_scale).round() as u32;
            let scaled_height = (height as f32 / current_scale).round() as u32;

            if scaled_width < min_size || scaled_height < min_size {
                break;
            }

            levels.push(ScaleLevel {
                level,
                scale: current_scale,
                width: scaled_width,
                height: scaled_height,
            });

            current_scale *= scale_factor;
        }

        levels
    }

    /// Build image pyramid from base image
    pub fn build_image_pyramid(img: &GrayImage, scale_levels: &[ScaleLevel]) -> Vec<GrayImage> {
        scale_levels
            .iter()
            .map(|scale_level| {
                if scale_level.level == 0 {
                    img.clone()
                } else {
                    imageops::resize(img, scale_level.width, scale_level.height, FilterType::Triangle)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_levels_shrink_geometrically() {
        let levels = ImagePyramid::generate_scale_levels(640, 480, 8, 1.2, 32);
        assert_eq!(levels.len(), 8);
        assert_eq!(levels[0].width, 640);
        assert_eq!(levels[0].scale, 1.0);
        for pair in levels.windows(2) {
            assert!(pair[1].width < pair[0].width);
            assert!((pair[1].scale / pair[0].scale - 1.2).abs() < 1e-4);
        }
    }

    #[test]
    fn test_scale_levels_stop_at_min_size() {
        let levels = ImagePyramid::generate_scale_levels(100, 100, 8, 1.2, 63);
        assert!(!levels.is_empty());
        assert!(levels.iter().all(|l| l.width >= 63 && l.height >= 63));
        assert!(levels.len() < 8);

        let none = ImagePyramid::generate_scale_levels(40, 40, 8, 1.2, 63);
        assert!(none.is_empty());
    }

    #[test]
    fn test_pyramid_dimensions() {
        let img = GrayImage::from_pixel(120, 90, image::Luma([77]));
        let levels = ImagePyramid::generate_scale_levels(120, 90, 4, 1.5, 16);
        let pyramid = ImagePyramid::build_image_pyramid(&img, &levels);
        assert_eq!(pyramid.len(), levels.len());
        for (level, layer) in levels.iter().zip(&pyramid) {
            assert_eq!(layer.dimensions(), (level.width, level.height));
            assert!(layer.pixels().all(|p| p[0] == 77));
        }
    }
}
