use crate::glyphs::{draw_text_mut, GLYPH_HEIGHT};
use image::Luma;
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::noise::gaussian_noise;
use imageproc::rect::Rect;
use imreg_core::{GrayImage, RegError, RegResult};
use std::fmt;
use std::str::FromStr;

/// Smallest side accepted by `create_synthetic`
pub const MIN_SYNTHETIC_SIZE: u32 = 16;
/// Font cell size of the "CV" text pattern
const TEXT_SCALE: u32 = 9;

/// Test scenes with known structure for validating registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyntheticPattern {
    /// 8x8 checkerboard with a grey disc and a rectangle outline
    Checkerboard,
    Rectangles,
    ConcentricCircles,
    TextAndCircles,
}

impl SyntheticPattern {
    pub const ALL: [SyntheticPattern; 4] = [
        SyntheticPattern::Checkerboard,
        SyntheticPattern::Rectangles,
        SyntheticPattern::ConcentricCircles,
        SyntheticPattern::TextAndCircles,
    ];
}

impl fmt::Display for SyntheticPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyntheticPattern::Checkerboard => "checkerboard",
            SyntheticPattern::Rectangles => "rectangles",
            SyntheticPattern::ConcentricCircles => "circles",
            SyntheticPattern::TextAndCircles => "text",
        };
        f.write_str(name)
    }
}

impl FromStr for SyntheticPattern {
    type Err = RegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "patron" | "checkerboard" => Ok(SyntheticPattern::Checkerboard),
            "cuadros" | "rectangles" => Ok(SyntheticPattern::Rectangles),
            "circulo" | "circles" => Ok(SyntheticPattern::ConcentricCircles),
            "texto" | "text" => Ok(SyntheticPattern::TextAndCircles),
            _ => Err(RegError::UnsupportedPattern(s.to_string())),
        }
    }
}

/// Filled rectangle between two inclusive corners
fn fill_rect(img: &mut GrayImage, (x0, y0): (i32, i32), (x1, y1): (i32, i32), value: u8) {
    let rect = Rect::at(x0, y0).of_size((x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32);
    draw_filled_rect_mut(img, rect, Luma([value]));
}

/// Rectangle outline centred on the given corners, `thickness` pixels wide
fn outline_rect(img: &mut GrayImage, (x0, y0): (i32, i32), (x1, y1): (i32, i32), thickness: i32, value: u8) {
    let half = thickness / 2;
    for d in -half..thickness - half {
        let (w, h) = (x1 - x0 + 1 - 2 * d, y1 - y0 + 1 - 2 * d);
        if w > 0 && h > 0 {
            draw_hollow_rect_mut(img, Rect::at(x0 + d, y0 + d).of_size(w as u32, h as u32), Luma([value]));
        }
    }
}

fn checkerboard(size: u32) -> GrayImage {
    let square = size / 8;
    let mut img = GrayImage::new(size, size);
    for i in 0..8 {
        for j in 0..8 {
            if (i + j) % 2 == 0 {
                let (x0, y0) = ((j * square) as i32, (i * square) as i32);
                let rect = Rect::at(x0, y0).of_size(square, square);
                draw_filled_rect_mut(&mut img, rect, Luma([255]));
            }
        }
    }
    let s = size as i32;
    draw_filled_circle_mut(&mut img, (s / 2, s / 2), s / 6, Luma([128]));
    outline_rect(&mut img, (s / 4, s / 4), (3 * s / 4, s / 3), 3, 200);
    img
}

fn rectangles(size: u32) -> GrayImage {
    let s = size as i32;
    let mut img = GrayImage::new(size, size);
    fill_rect(&mut img, (20, 20), (100, 100), 255);
    fill_rect(&mut img, (s - 120, 40), (s - 40, 120), 180);
    fill_rect(&mut img, (s / 2 - 30, s - 80), (s / 2 + 30, s - 20), 220);
    img
}

fn concentric_circles(size: u32) -> GrayImage {
    let s = size as i32;
    let mut img = GrayImage::new(size, size);
    draw_filled_circle_mut(&mut img, (s / 2, s / 2), s / 3, Luma([255]));
    draw_filled_circle_mut(&mut img, (s / 2, s / 2), s / 4, Luma([0]));
    draw_filled_circle_mut(&mut img, (s / 2, s / 2), s / 6, Luma([200]));
    img
}

fn text_and_circles(size: u32) -> GrayImage {
    let s = size as i32;
    let mut img = GrayImage::new(size, size);
    // Text baseline sits at (size/4, size/2)
    let top = s / 2 - (GLYPH_HEIGHT * TEXT_SCALE) as i32;
    draw_text_mut(&mut img, Luma([255]), s / 4, top, TEXT_SCALE, "CV");
    draw_filled_circle_mut(&mut img, (3 * s / 4, s / 4), 30, Luma([255]));
    draw_filled_circle_mut(&mut img, (3 * s / 4, 3 * s / 4), 40, Luma([200]));
    img
}

/// Square grayscale test image of side `size`
pub fn create_synthetic(size: u32, pattern: SyntheticPattern) -> RegResult<GrayImage> {
    if size < MIN_SYNTHETIC_SIZE {
        return Err(RegError::invalid(
            "size",
            format!("{} is below the minimum of {}", size, MIN_SYNTHETIC_SIZE),
        ));
    }
    Ok(match pattern {
        SyntheticPattern::Checkerboard => checkerboard(size),
        SyntheticPattern::Rectangles => rectangles(size),
        SyntheticPattern::ConcentricCircles => concentric_circles(size),
        SyntheticPattern::TextAndCircles => text_and_circles(size),
    })
}

pub fn create_synthetic_by_name(size: u32, pattern: &str) -> RegResult<GrayImage> {
    let pattern: SyntheticPattern = pattern.parse()?;
    create_synthetic(size, pattern)
}

/// Add zero-mean Gaussian noise with standard deviation `sigma`, clamped to 8 bits
pub fn add_gaussian_noise(img: &GrayImage, sigma: f64, seed: u64) -> RegResult<GrayImage> {
    if !sigma.is_finite() || sigma < 0.0 {
        return Err(RegError::invalid("sigma", format!("{} must be a finite non-negative value", sigma)));
    }
    if sigma == 0.0 {
        return Ok(img.clone());
    }
    Ok(gaussian_noise(img, 0.0, sigma, seed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_tags() {
        assert_eq!("patron".parse::<SyntheticPattern>().unwrap(), SyntheticPattern::Checkerboard);
        assert_eq!("cuadros".parse::<SyntheticPattern>().unwrap(), SyntheticPattern::Rectangles);
        assert_eq!("circulo".parse::<SyntheticPattern>().unwrap(), SyntheticPattern::ConcentricCircles);
        assert_eq!("texto".parse::<SyntheticPattern>().unwrap(), SyntheticPattern::TextAndCircles);
        assert_eq!("Text".parse::<SyntheticPattern>().unwrap(), SyntheticPattern::TextAndCircles);
        assert!(matches!(
            create_synthetic_by_name(64, "foo"),
            Err(RegError::UnsupportedPattern(tag)) if tag == "foo"
        ));
    }

    #[test]
    fn test_checkerboard_layout() {
        let img = create_synthetic(256, SyntheticPattern::Checkerboard).unwrap();
        assert_eq!(img.dimensions(), (256, 256));
        // Corner squares
        assert_eq!(img.get_pixel(5, 5)[0], 255);
        assert_eq!(img.get_pixel(37, 5)[0], 0);
        assert_eq!(img.get_pixel(250, 250)[0], 255);
        // Disc of radius 42 at the centre
        assert_eq!(img.get_pixel(128, 128)[0], 128);
        assert_eq!(img.get_pixel(128 + 40, 128)[0], 128);
        // Outline from (64, 64) to (192, 85), three pixels wide
        assert_eq!(img.get_pixel(100, 64)[0], 200);
        assert_eq!(img.get_pixel(100, 63)[0], 200);
        assert_eq!(img.get_pixel(100, 65)[0], 200);
        assert_eq!(img.get_pixel(192, 75)[0], 200);
    }

    #[test]
    fn test_rectangles_and_circles() {
        let img = create_synthetic(256, SyntheticPattern::Rectangles).unwrap();
        assert_eq!(img.get_pixel(20, 20)[0], 255);
        assert_eq!(img.get_pixel(100, 100)[0], 255);
        assert_eq!(img.get_pixel(101, 100)[0], 0);
        assert_eq!(img.get_pixel(180, 80)[0], 180);
        assert_eq!(img.get_pixel(128, 200)[0], 220);

        let img = create_synthetic(240, SyntheticPattern::ConcentricCircles).unwrap();
        assert_eq!(img.get_pixel(120, 120)[0], 200);
        assert_eq!(img.get_pixel(120 + 50, 120)[0], 0);
        assert_eq!(img.get_pixel(120 + 70, 120)[0], 255);
        assert_eq!(img.get_pixel(5, 5)[0], 0);
    }

    #[test]
    fn test_text_pattern_has_content() {
        let img = create_synthetic(256, SyntheticPattern::TextAndCircles).unwrap();
        assert_eq!(img.get_pixel(192, 64)[0], 255);
        assert_eq!(img.get_pixel(192, 192)[0], 200);
        let text_pixels = (64..128)
            .flat_map(|y| (64..160).map(move |x| (x, y)))
            .filter(|&(x, y)| img.get_pixel(x, y)[0] == 255)
            .count();
        assert!(text_pixels > 500);
    }

    #[test]
    fn test_small_sizes_rejected() {
        for pattern in SyntheticPattern::ALL {
            assert!(matches!(
                create_synthetic(15, pattern),
                Err(RegError::InvalidParameter { name: "size", .. })
            ));
            assert!(create_synthetic(16, pattern).is_ok());
        }
    }

    #[test]
    fn test_noise_is_seeded() {
        let img = create_synthetic(64, SyntheticPattern::ConcentricCircles).unwrap();
        let a = add_gaussian_noise(&img, 10.0, 1).unwrap();
        let b = add_gaussian_noise(&img, 10.0, 1).unwrap();
        let c = add_gaussian_noise(&img, 10.0, 2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, img);
        assert_eq!(add_gaussian_noise(&img, 0.0, 1).unwrap(), img);
        assert!(add_gaussian_noise(&img, -1.0, 1).is_err());
    }
}
