use crate::transform::{warp_perspective, Transform};
use image::{ImageBuffer, Pixel};
use imreg_core::{ensure_same_shape, GrayImage, RegError, RegResult};
use tracing::debug;

/// Composite `images` on a canvas three widths wide and two heights tall.
///
/// `homographies[i]` maps `images[i + 1]` into the frame of `images[0]`; `None`
/// entries are skipped. Image 0 sits at offset `(w/2, h/2)`. Each warped image
/// is averaged pairwise with the canvas wherever its own pixel is non-zero.
pub fn fuse_images(images: &[GrayImage], homographies: &[Option<Transform>]) -> RegResult<GrayImage> {
    let base = images.first().ok_or(RegError::EmptyInput("images"))?;
    if homographies.len() + 1 != images.len() {
        return Err(RegError::invalid(
            "homographies",
            format!("expected {} for {} images, got {}", images.len() - 1, images.len(), homographies.len()),
        ));
    }

    let (w, h) = base.dimensions();
    let (cw, ch) = (3 * w, 2 * h);
    let (ox, oy) = (w / 2, h / 2);
    let mut canvas = GrayImage::new(cw, ch);
    for (x, y, p) in base.enumerate_pixels() {
        canvas.put_pixel(x + ox, y + oy, *p);
    }

    for (i, (img, transform)) in images[1..].iter().zip(homographies).enumerate() {
        let Some(transform) = transform else {
            debug!(image = i + 1, "no homography, skipping");
            continue;
        };
        let shifted = transform.offset_translation(ox as f64, oy as f64);
        let warped = warp_perspective(img, &shifted, (cw, ch))?;
        for (dst, src) in canvas.as_mut().iter_mut().zip(warped.as_raw()) {
            if *src > 0 {
                *dst = ((*dst as u16 + *src as u16) / 2) as u8;
            }
        }
    }
    Ok(canvas)
}

/// `alpha * a + (1 - alpha) * b` per channel, rounded and clamped to 8 bits
pub fn blend<P>(
    a: &ImageBuffer<P, Vec<u8>>,
    b: &ImageBuffer<P, Vec<u8>>,
    alpha: f64,
) -> RegResult<ImageBuffer<P, Vec<u8>>>
where
    P: Pixel<Subpixel = u8>,
{
    ensure_same_shape(a.dimensions(), b.dimensions())?;
    if !(0.0..=1.0).contains(&alpha) {
        return Err(RegError::invalid("alpha", format!("{} is outside [0, 1]", alpha)));
    }
    let beta = 1.0 - alpha;
    let data: Vec<u8> = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&x, &y)| (alpha * x as f64 + beta * y as f64).round().clamp(0.0, 255.0) as u8)
        .collect();
    ImageBuffer::from_raw(a.width(), a.height(), data)
        .ok_or_else(|| RegError::invalid("image", "pixel buffer does not match dimensions"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::AffineMatrix;
    use image::{Luma, Rgb, RgbImage};

    #[test]
    fn test_single_image_canvas() {
        let img = GrayImage::from_pixel(10, 6, Luma([77]));
        let canvas = fuse_images(&[img], &[]).unwrap();
        assert_eq!(canvas.dimensions(), (30, 12));
        assert_eq!(canvas.get_pixel(5, 3)[0], 77);
        assert_eq!(canvas.get_pixel(14, 8)[0], 77);
        assert_eq!(canvas.get_pixel(4, 3)[0], 0);
        assert_eq!(canvas.get_pixel(15, 3)[0], 0);
    }

    #[test]
    fn test_identity_fusion_averages() {
        let a = GrayImage::from_pixel(8, 8, Luma([100]));
        let b = GrayImage::from_pixel(8, 8, Luma([201]));
        let canvas = fuse_images(&[a, b], &[Some(Transform::Affine(AffineMatrix::IDENTITY))]).unwrap();
        assert_eq!(canvas.get_pixel(6, 6)[0], 150);
        assert_eq!(canvas.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_shifted_image_lands_beside_base() {
        let a = GrayImage::from_pixel(8, 8, Luma([100]));
        let b = GrayImage::from_pixel(8, 8, Luma([50]));
        let canvas = fuse_images(&[a, b], &[Some(AffineMatrix::translation(8.0, 0.0).into())]).unwrap();
        // Base occupies x in [4, 12), the shifted copy [12, 20)
        assert_eq!(canvas.get_pixel(6, 6)[0], 100);
        assert_eq!(canvas.get_pixel(14, 6)[0], 25);
    }

    #[test]
    fn test_missing_homography_is_skipped() {
        let a = GrayImage::from_pixel(8, 8, Luma([100]));
        let b = GrayImage::from_pixel(8, 8, Luma([200]));
        let canvas = fuse_images(&[a.clone(), b], &[None]).unwrap();
        let alone = fuse_images(&[a], &[]).unwrap();
        assert_eq!(canvas, alone);
    }

    #[test]
    fn test_fusion_argument_errors() {
        assert!(matches!(fuse_images(&[], &[]), Err(RegError::EmptyInput(_))));
        let a = GrayImage::new(4, 4);
        assert!(matches!(
            fuse_images(&[a.clone(), a], &[]),
            Err(RegError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_blend_gray() {
        let a = GrayImage::from_pixel(3, 3, Luma([200]));
        let b = GrayImage::from_pixel(3, 3, Luma([101]));
        assert_eq!(blend(&a, &b, 0.5).unwrap().get_pixel(1, 1)[0], 151);
        assert_eq!(blend(&a, &b, 1.0).unwrap(), a);
        assert_eq!(blend(&a, &b, 0.0).unwrap(), b);
    }

    #[test]
    fn test_blend_rgb_and_errors() {
        let a = RgbImage::from_pixel(2, 2, Rgb([255, 0, 10]));
        let b = RgbImage::from_pixel(2, 2, Rgb([0, 255, 30]));
        let out = blend(&a, &b, 0.25).unwrap();
        assert_eq!(*out.get_pixel(0, 0), Rgb([64, 191, 25]));

        let c = RgbImage::new(3, 2);
        assert!(matches!(blend(&a, &c, 0.5), Err(RegError::ShapeMismatch { .. })));
        assert!(matches!(blend(&a, &b, 1.5), Err(RegError::InvalidParameter { .. })));
    }
}
