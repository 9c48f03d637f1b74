use image::buffer::ConvertBuffer;
use image::{GenericImage, Luma, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_line_segment_mut, Canvas};
use imreg_core::{ensure_same_shape, FeatureMatch, GrayImage, Keypoint, RegError, RegResult};

pub const KEYPOINT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

fn to_rgb(img: &GrayImage) -> RgbImage {
    img.convert()
}

/// Line of the given thickness, drawn as parallel one-pixel segments
pub(crate) fn draw_thick_line_mut<C: Canvas>(
    canvas: &mut C,
    start: (f32, f32),
    end: (f32, f32),
    thickness: u32,
    color: C::Pixel,
) {
    let steep = (end.1 - start.1).abs() > (end.0 - start.0).abs();
    let half = (thickness as i32 - 1) / 2;
    for d in -half..thickness as i32 - half {
        let (ox, oy) = if steep { (d as f32, 0.0) } else { (0.0, d as f32) };
        draw_line_segment_mut(canvas, (start.0 + ox, start.1 + oy), (end.0 + ox, end.1 + oy), color);
    }
}

/// Deterministic, well-separated colour for match `i`
fn match_color(i: usize) -> Rgb<u8> {
    const PALETTE: [[u8; 3]; 8] = [
        [255, 64, 64],
        [64, 200, 64],
        [64, 128, 255],
        [255, 200, 0],
        [200, 64, 255],
        [0, 220, 220],
        [255, 128, 0],
        [160, 255, 96],
    ];
    Rgb(PALETTE[i % PALETTE.len()])
}

/// Keypoints over an RGB copy of `img`. Rich mode draws each keypoint's size as a
/// circle and its orientation as a radius; otherwise a small marker is used.
pub fn draw_keypoints(img: &GrayImage, keypoints: &[Keypoint], rich: bool) -> RgbImage {
    let mut out = to_rgb(img);
    for kp in keypoints {
        let center = (kp.x.round() as i32, kp.y.round() as i32);
        if rich {
            let radius = (kp.size / 2.0).round().max(1.0);
            draw_hollow_circle_mut(&mut out, center, radius as i32, KEYPOINT_COLOR);
            let tip = (kp.x + radius * kp.angle.cos(), kp.y + radius * kp.angle.sin());
            draw_line_segment_mut(&mut out, (kp.x, kp.y), tip, KEYPOINT_COLOR);
        } else {
            draw_hollow_circle_mut(&mut out, center, 3, KEYPOINT_COLOR);
        }
    }
    out
}

/// Side-by-side rendering of matched keypoints, `img_a` on the left. With a mask only
/// matches flagged `true` are drawn; unmatched keypoints are never drawn.
pub fn draw_matches(
    img_a: &GrayImage,
    kp_a: &[Keypoint],
    img_b: &GrayImage,
    kp_b: &[Keypoint],
    matches: &[FeatureMatch],
    mask: Option<&[bool]>,
) -> RegResult<RgbImage> {
    if let Some(mask) = mask {
        if mask.len() != matches.len() {
            return Err(RegError::invalid(
                "mask",
                format!("{} entries for {} matches", mask.len(), matches.len()),
            ));
        }
    }
    let (wa, ha) = img_a.dimensions();
    let (wb, hb) = img_b.dimensions();
    let mut out = RgbImage::new(wa + wb, ha.max(hb));
    out.copy_from(&to_rgb(img_a), 0, 0)?;
    out.copy_from(&to_rgb(img_b), wa, 0)?;

    for (i, m) in matches.iter().enumerate() {
        if mask.is_some_and(|mask| !mask[i]) {
            continue;
        }
        let (a, b) = match (kp_a.get(m.query_idx), kp_b.get(m.train_idx)) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(RegError::invalid(
                    "matches",
                    format!("match ({}, {}) references a missing keypoint", m.query_idx, m.train_idx),
                ))
            }
        };
        let color = match_color(i);
        let pa = (a.x, a.y);
        let pb = (b.x + wa as f32, b.y);
        draw_hollow_circle_mut(&mut out, (pa.0.round() as i32, pa.1.round() as i32), 4, color);
        draw_hollow_circle_mut(&mut out, (pb.0.round() as i32, pb.1.round() as i32), 4, color);
        draw_line_segment_mut(&mut out, pa, pb, color);
    }
    Ok(out)
}

/// Red channel from `fixed`, green from `other`
pub fn registration_overlay(fixed: &GrayImage, other: &GrayImage) -> RegResult<RgbImage> {
    ensure_same_shape(fixed.dimensions(), other.dimensions())?;
    Ok(RgbImage::from_fn(fixed.width(), fixed.height(), |x, y| {
        Rgb([fixed.get_pixel(x, y)[0], other.get_pixel(x, y)[0], 0])
    }))
}

pub fn abs_difference(a: &GrayImage, b: &GrayImage) -> RegResult<GrayImage> {
    ensure_same_shape(a.dimensions(), b.dimensions())?;
    Ok(GrayImage::from_fn(a.width(), a.height(), |x, y| {
        Luma([a.get_pixel(x, y)[0].abs_diff(b.get_pixel(x, y)[0])])
    }))
}

/// Two-row comparison panel: fixed, moving, registered on top; overlays before and
/// after registration and the absolute difference below.
pub fn registration_panel(fixed: &GrayImage, moving: &GrayImage, registered: &GrayImage) -> RegResult<RgbImage> {
    ensure_same_shape(fixed.dimensions(), moving.dimensions())?;
    ensure_same_shape(fixed.dimensions(), registered.dimensions())?;
    let (w, h) = fixed.dimensions();
    let tiles = [
        to_rgb(fixed),
        to_rgb(moving),
        to_rgb(registered),
        registration_overlay(fixed, moving)?,
        registration_overlay(fixed, registered)?,
        to_rgb(&abs_difference(fixed, registered)?),
    ];
    let mut panel = RgbImage::new(3 * w, 2 * h);
    for (i, tile) in tiles.iter().enumerate() {
        let (col, row) = ((i % 3) as u32, (i / 3) as u32);
        panel.copy_from(tile, col * w, row * h)?;
    }
    Ok(panel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_and_difference() {
        let a = GrayImage::from_pixel(4, 4, Luma([200]));
        let b = GrayImage::from_pixel(4, 4, Luma([50]));
        let overlay = registration_overlay(&a, &b).unwrap();
        assert_eq!(*overlay.get_pixel(1, 1), Rgb([200, 50, 0]));
        assert_eq!(abs_difference(&a, &b).unwrap().get_pixel(0, 0)[0], 150);
        assert_eq!(abs_difference(&b, &a).unwrap().get_pixel(0, 0)[0], 150);
        assert!(registration_overlay(&a, &GrayImage::new(4, 5)).is_err());
    }

    #[test]
    fn test_gray_copies_into_every_channel() {
        let img = GrayImage::from_fn(3, 2, |x, y| Luma([(x * 40 + y * 7) as u8]));
        let rgb = to_rgb(&img);
        assert_eq!(rgb.dimensions(), (3, 2));
        assert_eq!(*rgb.get_pixel(2, 1), Rgb([87, 87, 87]));
    }

    #[test]
    fn test_panel_layout() {
        let a = GrayImage::from_pixel(5, 4, Luma([100]));
        let b = GrayImage::from_pixel(5, 4, Luma([40]));
        let panel = registration_panel(&a, &b, &a).unwrap();
        assert_eq!(panel.dimensions(), (15, 8));
        assert_eq!(*panel.get_pixel(6, 1), Rgb([40, 40, 40]));
        assert_eq!(*panel.get_pixel(1, 5), Rgb([100, 40, 0]));
        assert_eq!(*panel.get_pixel(12, 6), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_keypoints_marks_pixels() {
        let img = GrayImage::new(40, 40);
        let mut kp = Keypoint::new(20.0, 20.0);
        kp.size = 16.0;
        let plain = draw_keypoints(&img, &[kp], false);
        assert_eq!(*plain.get_pixel(23, 20), KEYPOINT_COLOR);
        let rich = draw_keypoints(&img, &[kp], true);
        assert_eq!(*rich.get_pixel(28, 20), KEYPOINT_COLOR);
        // Orientation tick along +x
        assert_eq!(*rich.get_pixel(24, 20), KEYPOINT_COLOR);
    }

    #[test]
    fn test_draw_matches_respects_mask() {
        let a = GrayImage::new(20, 20);
        let b = GrayImage::new(30, 10);
        let kp_a = vec![Keypoint::new(10.0, 10.0), Keypoint::new(5.0, 15.0)];
        let kp_b = vec![Keypoint::new(10.0, 5.0), Keypoint::new(20.0, 5.0)];
        let matches = vec![
            FeatureMatch { query_idx: 0, train_idx: 0, distance: 1.0 },
            FeatureMatch { query_idx: 1, train_idx: 1, distance: 2.0 },
        ];
        let all = draw_matches(&a, &kp_a, &b, &kp_b, &matches, None).unwrap();
        assert_eq!(all.dimensions(), (50, 20));
        let masked = draw_matches(&a, &kp_a, &b, &kp_b, &matches, Some(&[true, false][..])).unwrap();
        assert_ne!(all, masked);
        assert_eq!(*masked.get_pixel(1, 15), Rgb([0, 0, 0]));
        assert!(draw_matches(&a, &kp_a, &b, &kp_b, &matches, Some(&[true][..])).is_err());
    }
}
