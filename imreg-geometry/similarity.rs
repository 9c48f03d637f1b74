use imreg_core::{ensure_same_shape, GrayImage, RegError, RegResult, SimilarityMetric};

/// Histogram bins per axis for mutual information
pub const MI_BINS: usize = 20;
const NCC_EPS: f64 = 1e-8;

fn check_inputs(a: &GrayImage, b: &GrayImage) -> RegResult<()> {
    ensure_same_shape(a.dimensions(), b.dimensions())?;
    if a.as_raw().is_empty() {
        return Err(RegError::EmptyInput("image"));
    }
    Ok(())
}

/// Mean squared intensity difference
pub fn mse(a: &GrayImage, b: &GrayImage) -> RegResult<f64> {
    check_inputs(a, b)?;
    let sum: f64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();
    Ok(sum / a.as_raw().len() as f64)
}

fn mean_std(data: &[u8]) -> (f64, f64) {
    let n = data.len() as f64;
    let mean = data.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = data.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Normalized cross-correlation of the z-scored images, in [-1, 1]
pub fn ncc(a: &GrayImage, b: &GrayImage) -> RegResult<f64> {
    check_inputs(a, b)?;
    let (ma, sa) = mean_std(a.as_raw());
    let (mb, sb) = mean_std(b.as_raw());
    let (sa, sb) = (sa + NCC_EPS, sb + NCC_EPS);
    let sum: f64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&x, &y)| ((x as f64 - ma) / sa) * ((y as f64 - mb) / sb))
        .sum();
    Ok(sum / a.as_raw().len() as f64)
}

/// Bin index over `[lo, hi]` split into `bins` equal parts, the last bin closed
fn bin_index(v: f64, lo: f64, hi: f64, bins: usize) -> usize {
    let idx = ((v - lo) / (hi - lo) * bins as f64).floor();
    (idx.max(0.0) as usize).min(bins - 1)
}

fn value_range(data: &[u8]) -> (f64, f64) {
    let lo = data.iter().copied().min().unwrap_or(0) as f64;
    let hi = data.iter().copied().max().unwrap_or(0) as f64;
    if lo == hi {
        (lo - 0.5, hi + 0.5)
    } else {
        (lo, hi)
    }
}

/// Mutual information (nats) from a 20x20 joint histogram over each image's own range
pub fn mutual_information(a: &GrayImage, b: &GrayImage) -> RegResult<f64> {
    check_inputs(a, b)?;
    let (ra, rb) = (a.as_raw(), b.as_raw());
    let (lo_a, hi_a) = value_range(ra);
    let (lo_b, hi_b) = value_range(rb);

    let mut joint = [[0f64; MI_BINS]; MI_BINS];
    for (&x, &y) in ra.iter().zip(rb) {
        let i = bin_index(x as f64, lo_a, hi_a, MI_BINS);
        let j = bin_index(y as f64, lo_b, hi_b, MI_BINS);
        joint[i][j] += 1.0;
    }

    let total = ra.len() as f64;
    let mut px = [0f64; MI_BINS];
    let mut py = [0f64; MI_BINS];
    for i in 0..MI_BINS {
        for j in 0..MI_BINS {
            let p = joint[i][j] / total;
            joint[i][j] = p;
            px[i] += p;
            py[j] += p;
        }
    }

    let mut mi = 0.0;
    for i in 0..MI_BINS {
        for j in 0..MI_BINS {
            let p = joint[i][j];
            if p > 0.0 {
                mi += p * (p / (px[i] * py[j])).ln();
            }
        }
    }
    Ok(mi)
}

/// Score two equally shaped images with the chosen metric
pub fn similarity(a: &GrayImage, b: &GrayImage, metric: SimilarityMetric) -> RegResult<f64> {
    match metric {
        SimilarityMetric::Mse => mse(a, b),
        SimilarityMetric::Ncc => ncc(a, b),
        SimilarityMetric::Mi => mutual_information(a, b),
    }
}

/// Resolve the metric tag before reading either image
pub fn similarity_by_name(a: &GrayImage, b: &GrayImage, metric: &str) -> RegResult<f64> {
    let metric: SimilarityMetric = metric.parse()?;
    similarity(a, b, metric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use proptest::prelude::*;

    fn ramp() -> GrayImage {
        GrayImage::from_fn(32, 24, |x, y| Luma([(x * 5 + y * 2) as u8]))
    }

    #[test]
    fn test_identical_images() {
        let img = ramp();
        assert_eq!(mse(&img, &img).unwrap(), 0.0);
        assert!((ncc(&img, &img).unwrap() - 1.0).abs() < 1e-6);
        let mi = mutual_information(&img, &img).unwrap();
        assert!(mi > 0.0);
        // Self-information is the entropy, the maximum over partners
        let other = GrayImage::from_fn(32, 24, |x, y| Luma([((x * 31 + y * 17) % 200) as u8]));
        assert!(mi >= mutual_information(&img, &other).unwrap());
    }

    #[test]
    fn test_mse_value() {
        let a = GrayImage::from_pixel(4, 4, Luma([10]));
        let b = GrayImage::from_pixel(4, 4, Luma([13]));
        assert_eq!(mse(&a, &b).unwrap(), 9.0);
    }

    #[test]
    fn test_ncc_inverted() {
        let a = ramp();
        let b = GrayImage::from_fn(32, 24, |x, y| Luma([255 - a.get_pixel(x, y)[0]]));
        assert!((ncc(&a, &b).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_constant_images() {
        let a = GrayImage::from_pixel(8, 8, Luma([100]));
        let b = GrayImage::from_pixel(8, 8, Luma([200]));
        assert_eq!(ncc(&a, &b).unwrap(), 0.0);
        assert_eq!(mutual_information(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn test_bin_index_closes_last_bin() {
        assert_eq!(bin_index(0.0, 0.0, 255.0, 20), 0);
        assert_eq!(bin_index(255.0, 0.0, 255.0, 20), 19);
        assert_eq!(bin_index(12.75, 0.0, 255.0, 20), 1);
    }

    #[test]
    fn test_shape_mismatch_and_unknown_metric() {
        let a = GrayImage::new(4, 4);
        let b = GrayImage::new(4, 5);
        for metric in [SimilarityMetric::Mse, SimilarityMetric::Ncc, SimilarityMetric::Mi] {
            assert!(matches!(similarity(&a, &b, metric), Err(RegError::ShapeMismatch { .. })));
        }
        assert!(matches!(
            similarity_by_name(&a, &a, "foo"),
            Err(RegError::UnsupportedMetric(tag)) if tag == "foo"
        ));
        // Tag is checked before shapes
        assert!(matches!(similarity_by_name(&a, &b, "foo"), Err(RegError::UnsupportedMetric(_))));
    }

    proptest! {
        #[test]
        fn prop_mse_symmetric_nonnegative(
            a in prop::collection::vec(any::<u8>(), 64),
            b in prop::collection::vec(any::<u8>(), 64),
        ) {
            let ia = GrayImage::from_raw(8, 8, a).unwrap();
            let ib = GrayImage::from_raw(8, 8, b).unwrap();
            let ab = mse(&ia, &ib).unwrap();
            let ba = mse(&ib, &ia).unwrap();
            prop_assert!(ab >= 0.0);
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn prop_ncc_bounded(
            a in prop::collection::vec(any::<u8>(), 64),
            b in prop::collection::vec(any::<u8>(), 64),
        ) {
            let ia = GrayImage::from_raw(8, 8, a).unwrap();
            let ib = GrayImage::from_raw(8, 8, b).unwrap();
            let v = ncc(&ia, &ib).unwrap();
            prop_assert!((-1.0 - 1e-9..=1.0 + 1e-9).contains(&v));
        }
    }
}
