//! Homography estimation via DLT with Hartley normalization.

use imreg_core::{RegError, RegResult};
use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};

/// Project a 2D point through a 3×3 homography: H * [x, y, 1]^T → [u, v].
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> [f64; 2] {
    let p = h * Vector3::new(x, y, 1.0);
    if p[2].abs() < 1e-15 {
        return [f64::NAN, f64::NAN];
    }
    [p[0] / p[2], p[1] / p[2]]
}

/// Reprojection error: ||project(H, src) - dst||.
pub fn reprojection_error(h: &Matrix3<f64>, src: &[f64; 2], dst: &[f64; 2]) -> f64 {
    let p = project(h, src[0], src[1]);
    let dx = p[0] - dst[0];
    let dy = p[1] - dst[1];
    (dx * dx + dy * dy).sqrt()
}

/// Translate the centroid to the origin and scale the mean distance to sqrt(2)
fn normalize_points(pts: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = pts.len() as f64;
    let cx: f64 = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy: f64 = pts.iter().map(|p| p[1]).sum::<f64>() / n;

    let mean_dist: f64 = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts.iter().map(|p| [s * (p[0] - cx), s * (p[1] - cy)]).collect();
    (t, normalized)
}

/// True when three of the points are (nearly) on one line
pub fn has_collinear_triple(pts: &[[f64; 2]]) -> bool {
    let n = pts.len();
    for i in 0..n {
        for j in i + 1..n {
            for k in j + 1..n {
                let (ax, ay) = (pts[j][0] - pts[i][0], pts[j][1] - pts[i][1]);
                let (bx, by) = (pts[k][0] - pts[i][0], pts[k][1] - pts[i][1]);
                let cross = (ax * by - ay * bx).abs();
                let scale = (ax * ax + ay * ay).sqrt() * (bx * bx + by * by).sqrt();
                if scale < 1e-12 || cross <= 1e-6 * scale {
                    return true;
                }
            }
        }
    }
    false
}

/// Estimate the homography H with `dst ≈ project(H, src)` from at least 4 correspondences.
pub fn estimate_homography_dlt(src: &[[f64; 2]], dst: &[[f64; 2]]) -> RegResult<Matrix3<f64>> {
    let n = src.len();
    if src.len() != dst.len() {
        return Err(RegError::invalid(
            "correspondences",
            format!("{} source points but {} destination points", src.len(), dst.len()),
        ));
    }
    if n < 4 {
        return Err(RegError::invalid("correspondences", format!("need at least 4, got {}", n)));
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    // Two rows per correspondence
    let mut a = DMatrix::zeros(2 * n, 9);
    for i in 0..n {
        let (sx, sy) = (src_n[i][0], src_n[i][1]);
        let (dx, dy) = (dst_n[i][0], dst_n[i][1]);

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // h is the eigenvector of A^T A with the smallest eigenvalue
    let ata = a.transpose() * &a;
    let eig = SymmetricEigen::new(ata);
    let min_idx = (0..9)
        .min_by(|&i, &j| eig.eigenvalues[i].abs().total_cmp(&eig.eigenvalues[j].abs()))
        .unwrap_or(0);
    let h_norm = Matrix3::from_fn(|r, c| eig.eigenvectors[(3 * r + c, min_idx)]);

    // H = T_dst^-1 * H_norm * T_src
    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| RegError::invalid("correspondences", "destination normalization is singular"))?;
    let h = t_dst_inv * h_norm * t_src;

    let scale = h[(2, 2)];
    let h = if scale.abs() < 1e-15 { h } else { h / scale };
    if h.iter().any(|v| !v.is_finite()) {
        return Err(RegError::invalid("correspondences", "degenerate configuration"));
    }
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_homography() -> Matrix3<f64> {
        Matrix3::new(1.05, 0.1, 12.0, -0.05, 0.97, -8.0, 0.0002, -0.0001, 1.0)
    }

    #[test]
    fn test_dlt_exact_4points() {
        let h_true = make_test_homography();
        let src = [[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]];
        let dst: Vec<[f64; 2]> = src.iter().map(|s| project(&h_true, s[0], s[1])).collect();

        let h_est = estimate_homography_dlt(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            let err = reprojection_error(&h_est, s, d);
            assert!(err < 1e-6, "reprojection error too large: {}", err);
        }
    }

    #[test]
    fn test_dlt_overdetermined() {
        let h_true = make_test_homography();
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..5 {
            for j in 0..5 {
                let s = [i as f64 * 20.0, j as f64 * 20.0];
                dst.push(project(&h_true, s[0], s[1]));
                src.push(s);
            }
        }

        let h_est = estimate_homography_dlt(&src, &dst).unwrap();
        for r in 0..3 {
            for c in 0..3 {
                assert!((h_est[(r, c)] - h_true[(r, c)]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_too_few_or_mismatched_points() {
        let three = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]];
        assert!(estimate_homography_dlt(&three, &three).is_err());
        let four = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        assert!(estimate_homography_dlt(&four, &three).is_err());
    }

    #[test]
    fn test_collinear_detection() {
        assert!(has_collinear_triple(&[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [5.0, 0.0]]));
        assert!(has_collinear_triple(&[[0.0, 0.0], [0.0, 0.0], [2.0, 1.0], [5.0, 0.0]]));
        assert!(!has_collinear_triple(&[[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]));
    }

    #[test]
    fn test_project_roundtrip() {
        let h = make_test_homography();
        let h_inv = h.try_inverse().unwrap();
        let q = project(&h, 50.0, 75.0);
        let p = project(&h_inv, q[0], q[1]);
        assert!((p[0] - 50.0).abs() < 1e-8);
        assert!((p[1] - 75.0).abs() < 1e-8);
    }
}
