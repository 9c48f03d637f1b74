use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imreg_core::{GrayImage, RegError, RegResult, TransformKind, TransformParams};
use nalgebra::Matrix3;
use tracing::debug;

/// 2x3 affine matrix `[[a, b, tx], [c, d, ty]]` mapping source to destination pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineMatrix(pub [[f64; 3]; 2]);

impl Default for AffineMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl AffineMatrix {
    pub const IDENTITY: AffineMatrix = AffineMatrix([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);

    pub fn translation(tx: f64, ty: f64) -> Self {
        AffineMatrix([[1.0, 0.0, tx], [0.0, 1.0, ty]])
    }

    /// Counter-clockwise rotation by `angle_deg` about `center`, with isotropic `scale`
    pub fn rotation_about(center: (f64, f64), angle_deg: f64, scale: f64) -> Self {
        let (sin, cos) = angle_deg.to_radians().sin_cos();
        let alpha = scale * cos;
        let beta = scale * sin;
        let (cx, cy) = center;
        AffineMatrix([
            [alpha, beta, (1.0 - alpha) * cx - beta * cy],
            [-beta, alpha, beta * cx + (1.0 - alpha) * cy],
        ])
    }

    /// Matrix of the given family for an image of `size` (width, height).
    ///
    /// Rotation and rigid transforms ignore `params.scale`; only the affine family uses it.
    pub fn from_kind(kind: TransformKind, params: &TransformParams, size: (u32, u32)) -> Self {
        let center = (size.0 as f64 / 2.0, size.1 as f64 / 2.0);
        match kind {
            TransformKind::Translation => Self::translation(params.tx, params.ty),
            TransformKind::Rotation => Self::rotation_about(center, params.angle, 1.0),
            TransformKind::Rigid => Self::rotation_about(center, params.angle, 1.0).translated(params.tx, params.ty),
            TransformKind::Affine => {
                let mut m = Self::rotation_about(center, params.angle, params.scale).translated(params.tx, params.ty);
                m.0[0][1] += params.shear;
                m
            }
        }
    }

    /// Add `(tx, ty)` to the translation column
    pub fn translated(mut self, tx: f64, ty: f64) -> Self {
        self.0[0][2] += tx;
        self.0[1][2] += ty;
        self
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let m = &self.0;
        (
            m[0][0] * x + m[0][1] * y + m[0][2],
            m[1][0] * x + m[1][1] * y + m[1][2],
        )
    }

    pub fn determinant(&self) -> f64 {
        self.0[0][0] * self.0[1][1] - self.0[0][1] * self.0[1][0]
    }

    /// Inverse mapping, `None` when the linear part is singular
    pub fn inverse(&self) -> Option<AffineMatrix> {
        let det = self.determinant();
        if det.abs() < 1e-12 || !det.is_finite() {
            return None;
        }
        let [[a, b, tx], [c, d, ty]] = self.0;
        let (ia, ib, ic, id) = (d / det, -b / det, -c / det, a / det);
        Some(AffineMatrix([
            [ia, ib, -(ia * tx + ib * ty)],
            [ic, id, -(ic * tx + id * ty)],
        ]))
    }

    /// Integer offsets when the matrix is a pure translation by whole pixels
    pub fn integer_translation(&self) -> Option<(i64, i64)> {
        let [[a, b, tx], [c, d, ty]] = self.0;
        let pure = a == 1.0 && b == 0.0 && c == 0.0 && d == 1.0;
        (pure && tx.fract() == 0.0 && ty.fract() == 0.0).then(|| (tx as i64, ty as i64))
    }

    pub fn to_matrix3(&self) -> Matrix3<f64> {
        let [[a, b, tx], [c, d, ty]] = self.0;
        Matrix3::new(a, b, tx, c, d, ty, 0.0, 0.0, 1.0)
    }
}

/// Geometric mapping from moving-image coordinates into fixed-image coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    Affine(AffineMatrix),
    Homography(Matrix3<f64>),
}

impl Transform {
    pub fn to_matrix3(&self) -> Matrix3<f64> {
        match self {
            Transform::Affine(m) => m.to_matrix3(),
            Transform::Homography(h) => *h,
        }
    }

    /// Map a point; a point sent to infinity comes back as NaN
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Transform::Affine(m) => m.apply(x, y),
            Transform::Homography(h) => {
                let [u, v] = crate::homography::project(h, x, y);
                (u, v)
            }
        }
    }

    pub fn inverse(&self) -> Option<Transform> {
        match self {
            Transform::Affine(m) => m.inverse().map(Transform::Affine),
            Transform::Homography(h) => h.try_inverse().map(Transform::Homography),
        }
    }

    /// Row-major 3x3 representation
    pub fn rows(&self) -> [[f64; 3]; 3] {
        let m = self.to_matrix3();
        [
            [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
            [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
            [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
        ]
    }

    /// Same mapping followed by a shift of the destination by `(dx, dy)` in the
    /// translation entries only
    pub fn offset_translation(&self, dx: f64, dy: f64) -> Transform {
        match self {
            Transform::Affine(m) => Transform::Affine(m.translated(dx, dy)),
            Transform::Homography(h) => {
                let mut h = *h;
                h[(0, 2)] += dx;
                h[(1, 2)] += dy;
                Transform::Homography(h)
            }
        }
    }

    fn projection(&self) -> RegResult<Projection> {
        let r = self.rows();
        let flat = [
            r[0][0] as f32, r[0][1] as f32, r[0][2] as f32,
            r[1][0] as f32, r[1][1] as f32, r[1][2] as f32,
            r[2][0] as f32, r[2][1] as f32, r[2][2] as f32,
        ];
        Projection::from_matrix(flat).ok_or_else(|| RegError::invalid("transform", "matrix is not invertible"))
    }
}

impl From<AffineMatrix> for Transform {
    fn from(m: AffineMatrix) -> Self {
        Transform::Affine(m)
    }
}

/// Shift by whole pixels, filling uncovered pixels with zero
pub fn shift_exact(img: &GrayImage, dx: i64, dy: i64) -> GrayImage {
    let (w, h) = img.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        let sx = x as i64 - dx;
        let sy = y as i64 - dy;
        if sx >= 0 && sy >= 0 && sx < w as i64 && sy < h as i64 {
            *img.get_pixel(sx as u32, sy as u32)
        } else {
            image::Luma([0])
        }
    })
}

/// Resample `img` through `transform` into a `size` canvas, bilinear with zero fill.
///
/// Whole-pixel translations are applied exactly.
pub fn warp_perspective(img: &GrayImage, transform: &Transform, size: (u32, u32)) -> RegResult<GrayImage> {
    if let Transform::Affine(m) = transform {
        if let Some((dx, dy)) = m.integer_translation() {
            if size == img.dimensions() {
                return Ok(shift_exact(img, dx, dy));
            }
        }
    }
    let projection = transform.projection()?;
    let mut out = GrayImage::new(size.0, size.1);
    warp_into(img, &projection, Interpolation::Bilinear, image::Luma([0]), &mut out);
    Ok(out)
}

pub fn warp_affine(img: &GrayImage, m: &AffineMatrix) -> RegResult<GrayImage> {
    warp_perspective(img, &Transform::Affine(*m), img.dimensions())
}

/// Build the matrix for `kind` and warp the image with it, keeping the input size
pub fn apply_transformation(
    img: &GrayImage,
    kind: TransformKind,
    params: &TransformParams,
) -> RegResult<(GrayImage, AffineMatrix)> {
    let m = AffineMatrix::from_kind(kind, params, img.dimensions());
    debug!(%kind, matrix = ?m.0, "applying transformation");
    let warped = warp_affine(img, &m)?;
    Ok((warped, m))
}

/// Resolve a transform family from its tag before touching the image
pub fn apply_transformation_by_name(
    img: &GrayImage,
    kind: &str,
    params: &TransformParams,
) -> RegResult<(GrayImage, AffineMatrix)> {
    let kind: TransformKind = kind.parse()?;
    apply_transformation(img, kind, params)
}

/// Discrepancy between a known and a recovered transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformError {
    pub tx_error: f64,
    pub ty_error: f64,
    /// Root mean square difference over the six affine coefficients
    pub rmse: f64,
}

pub fn transform_error(real: &AffineMatrix, estimated: &AffineMatrix) -> TransformError {
    let sq: f64 = real
        .0
        .iter()
        .flatten()
        .zip(estimated.0.iter().flatten())
        .map(|(a, b)| (a - b) * (a - b))
        .sum();
    TransformError {
        tx_error: (real.0[0][2] - estimated.0[0][2]).abs(),
        ty_error: (real.0[1][2] - estimated.0[1][2]).abs(),
        rmse: (sq / 6.0).sqrt(),
    }
}
