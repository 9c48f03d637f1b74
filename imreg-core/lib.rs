use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;

pub use config::{DetectionConfig, MatchingConfig, RansacConfig, RegistrationConfig, SearchConfig};
pub use error::{RegError, RegResult};

/// 8-bit grayscale image used by every pipeline stage
pub type GrayImage = image::GrayImage;

/// Integer pixel coordinate `(x, y)`
pub type PixelPoint = (i32, i32);

/// Detected feature location in input-image pixel coordinates.
///
/// `angle` is in radians, measured with `atan2(dy, dx)` in the y-down image frame.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Diameter of the described neighbourhood
    pub size: f32,
    pub angle: f32,
    pub response: f32,
    pub octave: u8,
}

impl Keypoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            size: 1.0,
            angle: 0.0,
            response: 0.0,
            octave: 0,
        }
    }

    pub fn pt(&self) -> (f32, f32) {
        (self.x, self.y)
    }
}

/// Distance used to compare two descriptor rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DistanceNorm {
    Hamming,
    L2,
}

impl fmt::Display for DistanceNorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceNorm::Hamming => write!(f, "hamming"),
            DistanceNorm::L2 => write!(f, "l2"),
        }
    }
}

/// Descriptor rows, one per keypoint. The variant fixes the distance norm.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptors {
    /// Packed bit strings (ORB: 32 bytes, AKAZE: 61 bytes)
    Binary(Vec<Vec<u8>>),
    /// Float vectors (SIFT: 128 values)
    Real(Vec<Vec<f32>>),
}

impl Descriptors {
    pub fn len(&self) -> usize {
        match self {
            Descriptors::Binary(rows) => rows.len(),
            Descriptors::Real(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn norm(&self) -> DistanceNorm {
        match self {
            Descriptors::Binary(_) => DistanceNorm::Hamming,
            Descriptors::Real(_) => DistanceNorm::L2,
        }
    }

    /// Length of a single row (bytes for binary, floats for real)
    pub fn row_len(&self) -> usize {
        match self {
            Descriptors::Binary(rows) => rows.first().map_or(0, Vec::len),
            Descriptors::Real(rows) => rows.first().map_or(0, Vec::len),
        }
    }
}

/// Correspondence between keypoint `query_idx` of the first set and `train_idx` of the second
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeatureMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: f32,
}

/// Supported detector/descriptor families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DetectorKind {
    Orb,
    Sift,
    Akaze,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 3] = [DetectorKind::Orb, DetectorKind::Sift, DetectorKind::Akaze];

    /// Norm the matcher must use for this detector's descriptors
    pub fn norm(&self) -> DistanceNorm {
        match self {
            DetectorKind::Orb | DetectorKind::Akaze => DistanceNorm::Hamming,
            DetectorKind::Sift => DistanceNorm::L2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Orb => "orb",
            DetectorKind::Sift => "sift",
            DetectorKind::Akaze => "akaze",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorKind {
    type Err = RegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "orb" => Ok(DetectorKind::Orb),
            "sift" => Ok(DetectorKind::Sift),
            "akaze" => Ok(DetectorKind::Akaze),
            _ => Err(RegError::UnsupportedMethod(s.to_string())),
        }
    }
}

/// Image similarity measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum SimilarityMetric {
    Mse,
    Ncc,
    Mi,
}

impl SimilarityMetric {
    /// Only MSE is minimised; the other metrics grow with similarity
    pub fn lower_is_better(&self) -> bool {
        matches!(self, SimilarityMetric::Mse)
    }

    /// True when `candidate` strictly improves on `best`
    pub fn improves(&self, candidate: f64, best: f64) -> bool {
        if self.lower_is_better() {
            candidate < best
        } else {
            candidate > best
        }
    }

    /// Starting value for a best-score search
    pub fn worst_score(&self) -> f64 {
        if self.lower_is_better() {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityMetric::Mse => "mse",
            SimilarityMetric::Ncc => "ncc",
            SimilarityMetric::Mi => "mi",
        }
    }
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimilarityMetric {
    type Err = RegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mse" => Ok(SimilarityMetric::Mse),
            "ncc" => Ok(SimilarityMetric::Ncc),
            "mi" => Ok(SimilarityMetric::Mi),
            _ => Err(RegError::UnsupportedMetric(s.to_string())),
        }
    }
}

/// Families of 2x3 affine transforms that can be synthesised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TransformKind {
    Translation,
    Rotation,
    Rigid,
    Affine,
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransformKind::Translation => "translation",
            TransformKind::Rotation => "rotation",
            TransformKind::Rigid => "rigid",
            TransformKind::Affine => "affine",
        };
        f.write_str(name)
    }
}

impl FromStr for TransformKind {
    type Err = RegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "traslacion" | "translation" => Ok(TransformKind::Translation),
            "rotacion" | "rotation" => Ok(TransformKind::Rotation),
            "rigida" | "rigid" => Ok(TransformKind::Rigid),
            "afin" | "affine" => Ok(TransformKind::Affine),
            _ => Err(RegError::UnsupportedTransformType(s.to_string())),
        }
    }
}

/// Parameters consumed by the transform builders. Angles are in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TransformParams {
    pub tx: f64,
    pub ty: f64,
    pub angle: f64,
    pub scale: f64,
    pub shear: f64,
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            tx: 0.0,
            ty: 0.0,
            angle: 0.0,
            scale: 1.0,
            shear: 0.0,
        }
    }
}

impl TransformParams {
    pub fn translation(tx: f64, ty: f64) -> Self {
        Self { tx, ty, ..Self::default() }
    }

    pub fn rotation(angle: f64) -> Self {
        Self { angle, ..Self::default() }
    }
}

/// Check that two images share width and height
pub fn ensure_same_shape(a: (u32, u32), b: (u32, u32)) -> RegResult<()> {
    if a != b {
        return Err(RegError::ShapeMismatch { expected: a, actual: b });
    }
    Ok(())
}

/// Initialize Rayon thread pool with the specified number of threads
pub fn init_thread_pool(n_threads: usize) -> Result<(), rayon::ThreadPoolBuildError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .build_global()
}

/// Default worker count for the global pool
pub fn default_threads() -> usize {
    num_cpus::get().max(1)
}
