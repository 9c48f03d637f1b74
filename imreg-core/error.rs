use crate::DistanceNorm;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegError {
    #[error("Unsupported detection method '{0}' (expected orb, sift or akaze)")]
    UnsupportedMethod(String),
    #[error("Unsupported similarity metric '{0}' (expected mse, ncc or mi)")]
    UnsupportedMetric(String),
    #[error("Unsupported transform type '{0}' (expected traslacion, rotacion, rigida or afin)")]
    UnsupportedTransformType(String),
    #[error("Unsupported synthetic pattern '{0}' (expected patron, cuadros, circulo or texto)")]
    UnsupportedPattern(String),
    #[error("Image shape mismatch: expected {}x{}, got {}x{}", expected.0, expected.1, actual.0, actual.1)]
    ShapeMismatch { expected: (u32, u32), actual: (u32, u32) },
    #[error("Descriptor mismatch: expected {expected} descriptors, got {actual}")]
    DescriptorMismatch { expected: DistanceNorm, actual: DistanceNorm },
    #[error("Measurement requested before calibration")]
    NotCalibrated,
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("Empty input: {0}")]
    EmptyInput(&'static str),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RegError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        RegError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

pub type RegResult<T> = Result<T, RegError>;
