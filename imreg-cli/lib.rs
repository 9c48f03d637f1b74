pub mod glyphs;
pub mod measurement;
pub mod pipeline;
pub mod render;
pub mod report;
pub mod search;
pub mod synthetic;

pub use imreg_core::{self, RegError, RegResult, RegistrationConfig};
pub use imreg_features as features;
pub use imreg_geometry as geometry;

pub use measurement::{estimate_uncertainty, Calibrator, CalibrationState, MeasurementPicker, UncertaintyStats};
pub use pipeline::{
    register_with_features, FeatureRegistration, Registration, RegistrationFailure, RegistrationOutcome,
};
pub use report::{validate_report, ReportValidation};
pub use search::{exhaustive_search, SearchResult, SearchSample};
pub use synthetic::{add_gaussian_noise, create_synthetic, SyntheticPattern};

use image::GrayImage;
use std::path::Path;

/// Load any supported image file as 8-bit grayscale
pub fn open_gray<P: AsRef<Path>>(path: P) -> RegResult<GrayImage> {
    Ok(image::open(path)?.to_luma8())
}
