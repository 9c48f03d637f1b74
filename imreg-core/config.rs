use crate::error::{RegError, RegResult};
use crate::{default_threads, DetectorKind, SimilarityMetric};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Feature detection settings shared by both images of a registration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DetectionConfig {
    pub method: DetectorKind,
    /// Upper bound on retained keypoints per image
    pub max_features: usize,
    /// FAST intensity threshold (ORB only)
    pub fast_threshold: u8,
    /// Pyramid depth (ORB only)
    pub n_levels: usize,
    /// Pyramid downscale factor between levels (ORB only)
    pub scale_factor: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            method: DetectorKind::Orb,
            max_features: 500,
            fast_threshold: 20,
            n_levels: 8,
            scale_factor: 1.2,
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> RegResult<()> {
        if self.max_features == 0 {
            return Err(RegError::invalid("max_features", "must be positive"));
        }
        if self.fast_threshold == 0 || self.fast_threshold > 127 {
            return Err(RegError::invalid(
                "fast_threshold",
                format!("{} (must be 1-127)", self.fast_threshold),
            ));
        }
        if self.n_levels == 0 {
            return Err(RegError::invalid("n_levels", "must be positive"));
        }
        if !(self.scale_factor > 1.0) {
            return Err(RegError::invalid(
                "scale_factor",
                format!("{} (must be greater than 1)", self.scale_factor),
            ));
        }
        Ok(())
    }
}

/// Descriptor matching settings
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MatchingConfig {
    /// Lowe ratio: keep nearest only if it is closer than `ratio_test` times the second nearest
    pub ratio_test: f32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { ratio_test: 0.75 }
    }
}

impl MatchingConfig {
    pub fn validate(&self) -> RegResult<()> {
        validate_ratio(self.ratio_test)
    }
}

/// Lowe ratios outside (0, 1] either reject everything or accept ambiguous pairs
pub fn validate_ratio(ratio_test: f32) -> RegResult<()> {
    if !(ratio_test > 0.0 && ratio_test <= 1.0) {
        return Err(RegError::invalid(
            "ratio_test",
            format!("{} (must be in (0, 1])", ratio_test),
        ));
    }
    Ok(())
}

/// Random sample consensus settings for homography fitting
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RansacConfig {
    /// Maximum reprojection error (pixels) for a correspondence to count as inlier
    pub reproj_thresh: f64,
    pub max_iters: usize,
    /// Desired probability of drawing at least one outlier-free sample
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            reproj_thresh: 5.0,
            max_iters: 2000,
            confidence: 0.995,
            seed: 0,
        }
    }
}

impl RansacConfig {
    pub fn validate(&self) -> RegResult<()> {
        if !(self.reproj_thresh > 0.0) || !self.reproj_thresh.is_finite() {
            return Err(RegError::invalid(
                "reproj_thresh",
                format!("{} (must be positive)", self.reproj_thresh),
            ));
        }
        if self.max_iters == 0 {
            return Err(RegError::invalid("max_iters", "must be positive"));
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(RegError::invalid(
                "confidence",
                format!("{} (must be in (0, 1))", self.confidence),
            ));
        }
        Ok(())
    }
}

/// Grid definition for the exhaustive translation search. Ranges are inclusive.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SearchConfig {
    pub range_x: (i32, i32),
    pub range_y: (i32, i32),
    pub step: u32,
    pub metric: SimilarityMetric,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            range_x: (-20, 20),
            range_y: (-20, 20),
            step: 1,
            metric: SimilarityMetric::Mse,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> RegResult<()> {
        if self.step == 0 {
            return Err(RegError::invalid("step", "must be positive"));
        }
        if self.range_x.0 > self.range_x.1 {
            return Err(RegError::invalid(
                "range_x",
                format!("empty range {:?}", self.range_x),
            ));
        }
        if self.range_y.0 > self.range_y.1 {
            return Err(RegError::invalid(
                "range_y",
                format!("empty range {:?}", self.range_y),
            ));
        }
        Ok(())
    }

    /// Translation offsets along one axis, honouring the step
    pub fn offsets(range: (i32, i32), step: u32) -> Vec<i32> {
        (range.0..=range.1).step_by(step.max(1) as usize).collect()
    }

    /// Number of candidates the search will evaluate
    pub fn candidate_count(&self) -> usize {
        Self::offsets(self.range_x, self.step).len() * Self::offsets(self.range_y, self.step).len()
    }
}

/// Complete feature-registration configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RegistrationConfig {
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
    pub n_threads: usize,
    pub detection: DetectionConfig,
    pub matching: MatchingConfig,
    pub ransac: RansacConfig,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            name: None,
            n_threads: default_threads(),
            detection: DetectionConfig::default(),
            matching: MatchingConfig::default(),
            ransac: RansacConfig::default(),
        }
    }
}

impl RegistrationConfig {
    pub fn new(method: DetectorKind) -> Self {
        Self::default().with_method(method)
    }

    pub fn with_method(mut self, method: DetectorKind) -> Self {
        self.detection.method = method;
        self
    }

    pub fn with_max_features(mut self, max_features: usize) -> Self {
        self.detection.max_features = max_features;
        self
    }

    pub fn with_ratio_test(mut self, ratio_test: f32) -> Self {
        self.matching.ratio_test = ratio_test;
        self
    }

    pub fn with_reproj_thresh(mut self, reproj_thresh: f64) -> Self {
        self.ransac.reproj_thresh = reproj_thresh;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.ransac.seed = seed;
        self
    }

    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> RegResult<()> {
        self.detection.validate()?;
        self.matching.validate()?;
        self.ransac.validate()?;
        if self.n_threads == 0 {
            return Err(RegError::invalid("n_threads", "must be positive"));
        }
        Ok(())
    }

    /// Generate human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "RegistrationConfig: method={}, max_features={}, ratio_test={:.2}, reproj_thresh={:.1}, ransac=[iters:{}, confidence:{}, seed:{}], threads={}",
            self.detection.method,
            self.detection.max_features,
            self.matching.ratio_test,
            self.ransac.reproj_thresh,
            self.ransac.max_iters,
            self.ransac.confidence,
            self.ransac.seed,
            self.n_threads
        )
    }

    /// Load configuration from JSON file
    #[cfg(feature = "serde")]
    pub fn load_json<P: AsRef<std::path::Path>>(path: P) -> RegResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Save configuration to JSON file
    #[cfg(feature = "serde")]
    pub fn save_json<P: AsRef<std::path::Path>>(&self, path: P) -> RegResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Load configuration from TOML file
    #[cfg(feature = "serde")]
    pub fn load_toml<P: AsRef<std::path::Path>>(path: P) -> RegResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Save configuration to TOML file
    #[cfg(feature = "serde")]
    pub fn save_toml<P: AsRef<std::path::Path>>(&self, path: P) -> RegResult<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Load from a `.toml` or `.json` file, chosen by extension
    #[cfg(feature = "serde")]
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> RegResult<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::load_json(path),
            Some("toml") => Self::load_toml(path),
            other => Err(RegError::Config(format!(
                "unknown config extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> RegResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| RegError::Config(e.to_string()))
    }

    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> RegResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| RegError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "serde")]
    pub fn to_toml(&self) -> RegResult<String> {
        toml::to_string_pretty(self).map_err(|e| RegError::Config(e.to_string()))
    }

    #[cfg(feature = "serde")]
    pub fn from_toml(toml_str: &str) -> RegResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| RegError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
