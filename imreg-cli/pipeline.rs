use imreg_core::{DetectorKind, FeatureMatch, GrayImage, Keypoint, RansacConfig, RegError, RegResult, RegistrationConfig};
use imreg_features::{extract, extractor_from_config, match_features, BoxedExtractor, MatchStatistics};
use imreg_geometry::{filter_matches_ransac, warp_perspective, HomographyFit, Transform};
use serde::Serialize;
use tracing::{info, warn};

/// Minimum correspondences for a homography
pub const MIN_MATCHES: usize = 4;

/// Why a registration stopped before producing a transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationFailure {
    /// One of the images produced no descriptors
    InsufficientFeatures,
    /// Fewer than four matches survived the ratio test
    InsufficientMatches,
    /// No well-conditioned homography was found
    HomographyFitFailed,
}

impl std::fmt::Display for RegistrationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationFailure::InsufficientFeatures => write!(f, "insufficient features"),
            RegistrationFailure::InsufficientMatches => write!(f, "insufficient matches"),
            RegistrationFailure::HomographyFitFailed => write!(f, "homography fit failed"),
        }
    }
}

/// Intermediate results kept for inspection and rendering
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationDiagnostics {
    pub fixed_keypoints: Vec<Keypoint>,
    pub moving_keypoints: Vec<Keypoint>,
    /// Query side indexes the fixed keypoints, train side the moving ones
    pub matches: Vec<FeatureMatch>,
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
}

impl RegistrationDiagnostics {
    pub fn statistics(&self) -> MatchStatistics {
        MatchStatistics::compute(&self.matches, Some(&self.inlier_mask))
    }
}

/// Successful registration: moving image resampled into the fixed frame
#[derive(Debug, Clone)]
pub struct Registration {
    /// Maps moving-image coordinates to fixed-image coordinates
    pub transform: Transform,
    pub registered: GrayImage,
    pub diagnostics: RegistrationDiagnostics,
}

#[derive(Debug, Clone)]
pub enum RegistrationOutcome {
    Registered(Registration),
    Failed(RegistrationFailure),
}

impl RegistrationOutcome {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationOutcome::Registered(_))
    }

    pub fn registration(&self) -> Option<&Registration> {
        match self {
            RegistrationOutcome::Registered(r) => Some(r),
            RegistrationOutcome::Failed(_) => None,
        }
    }

    pub fn into_registration(self) -> Option<Registration> {
        match self {
            RegistrationOutcome::Registered(r) => Some(r),
            RegistrationOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<RegistrationFailure> {
        match self {
            RegistrationOutcome::Registered(_) => None,
            RegistrationOutcome::Failed(f) => Some(*f),
        }
    }
}

/// Reject matches whose indices fall outside either keypoint list
pub fn check_match_indices(kp_a: &[Keypoint], kp_b: &[Keypoint], matches: &[FeatureMatch]) -> RegResult<()> {
    for m in matches {
        if m.query_idx >= kp_a.len() || m.train_idx >= kp_b.len() {
            return Err(RegError::invalid(
                "matches",
                format!(
                    "match ({}, {}) outside keypoint lists of length {} and {}",
                    m.query_idx,
                    m.train_idx,
                    kp_a.len(),
                    kp_b.len()
                ),
            ));
        }
    }
    Ok(())
}

/// Validated consensus fit; `Ok(None)` for too few matches or no model
pub fn fit_homography(
    kp_a: &[Keypoint],
    kp_b: &[Keypoint],
    matches: &[FeatureMatch],
    cfg: &RansacConfig,
) -> RegResult<Option<HomographyFit>> {
    cfg.validate()?;
    check_match_indices(kp_a, kp_b, matches)?;
    Ok(filter_matches_ransac(kp_a, kp_b, matches, cfg))
}

/// Feature-based registration: detect, match, fit a homography, warp
pub struct FeatureRegistration {
    config: RegistrationConfig,
    extractor: BoxedExtractor,
}

impl FeatureRegistration {
    pub fn new(config: RegistrationConfig) -> RegResult<Self> {
        config.validate()?;
        let extractor = extractor_from_config(&config.detection);
        Ok(Self { config, extractor })
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Align `moving` onto `fixed`. Early stops are reported as `Failed` outcomes.
    pub fn register(&self, fixed: &GrayImage, moving: &GrayImage) -> RegResult<RegistrationOutcome> {
        let method = self.config.detection.method;
        let fixed_features = extract(self.extractor.as_ref(), fixed)?;
        let moving_features = extract(self.extractor.as_ref(), moving)?;

        let (fixed_desc, moving_desc) = match (&fixed_features.descriptors, &moving_features.descriptors) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                warn!(
                    %method,
                    fixed = fixed_features.len(),
                    moving = moving_features.len(),
                    "not enough features detected"
                );
                return Ok(RegistrationOutcome::Failed(RegistrationFailure::InsufficientFeatures));
            }
        };
        info!(
            %method,
            fixed = fixed_features.len(),
            moving = moving_features.len(),
            "features detected"
        );

        let matches = match_features(Some(fixed_desc), Some(moving_desc), method, self.config.matching.ratio_test)?;
        info!(matches = matches.len(), "matches found");
        if matches.len() < MIN_MATCHES {
            warn!(matches = matches.len(), "not enough matches to fit a homography");
            return Ok(RegistrationOutcome::Failed(RegistrationFailure::InsufficientMatches));
        }

        let fit = match fit_homography(
            &fixed_features.keypoints,
            &moving_features.keypoints,
            &matches,
            &self.config.ransac,
        )? {
            Some(fit) => fit,
            None => {
                warn!(matches = matches.len(), "homography could not be estimated");
                return Ok(RegistrationOutcome::Failed(RegistrationFailure::HomographyFitFailed));
            }
        };
        info!(inliers = fit.num_inliers, matches = matches.len(), "ransac inliers");

        let registered = warp_perspective(moving, &fit.transform, fixed.dimensions())?;

        Ok(RegistrationOutcome::Registered(Registration {
            transform: fit.transform,
            registered,
            diagnostics: RegistrationDiagnostics {
                fixed_keypoints: fixed_features.keypoints,
                moving_keypoints: moving_features.keypoints,
                matches,
                inlier_mask: fit.inlier_mask,
                num_inliers: fit.num_inliers,
            },
        }))
    }
}

/// One-shot registration with the default matching and consensus settings
pub fn register_with_features(
    fixed: &GrayImage,
    moving: &GrayImage,
    method: DetectorKind,
    max_features: usize,
) -> RegResult<RegistrationOutcome> {
    let config = RegistrationConfig::new(method).with_max_features(max_features);
    FeatureRegistration::new(config)?.register(fixed, moving)
}
