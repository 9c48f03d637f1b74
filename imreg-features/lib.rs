use imreg_core::{DetectionConfig, Descriptors, DetectorKind, GrayImage, Keypoint, RegError, RegResult};
use tracing::{debug, warn};

pub mod akaze;
pub mod brief;
pub mod matcher;
pub mod orb;
pub mod pyramid;
pub mod refinement;
pub mod scale_space;
pub mod sift;

pub use akaze::AkazeExtractor;
pub use matcher::{knn_match, match_features, ratio_test, MatchStatistics};
pub use orb::OrbExtractor;
pub use sift::SiftExtractor;

/// Keypoints of one image and their descriptor rows (absent when nothing was detected)
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Option<Descriptors>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Common interface of the detector/descriptor families
pub trait FeatureExtractor {
    fn kind(&self) -> DetectorKind;

    /// Detect keypoints and describe them; row `i` of the descriptors belongs to keypoint `i`
    fn detect_and_compute(&self, img: &GrayImage) -> RegResult<(Vec<Keypoint>, Descriptors)>;
}

pub type BoxedExtractor = Box<dyn FeatureExtractor + Send + Sync>;

/// Build the extractor for `kind` with its default parameters
pub fn extractor_for(kind: DetectorKind, max_features: usize) -> BoxedExtractor {
    match kind {
        DetectorKind::Orb => Box::new(OrbExtractor::new(max_features)),
        DetectorKind::Sift => Box::new(SiftExtractor::new(max_features)),
        DetectorKind::Akaze => Box::new(AkazeExtractor::new(max_features)),
    }
}

/// Build the extractor described by a detection config (pyramid settings only affect ORB)
pub fn extractor_from_config(cfg: &DetectionConfig) -> BoxedExtractor {
    match cfg.method {
        DetectorKind::Orb => Box::new(OrbExtractor::from_config(cfg)),
        kind => extractor_for(kind, cfg.max_features),
    }
}

/// Run an extractor and package its output
pub fn extract(extractor: &dyn FeatureExtractor, img: &GrayImage) -> RegResult<Features> {
    let (keypoints, descriptors) = extractor.detect_and_compute(img)?;
    debug!(method = %extractor.kind(), keypoints = keypoints.len(), "features extracted");
    let descriptors = if keypoints.is_empty() {
        None
    } else {
        Some(descriptors)
    };
    Ok(Features {
        keypoints,
        descriptors,
    })
}

/// Detect keypoints and compute descriptors with the chosen method
pub fn detect_features(img: &GrayImage, kind: DetectorKind, max_features: usize) -> RegResult<Features> {
    if max_features == 0 {
        return Err(RegError::invalid("max_features", "must be positive"));
    }
    extract(extractor_for(kind, max_features).as_ref(), img)
}

/// Resolve the detector from its tag before touching the image
pub fn detect_features_by_name(img: &GrayImage, method: &str, max_features: usize) -> RegResult<Features> {
    let kind: DetectorKind = method.parse()?;
    detect_features(img, kind, max_features)
}

/// Keypoint count and descriptor shape of one detector run
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSummary {
    pub num_keypoints: usize,
    pub descriptor_len: usize,
    pub mean_response: f32,
    pub features: Features,
}

/// Outcome of one detector in a comparison run
#[derive(Debug)]
pub struct DetectorComparison {
    pub kind: DetectorKind,
    pub result: Result<DetectorSummary, RegError>,
}

/// Run every detector in `kinds` on the same image. A failing detector is recorded and
/// does not stop the others.
pub fn compare_detectors(img: &GrayImage, kinds: &[DetectorKind], max_features: usize) -> Vec<DetectorComparison> {
    kinds
        .iter()
        .map(|&kind| {
            let result = detect_features(img, kind, max_features).map(|features| {
                let num_keypoints = features.len();
                let mean_response = if num_keypoints > 0 {
                    features.keypoints.iter().map(|k| k.response.abs()).sum::<f32>() / num_keypoints as f32
                } else {
                    0.0
                };
                DetectorSummary {
                    num_keypoints,
                    descriptor_len: features.descriptors.as_ref().map_or(0, Descriptors::row_len),
                    mean_response,
                    features,
                }
            });
            if let Err(e) = &result {
                warn!(method = %kind, error = %e, "detector failed");
            }
            DetectorComparison { kind, result }
        })
        .collect()
}
