pub mod fusion;
pub mod homography;
pub mod ransac;
pub mod similarity;
pub mod transform;

pub use fusion::{blend, fuse_images};
pub use homography::{estimate_homography_dlt, project, reprojection_error};
pub use ransac::{filter_matches_ransac, find_homography_ransac, HomographyFit};
pub use similarity::{mse, mutual_information, ncc, similarity, similarity_by_name};
pub use transform::{
    apply_transformation, apply_transformation_by_name, transform_error, warp_affine, warp_perspective,
    AffineMatrix, Transform, TransformError,
};
