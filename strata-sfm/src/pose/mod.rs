mod fundamental;
mod homography;
mod p3p;
mod triangulate;

pub use fundamental::{
    enforce_fundamental_constraints, fundamental_8_point, fundamental_least_squares,
    sampson_distance, Correspondence2D2D, FundamentalMatrix,
};
pub use homography::{homography_dlt, symmetric_transfer_error, HomographyMatrix};
pub use p3p::pose_p3p_kneip;
pub use triangulate::triangulate_track;
