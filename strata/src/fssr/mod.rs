mod basis;
mod octree;
mod sample;

pub use basis::{
    evaluate_sample, gaussian, gaussian_fssr, gaussian_normalized, linear_ramp,
    rotation_from_normal, transform_position, weighting_function, weighting_function_mpu,
    weighting_function_x, weighting_function_yz, SampleContribution,
};
pub use octree::FssrOctree;
pub use sample::Sample;
