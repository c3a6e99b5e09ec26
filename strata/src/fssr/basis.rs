//! Scale-dependent basis and weighting functions of the floating-scale
//! implicit function.
//!
//! The basis is a Gaussian derivative along the sample normal and a
//! regular Gaussian orthogonal to it: positive in front of the sample,
//! negative behind, zero at the sample plane. Both basis and weighting
//! functions expect the query position transformed into the sample's
//! local coordinate system, where the normal points along positive x.

use glam::{Mat3, Vec3};

use crate::fssr::sample::Sample;

/// The Gaussian function in 3D, rotation invariant.
pub fn gaussian(sigma: f32, pos: Vec3) -> f32 {
    (-pos.dot(pos) / (2.0 * sigma * sigma)).exp()
}

/// The normalized Gaussian in 3D.
pub fn gaussian_normalized(sigma: f32, pos: Vec3) -> f32 {
    gaussian(sigma, pos) / (sigma * (2.0 * std::f32::consts::PI).sqrt())
}

/// The floating-scale basis function: a Gaussian derivative in normal
/// direction (positive x-axis) and a Gaussian orthogonal to it.
pub fn gaussian_fssr(sigma: f32, pos: Vec3) -> f32 {
    let sigma2 = sigma * sigma;
    pos.x * gaussian(sigma, pos) / (sigma2 * sigma2 * 2.0 * std::f32::consts::PI)
}

/// Linear ramp signed distance, computed from the untransformed position:
/// sdf = <pos - sample.pos | sample.normal>.
pub fn linear_ramp(sample: &Sample, pos: Vec3) -> f32 {
    (pos - sample.pos).dot(sample.normal)
}

/// Weighting function in normal direction over [-3, 3], asymmetric: it
/// falls off quickly behind the surface (negative x) and less quickly in
/// front of it.
pub fn weighting_function_x(x: f32) -> f32 {
    if x <= -3.0 || x >= 3.0 {
        return 0.0;
    }

    if x > 0.0 {
        let a = 2.0 / 27.0;
        let b = -1.0 / 3.0;
        a * x * x * x + b * x * x + 1.0
    } else {
        let a = 1.0 / 9.0;
        let b = 2.0 / 3.0;
        a * x * x + b * x + 1.0
    }
}

/// Radially symmetric weighting function in the plane orthogonal to the
/// normal, supported on y^2 + z^2 <= 9.
pub fn weighting_function_yz(y: f32, z: f32) -> f32 {
    let r2 = y * y + z * z;
    if r2 > 9.0 {
        return 0.0;
    }

    let a = 2.0 / 27.0;
    let b = -1.0 / 3.0;
    a * r2.powf(1.5) + b * r2 + 1.0
}

/// The separable weighting function scaled by the sample scale. Expects a
/// position in the sample's LCS.
pub fn weighting_function(sample_scale: f32, pos: Vec3) -> f32 {
    weighting_function_x(pos.x / sample_scale)
        * weighting_function_yz(pos.y / sample_scale, pos.z / sample_scale)
}

/// Radially symmetric weighting function from the MPU paper, a quadratic
/// B-spline over [-3, 3].
pub fn weighting_function_mpu(sample_scale: f32, pos: Vec3) -> f32 {
    let x = pos.length() / sample_scale;
    if x <= -3.0 || x >= 3.0 {
        return 0.0;
    }

    let xf = (x + 3.0) / 2.0;
    if xf <= 1.0 {
        xf * xf / 2.0
    } else if xf <= 2.0 {
        (-2.0 * xf * xf + 6.0 * xf - 3.0) / 2.0
    } else {
        (3.0 - xf) * (3.0 - xf) / 2.0
    }
}

/// Rotation that maps the given unit normal onto the reference axis
/// (1, 0, 0). The rotation axis is the cross product of normal and
/// reference, the angle follows from the dot product.
pub fn rotation_from_normal(normal: Vec3) -> Mat3 {
    let reference = Vec3::X;
    if (normal - reference).length() < 0.001 {
        return Mat3::IDENTITY;
    }

    if (normal + reference).length() < 0.001 {
        // 180 degree rotation around the z-axis.
        return Mat3::from_cols(Vec3::NEG_X, Vec3::NEG_Y, Vec3::Z);
    }

    let axis = normal.cross(reference).normalize();
    let angle = reference.dot(normal).clamp(-1.0, 1.0).acos();
    Mat3::from_axis_angle(axis, angle)
}

/// Transforms a position into the local coordinate system of a sample.
pub fn transform_position(pos: Vec3, sample: &Sample) -> Vec3 {
    rotation_from_normal(sample.normal) * (pos - sample.pos)
}

/// Contribution of one sample at a query position.
#[derive(Debug, Clone, Copy)]
pub struct SampleContribution {
    pub value: f64,
    pub weight: f64,
}

/// Evaluates the weighted basis of one sample at a query position.
/// Returns `None` outside the sample's compact support.
pub fn evaluate_sample(pos: Vec3, sample: &Sample) -> Option<SampleContribution> {
    let tpos = transform_position(pos, sample);
    let weight = weighting_function(sample.scale, tpos) * sample.confidence;
    if weight <= 0.0 {
        return None;
    }

    let value = gaussian_fssr(sample.scale, tpos);
    Some(SampleContribution {
        value: f64::from(weight) * f64::from(value),
        weight: f64::from(weight),
    })
}
