use glam::Vec3;

/// Oriented surface sample with intrinsic scale.
///
/// The scale is the per-sample bandwidth of the reconstruction kernel and
/// must be positive; samples without positive scale are rejected on
/// insertion. The confidence weights the sample's contribution and is
/// usually in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub pos: Vec3,
    pub normal: Vec3,
    pub scale: f32,
    pub confidence: f32,
    pub color: Option<Vec3>,
}

impl Sample {
    pub fn new(pos: Vec3, normal: Vec3, scale: f32) -> Self {
        Self {
            pos,
            normal,
            scale,
            confidence: 1.0,
            color: None,
        }
    }

    /// Radius of the sample's influence. The weighting function has
    /// compact support within three scales around the sample.
    pub fn support_radius(&self) -> f32 {
        3.0 * self.scale
    }
}
