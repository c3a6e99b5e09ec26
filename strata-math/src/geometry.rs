use glam::Vec3;

/// Area of the triangle spanned by a, b, c. Always non-negative.
pub fn triangle_area(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    (b - a).cross(c - a).length() / 2.0
}

/// Signed volume of the tetrahedron a, b, c, d. The sign depends on the
/// orientation of the tetrahedron.
pub fn tetrahedron_volume(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> f32 {
    // Determinant identity, see
    // http://mathworld.wolfram.com/DeterminantIdentities.html
    (c - a).dot((b - a).cross(d - c)) / 6.0
}

/// Orientation of the tetrahedron given by the sign of the returned value.
/// A value near zero indicates a degenerate tetrahedron.
pub fn tetrahedron_orientation(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> f32 {
    (c - a).dot((b - a).cross(d - c))
}

/// Barycentric coordinates of point p with respect to the tetrahedron
/// a, b, c, d, via x = M * b  <=>  b = M^-1 * x.
pub fn tetrahedron_bary(a: Vec3, b: Vec3, c: Vec3, d: Vec3, p: Vec3) -> Vec3 {
    let m = glam::Mat3::from_cols(a - d, b - d, c - d);
    m.inverse() * (p - d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_area() {
        let area = triangle_area(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        );
        assert!((area - 0.5).abs() < 1e-7);
    }

    #[test]
    fn test_tetrahedron_volume() {
        let volume = tetrahedron_volume(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
        );
        assert!((volume.abs() - 1.0 / 6.0).abs() < 1e-7);
    }

    #[test]
    fn test_tetrahedron_bary_vertices() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(1.0, 0.0, 0.0);
        let c = Vec3::new(0.0, 1.0, 0.0);
        let d = Vec3::new(0.0, 0.0, 1.0);
        let bary = tetrahedron_bary(a, b, c, d, a);
        assert!((bary - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);
        let bary = tetrahedron_bary(a, b, c, d, d);
        assert!(bary.length() < 1e-6);
    }

    #[test]
    fn test_tetrahedron_bary_center() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(1.0, 0.0, 0.0);
        let c = Vec3::new(0.0, 1.0, 0.0);
        let d = Vec3::new(0.0, 0.0, 1.0);
        let center = (a + b + c + d) / 4.0;
        let bary = tetrahedron_bary(a, b, c, d, center);
        assert!((bary - Vec3::splat(0.25)).length() < 1e-6);
    }
}
