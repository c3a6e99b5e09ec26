use glam::Vec3;

/// Result of a successful ray/triangle intersection.
#[derive(Debug, Clone, Copy)]
pub struct RayHit {
    /// Ray parameter of the intersection point. Can be negative for hits
    /// behind the ray origin.
    pub t: f32,
    /// Full barycentric coordinates (u, v, w) with w = 1 - u - v.
    pub bary: Vec3,
}

/// Intersects a ray with a triangle using the Moeller-Trumbore algorithm.
/// Returns `None` on a miss or when the ray lies in the triangle plane.
pub fn ray_triangle_intersect(origin: Vec3, dir: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<RayHit> {
    let edge1 = b - a;
    let edge2 = c - a;

    let pvec = dir.cross(edge2);
    let det = edge1.dot(pvec);
    if det.abs() <= f32::EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;

    let tvec = origin - a;
    let u = tvec.dot(pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let qvec = tvec.cross(edge1);
    let v = dir.dot(qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = edge2.dot(qvec) * inv_det;
    Some(RayHit {
        t,
        bary: Vec3::new(u, v, 1.0 - u - v),
    })
}

/// Plane/box overlap with the plane in Hesse normal form and the box
/// centered at the origin.
pub fn plane_box_overlap(normal: Vec3, pos: Vec3, boxhalfsize: Vec3) -> bool {
    let mut vmin = Vec3::ZERO;
    let mut vmax = Vec3::ZERO;
    for q in 0..3 {
        if normal[q] > 0.0 {
            vmin[q] = -boxhalfsize[q] - pos[q];
            vmax[q] = boxhalfsize[q] - pos[q];
        } else {
            vmin[q] = boxhalfsize[q] - pos[q];
            vmax[q] = -boxhalfsize[q] - pos[q];
        }
    }

    if normal.dot(vmin) > 0.0 {
        return false;
    }
    normal.dot(vmax) >= 0.0
}

fn axis_test(
    p0: f32,
    p1: f32,
    rad: f32,
) -> bool {
    let min = p0.min(p1);
    let max = p0.max(p1);
    !(min > rad || max < -rad)
}

/// Triangle/box overlap using the separating axis theorem. The box is
/// given by its center and half sizes.
pub fn triangle_box_overlap(
    boxcenter: Vec3,
    boxhalfsize: Vec3,
    a: Vec3,
    b: Vec3,
    c: Vec3,
) -> bool {
    let v = [a - boxcenter, b - boxcenter, c - boxcenter];
    let e = [v[1] - v[0], v[2] - v[1], v[0] - v[2]];

    // Nine axis tests from the cross products of edge and box axes.
    for (i, edge) in e.iter().enumerate() {
        let fabs = edge.abs();

        // X-axis cross product.
        let (q, r) = if i == 2 { (0, 1) } else { (0, 2) };
        let p0 = edge.z * v[q].y - edge.y * v[q].z;
        let p1 = edge.z * v[r].y - edge.y * v[r].z;
        let rad = fabs.z * boxhalfsize.y + fabs.y * boxhalfsize.z;
        if !axis_test(p0, p1, rad) {
            return false;
        }

        // Y-axis cross product.
        let (q, r) = if i == 2 { (0, 1) } else { (0, 2) };
        let p0 = edge.z * v[q].x - edge.x * v[q].z;
        let p1 = edge.z * v[r].x - edge.x * v[r].z;
        let rad = fabs.z * boxhalfsize.x + fabs.x * boxhalfsize.z;
        if !axis_test(-p0, -p1, rad) {
            return false;
        }

        // Z-axis cross product.
        let (q, r) = if i == 1 { (0, 1) } else { (1, 2) };
        let p0 = edge.y * v[q].x - edge.x * v[q].y;
        let p1 = edge.y * v[r].x - edge.x * v[r].y;
        let rad = fabs.y * boxhalfsize.x + fabs.x * boxhalfsize.y;
        if !axis_test(p0, p1, rad) {
            return false;
        }
    }

    // Overlap of the AABBs.
    for i in 0..3 {
        let min = v[0][i].min(v[1][i]).min(v[2][i]);
        let max = v[0][i].max(v[1][i]).max(v[2][i]);
        if min > boxhalfsize[i] || max < -boxhalfsize[i] {
            return false;
        }
    }

    // Overlap of the box with the triangle plane.
    let normal = e[0].cross(e[1]);
    plane_box_overlap(normal, v[0], boxhalfsize)
}

/// Overlap test between two axis-aligned boxes.
pub fn box_box_overlap(b1_min: Vec3, b1_max: Vec3, b2_min: Vec3, b2_max: Vec3) -> bool {
    for i in 0..3 {
        if b1_min[i] > b2_max[i] || b1_max[i] < b2_min[i] {
            return false;
        }
    }
    true
}

/// Tests whether a point is inside an axis-aligned box.
pub fn point_box_overlap(point: Vec3, aabb_min: Vec3, aabb_max: Vec3) -> bool {
    for i in 0..3 {
        if point[i] < aabb_min[i] || point[i] > aabb_max[i] {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    mod ray_triangle {
        use super::*;

        #[test]
        fn test_center_hit() {
            let hit = ray_triangle_intersect(
                Vec3::new(0.25, 0.25, -1.0),
                Vec3::new(0.0, 0.0, 1.0),
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            )
            .expect("ray must hit");
            assert!((hit.t - 1.0).abs() < 1e-6);
            let bary_sum = hit.bary.x + hit.bary.y + hit.bary.z;
            assert!((bary_sum - 1.0).abs() < 1e-6);
        }

        #[test]
        fn test_miss() {
            let hit = ray_triangle_intersect(
                Vec3::new(2.0, 2.0, -1.0),
                Vec3::new(0.0, 0.0, 1.0),
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            );
            assert!(hit.is_none());
        }

        #[test]
        fn test_parallel_ray() {
            let hit = ray_triangle_intersect(
                Vec3::new(0.0, 0.0, 1.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            );
            assert!(hit.is_none());
        }

        #[test]
        fn test_hit_behind_origin() {
            let hit = ray_triangle_intersect(
                Vec3::new(0.25, 0.25, 1.0),
                Vec3::new(0.0, 0.0, 1.0),
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            )
            .expect("plane hit is reported even behind the origin");
            assert!(hit.t < 0.0);
        }
    }

    mod triangle_box {
        use super::*;

        #[test]
        fn test_triangle_inside_box() {
            assert!(triangle_box_overlap(
                Vec3::splat(0.5),
                Vec3::splat(0.5),
                Vec3::new(0.25, 0.25, 0.25),
                Vec3::new(0.75, 0.25, 0.25),
                Vec3::new(0.25, 0.75, 0.25),
            ));
        }

        #[test]
        fn test_triangle_outside_box() {
            assert!(!triangle_box_overlap(
                Vec3::splat(0.5),
                Vec3::splat(0.5),
                Vec3::new(1.5, 1.5, 1.5),
                Vec3::new(2.5, 1.5, 1.5),
                Vec3::new(1.5, 2.5, 1.5),
            ));
        }

        #[test]
        fn test_triangle_crossing_box() {
            assert!(triangle_box_overlap(
                Vec3::splat(0.5),
                Vec3::splat(0.5),
                Vec3::new(-0.5, 0.5, 0.5),
                Vec3::new(1.5, 0.5, 0.5),
                Vec3::new(0.5, 2.0, 0.5),
            ));
        }

        #[test]
        fn test_plane_separates() {
            assert!(!triangle_box_overlap(
                Vec3::splat(0.5),
                Vec3::splat(0.4),
                Vec3::new(0.0, 0.0, 1.5),
                Vec3::new(1.0, 0.0, 1.5),
                Vec3::new(0.0, 1.0, 1.5),
            ));
        }
    }

    #[test]
    fn test_box_box_overlap() {
        assert!(box_box_overlap(
            Vec3::ZERO,
            Vec3::ONE,
            Vec3::splat(0.5),
            Vec3::splat(1.5)
        ));
        assert!(!box_box_overlap(
            Vec3::ZERO,
            Vec3::ONE,
            Vec3::splat(1.5),
            Vec3::splat(2.5)
        ));
    }

    #[test]
    fn test_point_box_overlap() {
        assert!(point_box_overlap(Vec3::splat(0.5), Vec3::ZERO, Vec3::ONE));
        assert!(!point_box_overlap(Vec3::splat(1.5), Vec3::ZERO, Vec3::ONE));
    }
}
