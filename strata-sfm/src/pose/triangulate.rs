use strata_math::{Matrix, Vector};

use crate::pose::fundamental::solve_homogeneous;
use crate::{Result, SfmError};

/// Linear triangulation of a track observed in N views, see Hartley and
/// Zisserman, section 12.2. Each view contributes two rows built from
/// its 3x4 projection matrix and the observed image position.
pub fn triangulate_track(
    positions: &[[f64; 2]],
    projections: &[Matrix<f64, 3, 4>],
) -> Result<Vector<f64, 3>> {
    if positions.len() != projections.len() || positions.len() < 2 {
        return Err(SfmError::invalid_argument(
            "invalid number of positions/poses",
        ));
    }

    let rows = 2 * positions.len();
    let mut a = vec![0.0f64; rows * 4];
    for (i, (pos, p_mat)) in positions.iter().zip(projections.iter()).enumerate() {
        for j in 0..4 {
            a[(2 * i) * 4 + j] = pos[0] * p_mat[(2, j)] - p_mat[(0, j)];
            a[(2 * i + 1) * 4 + j] = pos[1] * p_mat[(2, j)] - p_mat[(1, j)];
        }
    }

    let x = solve_homogeneous(&a, rows, 4);
    if x[3].abs() <= f64::EPSILON {
        return Err(SfmError::Numerical("track at infinity".to_string()));
    }

    Ok(Vector::new([x[0] / x[3], x[1] / x[3], x[2] / x[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn projection(rotation: Matrix<f64, 3, 3>, translation: [f64; 3]) -> Matrix<f64, 3, 4> {
        rotation.hstack(&Vector::new(translation))
    }

    fn rotation_y(angle: f64) -> Matrix<f64, 3, 3> {
        let (s, c) = angle.sin_cos();
        Matrix::new([[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]])
    }

    fn observe(p: &Matrix<f64, 3, 4>, x: &[f64; 3]) -> [f64; 2] {
        let hom = Vector::new([x[0], x[1], x[2], 1.0]);
        let projected = *p * hom;
        [projected[0] / projected[2], projected[1] / projected[2]]
    }

    #[test]
    fn test_two_view_triangulation() {
        let point = [0.3, -0.2, 4.0];
        let p1 = projection(Matrix::identity(), [0.0, 0.0, 0.0]);
        let p2 = projection(rotation_y(0.2), [-0.5, 0.0, 0.1]);

        let positions = [observe(&p1, &point), observe(&p2, &point)];
        let result = triangulate_track(&positions, &[p1, p2]).unwrap();

        assert!((result[0] - point[0]).abs() < 1e-9);
        assert!((result[1] - point[1]).abs() < 1e-9);
        assert!((result[2] - point[2]).abs() < 1e-9);
    }

    #[test]
    fn test_multi_view_triangulation() {
        let point = [-0.4, 0.6, 5.0];
        let poses = [
            projection(Matrix::identity(), [0.0, 0.0, 0.0]),
            projection(rotation_y(0.15), [-0.4, 0.0, 0.0]),
            projection(rotation_y(-0.15), [0.4, 0.1, 0.0]),
        ];
        let positions: Vec<[f64; 2]> = poses.iter().map(|p| observe(p, &point)).collect();
        let result = triangulate_track(&positions, &poses).unwrap();
        for i in 0..3 {
            assert!((result[i] - point[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rejects_single_view() {
        let p1 = projection(Matrix::identity(), [0.0, 0.0, 0.0]);
        assert!(triangulate_track(&[[0.0, 0.0]], &[p1]).is_err());
    }
}
