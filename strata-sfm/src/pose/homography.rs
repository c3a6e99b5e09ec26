use strata_math::Matrix;

use crate::pose::fundamental::{solve_homogeneous, Correspondence2D2D};
use crate::{Result, SfmError};

pub type HomographyMatrix = Matrix<f64, 3, 3>;

/// Estimates a homography from at least four correspondences with the
/// direct linear transform. The result is normalized such that the
/// bottom-right entry is one.
pub fn homography_dlt(points: &[Correspondence2D2D]) -> Result<HomographyMatrix> {
    if points.len() < 4 {
        return Err(SfmError::invalid_argument("at least 4 matches required"));
    }

    // Each correspondence contributes two rows to the 2Nx9 system.
    let rows = 2 * points.len();
    let mut a = vec![0.0f64; rows * 9];
    for (i, m) in points.iter().enumerate() {
        let row1 = 9 * (2 * i);
        let row2 = 9 * (2 * i + 1);
        a[row1 + 3] = m.p1[0];
        a[row1 + 4] = m.p1[1];
        a[row1 + 5] = 1.0;
        a[row1 + 6] = -m.p1[0] * m.p2[1];
        a[row1 + 7] = -m.p1[1] * m.p2[1];
        a[row1 + 8] = -m.p2[1];
        a[row2] = -m.p1[0];
        a[row2 + 1] = -m.p1[1];
        a[row2 + 2] = -1.0;
        a[row2 + 6] = m.p1[0] * m.p2[0];
        a[row2 + 7] = m.p1[1] * m.p2[0];
        a[row2 + 8] = m.p2[0];
    }

    let h = solve_homogeneous(&a, rows, 9);

    if h[8].abs() <= f64::EPSILON {
        return Err(SfmError::Numerical(
            "degenerate homography solution".to_string(),
        ));
    }

    let mut result = HomographyMatrix::zero();
    for i in 0..9 {
        result[(i / 3, i % 3)] = h[i] / h[8];
    }
    Ok(result)
}

/// Symmetric transfer error of a correspondence with respect to a
/// homography: e = (d(x, H^-1 x')^2 + d(x', H x)^2) / 2.
pub fn symmetric_transfer_error(homography: &HomographyMatrix, m: &Correspondence2D2D) -> f64 {
    let p1 = strata_math::Vector::new([m.p1[0], m.p1[1], 1.0]);
    let p2 = strata_math::Vector::new([m.p2[0], m.p2[1], 1.0]);

    let inverse = homography.inverse();
    let mut result = inverse * p2;
    result = result * (1.0 / result[2]);
    let mut error = (p1 - result).square_norm();

    let mut result = *homography * p1;
    result = result * (1.0 / result[2]);
    error += (result - p2).square_norm();

    0.5 * error
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(h: &[[f64; 3]; 3], p: [f64; 2]) -> [f64; 2] {
        let x = h[0][0] * p[0] + h[0][1] * p[1] + h[0][2];
        let y = h[1][0] * p[0] + h[1][1] * p[1] + h[1][2];
        let w = h[2][0] * p[0] + h[2][1] * p[1] + h[2][2];
        [x / w, y / w]
    }

    fn synthetic_matches() -> (Vec<Correspondence2D2D>, [[f64; 3]; 3]) {
        // A projective map with mild perspective components.
        let h = [[1.2, 0.1, 0.3], [-0.05, 0.9, -0.2], [0.01, -0.02, 1.0]];
        let source = [
            [0.0, 0.0],
            [1.0, 0.0],
            [0.0, 1.0],
            [1.0, 1.0],
            [0.5, 0.25],
            [-0.5, 0.75],
        ];
        let matches = source
            .iter()
            .map(|&p| Correspondence2D2D {
                p1: p,
                p2: apply(&h, p),
            })
            .collect();
        (matches, h)
    }

    #[test]
    fn test_dlt_recovers_homography() {
        let (matches, h_true) = synthetic_matches();
        let h = homography_dlt(&matches).unwrap();

        // The estimate is scaled such that H22 = 1, as is the reference.
        assert!((h[(2, 2)] - 1.0).abs() < 1e-12);
        for r in 0..3 {
            for c in 0..3 {
                assert!(
                    (h[(r, c)] - h_true[r][c]).abs() < 1e-8,
                    "H({r},{c}) mismatch"
                );
            }
        }
    }

    #[test]
    fn test_transfer_error_zero_for_exact_matches() {
        let (matches, _) = synthetic_matches();
        let h = homography_dlt(&matches).unwrap();
        for m in &matches {
            assert!(symmetric_transfer_error(&h, m) < 1e-16);
        }
    }

    #[test]
    fn test_dlt_needs_four_matches() {
        let (matches, _) = synthetic_matches();
        assert!(homography_dlt(&matches[0..3]).is_err());
    }
}
