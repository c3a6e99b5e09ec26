use strata_math::matrix::mat_transpose_multiply;
use strata_math::svd::{matrix_svd, matrix_svd_slice};
use strata_math::Matrix;

use crate::{Result, SfmError};

pub type FundamentalMatrix = Matrix<f64, 3, 3>;

/// A pair of corresponding 2D points in two views.
#[derive(Debug, Clone, Copy)]
pub struct Correspondence2D2D {
    pub p1: [f64; 2],
    pub p2: [f64; 2],
}

const SVD_EPSILON: f64 = 1e-14;

/// Solves the homogeneous system A x = 0 for the x of unit norm: the
/// singular vector of the smallest singular value. The decomposition
/// runs on the square normal matrix A^T A, which shares its right
/// singular vectors with A.
pub(crate) fn solve_homogeneous(a: &[f64], rows: usize, cols: usize) -> Vec<f64> {
    let mut ata = vec![0.0f64; cols * cols];
    mat_transpose_multiply(a, rows, cols, &mut ata);

    let mut u = vec![0.0; cols * cols];
    let mut s = vec![0.0; cols];
    let mut v = vec![0.0; cols * cols];
    matrix_svd_slice(&ata, cols, cols, &mut u, &mut s, &mut v, SVD_EPSILON);

    // The Golub-Kahan sweep does not order the singular values.
    let mut smallest = 0;
    for i in 1..cols {
        if s[i] < s[smallest] {
            smallest = i;
        }
    }

    (0..cols).map(|r| v[r * cols + smallest]).collect()
}

fn constraint_row(correspondence: &Correspondence2D2D, row: &mut [f64]) {
    let p1 = &correspondence.p1;
    let p2 = &correspondence.p2;
    row[0] = p2[0] * p1[0];
    row[1] = p2[0] * p1[1];
    row[2] = p2[0];
    row[3] = p2[1] * p1[0];
    row[4] = p2[1] * p1[1];
    row[5] = p2[1];
    row[6] = p1[0];
    row[7] = p1[1];
    row[8] = 1.0;
}

/// Estimates the fundamental matrix from exactly eight correspondences
/// using the bilinear constraint x2^T F x1 = 0. The solution is the right
/// null vector of the 8x9 constraint matrix.
pub fn fundamental_8_point(
    correspondences: &[Correspondence2D2D; 8],
) -> Result<FundamentalMatrix> {
    let mut a = [0.0f64; 8 * 9];
    for (i, correspondence) in correspondences.iter().enumerate() {
        constraint_row(correspondence, &mut a[i * 9..(i + 1) * 9]);
    }

    let f = solve_homogeneous(&a, 8, 9);

    let mut result = FundamentalMatrix::zero();
    for i in 0..9 {
        result[(i / 3, i % 3)] = f[i];
    }
    Ok(result)
}

/// Least-squares fundamental matrix from at least eight correspondences.
pub fn fundamental_least_squares(
    correspondences: &[Correspondence2D2D],
) -> Result<FundamentalMatrix> {
    if correspondences.len() < 8 {
        return Err(SfmError::invalid_argument("at least 8 points required"));
    }

    let rows = correspondences.len();
    let mut a = vec![0.0f64; rows * 9];
    for (i, correspondence) in correspondences.iter().enumerate() {
        constraint_row(correspondence, &mut a[i * 9..(i + 1) * 9]);
    }

    let f = solve_homogeneous(&a, rows, 9);

    let mut result = FundamentalMatrix::zero();
    for i in 0..9 {
        result[(i / 3, i % 3)] = f[i];
    }
    Ok(result)
}

/// Enforces rank 2 on the fundamental matrix by zeroing the smallest
/// singular value: F' = USV^T, F = U diag(s1, s2, 0) V^T.
pub fn enforce_fundamental_constraints(matrix: &mut FundamentalMatrix) {
    let (u, mut s, v) = matrix_svd(matrix, SVD_EPSILON);
    s[(2, 2)] = 0.0;
    *matrix = u * s * v.transposed();
}

/// Sampson distance of one correspondence with respect to a fundamental
/// matrix, see Hartley and Zisserman, section 11.4.3.
pub fn sampson_distance(f: &FundamentalMatrix, m: &Correspondence2D2D) -> f64 {
    let mut p2_f_p1 = 0.0;
    p2_f_p1 += m.p2[0] * (m.p1[0] * f[(0, 0)] + m.p1[1] * f[(0, 1)] + f[(0, 2)]);
    p2_f_p1 += m.p2[1] * (m.p1[0] * f[(1, 0)] + m.p1[1] * f[(1, 1)] + f[(1, 2)]);
    p2_f_p1 += m.p1[0] * f[(2, 0)] + m.p1[1] * f[(2, 1)] + f[(2, 2)];
    p2_f_p1 *= p2_f_p1;

    let mut sum = 0.0;
    sum += (m.p1[0] * f[(0, 0)] + m.p1[1] * f[(0, 1)] + f[(0, 2)]).powi(2);
    sum += (m.p1[0] * f[(1, 0)] + m.p1[1] * f[(1, 1)] + f[(1, 2)]).powi(2);
    sum += (m.p2[0] * f[(0, 0)] + m.p2[1] * f[(1, 0)] + f[(2, 0)]).powi(2);
    sum += (m.p2[0] * f[(0, 1)] + m.p2[1] * f[(1, 1)] + f[(2, 1)]).powi(2);

    p2_f_p1 / sum
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Projects world points with two cameras: the first canonical, the
    /// second rotated by 45 degrees around z and translated.
    fn synthetic_correspondences() -> Vec<Correspondence2D2D> {
        let angle = std::f64::consts::FRAC_PI_4;
        let (s, c) = angle.sin_cos();
        let rotation = [[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]];
        let translation = [0.0, 0.0, -2.0];

        let world_points = [
            [0.2, 0.3, 6.0],
            [-0.5, 0.1, 5.0],
            [0.4, -0.2, 7.0],
            [-0.3, -0.4, 6.5],
            [0.6, 0.5, 8.0],
            [-0.1, 0.6, 5.5],
            [0.1, -0.6, 7.5],
            [0.7, -0.1, 6.2],
        ];

        world_points
            .iter()
            .map(|p| {
                let x1 = [p[0] / p[2], p[1] / p[2]];
                let mut q = [0.0; 3];
                for r in 0..3 {
                    q[r] = rotation[r][0] * p[0]
                        + rotation[r][1] * p[1]
                        + rotation[r][2] * p[2]
                        + translation[r];
                }
                let x2 = [q[0] / q[2], q[1] / q[2]];
                Correspondence2D2D { p1: x1, p2: x2 }
            })
            .collect()
    }

    fn epipolar_residual(f: &FundamentalMatrix, m: &Correspondence2D2D) -> f64 {
        let p1 = [m.p1[0], m.p1[1], 1.0];
        let p2 = [m.p2[0], m.p2[1], 1.0];
        let mut result = 0.0;
        for r in 0..3 {
            for c in 0..3 {
                result += p2[r] * f[(r, c)] * p1[c];
            }
        }
        result
    }

    #[test]
    fn test_eight_point_satisfies_epipolar_constraint() {
        let correspondences = synthetic_correspondences();
        let eight: [Correspondence2D2D; 8] = correspondences[0..8].try_into().unwrap();
        let mut f = fundamental_8_point(&eight).unwrap();
        enforce_fundamental_constraints(&mut f);

        for m in &correspondences {
            assert!(
                epipolar_residual(&f, m).abs() < 1e-10,
                "epipolar residual too large"
            );
        }
    }

    #[test]
    fn test_rank_two_after_enforcement() {
        let eight: [Correspondence2D2D; 8] =
            synthetic_correspondences()[0..8].try_into().unwrap();
        let mut f = fundamental_8_point(&eight).unwrap();
        enforce_fundamental_constraints(&mut f);
        assert!(f.determinant().abs() < 1e-12);
    }

    #[test]
    fn test_least_squares_matches_constraint() {
        let correspondences = synthetic_correspondences();
        let mut f = fundamental_least_squares(&correspondences).unwrap();
        enforce_fundamental_constraints(&mut f);
        for m in &correspondences {
            assert!(epipolar_residual(&f, m).abs() < 1e-10);
        }
    }

    #[test]
    fn test_least_squares_needs_eight_points() {
        let correspondences = synthetic_correspondences();
        assert!(fundamental_least_squares(&correspondences[0..5]).is_err());
    }

    #[test]
    fn test_sampson_distance_zero_for_perfect_match() {
        let correspondences = synthetic_correspondences();
        let eight: [Correspondence2D2D; 8] = correspondences[0..8].try_into().unwrap();
        let mut f = fundamental_8_point(&eight).unwrap();
        enforce_fundamental_constraints(&mut f);
        for m in &correspondences {
            assert!(sampson_distance(&f, m) < 1e-16);
        }
    }
}
