use num::Float;

use crate::matrix::Matrix;

/// Computes the Givens rotation coefficients c and s such that
/// [c s; -s c]^T [alpha; beta] = [r; 0].
pub(crate) fn givens_rotation<T: Float>(alpha: T, beta: T, epsilon: T) -> (T, T) {
    if beta.abs() <= epsilon {
        return (T::one(), T::zero());
    }

    if beta.abs() > alpha.abs() {
        let tao = -alpha / beta;
        let s = T::one() / (T::one() + tao * tao).sqrt();
        (s * tao, s)
    } else {
        let tao = -beta / alpha;
        let c = T::one() / (T::one() + tao * tao).sqrt();
        (c, c * tao)
    }
}

/// Applies a Givens rotation to columns (i, k) of a row-major matrix in-place.
pub(crate) fn apply_givens_column<T: Float>(
    mat: &mut [T],
    rows: usize,
    cols: usize,
    i: usize,
    k: usize,
    givens_c: T,
    givens_s: T,
) {
    for j in 0..rows {
        let tao1 = mat[j * cols + i];
        let tao2 = mat[j * cols + k];
        mat[j * cols + i] = givens_c * tao1 - givens_s * tao2;
        mat[j * cols + k] = givens_s * tao1 + givens_c * tao2;
    }
}

/// Applies a transposed Givens rotation to rows (i, k) of a row-major matrix.
pub(crate) fn apply_givens_row<T: Float>(
    mat: &mut [T],
    cols: usize,
    i: usize,
    k: usize,
    givens_c: T,
    givens_s: T,
) {
    for j in 0..cols {
        let tao1 = mat[i * cols + j];
        let tao2 = mat[k * cols + j];
        mat[i * cols + j] = givens_c * tao1 - givens_s * tao2;
        mat[k * cols + j] = givens_s * tao1 + givens_c * tao2;
    }
}

/// QR decomposition of a row-major MxN matrix using Givens rotations.
///
/// `mat_q` receives the MxM orthogonal factor, `mat_r` the MxN upper
/// triangular factor. Sub-diagonal entries are zeroed column by column,
/// bottom-up, rotating only the trailing submatrix.
pub fn matrix_qr_slice<T: Float>(
    mat_a: &[T],
    rows: usize,
    cols: usize,
    mat_q: &mut [T],
    mat_r: &mut [T],
    epsilon: T,
) {
    debug_assert_eq!(mat_a.len(), rows * cols);
    debug_assert_eq!(mat_q.len(), rows * rows);
    debug_assert_eq!(mat_r.len(), rows * cols);

    mat_r.copy_from_slice(mat_a);
    mat_q.fill(T::zero());
    for i in 0..rows {
        mat_q[i * rows + i] = T::one();
    }

    for j in 0..cols {
        for i in (j + 1..rows).rev() {
            let (givens_c, givens_s) = givens_rotation(
                mat_r[(i - 1) * cols + j],
                mat_r[i * cols + j],
                epsilon,
            );

            // Rotate only the trailing columns of rows (i - 1, i).
            for k in j..cols {
                let upper = mat_r[(i - 1) * cols + k];
                let lower = mat_r[i * cols + k];
                mat_r[(i - 1) * cols + k] = givens_c * upper - givens_s * lower;
                mat_r[i * cols + k] = givens_s * upper + givens_c * lower;
            }

            apply_givens_column(mat_q, rows, rows, i - 1, i, givens_c, givens_s);
        }
    }
}

/// QR decomposition for compile-time fixed-size matrices.
pub fn matrix_qr<T: Float, const M: usize, const N: usize>(
    mat_a: &Matrix<T, M, N>,
    epsilon: T,
) -> (Matrix<T, M, M>, Matrix<T, M, N>) {
    let a = mat_a.to_row_major();
    let mut q = vec![T::zero(); M * M];
    let mut r = vec![T::zero(); M * N];
    matrix_qr_slice(&a, M, N, &mut q, &mut r, epsilon);
    (Matrix::from_row_major(&q), Matrix::from_row_major(&r))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstructs<const M: usize, const N: usize>(a: Matrix<f64, M, N>) {
        let (q, r) = matrix_qr(&a, 1e-14);
        let qr = q * r;
        assert!(qr.is_similar(&a, 1e-12));
        // Q must be orthogonal.
        let qtq = q.transposed() * q;
        assert!(qtq.is_similar(&Matrix::identity(), 1e-12));
    }

    #[test]
    fn test_qr_square() {
        reconstructs(Matrix::new([
            [12.0, -51.0, 4.0],
            [6.0, 167.0, -68.0],
            [-4.0, 24.0, -41.0],
        ]));
    }

    #[test]
    fn test_qr_tall() {
        reconstructs(Matrix::new([
            [1.0, 2.0],
            [3.0, 4.0],
            [5.0, 6.0],
            [7.0, 8.0],
        ]));
    }

    #[test]
    fn test_r_upper_triangular() {
        let a = Matrix::new([[2.0, -4.0, 5.0], [0.0, 3.0, 2.0], [5.0, 6.0, 0.0]]);
        let (_, r) = matrix_qr(&a, 1e-14);
        for row in 1..3 {
            for col in 0..row {
                assert!(r[(row, col)].abs() < 1e-12);
            }
        }
    }
}
