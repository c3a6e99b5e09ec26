//! Singular value decomposition for dense row-major matrices.
//!
//! The decomposition computes A = U * S * V^T where A is MxN, U is MxN,
//! S is an N-vector and V is NxN. Wide matrices (M < N) are handled by
//! decomposing the transpose and swapping outputs. Tall matrices with
//! M >= 5/3 * N are pre-reduced with a QR step (economy SVD after Chan).
//!
//! References:
//! - "Matrix Computations" by Golub and Loan (page 455, algo 8.6.2, GK-SVD)
//! - "An Improved Algorithm for Computing the Singular Value Decomposition"
//!   by Chan (1987), R-SVD.

use num::Float;

use crate::matrix::{mat_is_diagonal, mat_multiply, mat_set_identity, mat_transpose, Matrix};
use crate::qr::{apply_givens_column, apply_givens_row, givens_rotation, matrix_qr_slice};

fn epsilon_eq<T: Float>(a: T, b: T, epsilon: T) -> bool {
    (a - b).abs() <= epsilon
}

/// Checks whether the lower-right KxK sub-matrix is enclosed by zeros within
/// a square matrix of size MxM. SVD specific deflation check.
fn is_submatrix_zero_enclosed<T: Float>(mat: &[T], m: usize, k: usize, epsilon: T) -> bool {
    if m < k + 1 {
        return true;
    }
    let j = m - k - 1;
    for i in m - k..m {
        if !epsilon_eq(T::zero(), mat[j * m + i], epsilon)
            || !epsilon_eq(T::zero(), mat[i * m + j], epsilon)
        {
            return false;
        }
    }
    true
}

/// Checks that the super-diagonal of a MxN matrix contains no zeros.
fn is_superdiagonal_nonzero<T: Float>(mat: &[T], rows: usize, cols: usize, epsilon: T) -> bool {
    let n = rows.min(cols) - 1;
    for i in 0..n {
        if epsilon_eq(T::zero(), mat[i * cols + i + 1], epsilon) {
            return false;
        }
    }
    true
}

/// Eigenvalues of a 2x2 matrix, assumed non-complex. A negative root is
/// clamped to zero.
fn eigenvalues_2x2<T: Float>(mat: &[T]) -> (T, T) {
    let (a, b, c, d) = (mat[0], mat[1], mat[2], mat[3]);
    let two = T::one() + T::one();
    let four = two + two;
    let mut x = (a + d) * (a + d) / four - a * d + b * c;
    x = if x > T::zero() { x.sqrt() } else { T::zero() };
    ((a + d) / two - x, (a + d) / two + x)
}

/// Creates a Householder vector and beta coefficient from a column frame.
fn householder_vector<T: Float>(
    input: &[T],
    vector: &mut [T],
    epsilon: T,
    norm_factor: T,
) -> T {
    let length = input.len();
    let mut sigma = T::zero();
    for i in 1..length {
        let v = input[i] / norm_factor;
        sigma = sigma + v * v;
    }

    vector[0] = T::one();
    for i in 1..length {
        vector[i] = input[i] / norm_factor;
    }

    if sigma.abs() < epsilon {
        return T::zero();
    }

    let mut first = input[0] / norm_factor;
    let mu = (first * first + sigma).sqrt();
    if first < epsilon {
        vector[0] = first - mu;
    } else {
        vector[0] = -sigma / (first + mu);
    }

    first = vector[0];
    let two = T::one() + T::one();
    let beta = two * first * first / (sigma + first * first);
    for i in 0..length {
        vector[i] = vector[i] / first;
    }
    beta
}

/// Expands a Householder vector into the dense transformation matrix
/// I - beta * v * v^T.
fn householder_matrix<T: Float>(vector: &[T], beta: T, matrix: &mut [T]) {
    let length = vector.len();
    matrix.fill(T::zero());
    for i in 0..length {
        matrix[i * length + i] = T::one();
    }
    for i in 0..length {
        for j in 0..length {
            matrix[i * length + j] = matrix[i * length + j] - beta * vector[i] * vector[j];
        }
    }
}

/// Applies a Householder matrix to a frame of `mat_a` with the given offset.
fn apply_householder_matrix<T: Float>(
    mat_a: &mut [T],
    rows: usize,
    cols: usize,
    house_mat: &[T],
    house_length: usize,
    offset_rows: usize,
    offset_cols: usize,
) {
    // Save the block of the old matrix that will be modified.
    let house_length_n = house_length - (rows - cols);
    let mut rhs = vec![T::zero(); house_length * house_length_n];
    for i in 0..house_length {
        for j in 0..house_length_n {
            rhs[i * house_length_n + j] = mat_a[(offset_rows + i) * cols + (offset_cols + j)];
        }
    }

    for i in 0..rows - offset_rows {
        for j in 0..cols - offset_cols {
            let mut current = T::zero();
            for k in 0..house_length {
                current = current + house_mat[i * house_length + k] * rhs[k * house_length_n + j];
            }
            mat_a[(offset_rows + i) * cols + (offset_cols + j)] = current;
        }
    }
}

/// Bidiagonalizes an MxN matrix into U * B * V^T with one column pass and
/// one row pass of Householder reflections per step.
fn bidiagonalize<T: Float>(
    mat_a: &[T],
    rows: usize,
    cols: usize,
    mat_u: &mut [T],
    mat_b: &mut [T],
    mat_v: &mut [T],
    epsilon: T,
) {
    mat_set_identity(mat_u, rows);
    mat_set_identity(mat_v, cols);
    mat_b.copy_from_slice(mat_a);

    let steps = if rows == cols { cols - 1 } else { cols };
    for k in 0..steps {
        let sub_length = cols - k + if rows == cols { 0 } else { 1 };
        let mut input_vec = vec![T::zero(); sub_length];
        let mut house_vec = vec![T::zero(); sub_length];
        let mut house_mat = vec![T::zero(); sub_length * sub_length];

        for i in 0..sub_length {
            input_vec[i] = mat_b[(k + i) * cols + k];
        }

        let house_beta = householder_vector(&input_vec, &mut house_vec, epsilon, T::one());
        householder_matrix(&house_vec, house_beta, &mut house_mat);
        apply_householder_matrix(mat_b, rows, cols, &house_mat, sub_length, k, k);

        for i in k + 1..rows {
            mat_b[i * cols + k] = T::zero();
        }

        // Accumulate the U update.
        let mut update_u = vec![T::zero(); rows * rows];
        for i in 0..k {
            update_u[i * rows + i] = T::one();
        }
        for i in 0..sub_length {
            for j in 0..sub_length {
                update_u[(k + i) * rows + (k + j)] = house_mat[i * sub_length + j];
            }
        }
        let mat_u_tmp = mat_u.to_vec();
        mat_multiply(&mat_u_tmp, rows, rows, &update_u, rows, mat_u);

        if k + 3 <= cols {
            // Normalization constant for numerical stability.
            let mut norm = T::zero();
            for i in k + 1..cols {
                norm = norm + mat_b[k * cols + i];
            }
            if epsilon_eq(norm, T::zero(), epsilon) {
                norm = T::one();
            }

            let inner_sub_length = cols - (k + 1);
            let mut inner_input_vec = vec![T::zero(); inner_sub_length];
            let mut inner_house_vec = vec![T::zero(); inner_sub_length];
            let mut inner_house_mat = vec![T::zero(); inner_sub_length * inner_sub_length];

            for i in 0..inner_sub_length {
                inner_input_vec[i] = mat_b[k * cols + (k + 1 + i)];
            }

            let inner_beta =
                householder_vector(&inner_input_vec, &mut inner_house_vec, epsilon, norm);
            householder_matrix(&inner_house_vec, inner_beta, &mut inner_house_mat);

            // Cut out mat_b(k:m, (k+1):n) and multiply from the right.
            let slice_rows = rows - k;
            let slice_cols = cols - k - 1;
            let mut mat_b_tmp = vec![T::zero(); slice_rows * slice_cols];
            let mut mat_b_res = vec![T::zero(); slice_rows * slice_cols];
            for i in 0..slice_rows {
                for j in 0..slice_cols {
                    mat_b_tmp[i * slice_cols + j] = mat_b[(k + i) * cols + (k + 1 + j)];
                }
            }
            mat_multiply(
                &mat_b_tmp,
                slice_rows,
                slice_cols,
                &inner_house_mat,
                inner_sub_length,
                &mut mat_b_res,
            );
            for i in 0..slice_rows {
                for j in 0..slice_cols {
                    mat_b[(k + i) * cols + (k + 1 + j)] = mat_b_res[i * slice_cols + j];
                }
            }

            for i in k + 2..cols {
                mat_b[k * cols + i] = T::zero();
            }

            let mut update_v = vec![T::zero(); cols * cols];
            for i in 0..k + 1 {
                update_v[i * cols + i] = T::one();
            }
            for i in 0..inner_sub_length {
                for j in 0..inner_sub_length {
                    update_v[(k + i + 1) * cols + (k + j + 1)] =
                        inner_house_mat[i * inner_sub_length + j];
                }
            }
            let mat_v_tmp = mat_v.to_vec();
            mat_multiply(&mat_v_tmp, cols, cols, &update_v, cols, mat_v);
        }
    }
}

/// Single Golub-Kahan step on the middle block B22 with Wilkinson shift.
fn gk_svd_step<T: Float>(
    rows: usize,
    cols: usize,
    mat_b: &mut [T],
    mat_q: &mut [T],
    mat_p: &mut [T],
    p: usize,
    q: usize,
    epsilon: T,
) {
    let slice_length = cols - q - p;
    let mat_sizes = slice_length * slice_length;
    let mut mat_b22 = vec![T::zero(); mat_sizes];
    let mut mat_b22_t = vec![T::zero(); mat_sizes];
    let mut mat_tmp = vec![T::zero(); mat_sizes];

    for i in 0..slice_length {
        for j in 0..slice_length {
            mat_b22[i * slice_length + j] = mat_b[(p + i) * cols + (p + j)];
        }
    }
    for i in 0..slice_length {
        for j in 0..slice_length {
            mat_b22_t[i * slice_length + j] = mat_b22[j * slice_length + i];
        }
    }

    // Outer product of the slice gives the covariance matrix.
    mat_multiply(
        &mat_b22,
        slice_length,
        slice_length,
        &mat_b22_t,
        slice_length,
        &mut mat_tmp,
    );

    let mat_c = [
        mat_tmp[(slice_length - 2) * slice_length + (slice_length - 2)],
        mat_tmp[(slice_length - 2) * slice_length + (slice_length - 1)],
        mat_tmp[(slice_length - 1) * slice_length + (slice_length - 2)],
        mat_tmp[(slice_length - 1) * slice_length + (slice_length - 1)],
    ];

    // Use the eigenvalue closer to the lower-right entry of the slice.
    let (eig_1, eig_2) = eigenvalues_2x2(&mat_c);
    let diff1 = (mat_c[3] - eig_1).abs();
    let diff2 = (mat_c[3] - eig_2).abs();
    let mu = if diff1 < diff2 { eig_1 } else { eig_2 };

    let k = p;
    let mut alpha = mat_b[k * cols + k] * mat_b[k * cols + k] - mu;
    let mut beta = mat_b[k * cols + k] * mat_b[k * cols + (k + 1)];

    for k in p..cols - q - 1 {
        let (givens_c, givens_s) = givens_rotation(alpha, beta, epsilon);
        apply_givens_column(mat_b, cols, cols, k, k + 1, givens_c, givens_s);
        apply_givens_column(mat_p, cols, cols, k, k + 1, givens_c, givens_s);

        alpha = mat_b[k * cols + k];
        beta = mat_b[(k + 1) * cols + k];
        let (givens_c, givens_s) = givens_rotation(alpha, beta, epsilon);
        apply_givens_row(mat_b, cols, k, k + 1, givens_c, -givens_s);
        apply_givens_column(mat_q, rows, cols, k, k + 1, givens_c, givens_s);

        if k + 2 < cols - q {
            alpha = mat_b[k * cols + (k + 1)];
            beta = mat_b[k * cols + (k + 2)];
        }
    }
}

/// Golub-Kahan SVD for MxN matrices with M >= N.
fn gk_svd<T: Float>(
    mat_a: &[T],
    rows: usize,
    cols: usize,
    mat_u: &mut [T],
    vec_s: &mut [T],
    mat_v: &mut [T],
    epsilon: T,
) {
    let mut mat_q_full = vec![T::zero(); rows * rows];
    let mut mat_b_full = vec![T::zero(); rows * cols];
    let mut mat_p = vec![T::zero(); cols * cols];
    let mut mat_q = vec![T::zero(); rows * cols];
    let mut mat_b = vec![T::zero(); cols * cols];

    bidiagonalize(
        mat_a,
        rows,
        cols,
        &mut mat_q_full,
        &mut mat_b_full,
        &mut mat_p,
        epsilon,
    );

    // Extract the economy-size blocks.
    for i in 0..rows {
        for j in 0..cols {
            mat_q[i * cols + j] = mat_q_full[i * rows + j];
        }
    }
    mat_b.copy_from_slice(&mat_b_full[0..cols * cols]);

    // Exit after a maximum number of iterations to avoid infinite loops.
    let max_iterations = rows * cols;
    for _ in 0..max_iterations {
        // Enforce exact zeros for numerical stability.
        for entry in mat_b.iter_mut() {
            if entry.abs() < epsilon {
                *entry = T::zero();
            }
        }

        // GK 2a: zero super-diagonal entries dominated by their diagonal
        // neighborhood.
        for i in 0..cols - 1 {
            if mat_b[i * cols + (i + 1)].abs()
                <= epsilon * (mat_b[i * cols + i] + mat_b[(i + 1) * cols + (i + 1)]).abs()
            {
                mat_b[i * cols + (i + 1)] = T::zero();
            }
        }

        // GK 2b: select q such that B33 is diagonal and blocked by zeros.
        let mut q = 0;
        for k in 0..cols {
            let slice_length = k + 1;
            let mut mat_b33 = vec![T::zero(); slice_length * slice_length];
            for i in 0..slice_length {
                for j in 0..slice_length {
                    mat_b33[i * slice_length + j] =
                        mat_b[(cols - k - 1 + i) * cols + (cols - k - 1 + j)];
                }
            }

            if mat_is_diagonal(&mat_b33, slice_length, slice_length, epsilon) {
                if k < cols - 1 {
                    if is_submatrix_zero_enclosed(&mat_b, cols, k + 1, epsilon) {
                        q = k + 1;
                    }
                } else {
                    q = k + 1;
                }
            }
        }

        // Select z := n-p-q such that B22 has no zero super-diagonal entry.
        let mut z = 0;
        for k in 0..cols - q {
            let slice_length = k + 1;
            let mut mat_b22 = vec![T::zero(); slice_length * slice_length];
            for i in 0..slice_length {
                for j in 0..slice_length {
                    mat_b22[i * slice_length + j] =
                        mat_b[(cols - q - k - 1 + i) * cols + (cols - q - k - 1 + j)];
                }
            }
            if is_superdiagonal_nonzero(&mat_b22, slice_length, slice_length, epsilon) {
                z = k + 1;
            }
        }

        let p = cols - q - z;

        // GK 2c: fully diagonal, done.
        if q == cols {
            break;
        }

        let mut diagonal_non_zero = true;
        for i in p..cols - q - 1 {
            if mat_b[i * cols + i].abs() < epsilon {
                diagonal_non_zero = false;
                mat_b[i * cols + i] = T::zero();
            }
        }

        if diagonal_non_zero {
            gk_svd_step(rows, cols, &mut mat_b, &mut mat_q, &mut mat_p, p, q, epsilon);
        }
    }

    mat_u[0..rows * cols].copy_from_slice(&mat_q);
    mat_v[0..cols * cols].copy_from_slice(&mat_p);
    for i in 0..cols {
        vec_s[i] = mat_b[i * cols + i];
    }

    // Enforce non-negative singular values by flipping U columns.
    for i in 0..cols {
        if vec_s[i] < epsilon {
            vec_s[i] = -vec_s[i];
            for j in 0..rows {
                let index = j * cols + i;
                mat_u[index] = -mat_u[index];
            }
        }
    }
}

/// Economy R-SVD after Chan: pre-reduce via QR, decompose R only.
fn r_svd<T: Float>(
    mat_a: &[T],
    rows: usize,
    cols: usize,
    mat_u: &mut [T],
    vec_s: &mut [T],
    mat_v: &mut [T],
    epsilon: T,
) {
    let mut mat_q = vec![T::zero(); rows * rows];
    let mut mat_r = vec![T::zero(); rows * cols];
    let mut mat_u_tmp = vec![T::zero(); rows * cols];

    matrix_qr_slice(mat_a, rows, cols, &mut mat_q, &mut mat_r, epsilon);
    let mat_r_top = mat_r[0..cols * cols].to_vec();
    gk_svd(&mat_r_top, cols, cols, &mut mat_u_tmp, vec_s, mat_v, epsilon);
    for value in mat_u_tmp[cols * cols..rows * cols].iter_mut() {
        *value = T::zero();
    }

    mat_multiply(&mat_q, rows, rows, &mat_u_tmp, cols, &mut mat_u[0..rows * cols]);
}

/// SVD of a dynamic-size row-major MxN matrix such that A = U * S * V^T.
///
/// `mat_u` must hold rows*cols elements, `vec_s` cols elements and `mat_v`
/// cols*cols elements when rows >= cols; for wide matrices the buffer sizes
/// follow the output shapes after the internal transpose (U: rows*cols,
/// S and V sized by cols).
pub fn matrix_svd_slice<T: Float>(
    mat_a: &[T],
    rows: usize,
    cols: usize,
    mat_u: &mut [T],
    vec_s: &mut [T],
    mat_v: &mut [T],
    epsilon: T,
) {
    if cols > rows {
        // Decompose the transpose, then swap and reshape the outputs.
        let mat_a_t = mat_transpose(mat_a, rows, cols);
        let (t_rows, t_cols) = (cols, rows);

        // Swapped roles: U of the transposed problem lands in mat_v.
        if t_rows >= 5 * t_cols / 3 {
            r_svd(&mat_a_t, t_rows, t_cols, mat_v, vec_s, mat_u, epsilon);
        } else {
            gk_svd(&mat_a_t, t_rows, t_cols, mat_v, vec_s, mat_u, epsilon);
        }

        // Fix S by appending zeros.
        for i in rows..cols {
            vec_s[i] = T::zero();
        }

        // Fix U by reshaping from rows x rows to rows x cols.
        let mut i = rows * rows;
        for y in (0..rows).rev() {
            for x in (0..rows).rev() {
                i -= 1;
                mat_u[y * cols + x] = mat_u[i];
            }
            for x in rows..cols {
                mat_u[y * cols + x] = T::zero();
            }
        }

        // Fix V by reshaping from cols x rows to cols x cols.
        let mut i = cols * rows;
        for y in (0..cols).rev() {
            for x in (0..rows).rev() {
                i -= 1;
                mat_v[y * cols + x] = mat_v[i];
            }
            for x in rows..cols {
                mat_v[y * cols + x] = T::zero();
            }
        }
        return;
    }

    if rows >= 5 * cols / 3 {
        r_svd(mat_a, rows, cols, mat_u, vec_s, mat_v, epsilon);
    } else {
        gk_svd(mat_a, rows, cols, mat_u, vec_s, mat_v, epsilon);
    }
}

/// SVD for compile-time fixed-size matrices.
pub fn matrix_svd<T: Float, const M: usize, const N: usize>(
    mat_a: &Matrix<T, M, N>,
    epsilon: T,
) -> (Matrix<T, M, N>, Matrix<T, N, N>, Matrix<T, N, N>) {
    let a = mat_a.to_row_major();
    let mut u = vec![T::zero(); M * N];
    let mut s = vec![T::zero(); N];
    let mut v = vec![T::zero(); N * N];
    matrix_svd_slice(&a, M, N, &mut u, &mut s, &mut v, epsilon);

    let mat_u = Matrix::from_row_major(&u);
    let mut mat_s = Matrix::zero();
    for i in 0..N {
        mat_s[(i, i)] = s[i];
    }
    let mat_v = Matrix::from_row_major(&v);
    (mat_u, mat_s, mat_v)
}

/// Moore-Penrose pseudo-inverse via the SVD: A+ = V * S+ * U^T where S+
/// takes the reciprocal of singular values above the epsilon, zero below.
pub fn matrix_pseudo_inverse<T: Float, const M: usize, const N: usize>(
    mat_a: &Matrix<T, M, N>,
    epsilon: T,
) -> Matrix<T, N, M> {
    let (u, mut s, v) = matrix_svd(mat_a, epsilon);
    for i in 0..N {
        if epsilon_eq(s[(i, i)], T::zero(), epsilon) {
            s[(i, i)] = T::zero();
        } else {
            s[(i, i)] = T::one() / s[(i, i)];
        }
    }
    v * s * u.transposed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn check_reconstruction<const M: usize, const N: usize>(
        a: &Matrix<f64, M, N>,
        tolerance: f64,
    ) {
        let (u, s, v) = matrix_svd(a, 1e-14);
        let recon = u * s * v.transposed();
        assert!(
            recon.is_similar(a, tolerance),
            "SVD reconstruction out of tolerance"
        );
    }

    #[test]
    fn test_svd_2x2_singular_values() {
        let a = Matrix::new([[1.0, 2.0], [3.0, 4.0]]);
        let (_, s, _) = matrix_svd(&a, 1e-14);
        assert!((s[(0, 0)] - 5.4649857042190426).abs() < 1e-10);
        assert!((s[(1, 1)] - 0.3659661906262578).abs() < 1e-10);
        check_reconstruction(&a, 1e-12);
    }

    #[test]
    fn test_svd_tall_matrix() {
        let a = Matrix::new([
            [2.0, -4.0, 5.0],
            [6.0, 0.0, 3.0],
            [2.0, -4.0, 5.0],
            [6.0, 0.0, 3.0],
            [1.0, 1.0, 1.0],
            [0.0, 2.0, -1.0],
        ]);
        check_reconstruction(&a, 1e-11);
    }

    #[test]
    fn test_svd_wide_matrix() {
        let a = Matrix::new([[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]]);
        check_reconstruction(&a, 1e-11);
    }

    #[test]
    fn test_svd_random_reconstruction() {
        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..10 {
            let mut a = Matrix::<f64, 5, 4>::zero();
            for r in 0..5 {
                for c in 0..4 {
                    a[(r, c)] = rng.random_range(-1.0..1.0);
                }
            }
            check_reconstruction(&a, 1e-11);
        }
    }

    #[test]
    fn test_singular_values_non_negative() {
        let a = Matrix::new([[0.0, -1.0], [1.0, 0.0]]);
        let (_, s, _) = matrix_svd(&a, 1e-14);
        assert!(s[(0, 0)] >= 0.0);
        assert!(s[(1, 1)] >= 0.0);
    }

    #[test]
    fn test_pseudo_inverse_tall() {
        // Golden test: pinv of the 4x3 matrix from the reference data set.
        let a = Matrix::new([
            [2.0, 0.0, 5.0],
            [-4.0, 3.0, 6.0],
            [5.0, 2.0, 0.0],
            [6.0, -4.0, 3.0],
        ]);
        let pinv = matrix_pseudo_inverse(&a, 1e-14);
        // A * A+ * A == A holds for any pseudo-inverse.
        let recon = a * (pinv * a);
        assert!(recon.is_similar(&a, 1e-10));
        // A+ * A must be the identity for full column rank A.
        let ata = pinv * a;
        assert!(ata.is_similar(&Matrix::identity(), 1e-10));
    }

    #[test]
    fn test_pseudo_inverse_rank_deficient() {
        let a = Matrix::new([[1.0, 0.0], [0.0, 0.0]]);
        let pinv = matrix_pseudo_inverse(&a, 1e-12);
        assert!((pinv[(0, 0)] - 1.0).abs() < 1e-12);
        assert!(pinv[(1, 1)].abs() < 1e-12);
    }
}
