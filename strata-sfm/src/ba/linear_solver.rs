use log::warn;
use strata_math::cholesky::cholesky_invert_inplace;
use strata_math::Matrix;

use crate::ba::cg::{CgInfo, CgOptions, ConjugateGradient};
use crate::ba::dense::DenseVector;
use crate::ba::sparse::{SparseMatrix, Triplet};

/// Options of the bundle adjustment linear solver.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Number of camera parameters, 9 for full or 6 for fixed intrinsics.
    pub camera_block_dim: usize,
    pub cg_max_iterations: usize,
    /// Levenberg-Marquardt trust region radius used for augmentation.
    pub trust_region_radius: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            camera_block_dim: 9,
            cg_max_iterations: 1000,
            trust_region_radius: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SolverStatus {
    pub success: bool,
    pub num_cg_iterations: usize,
    pub predicted_error_decrease: f64,
}

/// Solves the augmented normal equations of one Levenberg-Marquardt step,
/// reducing the point block with the Schur complement when both Jacobian
/// blocks are present.
pub struct LinearSolver {
    opts: SolverOptions,
}

/// Inverts a symmetric positive definite matrix with NxN blocks on its
/// diagonal using Cholesky decomposition. All other entries must be zero.
fn invert_block_matrix_nxn_inplace(a: &mut SparseMatrix<f64>, blocksize: usize) {
    assert_eq!(a.num_rows(), a.num_cols(), "block matrix must be square");
    assert_eq!(
        a.num_non_zero(),
        a.num_rows() * blocksize,
        "invalid number of non-zeros"
    );

    let bs2 = blocksize * blocksize;
    for block in a.values_mut().chunks_mut(bs2) {
        let mut matrix_block = block.to_vec();
        cholesky_invert_inplace(&mut matrix_block, blocksize);
        for (out, value) in block.iter_mut().zip(matrix_block) {
            *out = if value.is_finite() { value } else { 0.0 };
        }
    }
}

/// Inverts a matrix with 3x3 blocks on its diagonal through the
/// determinant formula. Singular blocks are left untouched.
fn invert_block_matrix_3x3_inplace(a: &mut SparseMatrix<f64>) {
    assert_eq!(a.num_rows(), a.num_cols(), "block matrix must be square");
    assert_eq!(
        a.num_non_zero(),
        a.num_rows() * 3,
        "invalid number of non-zeros"
    );

    for block in a.values_mut().chunks_mut(9) {
        let matrix = Matrix::<f64, 3, 3>::from_row_major(block);
        let det = matrix.determinant();
        if det.abs() <= f64::EPSILON {
            continue;
        }
        let inverse = matrix.inverse_with_determinant(det);
        block.copy_from_slice(&inverse.to_row_major());
    }
}

/// Computes A^T * A for the case that block columns of A only need to be
/// multiplied with themselves. The result is block-diagonal; since it is
/// symmetric only about half the dot products are computed.
fn matrix_block_column_multiply(
    a: &SparseMatrix<f64>,
    block_size: usize,
) -> SparseMatrix<f64> {
    let mut triplets = Vec::with_capacity(a.num_cols() * block_size);
    let mut block = 0;
    while block < a.num_cols() {
        let mut columns = Vec::with_capacity(block_size);
        for col in 0..block_size {
            columns.push(a.column_nonzeros(block + col));
        }
        for col in 0..block_size {
            let dot = columns[col].dot(&columns[col]);
            triplets.push(Triplet::new(block + col, block + col, dot));
            for row in col + 1..block_size {
                let dot = columns[col].dot(&columns[row]);
                triplets.push(Triplet::new(block + row, block + col, dot));
                triplets.push(Triplet::new(block + col, block + row, dot));
            }
        }
        block += block_size;
    }

    let mut out = SparseMatrix::new(a.num_cols(), a.num_cols());
    out.set_from_triplets(&triplets);
    out
}

impl LinearSolver {
    pub fn new(opts: SolverOptions) -> Self {
        Self { opts }
    }

    /// Selects the solver based on the available Jacobians: Schur
    /// complement for both blocks, plain normal equations otherwise.
    pub fn solve(
        &self,
        jac_cams: Option<&SparseMatrix<f64>>,
        jac_points: Option<&SparseMatrix<f64>>,
        vector_f: &DenseVector<f64>,
    ) -> (SolverStatus, DenseVector<f64>) {
        match (jac_cams, jac_points) {
            (Some(jac_cams), Some(jac_points)) => {
                self.solve_schur(jac_cams, jac_points, vector_f)
            }
            (Some(jac_cams), None) => self.solve_single(jac_cams, vector_f, 0),
            (None, Some(jac_points)) => self.solve_single(jac_points, vector_f, 3),
            (None, None) => panic!("no Jacobian given"),
        }
    }

    /// Schur complement solver.
    ///
    /// With J = [Jc Jp], the Hessian is H = [B E; E^T C] = J^T J where
    /// B = Jc^T Jc, E = Jc^T Jp and C = Jp^T Jp. The camera update is
    /// obtained from S * dy = rhs with S = B - E C^-1 E^T; the point
    /// update follows by back-substitution.
    fn solve_schur(
        &self,
        jac_cams: &SparseMatrix<f64>,
        jac_points: &SparseMatrix<f64>,
        values: &DenseVector<f64>,
    ) -> (SolverStatus, DenseVector<f64>) {
        let f = values;
        let jc = jac_cams;
        let jp = jac_points;
        let jc_t = jc.transpose();
        let jp_t = jp.transpose();

        let mut b = matrix_block_column_multiply(jc, self.opts.camera_block_dim);
        let mut c = matrix_block_column_multiply(jp, 3);
        let e = jc_t.multiply(jp);

        let mut v = jc_t.multiply_vec(f);
        let mut w = jp_t.multiply_vec(f);
        v.negate_self();
        w.negate_self();

        // Keep the unaugmented diagonals for the predicted decrease.
        let b_diag = b.diagonal_matrix();
        let c_diag = c.diagonal_matrix();

        // Augment the diagonals with the trust region.
        c.mult_diagonal(1.0 + 1.0 / self.opts.trust_region_radius);
        b.mult_diagonal(1.0 + 1.0 / self.opts.trust_region_radius);

        invert_block_matrix_3x3_inplace(&mut c);

        // Schur complement matrix and right hand side.
        let e_t = e.transpose();
        let s = b.subtract(&e.multiply(&c).multiply(&e_t));
        let rhs = v.subtract(&e.multiply_vec(&c.multiply_vec(&w)));

        // Block-diagonal Cholesky inverse of B as preconditioner.
        let mut precond = b;
        invert_block_matrix_nxn_inplace(&mut precond, self.opts.camera_block_dim);

        let mut delta_y = DenseVector::zeros(jc.num_cols());
        let solver = ConjugateGradient::new(CgOptions {
            max_iterations: self.opts.cg_max_iterations,
            tolerance: 1e-20,
        });
        let cg_status = solver.solve(&s, &rhs, &mut delta_y, Some(&precond));

        let mut status = SolverStatus {
            num_cg_iterations: cg_status.num_iterations,
            ..Default::default()
        };
        match cg_status.info {
            CgInfo::Convergence | CgInfo::MaxIterations => status.success = true,
            CgInfo::InvalidInput => {
                warn!("CG failed (invalid input)");
                status.success = false;
                return (status, DenseVector::zeros(0));
            }
        }

        // Back-substitute to obtain the point update.
        let delta_z = c.multiply_vec(&w.subtract(&e_t.multiply_vec(&delta_y)));

        let jac_cam_cols = jc.num_cols();
        let jac_point_cols = jp.num_cols();
        let mut delta_x = DenseVector::zeros(jac_cam_cols + jac_point_cols);
        for i in 0..jac_cam_cols {
            delta_x.set(i, delta_y.at(i));
        }
        for i in 0..jac_point_cols {
            delta_x.set(jac_cam_cols + i, delta_z.at(i));
        }

        // Predicted error decrease of the linearized model.
        status.predicted_error_decrease = 0.0;
        status.predicted_error_decrease += delta_y.dot(
            &b_diag
                .multiply_vec(&delta_y)
                .multiply(1.0 / self.opts.trust_region_radius)
                .add(&v),
        );
        status.predicted_error_decrease += delta_z.dot(
            &c_diag
                .multiply_vec(&delta_z)
                .multiply(1.0 / self.opts.trust_region_radius)
                .add(&w),
        );

        (status, delta_x)
    }

    /// Solves the plain normal equations for a single Jacobian block.
    /// With `block_size == 3` the Hessian is block-diagonal and inverted
    /// directly, otherwise preconditioned CG is used.
    fn solve_single(
        &self,
        jacobian: &SparseMatrix<f64>,
        vector_f: &DenseVector<f64>,
        block_size: usize,
    ) -> (SolverStatus, DenseVector<f64>) {
        let j_t = jacobian.transpose();
        let mut h = j_t.multiply(jacobian);
        let h_diag = h.diagonal_matrix();

        let mut g = j_t.multiply_vec(vector_f);
        g.negate_self();

        h.mult_diagonal(1.0 + 1.0 / self.opts.trust_region_radius);

        let mut status = SolverStatus::default();
        let mut delta_x = DenseVector::zeros(jacobian.num_cols());

        if block_size == 0 {
            let mut precond = h.diagonal_matrix();
            precond.cwise_invert();

            let solver = ConjugateGradient::new(CgOptions {
                max_iterations: self.opts.cg_max_iterations,
                tolerance: 1e-20,
            });
            let cg_status = solver.solve(&h, &g, &mut delta_x, Some(&precond));
            status.num_cg_iterations = cg_status.num_iterations;
            match cg_status.info {
                CgInfo::Convergence | CgInfo::MaxIterations => status.success = true,
                CgInfo::InvalidInput => {
                    warn!("CG failed (invalid input)");
                    status.success = false;
                    return (status, delta_x);
                }
            }
        } else if block_size == 3 {
            invert_block_matrix_3x3_inplace(&mut h);
            delta_x = h.multiply_vec(&g);
            status.success = true;
            status.num_cg_iterations = 0;
        } else {
            panic!("unsupported block size in linear solver");
        }

        status.predicted_error_decrease = delta_x.dot(
            &h_diag
                .multiply_vec(&delta_x)
                .multiply(1.0 / self.opts.trust_region_radius)
                .add(&g),
        );

        (status, delta_x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invert_block_matrix_3x3() {
        // Block diagonal with one 3x3 SPD block.
        let dense = [4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0];
        let mut triplets = Vec::new();
        for r in 0..3 {
            for c in 0..3 {
                triplets.push(Triplet::new(r, c, dense[r * 3 + c]));
            }
        }
        let mut matrix = SparseMatrix::new(3, 3);
        matrix.set_from_triplets(&triplets);

        invert_block_matrix_3x3_inplace(&mut matrix);

        // Multiplying with the original must give the identity.
        let mut original = SparseMatrix::new(3, 3);
        original.set_from_triplets(&triplets);
        let product = matrix.multiply(&original);
        let result = product.to_dense();
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert!((result[r * 3 + c] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_block_column_multiply() {
        // One 2-column block; columns of a block share their sparsity
        // pattern, as the Jacobian assembly guarantees.
        let entries = [
            (0, 0, 1.0),
            (1, 0, 2.0),
            (0, 1, 1.0),
            (1, 1, 5.0),
        ];
        let mut a = SparseMatrix::new(4, 2);
        let triplets: Vec<Triplet<f64>> =
            entries.iter().map(|&(r, c, v)| Triplet::new(r, c, v)).collect();
        a.set_from_triplets(&triplets);

        let b = matrix_block_column_multiply(&a, 2);
        let dense = b.to_dense();
        // B = A^T A for the single block.
        assert!((dense[0] - 5.0).abs() < 1e-12);
        assert!((dense[1] - 11.0).abs() < 1e-12);
        assert!((dense[2] - 11.0).abs() < 1e-12);
        assert!((dense[3] - 26.0).abs() < 1e-12);
    }
}
