use num::Float;

use crate::ba::dense::DenseVector;
use crate::ba::sparse::SparseMatrix;

/// Operator interface for the conjugate gradient solver, decoupling it
/// from the explicit matrix representation.
pub trait LinearOperator<T> {
    fn apply(&self, x: &DenseVector<T>) -> DenseVector<T>;
    fn input_size(&self) -> usize;
    fn output_size(&self) -> usize;
}

impl<T: Float + Send + Sync> LinearOperator<T> for SparseMatrix<T> {
    fn apply(&self, x: &DenseVector<T>) -> DenseVector<T> {
        self.multiply_vec(x)
    }

    fn input_size(&self) -> usize {
        self.num_cols()
    }

    fn output_size(&self) -> usize {
        self.num_rows()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgInfo {
    Convergence,
    MaxIterations,
    InvalidInput,
}

#[derive(Debug, Clone)]
pub struct CgOptions<T> {
    pub max_iterations: usize,
    pub tolerance: T,
}

impl<T: Float> Default for CgOptions<T> {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: T::from(1e-20).unwrap(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CgStatus {
    pub num_iterations: usize,
    pub info: CgInfo,
}

/// Preconditioned conjugate gradient solver for A * x = b with symmetric
/// positive definite A.
pub struct ConjugateGradient<T> {
    opts: CgOptions<T>,
}

impl<T: Float + Send + Sync> ConjugateGradient<T> {
    pub fn new(opts: CgOptions<T>) -> Self {
        Self { opts }
    }

    pub fn solve<A: LinearOperator<T>>(
        &self,
        a: &A,
        b: &DenseVector<T>,
        x: &mut DenseVector<T>,
        precond: Option<&SparseMatrix<T>>,
    ) -> CgStatus {
        if a.output_size() != b.len() {
            return CgStatus {
                num_iterations: 0,
                info: CgInfo::InvalidInput,
            };
        }

        // Initial x = 0; the initial residual is b.
        x.resize(a.input_size(), T::zero());
        for value in x.as_mut_slice() {
            *value = T::zero();
        }
        let mut r = b.clone();

        // Search direction d and preconditioned residual z.
        let mut d;
        let mut r_dot_r;
        if let Some(precond) = precond {
            let z = precond.multiply_vec(&r);
            r_dot_r = z.dot(&r);
            d = z;
        } else {
            r_dot_r = r.dot(&r);
            d = b.clone();
        }

        for iteration in 0..self.opts.max_iterations {
            // Step size in the search direction.
            let ad = a.apply(&d);
            let alpha = r_dot_r / d.dot(&ad);

            *x = x.add(&d.multiply(alpha));
            r = r.subtract(&ad.multiply(alpha));

            let mut new_r_dot_r = r.dot(&r);
            if new_r_dot_r < self.opts.tolerance {
                return CgStatus {
                    num_iterations: iteration + 1,
                    info: CgInfo::Convergence,
                };
            }

            let z = precond.map(|p| p.multiply_vec(&r));
            if let Some(z) = &z {
                new_r_dot_r = z.dot(&r);
            }

            // Update the search direction so the next residual is
            // orthogonal to the new Krylov space.
            let beta = new_r_dot_r / r_dot_r;
            d = match z {
                Some(z) => z.add(&d.multiply(beta)),
                None => r.add(&d.multiply(beta)),
            };
            r_dot_r = new_r_dot_r;
        }

        CgStatus {
            num_iterations: self.opts.max_iterations,
            info: CgInfo::MaxIterations,
        }
    }
}
