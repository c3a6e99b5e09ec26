use num::Float;
use rayon::prelude::*;

use crate::ba::dense::DenseVector;

/// Matrix entry with row and column index, used for construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Triplet<T> {
    pub row: usize,
    pub col: usize,
    pub value: T,
}

impl<T> Triplet<T> {
    pub fn new(row: usize, col: usize, value: T) -> Self {
        Self { row, col, value }
    }
}

/// Sparse matrix in Yale format for column-major matrices: `values` and
/// `inner` (row indices) per nonzero, `outer` holds the column start
/// offsets and has `cols + 1` entries.
#[derive(Debug, Clone)]
pub struct SparseMatrix<T> {
    rows: usize,
    cols: usize,
    values: Vec<T>,
    outer: Vec<usize>,
    inner: Vec<usize>,
}

impl<T: Float + Send + Sync> SparseMatrix<T> {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            values: Vec::new(),
            outer: vec![0; cols + 1],
            inner: Vec::new(),
        }
    }

    pub fn allocate(&mut self, rows: usize, cols: usize) {
        self.rows = rows;
        self.cols = cols;
        self.values.clear();
        self.inner.clear();
        self.outer.clear();
        self.outer.resize(cols + 1, 0);
    }

    pub fn reserve(&mut self, num_elements: usize) {
        self.inner.reserve(num_elements);
        self.values.reserve(num_elements);
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn num_cols(&self) -> usize {
        self.cols
    }

    pub fn num_non_zero(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    /// Builds the matrix from triplets with a bucket-and-prefix-sum double
    /// pass: the transposed matrix is assembled row-bucketed first, then
    /// transposed back, which implicitly sorts the inner indices.
    pub fn set_from_triplets(&mut self, triplets: &[Triplet<T>]) {
        let mut transposed = SparseMatrix::new(self.cols, self.rows);
        transposed.values = vec![T::zero(); triplets.len()];
        transposed.inner = vec![0; triplets.len()];

        // Initialize outer indices with the number of inner values.
        for triplet in triplets {
            transposed.outer[triplet.row] += 1;
        }

        // Convert amounts to offsets with a prefix sum.
        let mut sum = 0;
        let mut scratch = vec![0usize; transposed.outer.len()];
        for i in 0..transposed.outer.len() {
            let temp = transposed.outer[i];
            transposed.outer[i] = sum;
            scratch[i] = sum;
            sum += temp;
        }

        // Scatter the triplets; inner indices stay unsorted.
        for triplet in triplets {
            let pos = scratch[triplet.row];
            scratch[triplet.row] += 1;
            transposed.values[pos] = triplet.value;
            transposed.inner[pos] = triplet.col;
        }

        // Transposing implicitly sorts the inner indices.
        *self = transposed.transpose();
    }

    /// Transposes the matrix with a bucket sort over the inner indices.
    pub fn transpose(&self) -> Self {
        let mut ret = SparseMatrix::new(self.cols, self.rows);
        ret.values = vec![T::zero(); self.num_non_zero()];
        ret.inner = vec![0; self.num_non_zero()];

        for &inner in &self.inner {
            ret.outer[inner] += 1;
        }

        let mut sum = 0;
        let mut scratch = vec![0usize; ret.outer.len()];
        for i in 0..ret.outer.len() {
            let temp = ret.outer[i];
            ret.outer[i] = sum;
            scratch[i] = sum;
            sum += temp;
        }

        for i in 0..self.outer.len() - 1 {
            for j in self.outer[i]..self.outer[i + 1] {
                let pos = scratch[self.inner[j]];
                scratch[self.inner[j]] += 1;
                ret.inner[pos] = i;
                ret.values[pos] = self.values[j];
            }
        }

        ret
    }

    /// Subtracts a same-shape matrix by merging the sorted column runs.
    pub fn subtract(&self, rhs: &Self) -> Self {
        assert_eq!(self.rows, rhs.rows, "incompatible matrix dimensions");
        assert_eq!(self.cols, rhs.cols, "incompatible matrix dimensions");

        let mut ret = SparseMatrix::new(self.rows, self.cols);
        ret.reserve(self.num_non_zero() + rhs.num_non_zero());

        for outer in 0..self.cols {
            ret.outer[outer] = ret.values.len();

            let mut i1 = self.outer[outer];
            let mut i2 = rhs.outer[outer];
            let i1_end = self.outer[outer + 1];
            let i2_end = rhs.outer[outer + 1];
            while i1 < i1_end || i2 < i2_end {
                if i1 >= i1_end {
                    ret.values.push(-rhs.values[i2]);
                    ret.inner.push(rhs.inner[i2]);
                    i2 += 1;
                    continue;
                }
                if i2 >= i2_end {
                    ret.values.push(self.values[i1]);
                    ret.inner.push(self.inner[i1]);
                    i1 += 1;
                    continue;
                }

                let id1 = self.inner[i1];
                let id2 = rhs.inner[i2];
                if id1 < id2 {
                    ret.values.push(self.values[i1]);
                } else if id2 < id1 {
                    ret.values.push(-rhs.values[i2]);
                } else {
                    ret.values.push(self.values[i1] - rhs.values[i2]);
                }
                i1 += usize::from(id1 <= id2);
                i2 += usize::from(id2 <= id1);
                ret.inner.push(id1.min(id2));
            }
        }
        ret.outer[self.cols] = ret.values.len();

        ret
    }

    /// Sparse matrix-matrix product. Columns of the output are processed
    /// in chunks of 64 in parallel; chunk results are concatenated in
    /// column order so output columns appear in ascending order.
    pub fn multiply(&self, rhs: &Self) -> Self {
        assert_eq!(self.cols, rhs.rows, "incompatible matrix dimensions");

        const CHUNK_SIZE: usize = 64;
        let num_chunks = rhs.cols.div_ceil(CHUNK_SIZE);

        let chunks: Vec<(Vec<usize>, Vec<usize>, Vec<T>)> = (0..num_chunks)
            .into_par_iter()
            .map(|chunk| {
                let begin = chunk * CHUNK_SIZE;
                let end = (begin + CHUNK_SIZE).min(rhs.cols);

                let mut column_counts = Vec::with_capacity(end - begin);
                let mut chunk_inner = Vec::new();
                let mut chunk_values = Vec::new();
                let mut ret_col = vec![T::zero(); self.rows];
                let mut ret_nonzero = vec![false; self.rows];

                for col in begin..end {
                    ret_col.fill(T::zero());
                    ret_nonzero.fill(false);

                    for i in rhs.outer[col]..rhs.outer[col + 1] {
                        let rhs_value = rhs.values[i];
                        let lhs_col = rhs.inner[i];
                        for j in self.outer[lhs_col]..self.outer[lhs_col + 1] {
                            let id = self.inner[j];
                            ret_col[id] = ret_col[id] + self.values[j] * rhs_value;
                            ret_nonzero[id] = true;
                        }
                    }

                    let mut count = 0;
                    for i in 0..self.rows {
                        if ret_nonzero[i] {
                            count += 1;
                            chunk_inner.push(i);
                            chunk_values.push(ret_col[i]);
                        }
                    }
                    column_counts.push(count);
                }

                (column_counts, chunk_inner, chunk_values)
            })
            .collect();

        // Ordered concatenation of the per-chunk buffers.
        let mut ret = SparseMatrix::new(self.rows, rhs.cols);
        let total: usize = chunks.iter().map(|(_, inner, _)| inner.len()).sum();
        ret.reserve(total);
        let mut col = 0;
        let mut offset = 0;
        for (column_counts, chunk_inner, chunk_values) in chunks {
            for count in column_counts {
                ret.outer[col] = offset;
                offset += count;
                col += 1;
            }
            ret.inner.extend_from_slice(&chunk_inner);
            ret.values.extend_from_slice(&chunk_values);
        }
        ret.outer[rhs.cols] = offset;

        ret
    }

    /// Sparse matrix times dense vector.
    pub fn multiply_vec(&self, rhs: &DenseVector<T>) -> DenseVector<T> {
        assert_eq!(rhs.len(), self.cols, "incompatible dimensions");

        let mut ret = DenseVector::zeros(self.rows);
        for i in 0..self.cols {
            for id in self.outer[i]..self.outer[i + 1] {
                let value = ret.at(self.inner[id]) + self.values[id] * rhs.at(i);
                ret.set(self.inner[id], value);
            }
        }
        ret
    }

    /// Extracts the diagonal as a square sparse matrix.
    pub fn diagonal_matrix(&self) -> Self {
        let diag_size = self.rows.min(self.cols);
        let mut ret = SparseMatrix::new(diag_size, diag_size);
        ret.reserve(diag_size);
        for i in 0..diag_size {
            ret.outer[i] = ret.values.len();
            for j in self.outer[i]..self.outer[i + 1] {
                if self.inner[j] == i {
                    ret.inner.push(i);
                    ret.values.push(self.values[j]);
                } else if self.inner[j] > i {
                    break;
                }
            }
        }
        ret.outer[diag_size] = ret.values.len();
        ret
    }

    /// Scales the diagonal entries in place.
    pub fn mult_diagonal(&mut self, factor: T) {
        for i in 0..self.outer.len() - 1 {
            for j in self.outer[i]..self.outer[i + 1] {
                if self.inner[j] == i {
                    self.values[j] = self.values[j] * factor;
                }
                if self.inner[j] >= i {
                    break;
                }
            }
        }
    }

    /// Inverts every stored value in place.
    pub fn cwise_invert(&mut self) {
        for value in &mut self.values {
            *value = T::one() / *value;
        }
    }

    /// Copies the nonzero values of one column.
    pub fn column_nonzeros(&self, col: usize) -> DenseVector<T> {
        let start = self.outer[col];
        let end = self.outer[col + 1];
        DenseVector::from_vec(self.values[start..end].to_vec())
    }

    /// Dense row-major copy, for tests and debugging.
    pub fn to_dense(&self) -> Vec<T> {
        let mut out = vec![T::zero(); self.rows * self.cols];
        for col in 0..self.cols {
            for j in self.outer[col]..self.outer[col + 1] {
                out[self.inner[j] * self.cols + col] = self.values[j];
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_from_dense(dense: &[f64], rows: usize, cols: usize) -> SparseMatrix<f64> {
        let mut triplets = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                let value = dense[r * cols + c];
                if value != 0.0 {
                    triplets.push(Triplet::new(r, c, value));
                }
            }
        }
        let mut matrix = SparseMatrix::new(rows, cols);
        matrix.set_from_triplets(&triplets);
        matrix
    }

    #[test]
    fn test_set_from_triplets_and_back() {
        let dense = [1.0, 0.0, 2.0, 0.0, 3.0, 0.0, 4.0, 0.0, 5.0];
        let matrix = matrix_from_dense(&dense, 3, 3);
        assert_eq!(matrix.num_non_zero(), 5);
        assert_eq!(matrix.to_dense(), dense);
    }

    #[test]
    fn test_transpose() {
        let dense = [1.0, 2.0, 0.0, 0.0, 3.0, 4.0];
        let matrix = matrix_from_dense(&dense, 2, 3);
        let transposed = matrix.transpose();
        assert_eq!(transposed.num_rows(), 3);
        assert_eq!(transposed.num_cols(), 2);
        assert_eq!(
            transposed.to_dense(),
            vec![1.0, 0.0, 2.0, 3.0, 0.0, 4.0]
        );
    }

    #[test]
    fn test_multiply() {
        let a = matrix_from_dense(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let b = matrix_from_dense(&[5.0, 6.0, 7.0, 8.0], 2, 2);
        let product = a.multiply(&b);
        assert_eq!(product.to_dense(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_multiply_rectangular() {
        let a = matrix_from_dense(&[1.0, 0.0, 2.0, 0.0, 3.0, 0.0], 2, 3);
        let b = matrix_from_dense(&[1.0, 2.0, 0.0, 1.0, 3.0, 0.0], 3, 2);
        let product = a.multiply(&b);
        assert_eq!(product.num_rows(), 2);
        assert_eq!(product.num_cols(), 2);
        assert_eq!(product.to_dense(), vec![7.0, 2.0, 0.0, 3.0]);
    }

    #[test]
    fn test_multiply_vec() {
        let a = matrix_from_dense(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let x = DenseVector::from_vec(vec![1.0, 1.0]);
        let b = a.multiply_vec(&x);
        assert_eq!(b.as_slice(), &[3.0, 7.0]);
    }

    #[test]
    fn test_subtract() {
        let a = matrix_from_dense(&[5.0, 0.0, 0.0, 3.0], 2, 2);
        let b = matrix_from_dense(&[1.0, 1.0, 0.0, 1.0], 2, 2);
        let difference = a.subtract(&b);
        assert_eq!(difference.to_dense(), vec![4.0, -1.0, 0.0, 2.0]);
    }

    #[test]
    fn test_diagonal_and_scaling() {
        let mut a = matrix_from_dense(&[2.0, 1.0, 1.0, 4.0], 2, 2);
        let diag = a.diagonal_matrix();
        assert_eq!(diag.to_dense(), vec![2.0, 0.0, 0.0, 4.0]);

        a.mult_diagonal(10.0);
        assert_eq!(a.to_dense(), vec![20.0, 1.0, 1.0, 40.0]);
    }

    #[test]
    fn test_cwise_invert() {
        let mut a = matrix_from_dense(&[2.0, 0.0, 0.0, 4.0], 2, 2);
        a.cwise_invert();
        assert_eq!(a.to_dense(), vec![0.5, 0.0, 0.0, 0.25]);
    }

    #[test]
    fn test_column_nonzeros() {
        let a = matrix_from_dense(&[1.0, 0.0, 2.0, 3.0], 2, 2);
        assert_eq!(a.column_nonzeros(0).as_slice(), &[1.0, 2.0]);
        assert_eq!(a.column_nonzeros(1).as_slice(), &[3.0]);
    }

    #[test]
    fn test_multiply_many_columns_parallel_ordering() {
        // More than one 64-column chunk; compare against the transpose
        // identity (A * I) = A.
        let cols = 150;
        let mut triplets = Vec::new();
        for c in 0..cols {
            triplets.push(Triplet::new(c % 7, c, (c + 1) as f64));
        }
        let mut a = SparseMatrix::new(7, cols);
        a.set_from_triplets(&triplets);

        let mut identity_triplets = Vec::new();
        for c in 0..cols {
            identity_triplets.push(Triplet::new(c, c, 1.0));
        }
        let mut identity = SparseMatrix::new(cols, cols);
        identity.set_from_triplets(&identity_triplets);

        let product = a.multiply(&identity);
        assert_eq!(product.to_dense(), a.to_dense());
    }
}
