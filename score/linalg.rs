use ndarray::Array2;
use ndarray_linalg::SVD;
use ndarray_linalg::error::LinalgError;

/// Relative singular-value cutoff below which a design column is treated as redundant.
pub const RANK_TOLERANCE: f64 = 1e-10;

/// Numerical rank of `matrix` from its singular values.
///
/// A singular value counts toward the rank when it exceeds `relative_tolerance` times
/// the largest singular value. An all-zero matrix has rank zero.
pub fn effective_rank(matrix: &Array2<f64>, relative_tolerance: f64) -> Result<usize, LinalgError> {
    if matrix.is_empty() {
        return Ok(0);
    }
    let (_, singular_values, _) = matrix.svd(false, false)?;
    let max_sv = singular_values.iter().fold(0.0_f64, |max, &val| max.max(val));
    if max_sv <= 0.0 {
        return Ok(0);
    }
    let cutoff = max_sv * relative_tolerance;
    Ok(singular_values.iter().filter(|&&sv| sv > cutoff).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn collinear_columns_lose_rank() {
        let full = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        assert_eq!(effective_rank(&full, RANK_TOLERANCE).unwrap(), 2);

        let collinear = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]];
        assert_eq!(effective_rank(&collinear, RANK_TOLERANCE).unwrap(), 1);

        let zeros = Array2::<f64>::zeros((3, 2));
        assert_eq!(effective_rank(&zeros, RANK_TOLERANCE).unwrap(), 0);
    }
}
