use crate::prelude::{StageError, StageResult};
use nalgebra::{DMatrix, DVector, SVD};

/// Singular values smaller than this fraction of the largest one mark the
/// system as rank deficient.
const RANK_TOLERANCE: f64 = 1e-10;

pub struct MatrixHelper;

impl MatrixHelper {
    /// Least-squares solution of `a · x ≈ b` through a thin SVD.
    /// Rank-deficient or non-finite systems are rejected rather than
    /// yielding arbitrary coefficients.
    pub fn solve_least_squares(a: DMatrix<f64>, b: &DVector<f64>) -> StageResult<DVector<f64>> {
        let (m, n) = a.shape();
        if b.len() != m {
            return Err(StageError::InputShapeMismatch(format!(
                "design matrix has {} rows but {} observations",
                m,
                b.len()
            )));
        }
        if m < n {
            return Err(StageError::NumericalSingularity(format!(
                "{} observations cannot determine {} unknowns",
                m, n
            )));
        }
        if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
            return Err(StageError::NumericalSingularity(
                "non-finite value in least-squares system".into(),
            ));
        }
        if n == 0 {
            return Ok(DVector::zeros(0));
        }

        let svd = SVD::new(a, true, true);
        let max_sv = svd.singular_values.max();
        let min_sv = svd.singular_values.min();
        if max_sv <= 0.0 || min_sv <= RANK_TOLERANCE * max_sv {
            return Err(StageError::NumericalSingularity(format!(
                "rank-deficient system: singular value {:e} against max {:e}",
                min_sv, max_sv
            )));
        }
        svd.solve(b, RANK_TOLERANCE * max_sv)
            .map_err(|msg| StageError::NumericalSingularity(msg.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_overdetermined_line() {
        // y = 2 + 3x sampled exactly
        let a = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let b = DVector::from_vec(vec![2.0, 5.0, 8.0, 11.0]);
        let x = MatrixHelper::solve_least_squares(a, &b).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-12);
        assert!((x[1] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn least_squares_averages_inconsistent_rows() {
        let a = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        let b = DVector::from_vec(vec![1.0, 3.0]);
        let x = MatrixHelper::solve_least_squares(a, &b).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn rank_deficient_system_is_rejected() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            MatrixHelper::solve_least_squares(a, &b),
            Err(StageError::NumericalSingularity(_))
        ));
    }

    #[test]
    fn square_system_matches_known_solution() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 2.0, 3.0]);
        let b = DVector::from_vec(vec![1.0, 2.0]);
        let x = MatrixHelper::solve_least_squares(a.clone(), &b).unwrap();
        assert!((x[0] - 0.1).abs() < 1e-12);
        assert!((x[1] - 0.6).abs() < 1e-12);
        assert!(((a * x)[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let a = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            MatrixHelper::solve_least_squares(a, &b),
            Err(StageError::InputShapeMismatch(_))
        ));
    }
}
