use super::matrix::MatrixHelper;
use crate::prelude::{StageError, StageResult};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

/// Polynomial with coefficients in ascending power order.
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    coefficients: Vec<f64>,
}

impl Polynomial {
    pub fn new(coefficients: Vec<f64>) -> Self {
        Self { coefficients }
    }

    /// Flat zero model of the given degree.
    pub fn zero(degree: usize) -> Self {
        Self {
            coefficients: vec![0.0; degree + 1],
        }
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc * x + c)
    }

    pub fn fit(x: &[f64], y: &[f64], degree: usize) -> StageResult<Self> {
        let powers: Vec<usize> = (0..=degree).collect();
        Self::fit_powers(x, y, &powers)
    }

    /// Fits only the listed powers of `x`; every other coefficient is zero.
    /// Abscissae are scaled by their largest magnitude before the design
    /// matrix is built; coefficients come back in the unscaled basis.
    pub fn fit_powers(x: &[f64], y: &[f64], powers: &[usize]) -> StageResult<Self> {
        if x.len() != y.len() {
            return Err(StageError::InputShapeMismatch(format!(
                "{} abscissae against {} ordinates",
                x.len(),
                y.len()
            )));
        }
        let scale = x.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
        let scale = if scale > 0.0 && scale.is_finite() { scale } else { 1.0 };

        let design = DMatrix::from_fn(x.len(), powers.len(), |i, j| {
            (x[i] / scale).powi(powers[j] as i32)
        });
        let solution = MatrixHelper::solve_least_squares(design, &DVector::from_column_slice(y))?;

        let degree = powers.iter().copied().max().unwrap_or(0);
        let mut coefficients = vec![0.0; degree + 1];
        for (&power, &value) in powers.iter().zip(solution.iter()) {
            coefficients[power] = value / scale.powi(power as i32);
        }
        Ok(Self { coefficients })
    }
}

/// One set of `(x, y)` samples to fit.
#[derive(Debug, Clone, Copy)]
pub struct SampleSet<'a> {
    pub x: &'a [f64],
    pub y: &'a [f64],
}

/// Fits one polynomial per sample set. How the sets are scheduled is up to
/// the implementation; results always come back in input order.
pub trait BatchLeastSquares: Sync {
    fn fit_batch(&self, sets: &[SampleSet<'_>], degree: usize) -> Vec<StageResult<Polynomial>>;
}

pub struct SerialBatch;

impl BatchLeastSquares for SerialBatch {
    fn fit_batch(&self, sets: &[SampleSet<'_>], degree: usize) -> Vec<StageResult<Polynomial>> {
        sets.iter()
            .map(|set| Polynomial::fit(set.x, set.y, degree))
            .collect()
    }
}

/// Spreads the sets over the rayon pool.
pub struct ParallelBatch;

impl BatchLeastSquares for ParallelBatch {
    fn fit_batch(&self, sets: &[SampleSet<'_>], degree: usize) -> Vec<StageResult<Polynomial>> {
        sets.par_iter()
            .map(|set| Polynomial::fit(set.x, set.y, degree))
            .collect()
    }
}

pub fn batch_solver(parallel: bool) -> &'static dyn BatchLeastSquares {
    if parallel {
        &ParallelBatch
    } else {
        &SerialBatch
    }
}
