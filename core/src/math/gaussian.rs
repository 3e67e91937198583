use super::matrix::MatrixHelper;
use nalgebra::{DMatrix, DVector, Vector4};
use serde::{Deserialize, Serialize};

/// Iteration cap of [`fit_gaussian`].
pub const MAX_ITERATIONS: usize = 200;
const FTOL: f64 = 1e-12;
const MIN_LAMBDA: f64 = 1e-12;
const MAX_LAMBDA: f64 = 1e16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianParams {
    pub amplitude: f64,
    pub mean: f64,
    pub sigma: f64,
    pub baseline: f64,
}

impl GaussianParams {
    pub fn evaluate(&self, x: f64) -> f64 {
        let z = (x - self.mean) / self.sigma;
        self.baseline + self.amplitude * (-0.5 * z * z).exp()
    }

    fn to_vector(self) -> Vector4<f64> {
        Vector4::new(self.amplitude, self.mean, self.sigma, self.baseline)
    }

    fn from_vector(values: &Vector4<f64>) -> Self {
        Self {
            amplitude: values[0],
            mean: values[1],
            sigma: values[2],
            baseline: values[3],
        }
    }

    fn is_finite(&self) -> bool {
        self.amplitude.is_finite()
            && self.mean.is_finite()
            && self.sigma.is_finite()
            && self.baseline.is_finite()
            && self.sigma != 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFit {
    pub params: GaussianParams,
    pub iterations: usize,
    /// Sum of squared residuals at the solution.
    pub cost: f64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GaussianFitError {
    #[error("non-finite sample in profile")]
    NonFinite,
    #[error("{0} samples cannot constrain 4 parameters")]
    TooFewSamples(usize),
    #[error("no convergence after {0} iterations")]
    NotConverged(usize),
    #[error("fit diverged to non-finite parameters")]
    Diverged,
}

fn cost(x: &[f64], y: &[f64], params: &GaussianParams) -> f64 {
    x.iter()
        .zip(y)
        .map(|(&xi, &yi)| {
            let r = yi - params.evaluate(xi);
            r * r
        })
        .sum()
}

/// Returns `(JᵀJ, Jᵀr)` at `params`.
fn normal_equations(
    x: &[f64],
    y: &[f64],
    params: &GaussianParams,
) -> (DMatrix<f64>, DVector<f64>) {
    let mut jacobian = DMatrix::zeros(x.len(), 4);
    let mut residuals = DVector::zeros(x.len());
    let sigma = params.sigma;
    for (i, (&xi, &yi)) in x.iter().zip(y).enumerate() {
        let dx = xi - params.mean;
        let e = (-0.5 * dx * dx / (sigma * sigma)).exp();
        jacobian[(i, 0)] = e;
        jacobian[(i, 1)] = params.amplitude * e * dx / (sigma * sigma);
        jacobian[(i, 2)] = params.amplitude * e * dx * dx / (sigma * sigma * sigma);
        jacobian[(i, 3)] = 1.0;
        residuals[i] = yi - (params.baseline + params.amplitude * e);
    }
    let jtj = jacobian.tr_mul(&jacobian);
    let jtr = jacobian.tr_mul(&residuals);
    (jtj, jtr)
}

/// Levenberg–Marquardt fit of `baseline + amplitude · exp(−(x − mean)² / (2σ²))`.
pub fn fit_gaussian(
    x: &[f64],
    y: &[f64],
    initial: GaussianParams,
) -> Result<GaussianFit, GaussianFitError> {
    fit_gaussian_limited(x, y, initial, MAX_ITERATIONS)
}

/// [`fit_gaussian`] giving up with `NotConverged` after `max_iterations`
/// accepted steps.
pub fn fit_gaussian_limited(
    x: &[f64],
    y: &[f64],
    initial: GaussianParams,
    max_iterations: usize,
) -> Result<GaussianFit, GaussianFitError> {
    if x.len() < 4 || x.len() != y.len() {
        return Err(GaussianFitError::TooFewSamples(x.len().min(y.len())));
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) || !initial.is_finite() {
        return Err(GaussianFitError::NonFinite);
    }

    let mut params = initial;
    let mut current_cost = cost(x, y, &params);
    let mut lambda = 1e-3;

    for iteration in 1..=max_iterations {
        let (jtj, jtr) = normal_equations(x, y, &params);
        loop {
            let mut damped = jtj.clone();
            for k in 0..4 {
                damped[(k, k)] += lambda * jtj[(k, k)].max(MIN_LAMBDA);
            }
            if let Ok(delta) = MatrixHelper::solve_least_squares(damped, &jtr) {
                let step = Vector4::new(delta[0], delta[1], delta[2], delta[3]);
                let candidate = GaussianParams::from_vector(&(params.to_vector() + step));
                let candidate_cost = cost(x, y, &candidate);
                if candidate.is_finite() && candidate_cost <= current_cost {
                    let improvement = current_cost - candidate_cost;
                    params = candidate;
                    current_cost = candidate_cost;
                    lambda = (lambda / 10.0).max(MIN_LAMBDA);
                    if improvement <= FTOL * current_cost {
                        return Ok(finish(params, iteration, current_cost));
                    }
                    break;
                }
            }
            lambda *= 10.0;
            if lambda > MAX_LAMBDA {
                // No downhill step left: the current point is a minimum to
                // working precision.
                return Ok(finish(params, iteration, current_cost));
            }
        }
    }
    Err(GaussianFitError::NotConverged(max_iterations))
}

fn finish(mut params: GaussianParams, iterations: usize, cost: f64) -> GaussianFit {
    params.sigma = params.sigma.abs();
    GaussianFit {
        params,
        iterations,
        cost,
    }
}
