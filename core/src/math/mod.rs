pub mod gaussian;
pub mod matrix;
pub mod polyfit;
pub mod stats;

pub use gaussian::{
    fit_gaussian, fit_gaussian_limited, GaussianFit, GaussianFitError, GaussianParams,
};
pub use matrix::MatrixHelper;
pub use polyfit::{batch_solver, BatchLeastSquares, ParallelBatch, Polynomial, SampleSet, SerialBatch};
pub use stats::StatsHelper;
