use crate::prelude::{StageError, StageResult};
use ndarray::{Array3, ArrayD, ArrayView2, Axis, Ix3};
use serde::{Deserialize, Serialize};

/// Quality bit set on every pixel replaced by the outlier cleaner.
pub const OUTLIER_FLAG: u32 = 1 << 4;

/// Rate (or count) cube `[integration, row, col]` with co-indexed variance and
/// quality bitmask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorCube {
    data: Array3<f64>,
    variance: Array3<f64>,
    dq: Array3<u32>,
}

impl DetectorCube {
    pub fn new(data: Array3<f64>, variance: Array3<f64>, dq: Array3<u32>) -> StageResult<Self> {
        if variance.dim() != data.dim() || dq.dim() != data.dim() {
            return Err(StageError::InputShapeMismatch(format!(
                "data {:?}, variance {:?} and dq {:?} must share a shape",
                data.dim(),
                variance.dim(),
                dq.dim()
            )));
        }
        Ok(Self { data, variance, dq })
    }

    /// Builds the variance cube from a 1-sigma error cube.
    pub fn from_error(data: Array3<f64>, error: Array3<f64>, dq: Array3<u32>) -> StageResult<Self> {
        Self::new(data, error.mapv(|e| e * e), dq)
    }

    /// Cube with the same variance everywhere and no quality flags.
    pub fn with_uniform_variance(data: Array3<f64>, variance: f64) -> Self {
        let dim = data.dim();
        Self {
            data,
            variance: Array3::from_elem(dim, variance),
            dq: Array3::zeros(dim),
        }
    }

    pub fn from_dyn(data: ArrayD<f64>, variance: ArrayD<f64>, dq: ArrayD<u32>) -> StageResult<Self> {
        let rank_error = |name: &str, ndim: usize| {
            StageError::InputShapeMismatch(format!(
                "{} must have 3 axes [integration, row, col], got {}",
                name, ndim
            ))
        };
        let (d, v, q) = (data.ndim(), variance.ndim(), dq.ndim());
        let data = data
            .into_dimensionality::<Ix3>()
            .map_err(|_| rank_error("data", d))?;
        let variance = variance
            .into_dimensionality::<Ix3>()
            .map_err(|_| rank_error("variance", v))?;
        let dq = dq
            .into_dimensionality::<Ix3>()
            .map_err(|_| rank_error("dq", q))?;
        Self::new(data, variance, dq)
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn variance(&self) -> &Array3<f64> {
        &self.variance
    }

    pub fn dq(&self) -> &Array3<u32> {
        &self.dq
    }

    /// 1-sigma error cube.
    pub fn error(&self) -> Array3<f64> {
        self.variance.mapv(f64::sqrt)
    }

    /// `(integrations, rows, columns)`.
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn integrations(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn into_parts(self) -> (Array3<f64>, Array3<f64>, Array3<u32>) {
        (self.data, self.variance, self.dq)
    }
}

/// Cross-dispersion spatial profile, same shape as the cube it was fitted on.
/// Every row is non-negative and sums to one across columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialProfile(Array3<f64>);

impl SpatialProfile {
    pub fn new(profile: Array3<f64>) -> Self {
        Self(profile)
    }

    /// Profile where every row spreads evenly across all columns.
    pub fn uniform(dim: (usize, usize, usize)) -> Self {
        let weight = if dim.2 > 0 { 1.0 / dim.2 as f64 } else { 0.0 };
        Self(Array3::from_elem(dim, weight))
    }

    pub fn as_array(&self) -> &Array3<f64> {
        &self.0
    }

    pub fn integration(&self, index: usize) -> ArrayView2<'_, f64> {
        self.0.index_axis(Axis(0), index)
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.0.dim()
    }

    pub fn into_inner(self) -> Array3<f64> {
        self.0
    }
}
