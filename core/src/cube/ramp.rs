use crate::prelude::{StageError, StageResult};
use ndarray::{Array4, ArrayD, Ix4};

/// Raw ramp cube `[integration, group, row, col]` of accumulated counts.
#[derive(Debug, Clone)]
pub struct RampCube {
    data: Array4<f64>,
}

impl RampCube {
    pub fn new(data: Array4<f64>) -> Self {
        Self { data }
    }

    /// Accepts an array of unknown rank, as handed over by container loaders.
    pub fn from_dyn(data: ArrayD<f64>) -> StageResult<Self> {
        let ndim = data.ndim();
        let data = data.into_dimensionality::<Ix4>().map_err(|_| {
            StageError::InputShapeMismatch(format!(
                "ramp cube must have 4 axes [integration, group, row, col], got {}",
                ndim
            ))
        })?;
        Ok(Self { data })
    }

    pub fn data(&self) -> &Array4<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array4<f64> {
        &mut self.data
    }

    pub fn integrations(&self) -> usize {
        self.data.dim().0
    }

    pub fn groups(&self) -> usize {
        self.data.dim().1
    }

    pub fn rows(&self) -> usize {
        self.data.dim().2
    }

    pub fn columns(&self) -> usize {
        self.data.dim().3
    }
}
