use super::amplifier::{AmplifierPartition, AMPLIFIER_COUNT};
use ndarray::{s, Array3, Array4, Axis};
use serde::{Deserialize, Serialize};

/// Polynomial degree of the non-linearity correction plus one.
pub const COEFFICIENT_COUNT: usize = 5;

/// Correction `ideal = c0 + c1·x + c2·x² + c3·x³ + c4·x⁴`, stored in
/// ascending power order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearityCoefficients(pub [f64; COEFFICIENT_COUNT]);

impl LinearityCoefficients {
    pub fn identity() -> Self {
        Self([0.0, 1.0, 0.0, 0.0, 0.0])
    }

    pub fn zero() -> Self {
        Self([0.0; COEFFICIENT_COUNT])
    }

    /// An all-zero set marks a column that must not be corrected.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&c| c == 0.0)
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        self.0.iter().rev().fold(0.0, |acc, &c| acc * x + c)
    }
}

/// One correction per amplifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmplifierCoefficients {
    pub amplifiers: [LinearityCoefficients; AMPLIFIER_COUNT],
}

impl AmplifierCoefficients {
    pub fn for_column(&self, column: usize) -> &LinearityCoefficients {
        &self.amplifiers[AmplifierPartition::amplifier_of(column)]
    }

    /// Applies each amplifier's correction to every column it reads out,
    /// leaving the `reference_columns` leftmost columns untouched.
    pub fn apply_in_place(&self, ramps: &mut Array4<f64>, reference_columns: usize) {
        let n_columns = ramps.len_of(Axis(3));
        for column in reference_columns.min(n_columns)..n_columns {
            let coefficients = self.for_column(column);
            if coefficients.is_zero() {
                continue;
            }
            ramps
                .slice_mut(s![.., .., .., column])
                .mapv_inplace(|dn| coefficients.evaluate(dn));
        }
    }

    /// Broadcasts the per-amplifier sets into a `[coefficient, row, col]`
    /// cube; reference columns get an all-zero set.
    pub fn coefficient_cube(
        &self,
        n_rows: usize,
        n_columns: usize,
        reference_columns: usize,
    ) -> Array3<f64> {
        let mut cube = Array3::zeros((COEFFICIENT_COUNT, n_rows, n_columns));
        for column in reference_columns.min(n_columns)..n_columns {
            let coefficients = self.for_column(column);
            for (k, &c) in coefficients.0.iter().enumerate() {
                cube.slice_mut(s![k, .., column]).fill(c);
            }
        }
        cube
    }
}
