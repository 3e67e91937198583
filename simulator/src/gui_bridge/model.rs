use crate::workflow::runner::WorkflowResult;
use serde::{Deserialize, Serialize};
use slitcore::telemetry::MetricsSnapshot;

/// Latest extracted spectra as served to GUI clients.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SpectrumModel {
    pub wavelengths: Vec<f64>,
    /// `[integration][row]`, NaN encoded as `null`.
    pub flux: Vec<Vec<Option<f64>>>,
    pub uncertainty: Vec<Vec<Option<f64>>>,
    pub trace_centers: Vec<Option<f64>>,
    /// Linearity correction per amplifier, ascending powers.
    pub coefficients: Vec<[f64; 5]>,
    pub outliers_replaced: usize,
    pub injected_outliers: usize,
    pub metrics: MetricsSnapshot,
    pub notes: Vec<String>,
    pub scenario: Option<String>,
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

impl SpectrumModel {
    pub fn from_result(result: &WorkflowResult, scenario: Option<String>) -> Self {
        let rows = |array: &ndarray::Array2<f64>| -> Vec<Vec<Option<f64>>> {
            array
                .rows()
                .into_iter()
                .map(|row| row.iter().copied().map(finite).collect())
                .collect()
        };
        Self {
            wavelengths: result.spectrum.wavelengths.clone(),
            flux: rows(&result.spectrum.flux),
            uncertainty: rows(&result.spectrum.uncertainty),
            trace_centers: result.spectrum.trace_centers.iter().copied().map(finite).collect(),
            coefficients: result.coefficients.amplifiers.iter().map(|c| c.0).collect(),
            outliers_replaced: result.cleaning.iter().map(|s| s.outliers_replaced).sum(),
            injected_outliers: result.injected_outliers,
            metrics: result.metrics,
            notes: result.notes.clone(),
            scenario,
        }
    }
}
