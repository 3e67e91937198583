use ndarray::{s, Array2, Array3, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Aperture columns selected around the trace of each integration.
#[derive(Debug, Clone)]
pub struct TraceMask {
    mask: Array3<bool>,
    apertures: Vec<Option<Range<usize>>>,
}

impl TraceMask {
    /// `apertures` holds one column range per integration; `None` marks an
    /// integration whose trace could not be located.
    pub fn new(n_rows: usize, n_columns: usize, apertures: Vec<Option<Range<usize>>>) -> Self {
        let mut mask = Array3::from_elem((apertures.len(), n_rows, n_columns), false);
        for (integration, aperture) in apertures.iter().enumerate() {
            if let Some(columns) = aperture {
                mask.slice_mut(s![integration, .., columns.clone()]).fill(true);
            }
        }
        Self { mask, apertures }
    }

    pub fn as_array(&self) -> &Array3<bool> {
        &self.mask
    }

    pub fn aperture(&self, integration: usize) -> Option<Range<usize>> {
        self.apertures.get(integration).cloned().flatten()
    }

    /// Number of selected columns in each row of `integration`.
    pub fn width(&self, integration: usize) -> usize {
        self.aperture(integration).map_or(0, |columns| columns.len())
    }
}

/// Extracted 1-D spectra sharing one wavelength axis.
///
/// `flux` and `uncertainty` are `[integration, row]`; rows run along the
/// dispersion direction so each row maps to one wavelength.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedSpectrum {
    pub wavelengths: Vec<f64>,
    pub flux: Array2<f64>,
    pub uncertainty: Array2<f64>,
    /// Unweighted aperture sum and its 1-sigma uncertainty.
    pub box_flux: Array2<f64>,
    pub box_uncertainty: Array2<f64>,
    /// Located trace center per integration, NaN where undefined.
    pub trace_centers: Vec<f64>,
    /// Fitted Gaussian width per integration, NaN unless fitted.
    pub trace_widths: Vec<f64>,
    /// Detector column the wavelengths were read from.
    pub wavelength_column: usize,
}

impl ExtractedSpectrum {
    pub fn integrations(&self) -> usize {
        self.flux.len_of(Axis(0))
    }

    pub fn flux_of(&self, integration: usize) -> ArrayView1<'_, f64> {
        self.flux.index_axis(Axis(0), integration)
    }
}
