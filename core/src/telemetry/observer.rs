use crate::cube::{ExtractedSpectrum, LinearityCoefficients, TraceMask};
use crate::math::GaussianFit;
use crate::processing::windows::Window;
use ndarray::ArrayView2;

/// One pass of the iterative fit of a single window column.
#[derive(Debug, Clone, Copy)]
pub struct ColumnIteration<'a> {
    pub integration: usize,
    pub window: &'a Window,
    pub column: usize,
    /// Fit evaluated at every row of the window span.
    pub fitted: &'a [f64],
    /// `true` for rows still used by the fit.
    pub usable: &'a [bool],
    /// Largest residual in standard deviations (0 when the fit is exact).
    pub max_deviation: f64,
    pub converged: bool,
}

/// Receives intermediate arrays from the stages. Every method defaults to a
/// no-op.
pub trait DiagnosticObserver: Send + Sync {
    /// Pooled `(measured, ideal)` samples of one amplifier and its fitted correction.
    fn amplifier_pool(
        &self,
        _amplifier: usize,
        _measured: &[f64],
        _ideal: &[f64],
        _coefficients: &LinearityCoefficients,
    ) {
    }

    fn column_iteration(&self, _event: &ColumnIteration<'_>) {}

    /// Normalized profile of a window, `[span row, column]`.
    fn window_profile(&self, _integration: usize, _window: &Window, _profile: ArrayView2<'_, f64>) {}

    /// Row-median cross-dispersion profile and its Gaussian fit, if one converged.
    fn trace_fit(&self, _integration: usize, _profile: &[f64], _fit: Option<&GaussianFit>) {}

    fn trace_mask(&self, _mask: &TraceMask) {}

    fn spectra(&self, _spectrum: &ExtractedSpectrum) {}
}

pub struct NoopObserver;

impl DiagnosticObserver for NoopObserver {}
