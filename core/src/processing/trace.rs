use crate::config::{ExtractionConfig, TraceStrategy};
use crate::cube::TraceMask;
use crate::math::{fit_gaussian_limited, GaussianFit, GaussianFitError, GaussianParams, StatsHelper};
use crate::prelude::{DiagnosticObserver, StageError, StageResult};
use crate::telemetry::log::LogManager;
use ndarray::{Array3, ArrayView2, Axis};
use std::ops::Range;

/// Located traces and the apertures built around them.
#[derive(Debug, Clone)]
pub struct TraceSolution {
    /// Trace center per integration, NaN where undefined.
    pub centers: Vec<f64>,
    /// Fitted Gaussian sigma per integration, NaN unless fitted.
    pub widths: Vec<f64>,
    pub mask: TraceMask,
    pub failures: usize,
}

impl TraceSolution {
    pub fn is_defined(&self, integration: usize) -> bool {
        self.mask.aperture(integration).is_some()
    }
}

/// Median over rows of every column of one integration. A column holding a
/// NaN yields NaN.
pub fn cross_dispersion_profile(frame: ArrayView2<'_, f64>) -> Vec<f64> {
    frame
        .axis_iter(Axis(1))
        .map(|column| StatsHelper::median(&column.to_vec()))
        .collect()
}

/// Fits the trace Gaussian to a cross-dispersion profile, starting from the
/// profile peak.
pub fn fit_trace(
    profile: &[f64],
    sigma_guess: f64,
    max_iterations: usize,
) -> Result<GaussianFit, GaussianFitError> {
    if profile.iter().any(|v| !v.is_finite()) {
        return Err(GaussianFitError::NonFinite);
    }
    let peak = StatsHelper::argmax(profile).ok_or(GaussianFitError::TooFewSamples(0))?;
    let columns: Vec<f64> = (0..profile.len()).map(|c| c as f64).collect();
    fit_gaussian_limited(
        &columns,
        profile,
        GaussianParams {
            amplitude: profile[peak],
            mean: peak as f64,
            sigma: sigma_guess,
            baseline: 0.0,
        },
        max_iterations,
    )
}

/// Inclusive aperture edges `[round(c − left), round(c + right)]`.
pub fn aperture_edges(center: f64, left_width: usize, right_width: usize) -> (i64, i64) {
    (
        (center - left_width as f64).round() as i64,
        (center + right_width as f64).round() as i64,
    )
}

/// Aperture columns as a half-open range, or `ApertureOutOfBounds`.
pub fn aperture_columns(
    center: f64,
    left_width: usize,
    right_width: usize,
    n_columns: usize,
) -> StageResult<Range<usize>> {
    let (left, right) = aperture_edges(center, left_width, right_width);
    if !center.is_finite() || left < 0 || right >= n_columns as i64 {
        return Err(StageError::ApertureOutOfBounds {
            left,
            right,
            columns: n_columns,
        });
    }
    Ok(left as usize..right as usize + 1)
}

/// Locates the trace of every integration of `data` and builds its aperture.
///
/// Failures of the fitted strategy are contained to their integration; a
/// fixed aperture outside the detector aborts.
pub fn locate_traces(
    data: &Array3<f64>,
    config: &ExtractionConfig,
    observer: &dyn DiagnosticObserver,
    logger: &LogManager,
) -> StageResult<TraceSolution> {
    let (n_integrations, n_rows, n_columns) = data.dim();
    let mut centers = Vec::with_capacity(n_integrations);
    let mut widths = Vec::with_capacity(n_integrations);
    let mut apertures = Vec::with_capacity(n_integrations);
    let mut failures = 0;

    match config.trace {
        TraceStrategy::Fixed => {
            let center = config.aperture_center as f64;
            let columns =
                aperture_columns(center, config.left_width, config.right_width, n_columns)?;
            for _ in 0..n_integrations {
                centers.push(center);
                widths.push(f64::NAN);
                apertures.push(Some(columns.clone()));
            }
        }
        TraceStrategy::Fitted { sigma_guess } => {
            for (integration, frame) in data.axis_iter(Axis(0)).enumerate() {
                let profile = cross_dispersion_profile(frame);
                let located = match fit_trace(&profile, sigma_guess, config.trace_max_iterations) {
                    Ok(fit) => {
                        observer.trace_fit(integration, &profile, Some(&fit));
                        aperture_columns(
                            fit.params.mean,
                            config.left_width,
                            config.right_width,
                            n_columns,
                        )
                        .map(|columns| (fit, columns))
                        .map_err(|err| err.to_string())
                    }
                    Err(err) => {
                        observer.trace_fit(integration, &profile, None);
                        Err(err.to_string())
                    }
                };
                match located {
                    Ok((fit, columns)) => {
                        centers.push(fit.params.mean);
                        widths.push(fit.params.sigma);
                        apertures.push(Some(columns));
                    }
                    Err(reason) => {
                        logger.warn(&format!(
                            "Gaussian trace fit failed for integration={}: {}",
                            integration, reason
                        ));
                        failures += 1;
                        centers.push(f64::NAN);
                        widths.push(f64::NAN);
                        apertures.push(None);
                    }
                }
            }
        }
    }

    let mask = TraceMask::new(n_rows, n_columns, apertures);
    observer.trace_mask(&mask);
    Ok(TraceSolution {
        centers,
        widths,
        mask,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::NoopObserver;

    fn gaussian_frames(centers: &[f64], n_rows: usize, n_columns: usize) -> Array3<f64> {
        Array3::from_shape_fn((centers.len(), n_rows, n_columns), |(i, _, c)| {
            let z = (c as f64 - centers[i]) / 1.59;
            5.0 + 1000.0 * (-0.5 * z * z).exp()
        })
    }

    fn fitted_config() -> ExtractionConfig {
        ExtractionConfig {
            trace: TraceStrategy::Fitted { sigma_guess: 1.59 },
            ..Default::default()
        }
    }

    #[test]
    fn aperture_is_inclusive_and_rounded() {
        assert_eq!(aperture_columns(36.0, 10, 10, 72).unwrap(), 26..47);
        assert_eq!(aperture_columns(36.4, 3, 2, 72).unwrap(), 33..39);
        assert_eq!(aperture_edges(36.6, 3, 2), (34, 39));
    }

    #[test]
    fn fixed_aperture_outside_detector_is_fatal() {
        let data = gaussian_frames(&[36.0], 4, 40);
        let result = locate_traces(
            &data,
            &ExtractionConfig::default(),
            &NoopObserver,
            &LogManager::default(),
        );
        assert!(matches!(
            result,
            Err(StageError::ApertureOutOfBounds {
                left: 26,
                right: 46,
                columns: 40
            })
        ));
    }

    #[test]
    fn fitted_strategy_recovers_each_center() {
        let data = gaussian_frames(&[35.2, 36.0, 37.7], 6, 72);
        let solution =
            locate_traces(&data, &fitted_config(), &NoopObserver, &LogManager::default()).unwrap();
        for (found, expected) in solution.centers.iter().zip([35.2, 36.0, 37.7]) {
            assert!((found - expected).abs() < 1e-4, "{} vs {}", found, expected);
        }
        for width in &solution.widths {
            assert!((width - 1.59).abs() < 1e-4);
        }
        assert_eq!(solution.failures, 0);
        assert_eq!(solution.mask.aperture(2), Some(28..49));
        assert_eq!(solution.mask.width(0), 21);
    }

    #[test]
    fn non_finite_integration_is_contained() {
        let mut data = gaussian_frames(&[36.0, 36.0], 5, 72);
        data.index_axis_mut(Axis(0), 1).fill(f64::NAN);
        let solution =
            locate_traces(&data, &fitted_config(), &NoopObserver, &LogManager::default()).unwrap();
        assert!((solution.centers[0] - 36.0).abs() < 1e-6);
        assert!(solution.centers[1].is_nan());
        assert!(solution.is_defined(0));
        assert!(!solution.is_defined(1));
        assert_eq!(solution.failures, 1);
        assert!(!solution.mask.as_array().index_axis(Axis(0), 1).iter().any(|&m| m));
    }

    #[test]
    fn fitted_center_near_edge_is_a_failure() {
        let data = gaussian_frames(&[3.0], 5, 72);
        let solution =
            locate_traces(&data, &fitted_config(), &NoopObserver, &LogManager::default()).unwrap();
        assert!(solution.centers[0].is_nan());
        assert_eq!(solution.failures, 1);
    }

    #[test]
    fn unconverged_fit_fails_only_its_integration() {
        // A trace sitting on an integer column with no baseline matches the
        // starting guess exactly; the half-column offset needs more steps.
        let data = Array3::from_shape_fn((2, 4, 72), |(i, _, c)| {
            let center = if i == 0 { 36.0 } else { 36.5 };
            let z = (c as f64 - center) / 1.59;
            1000.0 * (-0.5 * z * z).exp()
        });
        let config = ExtractionConfig {
            trace_max_iterations: 1,
            ..fitted_config()
        };
        let solution =
            locate_traces(&data, &config, &NoopObserver, &LogManager::default()).unwrap();
        assert!((solution.centers[0] - 36.0).abs() < 1e-9);
        assert!(solution.is_defined(0));
        assert!(solution.centers[1].is_nan());
        assert!(!solution.is_defined(1));
        assert_eq!(solution.failures, 1);
        assert!(matches!(
            fit_trace(&cross_dispersion_profile(data.index_axis(Axis(0), 1)), 1.59, 1),
            Err(GaussianFitError::NotConverged(1))
        ));
    }

    #[test]
    fn row_median_ignores_a_single_hot_row() {
        let mut data = gaussian_frames(&[36.0], 5, 72);
        data[[0, 2, 10]] = 1e6;
        let profile = cross_dispersion_profile(data.index_axis(Axis(0), 0));
        assert!((profile[10] - 5.0).abs() < 1e-6);
    }
}
