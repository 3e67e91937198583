use crate::config::ExtractionConfig;
use crate::cube::{DetectorCube, ExtractedSpectrum, SpatialProfile, TraceMask};
use crate::math::StatsHelper;
use crate::prelude::{
    DiagnosticObserver, ProcessingStage, StageError, StageMetadata, StageResult,
};
use crate::processing::outliers::normalize_rows;
use crate::processing::trace::{locate_traces, TraceSolution};
use crate::telemetry::log::LogManager;
use ndarray::{s, Array1, Array2, ArrayView2, Axis, Zip};
use std::ops::Range;

/// Everything the extractor consumes besides its configuration.
#[derive(Debug, Clone)]
pub struct ExtractionInput {
    pub cube: DetectorCube,
    pub profile: SpatialProfile,
    /// Wavelength of every detector pixel, `[row, col]`.
    pub wavelength_map: Array2<f64>,
    pub read_noise: f64,
}

impl ExtractionInput {
    fn validate(&self) -> StageResult<()> {
        let (_, n_rows, n_columns) = self.cube.dim();
        if self.profile.dim() != self.cube.dim() {
            return Err(StageError::InputShapeMismatch(format!(
                "spatial profile {:?} does not match cube {:?}",
                self.profile.dim(),
                self.cube.dim()
            )));
        }
        if self.wavelength_map.dim() != (n_rows, n_columns) {
            return Err(StageError::InputShapeMismatch(format!(
                "wavelength map {:?} does not match detector ({}, {})",
                self.wavelength_map.dim(),
                n_rows,
                n_columns
            )));
        }
        if !(self.read_noise.is_finite() && self.read_noise >= 0.0) {
            return Err(StageError::InvalidConfig(format!(
                "read noise {} must be a non-negative number",
                self.read_noise
            )));
        }
        Ok(())
    }
}

/// Terms of the revised pixel variance
/// `read_noise + |flux · profile + background| / gain`.
///
/// The read-noise scalar enters as the base variance as given.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseModel {
    pub read_noise: f64,
    pub background: f64,
    pub gain: f64,
}

impl NoiseModel {
    pub fn revised_variance(&self, flux: f64, profile: f64) -> f64 {
        self.read_noise + (flux * profile + self.background).abs() / self.gain
    }
}

/// Per-row spectra of one integration.
#[derive(Debug, Clone)]
pub struct RowSpectra {
    pub box_flux: Array1<f64>,
    pub box_variance: Array1<f64>,
    pub flux: Array1<f64>,
    pub variance: Array1<f64>,
}

/// Standard and optimal spectra of one aperture-cropped integration.
///
/// `data`, `variance` and `profile` are `[row, aperture column]`. Pixels with
/// zero profile weight carry no information and are skipped.
pub fn horne_extract(
    data: ArrayView2<'_, f64>,
    variance: ArrayView2<'_, f64>,
    profile: ArrayView2<'_, f64>,
    noise: &NoiseModel,
) -> RowSpectra {
    let box_flux = data.sum_axis(Axis(1));
    let box_variance = variance.sum_axis(Axis(1));

    let n_rows = data.nrows();
    let mut flux = Array1::zeros(n_rows);
    let mut optimal_variance = Array1::zeros(n_rows);
    for row in 0..n_rows {
        let standard = box_flux[row];
        let (mut weighted, mut norm, mut total) = (0.0, 0.0, 0.0);
        Zip::from(data.row(row))
            .and(profile.row(row))
            .for_each(|&d, &p| {
                if p == 0.0 {
                    return;
                }
                let v = noise.revised_variance(standard, p);
                weighted += p * d / v;
                norm += p * p / v;
                total += p;
            });
        flux[row] = weighted / norm;
        optimal_variance[row] = total / norm;
    }

    RowSpectra {
        box_flux,
        box_variance,
        flux,
        variance: optimal_variance,
    }
}

/// Per-pixel median over the integrations with a located trace of the
/// aperture-cropped profile, re-normalized per row.
pub fn median_profile(profile: &SpatialProfile, mask: &TraceMask) -> Option<Array2<f64>> {
    let (n_integrations, n_rows, _) = profile.dim();
    let apertures: Vec<Range<usize>> =
        (0..n_integrations).filter_map(|i| mask.aperture(i)).collect();
    let width = apertures.first()?.len();
    let cropped: Vec<ArrayView2<'_, f64>> = (0..n_integrations)
        .filter_map(|i| {
            mask.aperture(i)
                .map(|columns| profile.as_array().slice(s![i, .., columns]))
        })
        .collect();

    let mut median = Array2::from_shape_fn((n_rows, width), |(row, offset)| {
        let samples: Vec<f64> = cropped.iter().map(|p| p[[row, offset]]).collect();
        StatsHelper::median(&samples)
    });
    normalize_rows(median.view_mut());
    Some(median)
}

#[derive(Debug, Clone)]
pub struct ExtractionOutput {
    pub spectrum: ExtractedSpectrum,
    pub trace_mask: TraceMask,
    pub trace_failures: usize,
    pub metadata: StageMetadata,
}

pub struct OptimalExtractor {
    config: ExtractionConfig,
    logger: LogManager,
}

impl OptimalExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self {
            config,
            logger: LogManager::new("extract_1d_optimal"),
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Column nearest the median of the defined trace centers.
    fn wavelength_column(&self, traces: &TraceSolution, n_columns: usize) -> StageResult<usize> {
        let center = StatsHelper::nan_median(&traces.centers);
        if !center.is_finite() {
            return Err(StageError::TraceLocalizationFailure(format!(
                "no trace located in any of {} integrations",
                traces.centers.len()
            )));
        }
        Ok((center.round() as usize).min(n_columns.saturating_sub(1)))
    }
}

impl ProcessingStage for OptimalExtractor {
    type Input = ExtractionInput;
    type Output = ExtractionOutput;

    fn name(&self) -> &'static str {
        "extract_1d_optimal"
    }

    fn execute_with(
        &self,
        input: ExtractionInput,
        observer: &dyn DiagnosticObserver,
    ) -> StageResult<ExtractionOutput> {
        self.config.validate()?;
        input.validate()?;
        let (n_integrations, n_rows, n_columns) = input.cube.dim();

        let traces = locate_traces(input.cube.data(), &self.config, observer, &self.logger)?;
        let wavelength_column = self.wavelength_column(&traces, n_columns)?;
        self.logger.record(&format!(
            "Assigning wavelengths using trace center column {}.",
            wavelength_column
        ));
        let wavelengths = input.wavelength_map.column(wavelength_column).to_vec();

        let shared_profile = if self.config.median_profile {
            self.logger.record("Using median spatial profile.");
            median_profile(&input.profile, &traces.mask)
        } else {
            None
        };

        let noise = NoiseModel {
            read_noise: input.read_noise,
            background: self.config.background,
            gain: self.config.gain,
        };
        let mut flux = Array2::from_elem((n_integrations, n_rows), f64::NAN);
        let mut uncertainty = flux.clone();
        let mut box_flux = flux.clone();
        let mut box_uncertainty = flux.clone();

        for integration in 0..n_integrations {
            let Some(columns) = traces.mask.aperture(integration) else {
                self.logger.record(&format!(
                    "Integration={}: no trace, spectrum left undefined.",
                    integration
                ));
                continue;
            };
            let data = input.cube.data().slice(s![integration, .., columns.clone()]);
            let variance = input
                .cube
                .variance()
                .slice(s![integration, .., columns.clone()]);
            let spectra = match &shared_profile {
                Some(profile) => horne_extract(data, variance, profile.view(), &noise),
                None => {
                    let profile = input
                        .profile
                        .as_array()
                        .slice(s![integration, .., columns.clone()]);
                    horne_extract(data, variance, profile, &noise)
                }
            };

            flux.row_mut(integration).assign(&spectra.flux);
            uncertainty
                .row_mut(integration)
                .assign(&spectra.variance.mapv(f64::sqrt));
            box_flux.row_mut(integration).assign(&spectra.box_flux);
            box_uncertainty
                .row_mut(integration)
                .assign(&spectra.box_variance.mapv(f64::sqrt));
            self.logger.record(&format!(
                "Integration={}: optimal extraction over columns {}..{}, total flux {:.3e}.",
                integration,
                columns.start,
                columns.end,
                spectra.flux.iter().filter(|v| v.is_finite()).sum::<f64>()
            ));
        }

        let spectrum = ExtractedSpectrum {
            wavelengths,
            flux,
            uncertainty,
            box_flux,
            box_uncertainty,
            trace_centers: traces.centers,
            trace_widths: traces.widths,
            wavelength_column,
        };
        observer.spectra(&spectrum);

        let mut metadata = StageMetadata::new(self.name(), n_integrations);
        metadata.notes.push(format!("trace {:?}", self.config.trace));
        if traces.failures > 0 {
            metadata
                .notes
                .push(format!("{} integrations without a trace", traces.failures));
        }

        Ok(ExtractionOutput {
            spectrum,
            trace_mask: traces.mask,
            trace_failures: traces.failures,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraceStrategy;
    use ndarray::Array3;

    const FLUX: f64 = 2_000.0;

    fn wavelength_map(n_rows: usize, n_columns: usize) -> Array2<f64> {
        Array2::from_shape_fn((n_rows, n_columns), |(r, c)| 5.0 + 0.01 * r as f64 + 1e-4 * c as f64)
    }

    /// Row-normalized Gaussian profile and the matching noiseless data.
    fn gaussian_input(n_integrations: usize, n_rows: usize, n_columns: usize) -> ExtractionInput {
        let row: Vec<f64> = (0..n_columns)
            .map(|c| {
                let z = (c as f64 - 36.0) / 1.59;
                (-0.5 * z * z).exp()
            })
            .collect();
        let sum: f64 = row.iter().sum();
        let profile = Array3::from_shape_fn((n_integrations, n_rows, n_columns), |(_, _, c)| {
            row[c] / sum
        });
        let data = profile.mapv(|p| FLUX * p);
        ExtractionInput {
            cube: DetectorCube::with_uniform_variance(data, 4.0),
            profile: SpatialProfile::new(profile),
            wavelength_map: wavelength_map(n_rows, n_columns),
            read_noise: 2.0,
        }
    }

    #[test]
    fn uniform_profile_and_variance_give_box_flux() {
        let data = Array3::from_shape_fn((2, 5, 9), |(i, r, c)| {
            100.0 + ((i * 5 + r * 7 + c * 3) % 11) as f64
        });
        let input = ExtractionInput {
            cube: DetectorCube::with_uniform_variance(data, 9.0),
            profile: SpatialProfile::uniform((2, 5, 9)),
            wavelength_map: wavelength_map(5, 9),
            read_noise: 3.0,
        };
        let extractor = OptimalExtractor::new(ExtractionConfig {
            aperture_center: 4,
            left_width: 4,
            right_width: 4,
            ..Default::default()
        });
        let spectrum = extractor.execute(input).unwrap().spectrum;
        for (optimal, standard) in spectrum.flux.iter().zip(spectrum.box_flux.iter()) {
            assert!((optimal - standard).abs() < 1e-9 * standard);
        }
        assert_eq!(spectrum.wavelength_column, 4);
    }

    #[test]
    fn noiseless_gaussian_recovers_flux() {
        let output = OptimalExtractor::new(ExtractionConfig::default())
            .execute(gaussian_input(2, 6, 72))
            .unwrap();
        assert!(output
            .spectrum
            .flux
            .iter()
            .all(|f| (f - FLUX).abs() < 1e-6 * FLUX));
        assert!(output.spectrum.uncertainty.iter().all(|u| u.is_finite() && *u > 0.0));
        assert_eq!(output.trace_mask.aperture(1), Some(26..47));
        assert_eq!(output.spectrum.wavelengths, wavelength_map(6, 72).column(36).to_vec());
    }

    #[test]
    fn revised_variance_follows_noise_model() {
        let noise = NoiseModel {
            read_noise: 3.0,
            background: -50.0,
            gain: 2.0,
        };
        assert_eq!(noise.revised_variance(100.0, 0.25), 3.0 + 12.5);
    }

    #[test]
    fn optimal_variance_uses_read_noise_as_base_term() {
        let profile = ndarray::array![[0.1, 0.8, 0.1]];
        let data = profile.mapv(|p| 100.0 * p);
        let variance = Array2::from_elem((1, 3), 9.0);
        let noise = NoiseModel {
            read_noise: 3.0,
            background: 0.0,
            gain: 1.0,
        };
        assert_eq!(noise.revised_variance(100.0, 0.1), 13.0);
        let spectra = horne_extract(data.view(), variance.view(), profile.view(), &noise);
        assert!((spectra.flux[0] - 100.0).abs() < 1e-9);
        // 1 / (2 · 0.01 / 13 + 0.64 / 83)
        assert!((spectra.variance[0].sqrt() - 10.397896).abs() < 1e-5);
        assert!((spectra.box_variance[0] - 27.0).abs() < 1e-12);
    }

    #[test]
    fn zero_read_noise_with_empty_profile_wings_stays_finite() {
        let profile = ndarray::array![[0.0, 0.25, 0.5, 0.25, 0.0], [0.0, 0.0, 1.0, 0.0, 0.0]];
        let data = profile.mapv(|p| 400.0 * p);
        let variance = Array2::from_elem((2, 5), 1.0);
        let noise = NoiseModel {
            read_noise: 0.0,
            background: 0.0,
            gain: 1.0,
        };
        let spectra = horne_extract(data.view(), variance.view(), profile.view(), &noise);
        for row in 0..2 {
            assert!((spectra.flux[row] - 400.0).abs() < 1e-9, "row {}", row);
            assert!(spectra.variance[row].is_finite());
        }
    }

    #[test]
    fn undefined_trace_leaves_integration_nan() {
        let mut input = gaussian_input(3, 6, 72);
        let (mut data, variance, dq) = input.cube.into_parts();
        data.index_axis_mut(Axis(0), 1).fill(f64::NAN);
        input.cube = DetectorCube::new(data, variance, dq).unwrap();

        let output = OptimalExtractor::new(ExtractionConfig {
            trace: TraceStrategy::Fitted { sigma_guess: 1.59 },
            ..Default::default()
        })
        .execute(input)
        .unwrap();
        assert_eq!(output.trace_failures, 1);
        assert!(output.spectrum.flux_of(1).iter().all(|f| f.is_nan()));
        assert!(output.spectrum.trace_centers[1].is_nan());
        for integration in [0, 2] {
            assert!(output
                .spectrum
                .flux_of(integration)
                .iter()
                .all(|f| (f - FLUX).abs() < 1e-6 * FLUX));
        }
        assert_eq!(output.spectrum.wavelength_column, 36);
    }

    #[test]
    fn no_located_trace_is_fatal() {
        let mut input = gaussian_input(2, 6, 72);
        let (data, variance, dq) = input.cube.into_parts();
        input.cube = DetectorCube::new(data.mapv(|_| f64::NAN), variance, dq).unwrap();
        let result = OptimalExtractor::new(ExtractionConfig {
            trace: TraceStrategy::Fitted { sigma_guess: 1.59 },
            ..Default::default()
        })
        .execute(input);
        assert!(matches!(result, Err(StageError::TraceLocalizationFailure(_))));
    }

    #[test]
    fn median_profile_outvotes_one_bad_integration() {
        let mut input = gaussian_input(3, 4, 72);
        let mut profile = input.profile.into_inner();
        profile.index_axis_mut(Axis(0), 2).fill(0.0);
        profile.slice_mut(s![2, .., 30]).fill(1.0);
        input.profile = SpatialProfile::new(profile);

        let output = OptimalExtractor::new(ExtractionConfig {
            median_profile: true,
            ..Default::default()
        })
        .execute(input)
        .unwrap();
        assert!(output
            .spectrum
            .flux
            .iter()
            .all(|f| (f - FLUX).abs() < 1e-6 * FLUX));
    }

    #[test]
    fn median_profile_rows_sum_to_one() {
        let input = gaussian_input(2, 3, 72);
        let mask = TraceMask::new(3, 72, vec![Some(26..47), None]);
        let median = median_profile(&input.profile, &mask).unwrap();
        assert_eq!(median.dim(), (3, 21));
        for row in median.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
        assert!(median_profile(&input.profile, &TraceMask::new(3, 72, vec![None, None])).is_none());
    }

    #[test]
    fn mismatched_wavelength_map_is_rejected() {
        let mut input = gaussian_input(1, 6, 72);
        input.wavelength_map = wavelength_map(6, 71);
        let result = OptimalExtractor::new(ExtractionConfig::default()).execute(input);
        assert!(matches!(result, Err(StageError::InputShapeMismatch(_))));
    }
}
