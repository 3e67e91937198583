use crate::config::CleaningConfig;
use crate::cube::{DetectorCube, SpatialProfile, OUTLIER_FLAG};
use crate::math::{Polynomial, StatsHelper};
use crate::prelude::{DiagnosticObserver, ProcessingStage, StageMetadata, StageResult};
use crate::processing::windows::{partition_rows, Window};
use crate::telemetry::log::LogManager;
use crate::telemetry::observer::ColumnIteration;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Residual spread below this fraction of the largest sample means the
/// polynomial reproduces the column exactly.
const EXACT_FIT_TOLERANCE: f64 = 1e-9;

/// Converged fit of one window column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnFit {
    /// Fit evaluated at every row of the window span.
    pub fitted: Vec<f64>,
    /// `false` for rows masked during fitting, including non-finite samples.
    pub usable: Vec<bool>,
    /// Fewer than two usable rows were left and the flat zero model was used.
    pub degenerate: bool,
}

impl ColumnFit {
    pub fn masked_rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.usable
            .iter()
            .enumerate()
            .filter(|(_, &usable)| !usable)
            .map(|(row, _)| row)
    }
}

/// Iteratively fits `values` (indexed by row offset) with a polynomial of
/// order `poly_order`, masking one worst row per pass while its residual
/// exceeds `threshold` standard deviations.
///
/// `on_pass` sees every pass as `(fitted, usable, max_deviation, converged)`.
pub fn fit_column<F>(
    values: &[f64],
    poly_order: usize,
    threshold: f64,
    mut on_pass: F,
) -> StageResult<ColumnFit>
where
    F: FnMut(&[f64], &[bool], f64, bool),
{
    let n = values.len();
    let rows: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let mut usable: Vec<bool> = values.iter().map(|v| v.is_finite()).collect();

    loop {
        let kept: Vec<usize> = (0..n).filter(|&i| usable[i]).collect();
        if kept.len() < 2 {
            let fitted = vec![0.0; n];
            on_pass(&fitted, &usable, 0.0, true);
            return Ok(ColumnFit {
                fitted,
                usable,
                degenerate: true,
            });
        }

        let xs: Vec<f64> = kept.iter().map(|&i| rows[i]).collect();
        let ys: Vec<f64> = kept.iter().map(|&i| values[i]).collect();
        let degree = poly_order.min(kept.len() - 1);
        let poly = Polynomial::fit(&xs, &ys, degree)?;
        let fitted: Vec<f64> = rows.iter().map(|&x| poly.evaluate(x)).collect();

        let residuals: Vec<f64> = kept.iter().map(|&i| values[i] - fitted[i]).collect();
        let spread = StatsHelper::std_dev(&residuals);
        let magnitude = ys.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));

        let mut worst: Option<(usize, f64)> = None;
        if spread > EXACT_FIT_TOLERANCE * magnitude {
            for (&row, &residual) in kept.iter().zip(&residuals) {
                let deviation = residual.abs() / spread;
                if worst.map_or(true, |(_, max)| deviation > max) {
                    worst = Some((row, deviation));
                }
            }
        }

        match worst {
            Some((row, deviation)) if deviation > threshold => {
                on_pass(&fitted, &usable, deviation, false);
                usable[row] = false;
            }
            _ => {
                let deviation = worst.map_or(0.0, |(_, d)| d);
                on_pass(&fitted, &usable, deviation, true);
                return Ok(ColumnFit {
                    fitted,
                    usable,
                    degenerate: false,
                });
            }
        }
    }
}

/// Normalizes every row to unit sum. Rows summing to exactly zero get
/// uniform weights; their count is returned.
pub fn normalize_rows(mut profile: ArrayViewMut2<'_, f64>) -> usize {
    let n_columns = profile.ncols();
    let mut degenerate = 0;
    for mut row in profile.rows_mut() {
        let sum = row.sum();
        if sum == 0.0 {
            row.fill(1.0 / n_columns as f64);
            degenerate += 1;
        } else {
            row.mapv_inplace(|v| v / sum);
        }
    }
    degenerate
}

/// Outcome counts of one integration, reported once per integration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationCleaningSummary {
    pub integration: usize,
    pub outliers_replaced: usize,
    pub degenerate_columns: usize,
    pub degenerate_rows: usize,
}

#[derive(Debug, Clone)]
pub struct CleaningOutput {
    /// Cleaned cube with the outlier flag OR-ed into its quality mask.
    pub cube: DetectorCube,
    /// Flags added by this stage only.
    pub dq_delta: Array3<u32>,
    pub profile: SpatialProfile,
    pub summaries: Vec<IntegrationCleaningSummary>,
    pub metadata: StageMetadata,
}

/// Windowed polynomial clipping along the rows of every column. The converged
/// fits, normalized across columns, become the spatial profile.
pub struct OutlierCleaner {
    config: CleaningConfig,
    logger: LogManager,
}

impl OutlierCleaner {
    pub fn new(config: CleaningConfig) -> Self {
        Self {
            config,
            logger: LogManager::new("clean_outliers"),
        }
    }

    pub fn config(&self) -> &CleaningConfig {
        &self.config
    }

    fn fit_window(
        &self,
        frame: ArrayView2<'_, f64>,
        integration: usize,
        window: &Window,
        observer: &dyn DiagnosticObserver,
    ) -> StageResult<Vec<ColumnFit>> {
        let fit_one = |column: usize| {
            let values = frame.slice(s![window.span(), column]).to_vec();
            fit_column(
                &values,
                self.config.poly_order,
                self.config.outlier_threshold,
                |fitted, usable, max_deviation, converged| {
                    observer.column_iteration(&ColumnIteration {
                        integration,
                        window,
                        column,
                        fitted,
                        usable,
                        max_deviation,
                        converged,
                    })
                },
            )
        };
        let n_columns = frame.ncols();
        if self.config.parallel {
            (0..n_columns).into_par_iter().map(fit_one).collect()
        } else {
            (0..n_columns).map(fit_one).collect()
        }
    }

    fn clean_integration(
        &self,
        integration: usize,
        data: &mut Array3<f64>,
        dq_delta: &mut Array3<u32>,
        profile: &mut Array3<f64>,
        observer: &dyn DiagnosticObserver,
    ) -> StageResult<IntegrationCleaningSummary> {
        let (_, n_rows, n_columns) = data.dim();
        let mut summary = IntegrationCleaningSummary {
            integration,
            ..Default::default()
        };

        for window in partition_rows(n_rows, self.config.window_width) {
            let fits = self.fit_window(
                data.index_axis(Axis(0), integration),
                integration,
                &window,
                observer,
            )?;

            let mut window_profile = Array2::zeros((window.width(), n_columns));
            for (column, fit) in fits.iter().enumerate() {
                summary.degenerate_columns += usize::from(fit.degenerate);
                for (offset, &value) in fit.fitted.iter().enumerate() {
                    window_profile[[offset, column]] = value.max(0.0);
                }
                for offset in fit.masked_rows().filter(|&o| o >= window.owned_offset()) {
                    let row = window.start + offset;
                    data[[integration, row, column]] = fit.fitted[offset];
                    dq_delta[[integration, row, column]] |= OUTLIER_FLAG;
                    summary.outliers_replaced += 1;
                }
            }

            let degenerate = window_profile
                .slice(s![window.owned_offset().., ..])
                .rows()
                .into_iter()
                .filter(|row| row.sum() == 0.0)
                .count();
            normalize_rows(window_profile.view_mut());
            let owned = window_profile.slice(s![window.owned_offset().., ..]);
            if degenerate > 0 {
                self.logger.warn(&format!(
                    "Integration={} rows {}..{}: {} profile rows without positive flux, using uniform weights",
                    integration, window.owned_start, window.end, degenerate
                ));
            }
            summary.degenerate_rows += degenerate;
            profile
                .slice_mut(s![integration, window.owned(), ..])
                .assign(&owned);
            observer.window_profile(integration, &window, window_profile.view());
        }

        Ok(summary)
    }
}

impl ProcessingStage for OutlierCleaner {
    type Input = DetectorCube;
    type Output = CleaningOutput;

    fn name(&self) -> &'static str {
        "clean_outliers"
    }

    fn execute_with(
        &self,
        input: DetectorCube,
        observer: &dyn DiagnosticObserver,
    ) -> StageResult<CleaningOutput> {
        self.config.validate()?;
        let (mut data, variance, dq) = input.into_parts();
        let dim = data.dim();
        let mut dq_delta = Array3::<u32>::zeros(dim);
        let mut profile = Array3::<f64>::zeros(dim);

        let mut summaries = Vec::with_capacity(dim.0);
        for integration in 0..dim.0 {
            let summary = self.clean_integration(
                integration,
                &mut data,
                &mut dq_delta,
                &mut profile,
                observer,
            )?;
            self.logger.record(&format!(
                "Integration={}: cleaned {} outliers w/ spatial profile ({} degenerate columns, {} uniform profile rows).",
                integration,
                summary.outliers_replaced,
                summary.degenerate_columns,
                summary.degenerate_rows
            ));
            summaries.push(summary);
        }

        let flagged = &dq | &dq_delta;
        let cube = DetectorCube::new(data, variance, flagged)?;
        let total: usize = summaries.iter().map(|s| s.outliers_replaced).sum();

        let mut metadata = StageMetadata::new(self.name(), dim.0);
        metadata.notes.push(format!(
            "window {} order {} threshold {:.2}",
            self.config.window_width, self.config.poly_order, self.config.outlier_threshold
        ));
        metadata.notes.push(format!("replaced {} outliers", total));

        Ok(CleaningOutput {
            cube,
            dq_delta,
            profile: SpatialProfile::new(profile),
            summaries,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::NoopObserver;

    fn linear_column(n: usize) -> Vec<f64> {
        (0..n).map(|i| 2.0 + 0.5 * i as f64).collect()
    }

    #[test]
    fn single_extreme_outlier_is_flagged_and_replaced() {
        let mut values = linear_column(20);
        values[7] += 500.0;
        let fit = fit_column(&values, 2, 3.0, |_, _, _, _| {}).unwrap();
        assert_eq!(fit.masked_rows().collect::<Vec<_>>(), vec![7]);
        assert!((fit.fitted[7] - 5.5).abs() < 1e-9);
        assert!(!fit.degenerate);
    }

    #[test]
    fn noiseless_polynomial_column_flags_nothing() {
        let values: Vec<f64> = (0..30)
            .map(|i| {
                let x = i as f64;
                100.0 - 3.0 * x + 0.2 * x * x
            })
            .collect();
        let mut passes = 0;
        let fit = fit_column(&values, 4, 2.0, |_, _, _, _| passes += 1).unwrap();
        assert_eq!(fit.masked_rows().count(), 0);
        assert_eq!(passes, 1);
    }

    #[test]
    fn outliers_are_removed_one_per_pass() {
        let mut values = linear_column(30);
        values[4] += 400.0;
        values[21] -= 900.0;
        let mut masked_per_pass = Vec::new();
        let fit = fit_column(&values, 1, 3.0, |_, usable, _, _| {
            masked_per_pass.push(usable.iter().filter(|&&u| !u).count());
        })
        .unwrap();
        assert_eq!(masked_per_pass, vec![0, 1, 2]);
        assert_eq!(fit.masked_rows().collect::<Vec<_>>(), vec![4, 21]);
    }

    #[test]
    fn column_without_usable_rows_falls_back_to_zero_model() {
        let values = vec![f64::NAN, 4.0, f64::NAN, f64::INFINITY];
        let fit = fit_column(&values, 4, 4.0, |_, _, _, _| {}).unwrap();
        assert!(fit.degenerate);
        assert_eq!(fit.fitted, vec![0.0; 4]);
        assert_eq!(fit.masked_rows().collect::<Vec<_>>(), vec![0, 2, 3]);
    }

    #[test]
    fn normalize_rows_uses_uniform_fallback() {
        let mut profile = Array2::from_shape_vec((2, 4), vec![1.0, 3.0, 0.0, 4.0, 0.0, 0.0, 0.0, 0.0])
            .unwrap();
        let degenerate = normalize_rows(profile.view_mut());
        assert_eq!(degenerate, 1);
        assert!((profile.row(0).sum() - 1.0).abs() < 1e-12);
        assert_eq!(profile[[0, 1]], 0.375);
        assert!(profile.row(1).iter().all(|&v| v == 0.25));
    }

    fn gaussian_cube(n_ints: usize, n_rows: usize, n_cols: usize) -> Array3<f64> {
        Array3::from_shape_fn((n_ints, n_rows, n_cols), |(_, _, c)| {
            let dx = c as f64 - n_cols as f64 / 2.0;
            1000.0 * (-0.5 * dx * dx / 4.0).exp()
        })
    }

    #[test]
    fn cleaner_flags_injected_pixel_and_keeps_existing_bits() {
        let mut data = gaussian_cube(2, 45, 12);
        data[[1, 30, 6]] += 5.0e4;
        let mut cube = DetectorCube::with_uniform_variance(data, 4.0);
        let (data, variance, mut dq) = cube.clone().into_parts();
        dq[[0, 3, 2]] = 1;
        cube = DetectorCube::new(data, variance, dq).unwrap();

        let cleaner = OutlierCleaner::new(CleaningConfig {
            window_width: 20,
            poly_order: 2,
            outlier_threshold: 3.0,
            parallel: false,
        });
        let output = cleaner.execute(cube).unwrap();

        let flagged: Vec<_> = output
            .dq_delta
            .indexed_iter()
            .filter(|(_, &bits)| bits != 0)
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(flagged, vec![(1, 30, 6)]);
        assert_eq!(output.cube.dq()[[1, 30, 6]], OUTLIER_FLAG);
        assert_eq!(output.cube.dq()[[0, 3, 2]], 1);
        let expected = 1000.0;
        assert!((output.cube.data()[[1, 30, 6]] - expected).abs() < 1e-6);
        assert_eq!(output.summaries[1].outliers_replaced, 1);
        assert_eq!(output.summaries[0].outliers_replaced, 0);
    }

    #[test]
    fn profile_rows_are_normalized_across_shifted_windows() {
        let cube = DetectorCube::with_uniform_variance(gaussian_cube(1, 25, 12), 1.0);
        let cleaner = OutlierCleaner::new(CleaningConfig {
            window_width: 10,
            poly_order: 3,
            outlier_threshold: 4.0,
            parallel: true,
        });
        let output = cleaner.execute(cube).unwrap();
        let profile = output.profile.integration(0);
        for row in profile.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
            assert!(row.iter().all(|&v| v >= 0.0));
        }
        assert_eq!(output.summaries[0].degenerate_rows, 0);
    }

    #[test]
    fn non_positive_window_gets_uniform_profile() {
        let cube = DetectorCube::with_uniform_variance(Array3::from_elem((1, 8, 5), -3.0), 1.0);
        let output = OutlierCleaner::new(CleaningConfig {
            window_width: 4,
            ..Default::default()
        })
        .execute(cube)
        .unwrap();
        assert!(output.profile.as_array().iter().all(|&v| v == 0.2));
        assert_eq!(output.summaries[0].degenerate_rows, 8);
    }

    #[test]
    fn parallel_and_serial_cleaning_agree() {
        let mut data = gaussian_cube(1, 30, 9);
        data[[0, 5, 4]] -= 800.0;
        data[[0, 17, 2]] += 300.0;
        let cube = DetectorCube::with_uniform_variance(data, 1.0);
        let run = |parallel| {
            OutlierCleaner::new(CleaningConfig {
                window_width: 15,
                poly_order: 2,
                outlier_threshold: 3.0,
                parallel,
            })
            .execute_with(cube.clone(), &NoopObserver)
            .unwrap()
        };
        let (serial, parallel) = (run(false), run(true));
        assert_eq!(serial.dq_delta, parallel.dq_delta);
        assert_eq!(serial.cube.data(), parallel.cube.data());
        assert_eq!(serial.profile.as_array(), parallel.profile.as_array());
    }
}
