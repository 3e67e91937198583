use crate::config::{LinearityConfig, LinearityMode, LinearityProduct};
use crate::cube::{
    AmplifierCoefficients, LinearityCoefficients, RampCube, AMPLIFIER_COUNT, COEFFICIENT_COUNT,
};
use crate::math::{batch_solver, Polynomial, SampleSet};
use crate::prelude::{
    DiagnosticObserver, ProcessingStage, StageError, StageMetadata, StageResult,
};
use crate::telemetry::log::LogManager;
use ndarray::{s, Array3};

/// Pooled `(measured, ideal)` samples of one amplifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmplifierPool {
    pub measured: Vec<f64>,
    pub ideal: Vec<f64>,
}

impl AmplifierPool {
    pub fn len(&self) -> usize {
        self.measured.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measured.is_empty()
    }

    /// Number of distinct measured values; the polynomial needs at least as
    /// many as it has free coefficients.
    pub fn distinct_measured(&self) -> usize {
        let mut values = self.measured.clone();
        values.sort_by(|a, b| a.total_cmp(b));
        values.dedup();
        values.len()
    }
}

#[derive(Debug, Clone)]
pub enum LinearityProductData {
    Corrected(RampCube),
    /// `[coefficient, row, col]`, reference columns all zero.
    CoefficientCube(Array3<f64>),
}

#[derive(Debug, Clone)]
pub struct LinearityOutput {
    pub coefficients: AmplifierCoefficients,
    pub product: LinearityProductData,
    pub samples_per_amplifier: [usize; AMPLIFIER_COUNT],
    pub metadata: StageMetadata,
}

/// Self-calibrated non-linearity correction. A line through the early groups
/// of each representative ramp predicts the ideal counts over the usable
/// groups; the pooled (measured, ideal) pairs of each amplifier are fitted
/// with a quartic.
pub struct LinearityCalibrator {
    config: LinearityConfig,
    logger: LogManager,
}

/// Fit and usable-range samples of one representative pixel.
struct PixelRamp {
    amplifier: usize,
    fit: Vec<f64>,
    usable: Vec<f64>,
}

impl LinearityCalibrator {
    pub fn new(config: LinearityConfig) -> Self {
        Self {
            config,
            logger: LogManager::new("custom_linearity"),
        }
    }

    pub fn config(&self) -> &LinearityConfig {
        &self.config
    }

    fn validate_input(&self, ramp: &RampCube) -> StageResult<()> {
        let config = &self.config;
        if config.rows.end > ramp.rows() {
            return Err(StageError::InputShapeMismatch(format!(
                "row span {:?} exceeds {} detector rows",
                config.rows,
                ramp.rows()
            )));
        }
        if let Some(&column) = config.partition.columns.iter().find(|&&c| c >= ramp.columns()) {
            return Err(StageError::InputShapeMismatch(format!(
                "representative column {} outside {} detector columns",
                column,
                ramp.columns()
            )));
        }
        for (name, groups) in [("fit", &config.fit_groups), ("usable", &config.usable_groups)] {
            if groups.end > ramp.groups() {
                return Err(StageError::InputShapeMismatch(format!(
                    "{} group range {:?} exceeds {} groups",
                    name,
                    groups,
                    ramp.groups()
                )));
            }
        }
        Ok(())
    }

    fn collect_ramps(&self, ramp: &RampCube) -> (Vec<PixelRamp>, usize) {
        let data = ramp.data();
        let mut ramps = Vec::new();
        let mut skipped = 0;
        for (column, amplifier) in self.config.partition.representatives() {
            for integration in 0..ramp.integrations() {
                for row in self.config.rows.clone() {
                    let fit = data
                        .slice(s![integration, self.config.fit_groups.clone(), row, column])
                        .to_vec();
                    let usable = data
                        .slice(s![integration, self.config.usable_groups.clone(), row, column])
                        .to_vec();
                    if fit.iter().chain(&usable).all(|v| v.is_finite()) {
                        ramps.push(PixelRamp {
                            amplifier,
                            fit,
                            usable,
                        });
                    } else {
                        skipped += 1;
                    }
                }
            }
        }
        (ramps, skipped)
    }

    /// Fits every representative pixel ramp and pools the resulting
    /// `(measured, ideal)` pairs per amplifier.
    pub fn pool_samples(&self, ramp: &RampCube) -> StageResult<[AmplifierPool; AMPLIFIER_COUNT]> {
        self.config.validate()?;
        self.validate_input(ramp)?;

        let fit_groups: Vec<f64> = self.config.fit_groups.clone().map(|g| g as f64).collect();
        let usable_groups: Vec<f64> = self.config.usable_groups.clone().map(|g| g as f64).collect();

        let (ramps, skipped) = self.collect_ramps(ramp);
        self.logger.debug(&format!(
            "fitting {} representative pixel ramps over groups {:?}",
            ramps.len(),
            self.config.fit_groups
        ));
        if skipped > 0 {
            self.logger.warn(&format!(
                "skipped {} representative ramps with non-finite samples",
                skipped
            ));
        }

        let sets: Vec<SampleSet> = ramps
            .iter()
            .map(|pixel| SampleSet {
                x: &fit_groups,
                y: &pixel.fit,
            })
            .collect();
        // Every per-pixel line is fitted before any amplifier is pooled.
        let lines = batch_solver(self.config.parallel)
            .fit_batch(&sets, 1)
            .into_iter()
            .collect::<StageResult<Vec<Polynomial>>>()?;

        let mut pools: [AmplifierPool; AMPLIFIER_COUNT] = Default::default();
        for (pixel, line) in ramps.iter().zip(&lines) {
            let pool = &mut pools[pixel.amplifier];
            for (&group, &measured) in usable_groups.iter().zip(&pixel.usable) {
                pool.measured.push(measured);
                pool.ideal.push(line.evaluate(group));
            }
        }
        Ok(pools)
    }

    /// Solves the correction of one amplifier from its pooled samples.
    pub fn fit_amplifier(
        &self,
        amplifier: usize,
        pool: &AmplifierPool,
    ) -> StageResult<LinearityCoefficients> {
        let required = match self.config.mode {
            LinearityMode::Unconstrained => COEFFICIENT_COUNT,
            LinearityMode::Constrained => COEFFICIENT_COUNT - 2,
        };
        let distinct = pool.distinct_measured();
        if distinct < required {
            return Err(StageError::EmptySamplePool {
                amplifier,
                found: distinct,
                required,
            });
        }

        match self.config.mode {
            LinearityMode::Unconstrained => {
                let poly = Polynomial::fit(&pool.measured, &pool.ideal, COEFFICIENT_COUNT - 1)?;
                let mut coefficients = LinearityCoefficients::zero();
                coefficients.0.copy_from_slice(poly.coefficients());
                Ok(coefficients)
            }
            LinearityMode::Constrained => {
                let excess: Vec<f64> = pool
                    .ideal
                    .iter()
                    .zip(&pool.measured)
                    .map(|(ideal, measured)| ideal - measured)
                    .collect();
                let poly = Polynomial::fit_powers(&pool.measured, &excess, &[2, 3, 4])?;
                let mut coefficients = LinearityCoefficients::identity();
                coefficients.0[2..].copy_from_slice(&poly.coefficients()[2..]);
                Ok(coefficients)
            }
        }
    }

    /// Pools and fits all amplifiers.
    pub fn calibrate(
        &self,
        ramp: &RampCube,
        observer: &dyn DiagnosticObserver,
    ) -> StageResult<(AmplifierCoefficients, [usize; AMPLIFIER_COUNT])> {
        let pools = self.pool_samples(ramp)?;
        let mut amplifiers = [LinearityCoefficients::zero(); AMPLIFIER_COUNT];
        let mut counts = [0; AMPLIFIER_COUNT];
        for (amplifier, pool) in pools.iter().enumerate() {
            let coefficients = self.fit_amplifier(amplifier, pool)?;
            self.logger.record(&format!(
                "Amplifier {}: {} samples, coefficients {:?}",
                amplifier,
                pool.len(),
                coefficients.0
            ));
            observer.amplifier_pool(amplifier, &pool.measured, &pool.ideal, &coefficients);
            amplifiers[amplifier] = coefficients;
            counts[amplifier] = pool.len();
        }
        Ok((AmplifierCoefficients { amplifiers }, counts))
    }
}

impl ProcessingStage for LinearityCalibrator {
    type Input = RampCube;
    type Output = LinearityOutput;

    fn name(&self) -> &'static str {
        "custom_linearity"
    }

    fn execute_with(
        &self,
        input: RampCube,
        observer: &dyn DiagnosticObserver,
    ) -> StageResult<LinearityOutput> {
        let (coefficients, samples_per_amplifier) = self.calibrate(&input, observer)?;

        let mut metadata = StageMetadata::new(self.name(), input.integrations());
        metadata.notes.push(format!("mode {:?}", self.config.mode));

        let reference_columns = self.config.reference_columns;
        let product = match self.config.product {
            LinearityProduct::Corrected => {
                let mut corrected = input;
                coefficients.apply_in_place(corrected.data_mut(), reference_columns);
                metadata.notes.push("applied correction".into());
                LinearityProductData::Corrected(corrected)
            }
            LinearityProduct::CoefficientCube => {
                let cube =
                    coefficients.coefficient_cube(input.rows(), input.columns(), reference_columns);
                metadata.notes.push("exported coefficient cube".into());
                LinearityProductData::CoefficientCube(cube)
            }
        };

        Ok(LinearityOutput {
            coefficients,
            product,
            samples_per_amplifier,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::AmplifierPartition;
    use ndarray::Array4;

    const RATE: f64 = 100.0;
    const NONLINEARITY: f64 = 1.5e-5;

    /// Ramps that lose `NONLINEARITY · ideal²` counts to non-linearity.
    fn nonlinear_ramp(groups: usize) -> RampCube {
        RampCube::new(Array4::from_shape_fn((2, groups, 6, 12), |(_, g, _, _)| {
            let ideal = RATE * (g as f64 + 1.0);
            ideal - NONLINEARITY * ideal * ideal
        }))
    }

    fn config(mode: LinearityMode, product: LinearityProduct) -> LinearityConfig {
        LinearityConfig {
            rows: 1..5,
            fit_groups: 0..10,
            usable_groups: 0..55,
            partition: AmplifierPartition::new(vec![4, 5, 6, 7, 8], vec![0, 1, 2, 3, 0]).unwrap(),
            reference_columns: 4,
            mode,
            product,
            parallel: false,
        }
    }

    fn max_line_residual(values: &[f64]) -> f64 {
        let x: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
        let line = Polynomial::fit(&x, values, 1).unwrap();
        x.iter()
            .zip(values)
            .map(|(&xi, &yi)| (yi - line.evaluate(xi)).abs())
            .fold(0.0, f64::max)
    }

    #[test]
    fn every_amplifier_gets_five_coefficients() {
        let calibrator = LinearityCalibrator::new(config(
            LinearityMode::Unconstrained,
            LinearityProduct::Corrected,
        ));
        let output = calibrator.execute(nonlinear_ramp(60)).unwrap();
        for coefficients in &output.coefficients.amplifiers {
            assert_eq!(coefficients.0.len(), COEFFICIENT_COUNT);
            assert!(coefficients.0.iter().all(|c| c.is_finite()));
        }
        // columns 4 and 8 both feed amplifier 0
        assert_eq!(output.samples_per_amplifier, [880, 440, 440, 440]);
    }

    #[test]
    fn correction_linearizes_ramps() {
        let raw = nonlinear_ramp(60);
        let raw_ramp: Vec<f64> = raw.data().slice(s![0, 0..55, 2, 9]).to_vec();
        let output = LinearityCalibrator::new(config(
            LinearityMode::Unconstrained,
            LinearityProduct::Corrected,
        ))
        .execute(raw)
        .unwrap();
        let LinearityProductData::Corrected(corrected) = output.product else {
            panic!("expected corrected ramps");
        };
        let corrected_ramp: Vec<f64> = corrected.data().slice(s![0, 0..55, 2, 9]).to_vec();
        let before = max_line_residual(&raw_ramp);
        let after = max_line_residual(&corrected_ramp);
        assert!(after < before / 10.0, "before {} after {}", before, after);
        // reference columns stay untouched
        assert_eq!(
            corrected.data().slice(s![.., .., .., 0..4]),
            nonlinear_ramp(60).data().slice(s![.., .., .., 0..4])
        );
    }

    #[test]
    fn constrained_mode_pins_affine_terms_exactly() {
        let output = LinearityCalibrator::new(config(
            LinearityMode::Constrained,
            LinearityProduct::Corrected,
        ))
        .execute(nonlinear_ramp(60))
        .unwrap();
        for coefficients in &output.coefficients.amplifiers {
            assert_eq!(coefficients.0[0], 0.0);
            assert_eq!(coefficients.0[1], 1.0);
            // the detector loses counts, so the correction grows super-linearly
            assert!(coefficients.evaluate(5_000.0) > 5_000.0);
        }
    }

    #[test]
    fn coefficient_cube_has_zeroed_reference_columns() {
        let output = LinearityCalibrator::new(config(
            LinearityMode::Unconstrained,
            LinearityProduct::CoefficientCube,
        ))
        .execute(nonlinear_ramp(60))
        .unwrap();
        let LinearityProductData::CoefficientCube(cube) = output.product else {
            panic!("expected coefficient cube");
        };
        assert_eq!(cube.dim(), (COEFFICIENT_COUNT, 6, 12));
        assert!(cube.slice(s![.., .., 0..4]).iter().all(|&c| c == 0.0));
        let amp_one = output.coefficients.amplifiers[1];
        for k in 0..COEFFICIENT_COUNT {
            assert_eq!(cube[[k, 3, 9]], amp_one.0[k]);
        }
    }

    #[test]
    fn amplifier_without_columns_is_fatal() {
        let mut cfg = config(LinearityMode::Unconstrained, LinearityProduct::Corrected);
        cfg.partition = AmplifierPartition::new(vec![4, 5, 6], vec![0, 1, 2]).unwrap();
        let result = LinearityCalibrator::new(cfg).execute(nonlinear_ramp(60));
        assert!(matches!(
            result,
            Err(StageError::EmptySamplePool {
                amplifier: 3,
                found: 0,
                ..
            })
        ));
    }

    #[test]
    fn out_of_range_groups_are_a_shape_mismatch() {
        let result = LinearityCalibrator::new(config(
            LinearityMode::Unconstrained,
            LinearityProduct::Corrected,
        ))
        .execute(nonlinear_ramp(30));
        assert!(matches!(result, Err(StageError::InputShapeMismatch(_))));
    }

    #[test]
    fn serial_and_parallel_pools_agree() {
        let ramp = nonlinear_ramp(60);
        let serial = LinearityCalibrator::new(config(
            LinearityMode::Unconstrained,
            LinearityProduct::Corrected,
        ));
        let mut parallel_cfg = config(LinearityMode::Unconstrained, LinearityProduct::Corrected);
        parallel_cfg.parallel = true;
        let parallel = LinearityCalibrator::new(parallel_cfg);
        assert_eq!(
            serial.pool_samples(&ramp).unwrap(),
            parallel.pool_samples(&ramp).unwrap()
        );
    }
}
