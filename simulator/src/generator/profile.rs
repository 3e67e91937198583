use crate::generator::template::{dispersion, gaussian_profile};
use anyhow::{ensure, Context};
use ndarray::{Array2, Array3, Array4};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use slitcore::cube::{DetectorCube, RampCube};
use std::collections::HashSet;

/// Configuration for generating a synthetic slit exposure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub integrations: usize,
    pub groups: usize,
    pub rows: usize,
    pub columns: usize,
    pub trace_center: f64,
    pub trace_sigma: f64,
    /// Total electrons per row of the rate cube.
    pub row_flux: f64,
    /// Ideal counts gained per group by every ramp pixel.
    pub ramp_rate: f64,
    /// Counts lost as `nonlinearity · ideal²`.
    pub nonlinearity: f64,
    /// Half width of the uniform pixel noise.
    pub noise: f64,
    pub outliers: usize,
    pub outlier_amplitude: f64,
    pub seed: u64,
    pub description: Option<String>,
    pub scenario: Option<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            integrations: 3,
            groups: 60,
            rows: 40,
            columns: 72,
            trace_center: 36.0,
            trace_sigma: 1.59,
            row_flux: 1.0e4,
            ramp_rate: 100.0,
            nonlinearity: 1.5e-5,
            noise: 5.0,
            outliers: 6,
            outlier_amplitude: 5_000.0,
            seed: 0,
            description: None,
            scenario: None,
        }
    }
}

impl GeneratorConfig {
    /// Standard deviation of the uniform pixel noise.
    pub fn read_noise(&self) -> f64 {
        self.noise / 3f64.sqrt()
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.integrations > 0 && self.rows > 0 && self.columns > 0,
            "generator needs at least one integration, row and column"
        );
        ensure!(self.groups >= 2, "ramps need at least two groups");
        ensure!(self.trace_sigma > 0.0, "trace sigma must be positive");
        ensure!(self.noise >= 0.0, "noise half width must be non-negative");
        ensure!(
            self.outliers <= self.integrations * self.columns,
            "at most one outlier per column and integration can be injected"
        );
        Ok(())
    }

    fn element_count(&self, dims: &[usize]) -> anyhow::Result<usize> {
        dims.iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .context("overflow computing sample count for generator")
    }
}

/// Synthetic rate cube with everything the extractor needs alongside it.
#[derive(Debug, Clone)]
pub struct SyntheticExposure {
    pub cube: DetectorCube,
    pub wavelength_map: Array2<f64>,
    pub read_noise: f64,
    /// Injected outliers as `(integration, row, column)`, sorted.
    pub outliers: Vec<(usize, usize, usize)>,
}

fn jitter(rng: &mut StdRng, half_width: f64) -> f64 {
    if half_width > 0.0 {
        rng.gen_range(-half_width..half_width)
    } else {
        0.0
    }
}

/// Uniformly illuminated up-the-ramp cube that loses counts quadratically.
pub fn build_ramp_cube(config: &GeneratorConfig) -> anyhow::Result<RampCube> {
    config.validate()?;
    config.element_count(&[config.integrations, config.groups, config.rows, config.columns])?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let noise = config.noise * 1e-2;
    let data = Array4::from_shape_fn(
        (config.integrations, config.groups, config.rows, config.columns),
        |(_, group, _, _)| {
            let ideal = config.ramp_rate * (group as f64 + 1.0);
            ideal - config.nonlinearity * ideal * ideal + jitter(&mut rng, noise)
        },
    );
    Ok(RampCube::new(data))
}

/// Rate cube carrying a Gaussian trace, uniform noise and injected outliers.
pub fn build_exposure(config: &GeneratorConfig) -> anyhow::Result<SyntheticExposure> {
    config.validate()?;
    config.element_count(&[config.integrations, config.rows, config.columns])?;
    ensure!(config.rows > 4, "outliers are injected away from the first and last two rows");

    let profile = gaussian_profile(config.columns, config.trace_center, config.trace_sigma);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut data = Array3::from_shape_fn(
        (config.integrations, config.rows, config.columns),
        |(_, _, column)| config.row_flux * profile[column],
    );
    data.mapv_inplace(|v| v + jitter(&mut rng, config.noise));

    let mut used = HashSet::new();
    let mut outliers = Vec::with_capacity(config.outliers);
    while outliers.len() < config.outliers {
        let integration = rng.gen_range(0..config.integrations);
        let column = rng.gen_range(0..config.columns);
        if !used.insert((integration, column)) {
            continue;
        }
        let row = rng.gen_range(2..config.rows - 2);
        data[[integration, row, column]] += config.outlier_amplitude;
        outliers.push((integration, row, column));
    }
    outliers.sort_unstable();

    let wavelength_map =
        Array2::from_shape_fn((config.rows, config.columns), |(row, column)| {
            dispersion(row, column, config.rows)
        });
    let read_noise = config.read_noise();
    let error = Array3::from_elem(data.dim(), read_noise);
    let dq = Array3::zeros(data.dim());
    let cube = DetectorCube::from_error(data, error, dq).context("assembling rate cube")?;
    Ok(SyntheticExposure {
        cube,
        wavelength_map,
        read_noise,
        outliers,
    })
}
