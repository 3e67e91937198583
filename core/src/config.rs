use crate::cube::AmplifierPartition;
use crate::math::gaussian::MAX_ITERATIONS;
use crate::prelude::{StageError, StageResult};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// How the per-amplifier correction polynomial is solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearityMode {
    /// Least squares over all five coefficients.
    Unconstrained,
    /// Constant and linear terms pinned to the identity; only the
    /// quadratic and higher terms are solved.
    Constrained,
}

/// What the linearity stage hands back besides the coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearityProduct {
    Corrected,
    CoefficientCube,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearityConfig {
    pub rows: Range<usize>,
    pub fit_groups: Range<usize>,
    pub usable_groups: Range<usize>,
    pub partition: AmplifierPartition,
    /// Non-illuminated reference columns at the left detector edge.
    pub reference_columns: usize,
    pub mode: LinearityMode,
    pub product: LinearityProduct,
    pub parallel: bool,
}

impl Default for LinearityConfig {
    fn default() -> Self {
        Self {
            rows: 364..394,
            fit_groups: 12..40,
            usable_groups: 12..173,
            partition: AmplifierPartition::default(),
            reference_columns: 4,
            mode: LinearityMode::Unconstrained,
            product: LinearityProduct::Corrected,
            parallel: true,
        }
    }
}

impl LinearityConfig {
    pub fn validate(&self) -> StageResult<()> {
        if self.rows.is_empty() {
            return Err(StageError::InvalidConfig("empty row span".into()));
        }
        if self.fit_groups.len() < 2 {
            return Err(StageError::InvalidConfig(format!(
                "fit group range {:?} needs at least 2 groups for a linear fit",
                self.fit_groups
            )));
        }
        if self.usable_groups.is_empty() {
            return Err(StageError::InvalidConfig("empty usable group range".into()));
        }
        self.partition.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    pub window_width: usize,
    pub poly_order: usize,
    /// Outlier threshold in residual standard deviations.
    pub outlier_threshold: f64,
    pub parallel: bool,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            window_width: 100,
            poly_order: 4,
            outlier_threshold: 4.0,
            parallel: true,
        }
    }
}

impl CleaningConfig {
    pub fn validate(&self) -> StageResult<()> {
        if self.window_width == 0 {
            return Err(StageError::InvalidConfig("window width must be positive".into()));
        }
        if !(self.outlier_threshold.is_finite() && self.outlier_threshold > 0.0) {
            return Err(StageError::InvalidConfig(format!(
                "outlier threshold {} must be a positive number",
                self.outlier_threshold
            )));
        }
        Ok(())
    }
}

/// Trace localization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum TraceStrategy {
    /// The aperture center is used for every integration.
    #[default]
    Fixed,
    /// Gaussian fit to each integration's row-median cross-dispersion profile.
    Fitted { sigma_guess: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub trace: TraceStrategy,
    /// Levenberg–Marquardt iteration cap of the fitted trace.
    pub trace_max_iterations: usize,
    pub aperture_center: usize,
    pub left_width: usize,
    pub right_width: usize,
    pub median_profile: bool,
    /// Sky background term of the revised variance.
    pub background: f64,
    /// Detector gain dividing the photon-noise term of the revised variance.
    pub gain: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            trace: TraceStrategy::Fixed,
            trace_max_iterations: MAX_ITERATIONS,
            aperture_center: 36,
            left_width: 10,
            right_width: 10,
            median_profile: false,
            background: 0.0,
            gain: 1.0,
        }
    }
}

impl ExtractionConfig {
    pub fn validate(&self) -> StageResult<()> {
        if !(self.gain.is_finite() && self.gain > 0.0) {
            return Err(StageError::InvalidConfig(format!(
                "gain {} must be a positive number",
                self.gain
            )));
        }
        if !self.background.is_finite() {
            return Err(StageError::InvalidConfig("background must be finite".into()));
        }
        if self.trace_max_iterations == 0 {
            return Err(StageError::InvalidConfig(
                "trace fit needs at least one iteration".into(),
            ));
        }
        if let TraceStrategy::Fitted { sigma_guess } = self.trace {
            if !(sigma_guess.is_finite() && sigma_guess > 0.0) {
                return Err(StageError::InvalidConfig(format!(
                    "trace sigma guess {} must be a positive number",
                    sigma_guess
                )));
            }
        }
        Ok(())
    }

    pub fn aperture_width(&self) -> usize {
        self.left_width + self.right_width + 1
    }
}
