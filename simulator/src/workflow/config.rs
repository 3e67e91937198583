use crate::generator::profile::GeneratorConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use slitcore::config::{CleaningConfig, ExtractionConfig, LinearityConfig, TraceStrategy};
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub generator: GeneratorConfig,
    pub linearity: LinearityConfig,
    pub cleaning: CleaningConfig,
    pub extraction: ExtractionConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        let generator = GeneratorConfig::default();
        // Calibrate on the middle of the synthetic detector and drop the
        // last few groups as the unrecoverable tail.
        let linearity = LinearityConfig {
            rows: generator.rows / 4..generator.rows * 3 / 4,
            fit_groups: 0..generator.groups / 6,
            usable_groups: 0..generator.groups.saturating_sub(5),
            ..Default::default()
        };
        let extraction = ExtractionConfig {
            trace: TraceStrategy::Fitted { sigma_guess: 1.59 },
            ..Default::default()
        };
        Self {
            generator,
            linearity,
            cleaning: CleaningConfig::default(),
            extraction,
        }
    }
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_args(window_width: usize, poly_order: usize, outlier_threshold: f64) -> Self {
        let mut config = Self::default();
        config.cleaning.window_width = window_width;
        config.cleaning.poly_order = poly_order;
        config.cleaning.outlier_threshold = outlier_threshold;
        config
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.linearity
            .validate()
            .context("validating linearity settings")?;
        self.cleaning.validate().context("validating cleaning settings")?;
        self.extraction
            .validate()
            .context("validating extraction settings")?;
        Ok(())
    }
}
