use crate::generator::profile::{build_exposure, build_ramp_cube, GeneratorConfig};
use crate::workflow::config::WorkflowConfig;
use anyhow::Context;
use log::{info, warn};
use slitcore::cube::{AmplifierCoefficients, ExtractedSpectrum};
use slitcore::prelude::{DiagnosticObserver, NoopObserver, ProcessingStage};
use slitcore::processing::{
    ExtractionInput, IntegrationCleaningSummary, LinearityCalibrator, OptimalExtractor,
    OutlierCleaner,
};
use slitcore::telemetry::{MetricsRecorder, MetricsSnapshot};
use std::sync::Arc;

pub struct WorkflowResult {
    pub coefficients: AmplifierCoefficients,
    pub cleaning: Vec<IntegrationCleaningSummary>,
    pub spectrum: ExtractedSpectrum,
    /// Outliers injected by the generator, for comparison with the cleaner.
    pub injected_outliers: usize,
    pub metrics: MetricsSnapshot,
    pub notes: Vec<String>,
}

#[derive(Clone)]
pub struct Runner {
    config: WorkflowConfig,
    metrics: Arc<MetricsRecorder>,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(MetricsRecorder::new()),
        }
    }

    pub fn execute(&self, generator: &GeneratorConfig) -> anyhow::Result<WorkflowResult> {
        self.execute_with(generator, &NoopObserver)
    }

    /// Generates one exposure and runs it through all three stages.
    pub fn execute_with(
        &self,
        generator: &GeneratorConfig,
        observer: &dyn DiagnosticObserver,
    ) -> anyhow::Result<WorkflowResult> {
        let result = self.run_stages(generator, observer);
        if let Err(err) = &result {
            self.metrics.record_error();
            warn!("workflow failed: {:#}", err);
        }
        result
    }

    fn run_stages(
        &self,
        generator: &GeneratorConfig,
        observer: &dyn DiagnosticObserver,
    ) -> anyhow::Result<WorkflowResult> {
        let ramp = build_ramp_cube(generator).context("generating ramp cube")?;
        let linearity = LinearityCalibrator::new(self.config.linearity.clone())
            .execute_with(ramp, observer)
            .context("executing linearity stage")?;

        let exposure = build_exposure(generator).context("generating rate cube")?;
        let injected_outliers = exposure.outliers.len();
        let cleaned = OutlierCleaner::new(self.config.cleaning.clone())
            .execute_with(exposure.cube, observer)
            .context("executing cleaning stage")?;
        self.metrics.record_cleaning(&cleaned.summaries);

        let extracted = OptimalExtractor::new(self.config.extraction.clone())
            .execute_with(
                ExtractionInput {
                    cube: cleaned.cube,
                    profile: cleaned.profile,
                    wavelength_map: exposure.wavelength_map,
                    read_noise: exposure.read_noise,
                },
                observer,
            )
            .context("executing extraction stage")?;
        self.metrics.record_extraction(
            extracted.spectrum.integrations(),
            extracted.trace_failures,
        );

        let replaced: usize = cleaned.summaries.iter().map(|s| s.outliers_replaced).sum();
        info!(
            "workflow complete: {} integrations, {} of {} injected outliers replaced, {} trace failures",
            extracted.spectrum.integrations(),
            replaced,
            injected_outliers,
            extracted.trace_failures
        );

        let notes = [linearity.metadata, cleaned.metadata, extracted.metadata]
            .into_iter()
            .flat_map(|metadata| {
                let stage = metadata.stage;
                metadata
                    .notes
                    .into_iter()
                    .map(move |note| format!("{}: {}", stage, note))
            })
            .collect();

        Ok(WorkflowResult {
            coefficients: linearity.coefficients,
            cleaning: cleaned.summaries,
            spectrum: extracted.spectrum,
            injected_outliers,
            metrics: self.metrics.snapshot(),
            notes,
        })
    }
}
