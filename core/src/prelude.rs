pub use crate::config::{CleaningConfig, ExtractionConfig, LinearityConfig};
pub use crate::telemetry::observer::{DiagnosticObserver, NoopObserver};

/// Metadata used for chaining stages and telemetry.
#[derive(Debug, Clone, Default)]
pub struct StageMetadata {
    pub stage: &'static str,
    pub integrations: usize,
    pub notes: Vec<String>,
}

impl StageMetadata {
    pub fn new(stage: &'static str, integrations: usize) -> Self {
        Self {
            stage,
            integrations,
            notes: Vec::new(),
        }
    }
}

/// Common error type for stage execution.
///
/// Only structural failures are raised; contained events (degenerate column
/// fits, per-integration trace failures, degenerate profile rows) are counted
/// in the stage summaries instead.
#[derive(thiserror::Error, Debug)]
pub enum StageError {
    #[error("input shape mismatch: {0}")]
    InputShapeMismatch(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("amplifier {amplifier} has {found} usable samples, {required} required")]
    EmptySamplePool {
        amplifier: usize,
        found: usize,
        required: usize,
    },
    #[error("numerical singularity: {0}")]
    NumericalSingularity(String),
    #[error("aperture columns {left}..={right} outside detector columns 0..{columns}")]
    ApertureOutOfBounds {
        left: i64,
        right: i64,
        columns: usize,
    },
    #[error("trace localization failed: {0}")]
    TraceLocalizationFailure(String),
}

pub type StageResult<T> = Result<T, StageError>;

/// A processing stage is a pure function from an input bundle to an output
/// bundle; configuration lives on the stage and never changes during a call.
pub trait ProcessingStage {
    type Input;
    type Output;

    fn name(&self) -> &'static str;

    fn execute_with(
        &self,
        input: Self::Input,
        observer: &dyn DiagnosticObserver,
    ) -> StageResult<Self::Output>;

    fn execute(&self, input: Self::Input) -> StageResult<Self::Output> {
        self.execute_with(input, &NoopObserver)
    }
}
