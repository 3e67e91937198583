//! Numeric core of a slit-spectroscopy reduction pipeline.
//!
//! Three stages run in order on detector cubes: per-amplifier non-linearity
//! calibration of the raw ramps, windowed outlier cleaning that also yields
//! the spatial profile, and Horne optimal extraction of 1-D spectra.

pub mod config;
pub mod cube;
pub mod math;
pub mod prelude;
pub mod processing;
pub mod telemetry;

pub use prelude::{ProcessingStage, StageError, StageMetadata, StageResult};
pub use processing::{LinearityCalibrator, OptimalExtractor, OutlierCleaner};
