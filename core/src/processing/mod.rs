pub mod extraction;
pub mod linearity;
pub mod outliers;
pub mod trace;
pub mod windows;

pub use extraction::{ExtractionInput, ExtractionOutput, NoiseModel, OptimalExtractor};
pub use linearity::{AmplifierPool, LinearityCalibrator, LinearityOutput, LinearityProductData};
pub use outliers::{CleaningOutput, ColumnFit, IntegrationCleaningSummary, OutlierCleaner};
pub use trace::TraceSolution;
pub use windows::{partition_rows, Window};
