pub mod amplifier;
pub mod coefficients;
pub mod detector;
pub mod ramp;
pub mod spectrum;

pub use amplifier::{AmplifierPartition, AMPLIFIER_COUNT};
pub use coefficients::{AmplifierCoefficients, LinearityCoefficients, COEFFICIENT_COUNT};
pub use detector::{DetectorCube, SpatialProfile, OUTLIER_FLAG};
pub use ramp::RampCube;
pub use spectrum::{ExtractedSpectrum, TraceMask};
