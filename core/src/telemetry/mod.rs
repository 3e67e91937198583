pub mod log;
pub mod metrics;
pub mod observer;

pub use log::LogManager;
pub use metrics::{MetricsRecorder, MetricsSnapshot};
pub use observer::{ColumnIteration, DiagnosticObserver, NoopObserver};
