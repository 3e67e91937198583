use crate::processing::outliers::IntegrationCleaningSummary;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Run-wide counters aggregated from the per-integration stage summaries.
pub struct MetricsRecorder {
    inner: Mutex<MetricsSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub integrations_cleaned: usize,
    pub outliers_replaced: usize,
    pub degenerate_columns: usize,
    pub degenerate_profile_rows: usize,
    pub integrations_extracted: usize,
    pub trace_failures: usize,
    pub errors: usize,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsSnapshot::default()),
        }
    }

    pub fn record_cleaning(&self, summaries: &[IntegrationCleaningSummary]) {
        if let Ok(mut metrics) = self.inner.lock() {
            for summary in summaries {
                metrics.integrations_cleaned += 1;
                metrics.outliers_replaced += summary.outliers_replaced;
                metrics.degenerate_columns += summary.degenerate_columns;
                metrics.degenerate_profile_rows += summary.degenerate_rows;
            }
        }
    }

    pub fn record_extraction(&self, integrations: usize, trace_failures: usize) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.integrations_extracted += integrations;
            metrics.trace_failures += trace_failures;
        }
    }

    pub fn record_error(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.errors += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        if let Ok(metrics) = self.inner.lock() {
            *metrics
        } else {
            MetricsSnapshot::default()
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}
