pub struct StatsHelper;

impl StatsHelper {
    pub fn mean(samples: &[f64]) -> f64 {
        if samples.is_empty() {
            return f64::NAN;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    /// Population standard deviation (divides by `n`).
    pub fn std_dev(samples: &[f64]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let mean = Self::mean(samples);
        let sum_sq: f64 = samples.iter().map(|&v| (v - mean) * (v - mean)).sum();
        (sum_sq / samples.len() as f64).sqrt()
    }

    /// Median that propagates NaN: any NaN sample makes the result NaN.
    pub fn median(samples: &[f64]) -> f64 {
        if samples.is_empty() || samples.iter().any(|v| v.is_nan()) {
            return f64::NAN;
        }
        Self::sorted_median(samples.to_vec())
    }

    /// Median of the non-NaN samples; NaN when there are none.
    pub fn nan_median(samples: &[f64]) -> f64 {
        let finite: Vec<f64> = samples.iter().copied().filter(|v| !v.is_nan()).collect();
        if finite.is_empty() {
            return f64::NAN;
        }
        Self::sorted_median(finite)
    }

    /// Index of the largest sample, ignoring NaN.
    pub fn argmax(samples: &[f64]) -> Option<usize> {
        samples
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(idx, _)| idx)
    }

    fn sorted_median(mut values: Vec<f64>) -> f64 {
        values.sort_by(|a, b| a.total_cmp(b));
        let mid = values.len() / 2;
        if values.len() % 2 == 0 {
            0.5 * (values[mid - 1] + values[mid])
        } else {
            values[mid]
        }
    }
}
