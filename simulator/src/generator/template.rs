/// Point-sampled Gaussian across `n_columns`, normalized to unit sum.
pub fn gaussian_profile(n_columns: usize, center: f64, sigma: f64) -> Vec<f64> {
    let raw: Vec<f64> = (0..n_columns)
        .map(|c| {
            let z = (c as f64 - center) / sigma;
            (-0.5 * z * z).exp()
        })
        .collect();
    let total: f64 = raw.iter().sum();
    if total > 0.0 {
        raw.into_iter().map(|p| p / total).collect()
    } else {
        vec![1.0 / n_columns as f64; n_columns]
    }
}

/// Wavelength (micron) of row `row`: dispersion runs blue-ward with row index
/// and tilts slightly across columns.
pub fn dispersion(row: usize, column: usize, n_rows: usize) -> f64 {
    let start = 14.0;
    let end = 5.0;
    start + (end - start) * row as f64 / n_rows.max(1) as f64 + 1e-3 * column as f64
}
