use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Row window of the outlier cleaner.
///
/// The fit always runs over `start..end`, which has the same width for every
/// window. When the row count is not a multiple of the width the final window
/// is shifted left instead of truncated; the rows it shares with its
/// predecessor stay owned by the predecessor, so each row is committed by
/// exactly one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: usize,
    pub end: usize,
    pub owned_start: usize,
}

impl Window {
    pub fn span(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn owned(&self) -> Range<usize> {
        self.owned_start..self.end
    }

    pub fn width(&self) -> usize {
        self.end - self.start
    }

    /// Offset of the first owned row inside the span.
    pub fn owned_offset(&self) -> usize {
        self.owned_start - self.start
    }
}

/// Splits `n_rows` into windows of `width` rows. A cube shorter than `width`
/// gets a single window spanning all of its rows.
pub fn partition_rows(n_rows: usize, width: usize) -> Vec<Window> {
    if n_rows == 0 || width == 0 {
        return Vec::new();
    }
    let width = width.min(n_rows);
    let mut windows = Vec::with_capacity(n_rows.div_ceil(width));
    let mut owned_start = 0;
    while owned_start < n_rows {
        let end = (owned_start + width).min(n_rows);
        windows.push(Window {
            start: end - width,
            end,
            owned_start,
        });
        owned_start = end;
    }
    windows
}
