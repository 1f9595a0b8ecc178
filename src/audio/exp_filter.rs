//! First-order exponential low-pass filter.
//!
//! Smooths per-window VAD probabilities before thresholding.

/// Exponentially-weighted moving average.
#[derive(Debug, Clone)]
pub struct ExpFilter {
    alpha: f32,
    value: Option<f32>,
}

/// Default smoothing factor for VAD probabilities.
pub const DEFAULT_ALPHA: f32 = 0.35;

impl Default for ExpFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

impl ExpFilter {
    /// Create a filter with smoothing factor `alpha` in (0, 1].
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(f32::EPSILON, 1.0),
            value: None,
        }
    }

    /// Feed a sample and return the filtered value.
    pub fn apply(&mut self, sample: f32) -> f32 {
        let next = match self.value {
            Some(prev) => prev + self.alpha * (sample - prev),
            None => sample,
        };
        self.value = Some(next);
        next
    }

    /// The current filtered value, if any sample has been fed.
    pub fn value(&self) -> Option<f32> {
        self.value
    }

    /// Reset to the unfed state.
    pub fn reset(&mut self) {
        self.value = None;
    }
}
